//! Silhouette outlines around flagged objects.
//!
//! The input is copied to the output first. Pass A marks the footprint of
//! every outlined object (pushed out by the gap) in the stencil buffer with
//! colour writes off. Pass B draws the same objects pushed out further,
//! coloured, only where the stencil is still 0. Pass B increments the
//! stencil where it draws so overlapping rings are blended once.

use crate::{
    data_structures::{framebuffer::Framebuffer, material::Color},
    device::{ClearOps, CompareFunction, RenderState, StencilOp, StencilState},
    pipelines::{Effect, EffectContext, solid_source},
    render::PipelineOptions,
};

#[derive(Clone, Debug, PartialEq)]
pub struct OutlineOptions {
    pub enabled: bool,
    pub color: Color,
    /// Ring width in pixels.
    pub width: f32,
    /// Space between silhouette and ring in pixels.
    pub gap: f32,
}

impl Default for OutlineOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            color: [1.0, 0.6, 0.0, 1.0],
            width: 2.0,
            gap: 0.0,
        }
    }
}

/// Stencil state of Pass B.
pub fn ring_stencil() -> StencilState {
    StencilState {
        compare: CompareFunction::Equal,
        reference: 0,
        pass: StencilOp::IncrementClamp,
    }
}

#[derive(Debug, Default)]
pub struct OutlineEffect;

impl Effect for OutlineEffect {
    fn name(&self) -> &'static str {
        "outline"
    }

    fn is_enabled(&self, options: &PipelineOptions) -> bool {
        options.outline.enabled
    }

    fn pass(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: &Framebuffer,
        output: Option<&Framebuffer>,
    ) {
        let (Some(input), Some((target, size))) = (input.target(), ctx.output(output)) else {
            log::warn!("outline: skipped, targets are not restored");
            return;
        };
        let options = ctx.options.outline.clone();
        ctx.copy(input.texture, target, size);
        ctx.device.clear(target, &ClearOps::depth_stencil());

        let solid = solid_source();
        ctx.draw_objects(
            &solid,
            target,
            RenderState::opaque()
                .without_color()
                .with_stencil(StencilState::mark(1)),
            options.gap,
            |o| o.outline,
            |_| [0.0; 4],
        );
        ctx.draw_objects(
            &solid,
            target,
            RenderState::opaque().with_stencil(ring_stencil()),
            options.width + options.gap,
            |o| o.outline,
            |_| options.color,
        );
    }
}
