//! Glow around flagged objects.
//!
//! 1. Mask: non-glow objects write depth and stencil 1 only, glow objects
//!    are drawn in their colour into a transparent viewport-sized target.
//! 2. The mask is blurred horizontally then vertically into two targets of
//!    a fixed size.
//! 3. The input is copied to the output, non-glow objects mark the output
//!    stencil, and the blurred mask is alpha-blended where the stencil is 0.

use crate::{
    data_structures::{
        framebuffer::{Framebuffer, FramebufferOptions},
        material::Color,
    },
    device::{BlendMode, ClearOps, GraphicsDevice, RenderState, StencilState},
    error::DeviceError,
    pipelines::{
        BlurUniform, Effect, EffectContext, EffectTarget, ScreenUniform, blit_source,
        gaussian_blur_source, solid_source,
    },
    render::PipelineOptions,
};

#[derive(Clone, Debug, PartialEq)]
pub struct GlowOptions {
    pub enabled: bool,
    /// Size of the blur targets, independent of the viewport.
    pub blur_size: (u32, u32),
    /// Alpha multiplier of the composite.
    pub strength: f32,
    /// Colour of glowing objects. `None` uses each object's diffuse colour.
    pub color: Option<Color>,
}

impl Default for GlowOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            blur_size: (256, 256),
            strength: 1.0,
            color: None,
        }
    }
}

#[derive(Debug)]
pub struct GlowEffect {
    mask: EffectTarget,
    horizontal: EffectTarget,
    vertical: EffectTarget,
}

impl GlowEffect {
    pub fn new(options: &GlowOptions) -> Self {
        let (width, height) = options.blur_size;
        Self {
            mask: EffectTarget::viewport("glow_mask", FramebufferOptions::default()),
            horizontal: EffectTarget::fixed(
                "glow_blur_h",
                FramebufferOptions::color_only(),
                width,
                height,
            ),
            vertical: EffectTarget::fixed(
                "glow_blur_v",
                FramebufferOptions::color_only(),
                width,
                height,
            ),
        }
    }
}

impl Effect for GlowEffect {
    fn name(&self) -> &'static str {
        "glow"
    }

    fn is_enabled(&self, options: &PipelineOptions) -> bool {
        options.glow.enabled
    }

    fn pass(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: &Framebuffer,
        output: Option<&Framebuffer>,
    ) {
        let options = ctx.options.glow.clone();
        let (width, height) = options.blur_size;
        for blur in [&mut self.horizontal, &mut self.vertical] {
            if let Err(error) = blur.set_fixed_size(ctx.device, width, height) {
                log::error!("glow: cannot resize blur target: {}", error);
                return;
            }
        }
        let (Some(input), Some((target, size))) = (input.target(), ctx.output(output)) else {
            log::warn!("glow: skipped, targets are not restored");
            return;
        };
        let (Some(mask), Some(horizontal), Some(vertical)) = (
            self.mask.ensure(ctx.device),
            self.horizontal.ensure(ctx.device),
            self.vertical.ensure(ctx.device),
        ) else {
            return;
        };

        let solid = solid_source();
        let occluders = RenderState::opaque()
            .without_color()
            .with_stencil(StencilState::mark(1));
        ctx.device
            .clear(Some(mask.framebuffer), &ClearOps::all([0.0, 0.0, 0.0, 0.0]));
        ctx.draw_objects(
            &solid,
            Some(mask.framebuffer),
            occluders,
            0.0,
            |o| !o.glow,
            |_| [0.0; 4],
        );
        ctx.draw_objects(
            &solid,
            Some(mask.framebuffer),
            RenderState::opaque(),
            0.0,
            |o| o.glow,
            |o| options.color.unwrap_or_else(|| o.diffuse_color()),
        );

        let blur = gaussian_blur_source();
        ctx.fullscreen(
            &blur,
            Some(horizontal.framebuffer),
            bytemuck::bytes_of(&BlurUniform::horizontal(horizontal.size)),
            &[mask.texture],
            RenderState::fullscreen(),
        );
        ctx.fullscreen(
            &blur,
            Some(vertical.framebuffer),
            bytemuck::bytes_of(&BlurUniform::vertical(vertical.size)),
            &[horizontal.texture],
            RenderState::fullscreen(),
        );

        ctx.copy(input.texture, target, size);
        ctx.device.clear(target, &ClearOps::depth_stencil());
        ctx.draw_objects(&solid, target, occluders, 0.0, |o| !o.glow, |_| [0.0; 4]);
        let composite = ScreenUniform {
            tint: [1.0, 1.0, 1.0, options.strength],
            ..ScreenUniform::new(size)
        };
        ctx.fullscreen(
            &blit_source(),
            target,
            bytemuck::bytes_of(&composite),
            &[vertical.texture],
            RenderState::fullscreen()
                .with_blend(BlendMode::Alpha)
                .with_stencil(StencilState::only_where(0)),
        );
    }

    fn resize(
        &mut self,
        device: &mut dyn GraphicsDevice,
        width: u32,
        height: u32,
    ) -> Result<(), DeviceError> {
        self.mask.resize(device, width, height)
    }

    fn invalidate(&mut self) {
        self.mask.invalidate();
        self.horizontal.invalidate();
        self.vertical.invalidate();
    }

    fn restore(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        self.mask.restore(device)?;
        self.horizontal.restore(device)?;
        self.vertical.restore(device)
    }

    fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        self.mask.destroy(device);
        self.horizontal.destroy(device);
        self.vertical.destroy(device);
    }
}
