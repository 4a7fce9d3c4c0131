//! Tilt-shift: a low-resolution box blur mixed with the sharp input by
//! distance from a focus line or point.

use crate::{
    data_structures::framebuffer::{Framebuffer, FramebufferOptions},
    device::{GraphicsDevice, RenderState},
    error::DeviceError,
    pipelines::{BlurUniform, Effect, EffectContext, EffectTarget, box_blur_source, resolution},
    render::PipelineOptions,
    shaders::EffectSource,
};

const BLEND: &str = include_str!("tilt_shift.wgsl");

/// Region that stays sharp. Coordinates are in uv units, `(0, 0)` top left.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Focus {
    /// Infinite line through two points.
    Line { start: [f32; 2], end: [f32; 2] },
    Point { center: [f32; 2] },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TiltShiftOptions {
    pub enabled: bool,
    pub focus: Focus,
    /// Distance in pixels that stays fully sharp.
    pub radius: f32,
    /// Distance in pixels over which the image fades to fully blurred.
    pub gradient: f32,
    pub blur_size: (u32, u32),
}

impl Default for TiltShiftOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            focus: Focus::Line {
                start: [0.0, 0.5],
                end: [1.0, 0.5],
            },
            radius: 50.0,
            gradient: 150.0,
            blur_size: (128, 128),
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TiltShiftUniform {
    pub resolution: [f32; 4],
    // line: xy start, zw end. point: xy center
    pub shape: [f32; 4],
    // x: 0 line, 1 point. y: radius, z: gradient
    pub params: [f32; 4],
}

impl TiltShiftUniform {
    pub fn new(options: &TiltShiftOptions, size: (u32, u32)) -> Self {
        let (shape, mode) = match options.focus {
            Focus::Line { start, end } => ([start[0], start[1], end[0], end[1]], 0.0),
            Focus::Point { center } => ([center[0], center[1], 0.0, 0.0], 1.0),
        };
        Self {
            resolution: resolution(size),
            shape,
            params: [mode, options.radius, options.gradient, 0.0],
        }
    }
}

#[derive(Debug)]
pub struct TiltShiftEffect {
    horizontal: EffectTarget,
    vertical: EffectTarget,
}

impl TiltShiftEffect {
    pub fn new(options: &TiltShiftOptions) -> Self {
        let (width, height) = options.blur_size;
        Self {
            horizontal: EffectTarget::fixed(
                "tilt_shift_blur_h",
                FramebufferOptions::color_only(),
                width,
                height,
            ),
            vertical: EffectTarget::fixed(
                "tilt_shift_blur_v",
                FramebufferOptions::color_only(),
                width,
                height,
            ),
        }
    }
}

impl Effect for TiltShiftEffect {
    fn name(&self) -> &'static str {
        "tilt_shift"
    }

    fn is_enabled(&self, options: &PipelineOptions) -> bool {
        options.tilt_shift.enabled
    }

    fn pass(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: &Framebuffer,
        output: Option<&Framebuffer>,
    ) {
        let options = ctx.options.tilt_shift.clone();
        let (width, height) = options.blur_size;
        for blur in [&mut self.horizontal, &mut self.vertical] {
            if let Err(error) = blur.set_fixed_size(ctx.device, width, height) {
                log::error!("tilt_shift: cannot resize blur target: {}", error);
                return;
            }
        }
        let (Some(input), Some((target, size))) = (input.target(), ctx.output(output)) else {
            log::warn!("tilt_shift: skipped, targets are not restored");
            return;
        };
        let (Some(horizontal), Some(vertical)) = (
            self.horizontal.ensure(ctx.device),
            self.vertical.ensure(ctx.device),
        ) else {
            return;
        };

        let blur = box_blur_source();
        ctx.fullscreen(
            &blur,
            Some(horizontal.framebuffer),
            bytemuck::bytes_of(&BlurUniform::horizontal(horizontal.size)),
            &[input.texture],
            RenderState::fullscreen(),
        );
        ctx.fullscreen(
            &blur,
            Some(vertical.framebuffer),
            bytemuck::bytes_of(&BlurUniform::vertical(vertical.size)),
            &[horizontal.texture],
            RenderState::fullscreen(),
        );
        let uniform = TiltShiftUniform::new(&options, size);
        ctx.fullscreen(
            &EffectSource::fullscreen("tilt_shift", BLEND, 2),
            target,
            bytemuck::bytes_of(&uniform),
            &[input.texture, vertical.texture],
            RenderState::fullscreen(),
        );
    }

    fn invalidate(&mut self) {
        self.horizontal.invalidate();
        self.vertical.invalidate();
    }

    fn restore(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        self.horizontal.restore(device)?;
        self.vertical.restore(device)
    }

    fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        self.horizontal.destroy(device);
        self.vertical.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_encodes_focus_shape() {
        let mut options = TiltShiftOptions::default();
        let line = TiltShiftUniform::new(&options, (200, 100));
        assert_eq!(line.shape, [0.0, 0.5, 1.0, 0.5]);
        assert_eq!(line.params[0], 0.0);

        options.focus = Focus::Point { center: [0.25, 0.75] };
        let point = TiltShiftUniform::new(&options, (200, 100));
        assert_eq!(point.shape[..2], [0.25, 0.75]);
        assert_eq!(point.params[0], 1.0);
        assert_eq!(point.resolution, [200.0, 100.0, 0.005, 0.01]);
    }
}
