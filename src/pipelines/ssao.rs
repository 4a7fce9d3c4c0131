//! Screen-space ambient occlusion.
//!
//! View-space positions and normals of the visible scene are rendered into
//! two float targets. The kernel pass reflects four axis directions about a
//! per-pixel rotation from a tiled 4x4 noise texture and takes four weighted
//! taps along each (16 samples). The blend pass darkens the input colour by
//! the occlusion and applies gamma correction.

use crate::{
    data_structures::{
        framebuffer::{Framebuffer, FramebufferOptions},
        geometry::Attribute,
    },
    device::{
        ClearOps, ColorFormat, Filter, GraphicsDevice, RenderState, TextureDesc, TextureId, Wrap,
    },
    error::DeviceError,
    pipelines::{Effect, EffectContext, EffectTarget, resolution},
    render::PipelineOptions,
    shaders::EffectSource,
};

const GEOMETRY: &str = include_str!("ssao_geometry.wgsl");
const NORMAL_GEOMETRY: &str =
    concat!("#define OUTPUT_NORMAL\n", include_str!("ssao_geometry.wgsl"));
const KERNEL: &str = include_str!("ssao.wgsl");
const BLEND: &str = include_str!("ssao_blend.wgsl");

pub const NOISE_SIZE: u32 = 4;

#[derive(Clone, Debug, PartialEq)]
pub struct SsaoOptions {
    pub enabled: bool,
    /// Sample radius in view units at distance 1.
    pub radius: f32,
    pub intensity: f32,
    pub bias: f32,
    /// Falloff of occluders with distance.
    pub scale: f32,
    /// How much of the occlusion darkens the colour.
    pub strength: f32,
    /// 1.0 leaves the colour curve unchanged.
    pub gamma: f32,
}

impl Default for SsaoOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            radius: 0.1,
            intensity: 1.0,
            bias: 0.05,
            scale: 1.0,
            strength: 1.0,
            gamma: 1.0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SsaoUniform {
    pub resolution: [f32; 4],
    // x: radius, y: intensity, z: bias, w: scale
    pub params: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SsaoBlendUniform {
    pub resolution: [f32; 4],
    // x: gamma, y: strength
    pub params: [f32; 4],
}

/// 4x4 unit rotation vectors in the xy plane, stored like a normal map.
pub fn noise_pixels() -> Vec<u8> {
    let mut seed: u32 = 0x9e37_79b9;
    let mut pixels = Vec::with_capacity((NOISE_SIZE * NOISE_SIZE * 4) as usize);
    for _ in 0..NOISE_SIZE * NOISE_SIZE {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let angle = (seed >> 8) as f32 / (1u32 << 24) as f32 * std::f32::consts::TAU;
        let encode = |v: f32| ((v * 0.5 + 0.5) * 255.0).round() as u8;
        pixels.extend_from_slice(&[encode(angle.cos()), encode(angle.sin()), 127, 255]);
    }
    pixels
}

fn geometry_source(name: &'static str, template: &'static str) -> EffectSource {
    EffectSource::mesh(name, template, vec![Attribute::Position, Attribute::Normal])
}

#[derive(Debug)]
pub struct SsaoEffect {
    position: EffectTarget,
    normal: EffectTarget,
    occlusion: EffectTarget,
    noise: Option<TextureId>,
}

impl Default for SsaoEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl SsaoEffect {
    pub fn new() -> Self {
        Self {
            position: EffectTarget::viewport(
                "ssao_position",
                FramebufferOptions {
                    filter: Filter::Nearest,
                    ..FramebufferOptions::default().with_format(ColorFormat::Rgba32Float)
                },
            ),
            normal: EffectTarget::viewport(
                "ssao_normal",
                FramebufferOptions {
                    filter: Filter::Nearest,
                    ..FramebufferOptions::default().with_format(ColorFormat::Rgba16Float)
                },
            ),
            occlusion: EffectTarget::viewport("ssao_occlusion", FramebufferOptions::color_only()),
            noise: None,
        }
    }

    fn noise(&mut self, device: &mut dyn GraphicsDevice) -> Option<TextureId> {
        if self.noise.is_none() {
            let desc = TextureDesc {
                filter: Filter::Nearest,
                wrap: Wrap::Repeat,
                linear: true,
                ..TextureDesc::color("ssao_noise", NOISE_SIZE, NOISE_SIZE)
            };
            match device.create_texture(&desc, Some(&noise_pixels())) {
                Ok(texture) => self.noise = Some(texture),
                Err(error) => log::error!("ssao: cannot create noise texture: {}", error),
            }
        }
        self.noise
    }
}

impl Effect for SsaoEffect {
    fn name(&self) -> &'static str {
        "ssao"
    }

    fn is_enabled(&self, options: &PipelineOptions) -> bool {
        options.ssao.enabled
    }

    fn pass(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: &Framebuffer,
        output: Option<&Framebuffer>,
    ) {
        let (Some(input), Some((target, size))) = (input.target(), ctx.output(output)) else {
            log::warn!("ssao: skipped, targets are not restored");
            return;
        };
        let (Some(position), Some(normal), Some(occlusion), Some(noise)) = (
            self.position.ensure(ctx.device),
            self.normal.ensure(ctx.device),
            self.occlusion.ensure(ctx.device),
            self.noise(ctx.device),
        ) else {
            return;
        };
        let options = ctx.options.ssao.clone();

        for (view_target, source) in [
            (position, geometry_source("ssao_position", GEOMETRY)),
            (normal, geometry_source("ssao_normal", NORMAL_GEOMETRY)),
        ] {
            ctx.device.clear(
                Some(view_target.framebuffer),
                &ClearOps::all([0.0, 0.0, 0.0, 0.0]),
            );
            ctx.draw_objects(
                &source,
                Some(view_target.framebuffer),
                RenderState::opaque(),
                0.0,
                |_| true,
                |_| [0.0; 4],
            );
        }

        let kernel = SsaoUniform {
            resolution: resolution(occlusion.size),
            params: [options.radius, options.intensity, options.bias, options.scale],
        };
        ctx.fullscreen(
            &EffectSource::fullscreen("ssao_kernel", KERNEL, 3),
            Some(occlusion.framebuffer),
            bytemuck::bytes_of(&kernel),
            &[position.texture, normal.texture, noise],
            RenderState::fullscreen(),
        );

        let blend = SsaoBlendUniform {
            resolution: resolution(size),
            params: [options.gamma, options.strength, 0.0, 0.0],
        };
        ctx.fullscreen(
            &EffectSource::fullscreen("ssao_blend", BLEND, 2),
            target,
            bytemuck::bytes_of(&blend),
            &[input.texture, occlusion.texture],
            RenderState::fullscreen(),
        );
    }

    fn resize(
        &mut self,
        device: &mut dyn GraphicsDevice,
        width: u32,
        height: u32,
    ) -> Result<(), DeviceError> {
        self.position.resize(device, width, height)?;
        self.normal.resize(device, width, height)?;
        self.occlusion.resize(device, width, height)
    }

    fn invalidate(&mut self) {
        self.position.invalidate();
        self.normal.invalidate();
        self.occlusion.invalidate();
        self.noise = None;
    }

    fn restore(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        self.position.restore(device)?;
        self.normal.restore(device)?;
        self.occlusion.restore(device)
    }

    fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        self.position.destroy(device);
        self.normal.destroy(device);
        self.occlusion.destroy(device);
        if let Some(noise) = self.noise.take() {
            device.destroy_texture(noise);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_is_deterministic_unit_rotations() {
        let pixels = noise_pixels();
        assert_eq!(pixels, noise_pixels());
        assert_eq!(pixels.len(), 64);
        for texel in pixels.chunks(4) {
            let x = texel[0] as f32 / 255.0 * 2.0 - 1.0;
            let y = texel[1] as f32 / 255.0 * 2.0 - 1.0;
            assert!(((x * x + y * y).sqrt() - 1.0).abs() < 0.02);
        }
    }
}
