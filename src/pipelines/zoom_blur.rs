use crate::{
    data_structures::framebuffer::Framebuffer,
    device::RenderState,
    pipelines::{Effect, EffectContext, resolution},
    render::PipelineOptions,
    shaders::EffectSource,
};

const ZOOM_BLUR: &str = include_str!("zoom_blur.wgsl");

#[derive(Clone, Debug, PartialEq)]
pub struct ZoomBlurOptions {
    pub enabled: bool,
    /// Center in uv units.
    pub center: [f32; 2],
    /// Fraction of the way towards the center the last sample reaches.
    pub strength: f32,
}

impl Default for ZoomBlurOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            center: [0.5, 0.5],
            strength: 0.1,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ZoomBlurUniform {
    pub resolution: [f32; 4],
    // xy: center, z: strength
    pub params: [f32; 4],
}

#[derive(Debug, Default)]
pub struct ZoomBlurEffect;

impl Effect for ZoomBlurEffect {
    fn name(&self) -> &'static str {
        "zoom_blur"
    }

    fn is_enabled(&self, options: &PipelineOptions) -> bool {
        options.zoom_blur.enabled
    }

    fn pass(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: &Framebuffer,
        output: Option<&Framebuffer>,
    ) {
        let (Some(input), Some((target, size))) = (input.target(), ctx.output(output)) else {
            log::warn!("zoom_blur: skipped, targets are not restored");
            return;
        };
        let options = &ctx.options.zoom_blur;
        let uniform = ZoomBlurUniform {
            resolution: resolution(size),
            params: [options.center[0], options.center[1], options.strength, 0.0],
        };
        ctx.fullscreen(
            &EffectSource::fullscreen("zoom_blur", ZOOM_BLUR, 1),
            target,
            bytemuck::bytes_of(&uniform),
            &[input.texture],
            RenderState::fullscreen(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        camera::{Camera, Projection},
        device::recording::RecordingDevice,
        render::{FrameOutcome, RenderPipeline, Scene},
        resources::{MemoryLoader, texture::TextureCache},
    };
    use cgmath::Deg;

    #[test]
    fn options_reach_the_uniform_block() {
        let mut device = RecordingDevice::new(80, 40);
        let mut options = PipelineOptions::default();
        options.fxaa.enabled = false;
        options.zoom_blur = ZoomBlurOptions {
            enabled: true,
            center: [0.25, 0.6],
            strength: 0.3,
        };
        let mut pipeline = RenderPipeline::new(&mut device, options).unwrap();
        let mut scene = Scene::new(
            Camera::new((0.0, 0.0, 5.0), Deg(-90.0), Deg(0.0)),
            Projection::new(80, 40, Deg(45.0), 0.1, 100.0),
        );
        let mut textures = TextureCache::new(MemoryLoader::new());
        assert_eq!(
            pipeline.render_frame(&mut device, &mut scene, &mut textures),
            FrameOutcome::Rendered
        );

        let draw = device
            .draws()
            .into_iter()
            .find(|d| device.program_source(d.program).is_some_and(|s| s.label == "zoom_blur"))
            .cloned()
            .unwrap();
        assert_eq!(draw.target, None);
        assert_eq!(draw.textures[0].texture, pipeline.main_target().texture().unwrap());
        let uniform = draw.uniforms_as::<ZoomBlurUniform>().unwrap();
        assert_eq!(uniform.params, [0.25, 0.6, 0.3, 0.0]);
        assert_eq!(uniform.resolution, [80.0, 40.0, 1.0 / 80.0, 1.0 / 40.0]);
    }
}
