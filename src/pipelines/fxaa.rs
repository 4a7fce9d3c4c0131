use crate::{
    data_structures::framebuffer::Framebuffer,
    device::RenderState,
    pipelines::{Effect, EffectContext, ScreenUniform},
    render::PipelineOptions,
    shaders::EffectSource,
};

const FXAA: &str = include_str!("fxaa.wgsl");

#[derive(Clone, Debug, PartialEq)]
pub struct FxaaOptions {
    pub enabled: bool,
}

impl Default for FxaaOptions {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Default)]
pub struct FxaaEffect;

impl Effect for FxaaEffect {
    fn name(&self) -> &'static str {
        "fxaa"
    }

    fn is_enabled(&self, options: &PipelineOptions) -> bool {
        options.fxaa.enabled
    }

    fn pass(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: &Framebuffer,
        output: Option<&Framebuffer>,
    ) {
        let (Some(input), Some((target, _))) = (input.target(), ctx.output(output)) else {
            log::warn!("fxaa: skipped, targets are not restored");
            return;
        };
        // sampled at the input's texel size
        let uniform = ScreenUniform::new(input.size);
        ctx.fullscreen(
            &EffectSource::fullscreen("fxaa", FXAA, 1),
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
        render::{RenderPipeline, Scene},
        resources::{MemoryLoader, texture::TextureCache},
    };
    use cgmath::Deg;

    #[test]
    fn samples_the_previous_target_at_its_texel_size() {
        let mut device = RecordingDevice::new(64, 32);
        let mut options = PipelineOptions::default();
        options.zoom_blur.enabled = true;
        let mut pipeline = RenderPipeline::new(&mut device, options).unwrap();
        let mut scene = Scene::new(
            Camera::new((0.0, 0.0, 5.0), Deg(-90.0), Deg(0.0)),
            Projection::new(64, 32, Deg(45.0), 0.1, 100.0),
        );
        let mut textures = TextureCache::new(MemoryLoader::new());
        pipeline.render_frame(&mut device, &mut scene, &mut textures);

        let draws = device.draws();
        let last = draws.last().unwrap();
        assert_eq!(device.program_source(last.program).unwrap().label, "fxaa");
        assert_eq!(last.target, None);
        let input = device.texture_desc(last.textures[0].texture).unwrap();
        assert_eq!(input.label, "effect_a");
        let uniform = last.uniforms_as::<ScreenUniform>().unwrap();
        assert_eq!(uniform.resolution, [64.0, 32.0, 1.0 / 64.0, 1.0 / 32.0]);
    }
}
