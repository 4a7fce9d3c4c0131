//! Post-processing effects.
//!
//! An [`Effect`] reads the colour texture of one [`Framebuffer`] and writes
//! another one, or the visible surface when it is handed no output. The
//! [`RenderPipeline`](crate::render::RenderPipeline) owns the chain and
//! ping-pongs two viewport-sized targets between the enabled effects.
//!
//! - `outline` draws stencil-masked silhouette rings around flagged objects
//! - `glow` blurs flagged objects and composites the halo back
//! - `ssao` darkens creases using view-space positions and normals
//! - `fxaa` smooths aliased edges
//! - `tilt_shift` blurs by distance from a focus line or point
//! - `zoom_blur` blurs radially towards a center

pub mod fxaa;
pub mod glow;
pub mod outline;
pub mod ssao;
pub mod tilt_shift;
pub mod zoom_blur;

use cgmath::Matrix4;

use crate::{
    data_structures::{
        framebuffer::{Framebuffer, FramebufferOptions, RenderTarget},
        geometry::{Attribute, DrawParams, GeometryBuffer},
        material::Color,
    },
    device::{CullMode, FramebufferId, GraphicsDevice, RenderState, TextureBinding, TextureId},
    error::DeviceError,
    render::{PipelineOptions, RenderObject, Scene},
    shaders::{EffectSource, ShaderVariantCache},
};

const BLIT: &str = include_str!("blit.wgsl");
const SOLID: &str = include_str!("solid.wgsl");
const GAUSSIAN_BLUR: &str = include_str!("gaussian_blur.wgsl");
const BOX_BLUR: &str = include_str!("box_blur.wgsl");

/// Copies slot 0, multiplied by a tint.
pub fn blit_source() -> EffectSource {
    EffectSource::fullscreen("blit", BLIT, 1)
}

/// Flat-coloured scene geometry, optionally offset along the normals.
pub fn solid_source() -> EffectSource {
    EffectSource::mesh("solid", SOLID, vec![Attribute::Position, Attribute::Normal])
}

pub fn gaussian_blur_source() -> EffectSource {
    EffectSource::fullscreen("gaussian_blur", GAUSSIAN_BLUR, 1)
}

pub fn box_blur_source() -> EffectSource {
    EffectSource::fullscreen("box_blur", BOX_BLUR, 1)
}

/// `(width, height, 1 / width, 1 / height)`
pub fn resolution((width, height): (u32, u32)) -> [f32; 4] {
    let (width, height) = (width.max(1) as f32, height.max(1) as f32);
    [width, height, 1.0 / width, 1.0 / height]
}

/// Uniform block of `blit.wgsl` and `fxaa.wgsl`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ScreenUniform {
    pub resolution: [f32; 4],
    pub tint: [f32; 4],
}

impl ScreenUniform {
    pub fn new(size: (u32, u32)) -> Self {
        Self {
            resolution: resolution(size),
            tint: [1.0; 4],
        }
    }
}

/// Uniform block of the separable blur shaders.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BlurUniform {
    pub resolution: [f32; 4],
    // xy: step in texels, zw unused
    pub direction: [f32; 4],
}

impl BlurUniform {
    pub fn horizontal(size: (u32, u32)) -> Self {
        Self {
            resolution: resolution(size),
            direction: [1.0, 0.0, 0.0, 0.0],
        }
    }

    pub fn vertical(size: (u32, u32)) -> Self {
        Self {
            resolution: resolution(size),
            direction: [0.0, 1.0, 0.0, 0.0],
        }
    }
}

/// Uniform block of the mesh effect shaders (`solid.wgsl`, `ssao_geometry.wgsl`).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshUniform {
    pub model: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub color: [f32; 4],
    // x: offset along the normal in world units
    pub params: [f32; 4],
}

/// One stage of the post-processing chain.
pub trait Effect {
    fn name(&self) -> &'static str;

    fn is_enabled(&self, options: &PipelineOptions) -> bool;

    /// Reads `input` and writes `output`, or the visible surface for `None`.
    fn pass(
        &mut self,
        ctx: &mut EffectContext<'_>,
        input: &Framebuffer,
        output: Option<&Framebuffer>,
    );

    /// Follows a viewport change. Fixed-size targets stay as they are.
    fn resize(
        &mut self,
        _device: &mut dyn GraphicsDevice,
        _width: u32,
        _height: u32,
    ) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Forgets GPU objects after a context loss.
    fn invalidate(&mut self) {}

    fn restore(&mut self, _device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        Ok(())
    }

    fn destroy(&mut self, _device: &mut dyn GraphicsDevice) {}
}

/// Everything an effect may use during its pass.
pub struct EffectContext<'a> {
    pub device: &'a mut dyn GraphicsDevice,
    pub programs: &'a mut ShaderVariantCache,
    pub scene: &'a Scene,
    pub options: &'a PipelineOptions,
    pub quad: &'a GeometryBuffer,
}

impl EffectContext<'_> {
    pub fn viewport(&self) -> (u32, u32) {
        self.device.surface_size()
    }

    /// Target handle and size of an effect output, `None` as handle being
    /// the surface. Returns `None` while the output has no GPU objects.
    pub fn output(
        &self,
        output: Option<&Framebuffer>,
    ) -> Option<(Option<FramebufferId>, (u32, u32))> {
        match output {
            None => Some((None, self.viewport())),
            Some(framebuffer) => framebuffer
                .target()
                .map(|target| (Some(target.framebuffer), target.size)),
        }
    }

    /// Draws the full-screen quad, binding `inputs` to slots `0..`.
    pub fn fullscreen(
        &mut self,
        source: &EffectSource,
        target: Option<FramebufferId>,
        uniforms: &[u8],
        inputs: &[TextureId],
        state: RenderState,
    ) -> bool {
        let Some(program) = self.programs.get_effect_program(self.device, source, false) else {
            return false;
        };
        let mut params = DrawParams::new(target, program, state);
        params.uniforms = uniforms.to_vec();
        params.textures = inputs
            .iter()
            .enumerate()
            .map(|(slot, &texture)| TextureBinding {
                slot: slot as u32,
                texture,
            })
            .collect();
        self.quad.draw_all(self.device, &mut params) > 0
    }

    /// Copies `input` onto `target`.
    pub fn copy(
        &mut self,
        input: TextureId,
        target: Option<FramebufferId>,
        size: (u32, u32),
    ) -> bool {
        let uniform = ScreenUniform::new(size);
        self.fullscreen(
            &blit_source(),
            target,
            bytemuck::bytes_of(&uniform),
            &[input],
            RenderState::fullscreen(),
        )
    }

    /// Draws every visible object accepted by `filter` with a mesh program.
    /// `offset` is in pixels and is converted to world units per object.
    /// Returns the number of draw calls issued.
    pub fn draw_objects<F, C>(
        &mut self,
        source: &EffectSource,
        target: Option<FramebufferId>,
        state: RenderState,
        offset: f32,
        filter: F,
        color: C,
    ) -> u32
    where
        F: Fn(&RenderObject) -> bool,
        C: Fn(&RenderObject) -> Color,
    {
        let scene = self.scene;
        let view = scene.view_matrix();
        let view_proj = scene.view_proj();
        let mut issued = 0;
        for object in scene.objects().iter().filter(|o| o.visible && filter(o)) {
            let Some(geometry) = scene.geometry(&object.geometry) else {
                continue;
            };
            let graph = scene.graph();
            let (Some(world), Some(normal)) = (
                graph.world_matrix(object.node),
                graph.normal_matrix(object.node),
            ) else {
                continue;
            };
            let instanced = geometry.instance_count().is_some();
            let Some(program) = self.programs.get_effect_program(self.device, source, instanced)
            else {
                continue;
            };
            let world_offset = if offset == 0.0 {
                0.0
            } else {
                offset * scene.distance_factor(&world)
            };
            let uniform = MeshUniform {
                model: world.into(),
                view_proj: view_proj.into(),
                normal_matrix: Matrix4::from(normal).into(),
                view: view.into(),
                color: color(object),
                params: [world_offset, 0.0, 0.0, 0.0],
            };
            let mut state = state;
            if object.double_sided() {
                state.cull = CullMode::None;
            }
            let mut params = DrawParams::new(target, program, state);
            params.uniforms = bytemuck::bytes_of(&uniform).to_vec();
            issued += geometry.draw_all(self.device, &mut params);
        }
        issued
    }
}

/// A lazily created framebuffer owned by an effect. Viewport-sized targets
/// follow [`Effect::resize`]; fixed-size ones keep their size.
#[derive(Debug)]
pub struct EffectTarget {
    label: &'static str,
    options: FramebufferOptions,
    fixed: Option<(u32, u32)>,
    framebuffer: Option<Framebuffer>,
}

impl EffectTarget {
    pub fn viewport(label: &'static str, options: FramebufferOptions) -> Self {
        Self {
            label,
            options,
            fixed: None,
            framebuffer: None,
        }
    }

    pub fn fixed(
        label: &'static str,
        options: FramebufferOptions,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            label,
            options,
            fixed: Some((width, height)),
            framebuffer: None,
        }
    }

    pub fn framebuffer(&self) -> Option<&Framebuffer> {
        self.framebuffer.as_ref()
    }

    /// Changes the size of a fixed target.
    pub fn set_fixed_size(
        &mut self,
        device: &mut dyn GraphicsDevice,
        width: u32,
        height: u32,
    ) -> Result<(), DeviceError> {
        if self.fixed == Some((width, height)) {
            return Ok(());
        }
        self.fixed = Some((width, height));
        if let Some(framebuffer) = self.framebuffer.as_mut() {
            framebuffer.resize(device, width, height)?;
        }
        Ok(())
    }

    /// Creates the target on first use. Logs and returns `None` when the
    /// device refuses.
    pub fn ensure(&mut self, device: &mut dyn GraphicsDevice) -> Option<RenderTarget> {
        if self.framebuffer.is_none() {
            let (width, height) = self.fixed.unwrap_or_else(|| device.surface_size());
            match Framebuffer::new(device, self.label, width, height, self.options.clone()) {
                Ok(framebuffer) => self.framebuffer = Some(framebuffer),
                Err(error) => {
                    log::error!("{}: cannot create target: {}", self.label, error);
                    return None;
                }
            }
        }
        self.framebuffer.as_ref().and_then(Framebuffer::target)
    }

    pub fn resize(
        &mut self,
        device: &mut dyn GraphicsDevice,
        width: u32,
        height: u32,
    ) -> Result<(), DeviceError> {
        if self.fixed.is_some() {
            return Ok(());
        }
        if let Some(framebuffer) = self.framebuffer.as_mut() {
            framebuffer.resize(device, width, height)?;
        }
        Ok(())
    }

    pub fn invalidate(&mut self) {
        if let Some(framebuffer) = self.framebuffer.as_mut() {
            framebuffer.invalidate();
        }
    }

    pub fn restore(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        match self.framebuffer.as_mut() {
            Some(framebuffer) => framebuffer.restore(device),
            None => Ok(()),
        }
    }

    pub fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(mut framebuffer) = self.framebuffer.take() {
            framebuffer.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::recording::RecordingDevice;

    #[test]
    fn uniform_blocks_match_shader_layouts() {
        assert_eq!(std::mem::size_of::<ScreenUniform>(), 32);
        assert_eq!(std::mem::size_of::<BlurUniform>(), 32);
        assert_eq!(std::mem::size_of::<MeshUniform>(), 288);
    }

    #[test]
    fn viewport_target_follows_resize_but_fixed_does_not() {
        let mut device = RecordingDevice::new(100, 50);
        let mut viewport = EffectTarget::viewport("v", FramebufferOptions::color_only());
        let mut fixed = EffectTarget::fixed("f", FramebufferOptions::color_only(), 256, 256);
        assert_eq!(viewport.ensure(&mut device).unwrap().size, (100, 50));
        assert_eq!(fixed.ensure(&mut device).unwrap().size, (256, 256));
        viewport.resize(&mut device, 200, 80).unwrap();
        fixed.resize(&mut device, 200, 80).unwrap();
        assert_eq!(viewport.ensure(&mut device).unwrap().size, (200, 80));
        assert_eq!(fixed.ensure(&mut device).unwrap().size, (256, 256));
    }

    #[test]
    fn invalidated_target_is_rebuilt_on_restore() {
        let mut device = RecordingDevice::new(16, 16);
        let mut target = EffectTarget::viewport("v", FramebufferOptions::default());
        target.ensure(&mut device).unwrap();
        device.lose_context();
        target.invalidate();
        assert!(target.framebuffer().unwrap().target().is_none());
        device.restore_context();
        target.restore(&mut device).unwrap();
        assert!(target.framebuffer().unwrap().target().is_some());
        assert_eq!(device.framebuffer_count(), 1);
    }
}
