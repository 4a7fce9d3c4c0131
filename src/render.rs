//! Scene description and frame orchestration.
//!
//! A [`Scene`] holds the transform graph, named geometry buffers and the
//! objects that tie a node, a geometry and its materials together. The
//! [`RenderPipeline`] turns a scene into a frame:
//!
//! 1. `BeginFrame` applies finished texture loads
//! 2. `MainPass` draws opaque objects, then transparent ones back to front,
//!    into the main target
//! 3. `EffectChain` runs the enabled effects, ping-ponging two targets; the
//!    last effect writes to the surface
//! 4. `Present` submits the frame
//!
//! Frames are only produced while something changed. A lost device context
//! pauses the loop until [`RenderPipeline::restore`] succeeds.
//!
//! # Key types
//!
//! - [`Scene`] is the renderable world
//! - [`RenderObject`] places one geometry at one node
//! - [`PipelineOptions`] configures the clear colour and every effect
//! - [`RenderPipeline`] owns programs, targets and the effect chain

use std::collections::HashMap;

use cgmath::{EuclideanSpace, Matrix3, Matrix4, Point3};

use crate::{
    camera::{Camera, Projection},
    data_structures::{
        framebuffer::{Framebuffer, FramebufferOptions},
        geometry::{DrawParams, GeometryBuffer, GeometryData},
        material::{Color, Features, Material},
        scene_graph::{NodeId, SceneGraph},
    },
    device::{
        ClearOps, CullMode, FramebufferId, GraphicsDevice, RenderState, TextureBinding,
    },
    error::{DeviceError, GeometryError},
    pipelines::{
        Effect, EffectContext,
        fxaa::{FxaaEffect, FxaaOptions},
        glow::{GlowEffect, GlowOptions},
        outline::{OutlineEffect, OutlineOptions},
        ssao::{SsaoEffect, SsaoOptions},
        tilt_shift::{TiltShiftEffect, TiltShiftOptions},
        zoom_blur::{ZoomBlurEffect, ZoomBlurOptions},
    },
    resources::texture::TextureCache,
    shaders::{ShaderVariantCache, VariantUniform},
};

/// A point light.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Light {
    pub position: Point3<f32>,
    pub color: Color,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            position: Point3::new(10.0, 10.0, 10.0),
            color: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// One geometry placed at one node.
///
/// Parts of the geometry pick their material by name and fall back to the
/// first material. Without any material the object is drawn lit and white.
#[derive(Clone, Debug)]
pub struct RenderObject {
    pub node: NodeId,
    pub geometry: String,
    pub materials: Vec<Material>,
    pub visible: bool,
    /// Draw an outline ring around the silhouette.
    pub outline: bool,
    /// Contribute to the glow halo.
    pub glow: bool,
}

impl RenderObject {
    pub fn new(node: NodeId, geometry: &str) -> Self {
        Self {
            node,
            geometry: geometry.to_string(),
            materials: Vec::new(),
            visible: true,
            outline: false,
            glow: false,
        }
    }

    pub fn with_material(mut self, material: Material) -> Self {
        self.materials.push(material);
        self
    }

    pub fn with_outline(mut self, outline: bool) -> Self {
        self.outline = outline;
        self
    }

    pub fn with_glow(mut self, glow: bool) -> Self {
        self.glow = glow;
        self
    }

    pub fn material(&self) -> Option<&Material> {
        self.materials.first()
    }

    pub fn material_for(&self, part: &str) -> Option<&Material> {
        self.materials
            .iter()
            .find(|m| m.name == part)
            .or_else(|| self.material())
    }

    pub fn double_sided(&self) -> bool {
        self.material().is_some_and(Material::double_sided)
    }

    pub fn diffuse_color(&self) -> Color {
        self.material()
            .map(Material::diffuse_color)
            .unwrap_or([1.0; 4])
    }
}

/// The renderable world. Every mutation through `&mut` accessors marks the
/// scene dirty so the next frame is drawn.
pub struct Scene {
    graph: SceneGraph,
    geometries: HashMap<String, GeometryBuffer>,
    objects: Vec<RenderObject>,
    camera: Camera,
    projection: Projection,
    light: Light,
    dirty: bool,
}

impl Scene {
    pub fn new(camera: Camera, projection: Projection) -> Self {
        Self {
            graph: SceneGraph::new(),
            geometries: HashMap::new(),
            objects: Vec::new(),
            camera,
            projection,
            light: Light::default(),
            dirty: true,
        }
    }

    pub fn graph(&self) -> &SceneGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut SceneGraph {
        self.dirty = true;
        &mut self.graph
    }

    /// Uploads `data` under `name`, replacing and destroying a previous
    /// buffer of the same name.
    pub fn add_geometry(
        &mut self,
        device: &mut dyn GraphicsDevice,
        name: &str,
        data: GeometryData,
    ) -> Result<(), GeometryError> {
        let buffer = GeometryBuffer::new(device, name, data)?;
        if let Some(mut previous) = self.geometries.insert(name.to_string(), buffer) {
            previous.destroy(device);
        }
        self.dirty = true;
        Ok(())
    }

    pub fn geometry(&self, name: &str) -> Option<&GeometryBuffer> {
        self.geometries.get(name)
    }

    pub fn geometry_mut(&mut self, name: &str) -> Option<&mut GeometryBuffer> {
        self.dirty = true;
        self.geometries.get_mut(name)
    }

    pub fn remove_geometry(&mut self, device: &mut dyn GraphicsDevice, name: &str) -> bool {
        match self.geometries.remove(name) {
            Some(mut buffer) => {
                buffer.destroy(device);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Returns the object's index.
    pub fn add_object(&mut self, object: RenderObject) -> usize {
        self.objects.push(object);
        self.dirty = true;
        self.objects.len() - 1
    }

    pub fn objects(&self) -> &[RenderObject] {
        &self.objects
    }

    pub fn object_mut(&mut self, index: usize) -> Option<&mut RenderObject> {
        self.dirty = true;
        self.objects.get_mut(index)
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        self.dirty = true;
        &mut self.camera
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn projection_mut(&mut self) -> &mut Projection {
        self.dirty = true;
        &mut self.projection
    }

    pub fn light(&self) -> &Light {
        &self.light
    }

    pub fn set_light(&mut self, light: Light) {
        self.light = light;
        self.dirty = true;
    }

    pub fn view_matrix(&self) -> Matrix4<f32> {
        self.camera.calc_matrix()
    }

    pub fn view_proj(&self) -> Matrix4<f32> {
        self.projection.calc_matrix() * self.camera.calc_matrix()
    }

    /// World units covered by one pixel at the origin of `world`.
    pub fn distance_factor(&self, world: &Matrix4<f32>) -> f32 {
        let origin = Point3::from_vec(world.w.truncate());
        self.projection
            .world_units_per_pixel(self.camera.view_depth(origin))
    }

    fn object_depth(&self, object: &RenderObject) -> f32 {
        self.graph
            .world_matrix(object.node)
            .map(|world| self.camera.view_depth(Point3::from_vec(world.w.truncate())))
            .unwrap_or(0.0)
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn invalidate(&mut self) {
        self.geometries
            .values_mut()
            .for_each(GeometryBuffer::invalidate);
    }

    pub fn restore(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        for buffer in self.geometries.values_mut() {
            buffer.restore(device)?;
        }
        self.dirty = true;
        Ok(())
    }

    pub fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        for (_, mut buffer) in self.geometries.drain() {
            buffer.destroy(device);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOptions {
    pub clear_color: Color,
    /// Initial size of the render targets; defaults to the surface size.
    pub viewport: Option<(u32, u32)>,
    pub outline: OutlineOptions,
    pub glow: GlowOptions,
    pub ssao: SsaoOptions,
    pub fxaa: FxaaOptions,
    pub tilt_shift: TiltShiftOptions,
    pub zoom_blur: ZoomBlurOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            clear_color: [0.1, 0.2, 0.3, 1.0],
            viewport: None,
            outline: OutlineOptions::default(),
            glow: GlowOptions::default(),
            ssao: SsaoOptions::default(),
            fxaa: FxaaOptions::default(),
            tilt_shift: TiltShiftOptions::default(),
            zoom_blur: ZoomBlurOptions::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    BeginFrame,
    MainPass,
    /// Position in the chain of enabled effects.
    EffectChain(usize),
    Present,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Rendered,
    /// Nothing changed since the last frame.
    Skipped,
    /// The device context is lost.
    Paused,
}

struct FrameUniforms {
    target: FramebufferId,
    view_proj: Matrix4<f32>,
    camera_position: [f32; 4],
    light: Light,
}

struct ObjectTransform {
    world: Matrix4<f32>,
    normal: Matrix3<f32>,
    instanced: bool,
}

pub struct RenderPipeline {
    options: PipelineOptions,
    programs: ShaderVariantCache,
    effects: Vec<Box<dyn Effect>>,
    main: Framebuffer,
    ping_pong: [Framebuffer; 2],
    quad: GeometryBuffer,
    fallback: Material,
    state: FrameState,
    dirty: bool,
    lost: bool,
}

impl RenderPipeline {
    /// Builds the pipeline with the default effect chain: ssao, outline,
    /// glow, tilt-shift, zoom blur and fxaa.
    pub fn new(
        device: &mut dyn GraphicsDevice,
        options: PipelineOptions,
    ) -> Result<Self, DeviceError> {
        let (width, height) = match options.viewport {
            Some((width, height)) => {
                if device.surface_size() != (width, height) {
                    device.resize_surface(width, height);
                }
                (width, height)
            }
            None => device.surface_size(),
        };
        let quad = GeometryBuffer::new(device, "fullscreen_quad", GeometryData::fullscreen_quad())
            .map_err(|error| match error {
                GeometryError::Device(error) => error,
                other => DeviceError::Invalid {
                    what: "fullscreen quad",
                    reason: other.to_string(),
                },
            })?;
        let targets = FramebufferOptions::default();
        let main = Framebuffer::new(device, "main", width, height, targets.clone())?;
        let ping_pong = [
            Framebuffer::new(device, "effect_a", width, height, targets.clone())?,
            Framebuffer::new(device, "effect_b", width, height, targets)?,
        ];
        let effects: Vec<Box<dyn Effect>> = vec![
            Box::new(SsaoEffect::new()),
            Box::new(OutlineEffect),
            Box::new(GlowEffect::new(&options.glow)),
            Box::new(TiltShiftEffect::new(&options.tilt_shift)),
            Box::new(ZoomBlurEffect),
            Box::new(FxaaEffect),
        ];
        log::info!("render pipeline ready at {}x{}", width, height);
        Ok(Self {
            options,
            programs: ShaderVariantCache::new(),
            effects,
            main,
            ping_pong,
            quad,
            fallback: Material::default(),
            state: FrameState::Idle,
            dirty: true,
            lost: false,
        })
    }

    /// Replaces the material shader cache, e.g. to use another template.
    pub fn with_programs(mut self, programs: ShaderVariantCache) -> Self {
        self.programs = programs;
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut PipelineOptions {
        self.dirty = true;
        &mut self.options
    }

    pub fn programs(&self) -> &ShaderVariantCache {
        &self.programs
    }

    /// Appends an effect after the built-in chain.
    pub fn push_effect(&mut self, effect: Box<dyn Effect>) {
        self.effects.push(effect);
        self.dirty = true;
    }

    pub fn effect_names(&self) -> Vec<&'static str> {
        self.effects.iter().map(|e| e.name()).collect()
    }

    /// Names of the effects the next frame runs, in order.
    pub fn enabled_effects(&self) -> Vec<&'static str> {
        self.effects
            .iter()
            .filter(|e| e.is_enabled(&self.options))
            .map(|e| e.name())
            .collect()
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.lost
    }

    pub fn main_target(&self) -> &Framebuffer {
        &self.main
    }

    /// Forces the next frame to be drawn.
    pub fn request_redraw(&mut self) {
        self.dirty = true;
    }

    pub fn needs_redraw(&self, scene: &Scene) -> bool {
        self.dirty || scene.is_dirty()
    }

    pub fn resize(
        &mut self,
        device: &mut dyn GraphicsDevice,
        scene: &mut Scene,
        width: u32,
        height: u32,
    ) -> Result<(), DeviceError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        device.resize_surface(width, height);
        scene.projection_mut().resize(width, height);
        self.main.resize(device, width, height)?;
        for target in &mut self.ping_pong {
            target.resize(device, width, height)?;
        }
        for effect in &mut self.effects {
            effect.resize(device, width, height)?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Forgets every GPU object and pauses rendering. Safe to call more
    /// than once.
    pub fn context_lost(&mut self, scene: &mut Scene, textures: &mut TextureCache) {
        if self.lost {
            return;
        }
        log::warn!("graphics context lost, pausing rendering");
        self.lost = true;
        self.state = FrameState::Paused;
        self.programs.invalidate();
        self.quad.invalidate();
        self.main.invalidate();
        self.ping_pong.iter_mut().for_each(Framebuffer::invalidate);
        self.effects.iter_mut().for_each(|e| e.invalidate());
        scene.invalidate();
        textures.invalidate();
    }

    /// Rebuilds GPU objects on a working device and resumes rendering.
    /// Programs compile again lazily.
    pub fn restore(
        &mut self,
        device: &mut dyn GraphicsDevice,
        scene: &mut Scene,
        textures: &mut TextureCache,
    ) -> Result<(), DeviceError> {
        if device.is_lost() {
            return Err(DeviceError::ContextLost);
        }
        self.quad.restore(device)?;
        self.main.restore(device)?;
        for target in &mut self.ping_pong {
            target.restore(device)?;
        }
        for effect in &mut self.effects {
            effect.restore(device)?;
        }
        scene.restore(device)?;
        textures.restore(device);
        self.lost = false;
        self.dirty = true;
        self.state = FrameState::Idle;
        log::info!("graphics context restored");
        Ok(())
    }

    pub fn render_frame(
        &mut self,
        device: &mut dyn GraphicsDevice,
        scene: &mut Scene,
        textures: &mut TextureCache,
    ) -> FrameOutcome {
        if device.is_lost() {
            self.context_lost(scene, textures);
        }
        if self.lost {
            return FrameOutcome::Paused;
        }

        self.state = FrameState::BeginFrame;
        if textures.drain(device) > 0 {
            self.dirty = true;
        }
        if scene.take_dirty() {
            self.dirty = true;
        }
        if !self.dirty {
            self.state = FrameState::Idle;
            return FrameOutcome::Skipped;
        }
        self.dirty = false;

        self.state = FrameState::MainPass;
        let draws = self.main_pass(device, scene, textures);
        log::trace!("main pass issued {} draws", draws);

        self.effect_chain(device, scene);

        self.state = FrameState::Present;
        let outcome = match device.present() {
            Ok(()) => FrameOutcome::Rendered,
            Err(DeviceError::ContextLost) => {
                self.context_lost(scene, textures);
                return FrameOutcome::Paused;
            }
            Err(error) => {
                log::error!("present failed: {}", error);
                self.dirty = true;
                FrameOutcome::Rendered
            }
        };
        self.state = FrameState::Idle;
        outcome
    }

    fn main_pass(
        &mut self,
        device: &mut dyn GraphicsDevice,
        scene: &Scene,
        textures: &mut TextureCache,
    ) -> u32 {
        let Some(target) = self.main.id() else {
            log::warn!("main target is not restored, skipping main pass");
            return 0;
        };
        device.clear(Some(target), &ClearOps::all(self.options.clear_color));
        let frame = FrameUniforms {
            target,
            view_proj: scene.view_proj(),
            camera_position: scene.camera().position.to_homogeneous().into(),
            light: *scene.light(),
        };

        let mut visible: Vec<&RenderObject> =
            scene.objects().iter().filter(|o| o.visible).collect();
        let mut issued = 0;
        for object in &visible {
            issued += self.draw_object(device, scene, textures, &frame, object, false);
        }
        visible.sort_by(|a, b| {
            scene
                .object_depth(b)
                .partial_cmp(&scene.object_depth(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for object in &visible {
            issued += self.draw_object(device, scene, textures, &frame, object, true);
        }
        issued
    }

    /// Draws the parts of `object` whose material belongs to the pass.
    fn draw_object(
        &mut self,
        device: &mut dyn GraphicsDevice,
        scene: &Scene,
        textures: &mut TextureCache,
        frame: &FrameUniforms,
        object: &RenderObject,
        transparent: bool,
    ) -> u32 {
        let Some(geometry) = scene.geometry(&object.geometry) else {
            log::debug!("object uses unknown geometry `{}`", object.geometry);
            return 0;
        };
        let graph = scene.graph();
        let (Some(world), Some(normal)) = (
            graph.world_matrix(object.node),
            graph.normal_matrix(object.node),
        ) else {
            return 0;
        };
        let transform = ObjectTransform {
            world,
            normal,
            instanced: geometry.instance_count().is_some(),
        };

        if geometry.parts().is_empty() {
            let material = object.material().unwrap_or(&self.fallback);
            if material.is_transparent() != transparent {
                return 0;
            }
            let Some(mut params) =
                prepare_draw(&mut self.programs, device, textures, frame, &transform, material)
            else {
                return 0;
            };
            return geometry.draw_all(device, &mut params);
        }

        let mut by_part: HashMap<&str, DrawParams> = HashMap::new();
        for part in geometry.parts() {
            if by_part.contains_key(part.material.as_str()) {
                continue;
            }
            let material = object.material_for(&part.material).unwrap_or(&self.fallback);
            if material.is_transparent() != transparent {
                continue;
            }
            if let Some(params) =
                prepare_draw(&mut self.programs, device, textures, frame, &transform, material)
            {
                by_part.insert(part.material.as_str(), params);
            }
        }
        let Some(mut params) = by_part.values().next().cloned() else {
            return 0;
        };
        geometry.draw(device, &mut params, |part, params| {
            match by_part.get(part.material.as_str()) {
                Some(prepared) => {
                    params.clone_from(prepared);
                    true
                }
                None => false,
            }
        })
    }

    fn effect_chain(&mut self, device: &mut dyn GraphicsDevice, scene: &Scene) {
        let enabled: Vec<usize> = (0..self.effects.len())
            .filter(|&i| self.effects[i].is_enabled(&self.options))
            .collect();
        let mut ctx = EffectContext {
            device,
            programs: &mut self.programs,
            scene,
            options: &self.options,
            quad: &self.quad,
        };
        if enabled.is_empty() {
            if let Some(main) = self.main.target() {
                let size = ctx.viewport();
                ctx.copy(main.texture, None, size);
            }
            return;
        }
        let mut input = &self.main;
        for (position, &index) in enabled.iter().enumerate() {
            self.state = FrameState::EffectChain(position);
            let output = if position + 1 == enabled.len() {
                None
            } else {
                Some(&self.ping_pong[position % 2])
            };
            self.effects[index].pass(&mut ctx, input, output);
            if let Some(output) = output {
                input = output;
            }
        }
    }

    pub fn destroy(&mut self, device: &mut dyn GraphicsDevice) {
        for effect in &mut self.effects {
            effect.destroy(device);
        }
        self.programs.destroy(device);
        self.quad.destroy(device);
        self.main.destroy(device);
        for target in &mut self.ping_pong {
            target.destroy(device);
        }
    }
}

/// Resolves program, textures and uniforms of one material. `None` skips
/// the draw: the program failed to compile or a texture has no GPU object.
fn prepare_draw(
    programs: &mut ShaderVariantCache,
    device: &mut dyn GraphicsDevice,
    textures: &mut TextureCache,
    frame: &FrameUniforms,
    transform: &ObjectTransform,
    material: &Material,
) -> Option<DrawParams> {
    let mut features = material.feature_key();
    if transform.instanced {
        features |= Features::INSTANCED;
    }
    let program = programs.get_program(device, features)?;

    let mut bindings = Vec::new();
    for image in material.images() {
        let texture = textures.request(device, image.source, image.normal_map);
        bindings.push(TextureBinding {
            slot: image.unit,
            texture: textures.texture(texture)?,
        });
    }

    let uniform = VariantUniform {
        model: transform.world.into(),
        view_proj: frame.view_proj.into(),
        normal_matrix: Matrix4::from(transform.normal).into(),
        camera_position: frame.camera_position,
        light_position: frame.light.position.to_homogeneous().into(),
        light_color: frame.light.color,
        ambient: material.ambient_color(),
        diffuse: material.diffuse_color(),
        specular: material.specular_color(),
        emissive: material.emissive_color(),
        wireframe_color: material.wireframe_color(),
        clip_plane: material.clip_plane().unwrap_or([0.0; 4]),
        params: [
            material.shininess(),
            material.transparency(),
            material.wireframe_width(),
            0.0,
        ],
    };
    let mut state = if material.is_transparent() {
        RenderState::transparent()
    } else {
        RenderState::opaque()
    };
    if material.double_sided() {
        state.cull = CullMode::None;
    }
    let mut params = DrawParams::new(Some(frame.target), program, state);
    params.uniforms = bytemuck::bytes_of(&uniform).to_vec();
    params.textures = bindings;
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Deg, Vector3};

    fn scene() -> Scene {
        Scene::new(
            Camera::new((0.0, 0.0, 5.0), Deg(-90.0), Deg(0.0)),
            Projection::new(100, 100, Deg(45.0), 0.1, 100.0),
        )
    }

    #[test]
    fn part_material_falls_back_to_first() {
        let object = RenderObject::new(NodeId(0), "g")
            .with_material(Material::new("body"))
            .with_material(Material::new("glass"));
        assert_eq!(object.material_for("glass").unwrap().name, "glass");
        assert_eq!(object.material_for("unknown").unwrap().name, "body");
        assert_eq!(RenderObject::new(NodeId(0), "g").diffuse_color(), [1.0; 4]);
    }

    #[test]
    fn mutable_access_marks_scene_dirty() {
        let mut scene = scene();
        assert!(scene.take_dirty());
        assert!(!scene.is_dirty());
        scene.camera_mut().position.x = 1.0;
        assert!(scene.take_dirty());
        let _ = scene.graph();
        assert!(!scene.is_dirty());
    }

    #[test]
    fn distance_factor_grows_with_depth() {
        let mut scene = scene();
        let near = scene.graph_mut().create_node();
        let far = scene.graph_mut().create_node();
        scene.graph_mut().set_position(far, Vector3::new(0.0, 0.0, -45.0));
        let near = scene.graph().world_matrix(near).unwrap();
        let far = scene.graph().world_matrix(far).unwrap();
        let ratio = scene.distance_factor(&far) / scene.distance_factor(&near);
        assert!((ratio - 10.0).abs() < 1e-3);
    }

    #[test]
    fn default_chain_runs_only_fxaa() {
        let mut device = crate::device::recording::RecordingDevice::new(64, 64);
        let pipeline = RenderPipeline::new(&mut device, PipelineOptions::default()).unwrap();
        assert_eq!(
            pipeline.effect_names(),
            vec!["ssao", "outline", "glow", "tilt_shift", "zoom_blur", "fxaa"]
        );
        assert_eq!(pipeline.enabled_effects(), vec!["fxaa"]);
    }
}
