#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use cgmath::Deg;
use flow_vfx::{
    camera::{Camera, Projection},
    data_structures::geometry::GeometryData,
    device::recording::{RecordedDraw, RecordingDevice},
    error::ResourceLoadError,
    pipelines::MeshUniform,
    render::{PipelineOptions, RenderObject, RenderPipeline, Scene},
    resources::{AssetLoader, DecodedImage, LoadCallback, texture::TextureCache},
};

pub(crate) const WIDTH: u32 = 64;
pub(crate) const HEIGHT: u32 = 64;

/// Camera five units in front of the origin, looking down -z.
pub(crate) fn camera() -> Camera {
    Camera::new((0.0, 0.0, 5.0), Deg(-90.0), Deg(0.0))
}

pub(crate) fn projection() -> Projection {
    Projection::new(WIDTH, HEIGHT, Deg(45.0), 0.1, 100.0)
}

pub(crate) fn scene() -> Scene {
    Scene::new(camera(), projection())
}

/// World units per pixel at the origin for [`camera`] and [`projection`].
pub(crate) fn units_per_pixel() -> f32 {
    projection().world_units_per_pixel(5.0)
}

/// Loader that holds callbacks until the test completes them.
#[derive(Clone, Default)]
pub(crate) struct DeferredLoader {
    pending: Arc<Mutex<Vec<(String, LoadCallback)>>>,
}

impl DeferredLoader {
    pub(crate) fn pending(&self) -> Vec<String> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub(crate) fn complete(&self, url: &str, result: Result<DecodedImage, ResourceLoadError>) {
        let done = {
            let mut pending = self.pending.lock().unwrap();
            let position = pending
                .iter()
                .position(|(u, _)| u == url)
                .unwrap_or_else(|| panic!("no pending load for {}", url));
            pending.remove(position).1
        };
        done(result);
    }
}

impl AssetLoader for DeferredLoader {
    fn fetch(&self, url: &str, done: LoadCallback) {
        self.pending.lock().unwrap().push((url.to_string(), done));
    }
}

/// Everything one frame needs, wired to a recording device.
pub(crate) struct Harness {
    pub(crate) device: RecordingDevice,
    pub(crate) scene: Scene,
    pub(crate) pipeline: RenderPipeline,
    pub(crate) textures: TextureCache,
    pub(crate) loader: DeferredLoader,
}

impl Harness {
    pub(crate) fn new(options: PipelineOptions) -> Self {
        Self::with_device(RecordingDevice::new(WIDTH, HEIGHT), options)
    }

    pub(crate) fn with_device(mut device: RecordingDevice, options: PipelineOptions) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let pipeline = RenderPipeline::new(&mut device, options).unwrap();
        let loader = DeferredLoader::default();
        Self {
            device,
            scene: scene(),
            pipeline,
            textures: TextureCache::new(loader.clone()),
            loader,
        }
    }

    /// Adds a unit cube at `position` and returns the object index.
    pub(crate) fn add_cube(
        &mut self,
        position: [f32; 3],
        object: impl FnOnce(RenderObject) -> RenderObject,
    ) -> usize {
        if self.scene.geometry("cube").is_none() {
            self.scene
                .add_geometry(&mut self.device, "cube", GeometryData::cube(1.0))
                .unwrap();
        }
        let node = self.scene.graph_mut().create_node();
        self.scene.graph_mut().set_position(node, position.into());
        self.scene.add_object(object(RenderObject::new(node, "cube")))
    }

    pub(crate) fn render(&mut self) -> flow_vfx::render::FrameOutcome {
        self.pipeline
            .render_frame(&mut self.device, &mut self.scene, &mut self.textures)
    }

    pub(crate) fn draws(&self) -> Vec<RecordedDraw> {
        self.device.draws().into_iter().cloned().collect()
    }

    pub(crate) fn program_label(&self, draw: &RecordedDraw) -> String {
        self.device
            .program_source(draw.program)
            .map(|source| source.label.clone())
            .unwrap_or_default()
    }
}

/// Covers a disc per mesh-effect draw: centred on the object's projected
/// origin, with a radius of `base` pixels plus the normal offset converted
/// back to pixels. Other draws cover nothing.
pub(crate) fn disc_rasterizer(base: f32) -> impl Fn(&RecordedDraw) -> Vec<(u32, u32)> + 'static {
    let units = units_per_pixel();
    move |draw| {
        let Some(uniform) = draw.uniforms_as::<MeshUniform>() else {
            return Vec::new();
        };
        let cx = WIDTH as f32 / 2.0 + uniform.model[3][0] / units;
        let cy = HEIGHT as f32 / 2.0 - uniform.model[3][1] / units;
        let radius = base + uniform.params[0] / units;
        let mut pixels = Vec::new();
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let (dx, dy) = (x as f32 + 0.5 - cx, y as f32 + 0.5 - cy);
                if (dx * dx + dy * dy).sqrt() <= radius {
                    pixels.push((x, y));
                }
            }
        }
        pixels
    }
}

/// Distance of a pixel centre from the projected origin of `x`.
pub(crate) fn pixel_distance(pixel: (u32, u32), x: f32) -> f32 {
    let cx = WIDTH as f32 / 2.0 + x / units_per_pixel();
    let cy = HEIGHT as f32 / 2.0;
    let (dx, dy) = (pixel.0 as f32 + 0.5 - cx, pixel.1 as f32 + 0.5 - cy);
    (dx * dx + dy * dy).sqrt()
}
