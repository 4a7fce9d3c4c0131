#![cfg(feature = "integration-tests")]

mod common;

use common::test_utils::*;
use flow_vfx::{
    data_structures::{geometry::GeometryData, material::Material},
    device::{GraphicsDevice, wgpu_device::WgpuDevice},
    render::{FrameOutcome, PipelineOptions, RenderObject, RenderPipeline},
    resources::{MemoryLoader, texture::TextureCache},
};

const WHITE: [u8; 4] = [255, 255, 255, 255];
const RED: [u8; 4] = [255, 0, 0, 255];

fn headless() -> WgpuDevice {
    let _ = env_logger::builder().is_test(true).try_init();
    tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(WgpuDevice::headless(WIDTH, HEIGHT))
        .unwrap()
}

fn pixel(pixels: &[u8], x: u32, y: u32) -> [u8; 4] {
    let at = ((y * WIDTH + x) * 4) as usize;
    [pixels[at], pixels[at + 1], pixels[at + 2], pixels[at + 3]]
}

fn assert_close(actual: [u8; 4], expected: [u8; 4]) {
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!(a.abs_diff(*e) <= 2, "{:?} != {:?}", actual, expected);
    }
}

fn render(options: PipelineOptions, with_cube: bool) -> Vec<u8> {
    let mut device = headless();
    let mut scene = scene();
    let mut pipeline = RenderPipeline::new(&mut device, options).unwrap();
    let mut textures = TextureCache::new(MemoryLoader::new());
    if with_cube {
        scene
            .add_geometry(&mut device, "cube", GeometryData::cube(1.0))
            .unwrap();
        let node = scene.graph_mut().create_node();
        let mut red = Material::new("red");
        red.set_light(false);
        red.set_diffuse_color([1.0, 0.0, 0.0, 1.0]);
        scene.add_object(RenderObject::new(node, "cube").with_material(red));
    }

    assert_eq!(
        pipeline.render_frame(&mut device, &mut scene, &mut textures),
        FrameOutcome::Rendered
    );
    let pixels = device.read_pixels(None).unwrap();
    pipeline.destroy(&mut device);
    pixels
}

fn white_background() -> PipelineOptions {
    let mut options = PipelineOptions::default();
    options.clear_color = [1.0, 1.0, 1.0, 1.0];
    options.fxaa.enabled = false;
    options
}

#[test]
fn should_render_clear_colour() {
    let pixels = render(white_background(), false);
    assert_eq!(pixels.len(), (WIDTH * HEIGHT * 4) as usize);
    for chunk in pixels.chunks_exact(4) {
        assert_close([chunk[0], chunk[1], chunk[2], chunk[3]], WHITE);
    }
}

#[test]
fn should_render_unlit_cube() {
    let pixels = render(white_background(), true);
    assert_close(pixel(&pixels, WIDTH / 2, HEIGHT / 2), RED);
    assert_close(pixel(&pixels, 1, 1), WHITE);
    assert_close(pixel(&pixels, WIDTH - 2, HEIGHT - 2), WHITE);
}

#[test]
fn should_keep_flat_areas_through_fxaa() {
    let mut options = white_background();
    options.fxaa.enabled = true;
    let pixels = render(options, true);
    assert_close(pixel(&pixels, WIDTH / 2, HEIGHT / 2), RED);
    assert_close(pixel(&pixels, 1, 1), WHITE);
}
