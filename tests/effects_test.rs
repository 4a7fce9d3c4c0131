mod common;

use cgmath::Vector3;
use common::test_utils::*;
use flow_vfx::{
    data_structures::{
        geometry::GeometryData,
        instance::Instance,
        material::Material,
    },
    device::recording::{RecordedDraw, RecordingDevice},
    pipelines::ScreenUniform,
    render::{FrameOutcome, PipelineOptions, RenderObject},
};

fn all_effects() -> PipelineOptions {
    let mut options = PipelineOptions::default();
    options.ssao.enabled = true;
    options.outline.enabled = true;
    options.glow.enabled = true;
    options.tilt_shift.enabled = true;
    options.zoom_blur.enabled = true;
    options.fxaa.enabled = true;
    options
}

#[test]
fn full_chain_runs_in_order() {
    let mut h = Harness::new(all_effects());
    h.add_cube([0.0, 0.0, 0.0], |o| o.with_outline(true).with_glow(true));
    h.add_cube([1.5, 0.0, 0.0], |o| o);
    assert_eq!(
        h.pipeline.enabled_effects(),
        vec!["ssao", "outline", "glow", "tilt_shift", "zoom_blur", "fxaa"]
    );

    assert_eq!(h.render(), FrameOutcome::Rendered);
    let draws = h.draws();
    let last = draws.last().unwrap();
    assert_eq!(last.target, None);
    assert_eq!(h.program_label(last), "fxaa");
    // six effects: the fifth one wrote the first ping-pong target
    let input = h.device.texture_desc(last.textures[0].texture).unwrap();
    assert_eq!(input.label, "effect_a");
    assert_eq!(draws.iter().filter(|d| d.target.is_none()).count(), 1);
}

#[test]
fn disabling_an_effect_takes_it_out_of_the_chain() {
    let mut h = Harness::new(all_effects());
    h.add_cube([0.0, 0.0, 0.0], |o| o);
    h.pipeline.options_mut().fxaa.enabled = false;
    h.pipeline.options_mut().zoom_blur.enabled = false;
    assert_eq!(
        h.pipeline.enabled_effects(),
        vec!["ssao", "outline", "glow", "tilt_shift"]
    );
    assert_eq!(h.render(), FrameOutcome::Rendered);
    let draws = h.draws();
    assert!(draws.iter().all(|d| h.program_label(d) != "fxaa"));
    assert!(draws.last().unwrap().target.is_none());
}

/// Mesh draws cover discs, full-screen draws cover the whole target.
fn glow_rasterizer() -> impl Fn(&RecordedDraw) -> Vec<(u32, u32)> + 'static {
    let disc = disc_rasterizer(4.0);
    move |draw| {
        if draw.uniforms_as::<ScreenUniform>().is_some() {
            (0..HEIGHT)
                .flat_map(|y| (0..WIDTH).map(move |x| (x, y)))
                .collect()
        } else {
            disc(draw)
        }
    }
}

#[test]
fn glow_is_hidden_behind_non_glowing_objects() {
    let mut options = PipelineOptions::default();
    options.fxaa.enabled = false;
    options.glow.enabled = true;
    let device = RecordingDevice::new(WIDTH, HEIGHT).with_rasterizer(glow_rasterizer());
    let mut h = Harness::with_device(device, options);
    let mut lamp = Material::new("lamp");
    lamp.set_diffuse_color([1.0, 0.9, 0.2, 1.0]);
    h.add_cube([-0.5, 0.0, 0.0], |o| o.with_material(lamp).with_glow(true));
    h.add_cube([0.5, 0.0, 0.0], |o| o);

    assert_eq!(h.render(), FrameOutcome::Rendered);
    let writes = h.device.color_writes(None);
    // copy everywhere, composite only outside the occluder
    for (&pixel, &count) in &writes {
        if pixel_distance(pixel, 0.5) <= 4.0 {
            assert_eq!(count, 1, "glow leaked onto occluder at {:?}", pixel);
        } else {
            assert_eq!(count, 2, "glow missing at {:?}", pixel);
        }
    }
    assert_eq!(writes.len(), (WIDTH * HEIGHT) as usize);

    let mask = h
        .draws()
        .into_iter()
        .find(|d| {
            d.state.color_write && d.uniforms_as::<flow_vfx::pipelines::MeshUniform>().is_some()
        })
        .unwrap();
    assert_ne!(mask.target, None);
    let uniform = mask
        .uniforms_as::<flow_vfx::pipelines::MeshUniform>()
        .unwrap();
    assert_eq!(uniform.color, [1.0, 0.9, 0.2, 1.0]);
}

#[test]
fn instanced_geometry_uses_the_instanced_variant() {
    let mut h = Harness::new(PipelineOptions::default());
    let offsets: Vec<f32> = [-2.0, 0.0, 2.0]
        .into_iter()
        .flat_map(|x| {
            let instance = Instance {
                position: Vector3::new(x, 0.0, 0.0),
                ..Instance::new()
            };
            instance.to_raw().model.into_iter().flatten()
        })
        .collect();
    h.scene
        .add_geometry(
            &mut h.device,
            "crates",
            GeometryData::cube(0.5).with_attribute("instanceOffset", offsets),
        )
        .unwrap();
    let node = h.scene.graph_mut().create_node();
    h.scene.add_object(RenderObject::new(node, "crates"));

    assert_eq!(h.render(), FrameOutcome::Rendered);
    let main = h.pipeline.main_target().id();
    let draw = h
        .draws()
        .into_iter()
        .find(|d| d.target == main)
        .unwrap();
    assert_eq!(draw.instances, 3);
    assert_eq!(h.program_label(&draw), "variant[LIGHT,INSTANCED]");
    assert!(draw.streams.iter().any(|s| s.per_instance));
}
