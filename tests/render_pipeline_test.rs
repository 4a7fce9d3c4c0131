mod common;

use common::test_utils::*;
use flow_vfx::{
    data_structures::material::{ImageSource, Material},
    device::{BlendMode, recording::Command},
    render::{FrameOutcome, FrameState, PipelineOptions},
    resources::DecodedImage,
};

fn without_effects() -> PipelineOptions {
    let mut options = PipelineOptions::default();
    options.fxaa.enabled = false;
    options
}

fn created_framebuffers(commands: &[Command]) -> usize {
    commands
        .iter()
        .filter(|c| matches!(c, Command::CreateFramebuffer { .. }))
        .count()
}

#[test]
fn unchanged_frames_are_skipped() {
    let mut h = Harness::new(PipelineOptions::default());
    h.add_cube([0.0, 0.0, 0.0], |o| o);

    assert_eq!(h.render(), FrameOutcome::Rendered);
    assert_eq!(h.pipeline.state(), FrameState::Idle);
    let issued = h.draws().len();
    assert_eq!(h.render(), FrameOutcome::Skipped);
    assert_eq!(h.draws().len(), issued);

    h.scene.camera_mut().position.x = 0.5;
    assert_eq!(h.render(), FrameOutcome::Rendered);
    assert!(h.draws().len() > issued);

    h.pipeline.options_mut().clear_color = [0.0; 4];
    assert!(h.pipeline.needs_redraw(&h.scene));
    assert_eq!(h.render(), FrameOutcome::Rendered);
}

#[test]
fn opaque_objects_draw_before_transparent_ones() {
    let mut h = Harness::new(without_effects());
    let mut glass = Material::new("glass");
    glass.set_transparency(0.5);
    h.add_cube([0.0, 0.0, -2.0], |o| o.with_material(glass.clone()));
    h.add_cube([0.0, 0.0, 0.0], |o| o.with_material(glass));
    h.add_cube([1.0, 0.0, 0.0], |o| o.with_material(Material::new("stone")));

    h.render();
    let main = h.pipeline.main_target().id();
    let scene_draws: Vec<_> = h.draws().into_iter().filter(|d| d.target == main).collect();
    assert_eq!(scene_draws.len(), 3);
    assert_eq!(scene_draws[0].state.blend, BlendMode::Replace);
    assert_eq!(scene_draws[1].state.blend, BlendMode::Alpha);
    assert_eq!(scene_draws[2].state.blend, BlendMode::Alpha);
    assert!(!scene_draws[1].state.depth_write);

    // farthest transparent object first
    let z = |d: &flow_vfx::device::recording::RecordedDraw| {
        d.uniforms_as::<flow_vfx::shaders::VariantUniform>().unwrap().model[3][2]
    };
    assert_eq!(z(&scene_draws[1]), -2.0);
    assert_eq!(z(&scene_draws[2]), 0.0);
}

#[test]
fn materials_with_equal_features_share_a_program() {
    let mut h = Harness::new(without_effects());
    let mut red = Material::new("red");
    red.set_diffuse_color([1.0, 0.0, 0.0, 1.0]);
    let mut blue = Material::new("blue");
    blue.set_diffuse_color([0.0, 0.0, 1.0, 1.0]);
    h.add_cube([-1.0, 0.0, 0.0], |o| o.with_material(red));
    h.add_cube([1.0, 0.0, 0.0], |o| o.with_material(blue));
    h.add_cube([0.0, 1.0, 0.0], |o| o);

    h.render();
    let main = h.pipeline.main_target().id();
    let scene_draws: Vec<_> = h.draws().into_iter().filter(|d| d.target == main).collect();
    assert_eq!(scene_draws.len(), 3);
    assert!(scene_draws.iter().all(|d| d.program == scene_draws[0].program));
    assert_eq!(h.program_label(&scene_draws[0]), "variant[LIGHT]");
    assert_eq!(h.pipeline.programs().len(), 1);
}

#[test]
fn failed_variant_skips_only_its_objects() {
    let mut device = flow_vfx::device::recording::RecordingDevice::new(WIDTH, HEIGHT);
    device.fail_compile_on("t_normal");
    let mut h = Harness::with_device(device, without_effects());
    let mut bumpy = Material::new("bumpy");
    bumpy.set_normal_image(Some(ImageSource::from("bumps.png")));
    h.add_cube([-1.0, 0.0, 0.0], |o| o.with_material(bumpy));
    h.add_cube([1.0, 0.0, 0.0], |o| o.with_material(Material::new("plain")));

    assert_eq!(h.render(), FrameOutcome::Rendered);
    let main = h.pipeline.main_target().id();
    let scene_draws: Vec<_> = h.draws().into_iter().filter(|d| d.target == main).collect();
    assert_eq!(scene_draws.len(), 1);
    assert_eq!(h.program_label(&scene_draws[0]), "variant[LIGHT]");

    // the failure is remembered, not retried every frame
    let programs = h.device.program_count();
    h.scene.mark_dirty();
    h.render();
    assert_eq!(h.device.program_count(), programs);
}

#[test]
fn effect_chain_ends_on_the_surface() {
    let mut options = PipelineOptions::default();
    options.outline.enabled = true;
    let mut h = Harness::new(options);
    h.add_cube([0.0, 0.0, 0.0], |o| o.with_outline(true));
    assert_eq!(h.pipeline.enabled_effects(), vec!["outline", "fxaa"]);

    h.render();
    let draws = h.draws();
    let main = h.pipeline.main_target().id();
    let outline_draws: Vec<_> = draws
        .iter()
        .filter(|d| h.program_label(d) == "solid")
        .collect();
    assert_eq!(outline_draws.len(), 2);
    assert!(outline_draws.iter().all(|d| d.target.is_some() && d.target != main));

    let last = draws.last().unwrap();
    assert_eq!(last.target, None);
    assert_eq!(h.program_label(last), "fxaa");
    assert_eq!(last.textures[0].texture, {
        let fb = outline_draws[0].target.unwrap();
        h.device.framebuffer_desc(fb).unwrap().color
    });
}

#[test]
fn empty_chain_copies_main_to_the_surface() {
    let mut h = Harness::new(without_effects());
    h.add_cube([0.0, 0.0, 0.0], |o| o);
    assert!(h.pipeline.enabled_effects().is_empty());

    h.render();
    let last = h.draws().last().cloned().unwrap();
    assert_eq!(last.target, None);
    assert_eq!(h.program_label(&last), "blit");
    assert_eq!(
        Some(last.textures[0].texture),
        h.pipeline.main_target().texture()
    );
}

#[test]
fn resize_rebuilds_targets_only_when_the_size_changes() {
    let mut h = Harness::new(PipelineOptions::default());
    h.render();
    h.device.take_commands();

    h.pipeline
        .resize(&mut h.device, &mut h.scene, WIDTH, HEIGHT)
        .unwrap();
    assert_eq!(created_framebuffers(h.device.commands()), 0);

    h.pipeline.resize(&mut h.device, &mut h.scene, 0, 10).unwrap();
    assert_eq!(h.pipeline.main_target().size(), (WIDTH, HEIGHT));

    h.pipeline.resize(&mut h.device, &mut h.scene, 128, 32).unwrap();
    assert!(created_framebuffers(h.device.commands()) >= 3);
    assert_eq!(h.pipeline.main_target().size(), (128, 32));
    assert_eq!(h.render(), FrameOutcome::Rendered);
}

#[test]
fn lost_context_pauses_until_restored() {
    let mut h = Harness::new(PipelineOptions::default());
    h.add_cube([0.0, 0.0, 0.0], |o| o);
    assert_eq!(h.render(), FrameOutcome::Rendered);
    let epoch = h.textures.epoch();

    h.device.lose_context();
    assert_eq!(h.render(), FrameOutcome::Paused);
    assert_eq!(h.render(), FrameOutcome::Paused);
    assert!(h.pipeline.is_paused());
    assert_eq!(h.pipeline.state(), FrameState::Paused);
    assert_eq!(h.textures.epoch(), epoch + 1);

    h.device.restore_context();
    h.device.take_commands();
    h.pipeline
        .restore(&mut h.device, &mut h.scene, &mut h.textures)
        .unwrap();
    assert_eq!(h.render(), FrameOutcome::Rendered);

    let recompiled: Vec<_> = h
        .device
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::CreateProgram { label, .. } => Some(label.clone()),
            _ => None,
        })
        .collect();
    assert!(recompiled.contains(&"variant[LIGHT]".to_string()));
    assert!(recompiled.contains(&"fxaa".to_string()));
    assert!(h.device.buffer_count() > 0);
}

#[test]
fn restore_fails_while_the_device_is_still_lost() {
    let mut h = Harness::new(PipelineOptions::default());
    h.device.lose_context();
    assert_eq!(h.render(), FrameOutcome::Paused);
    assert!(
        h.pipeline
            .restore(&mut h.device, &mut h.scene, &mut h.textures)
            .is_err()
    );
    assert!(h.pipeline.is_paused());
}

#[test]
fn finished_texture_load_triggers_a_redraw() {
    let mut h = Harness::new(without_effects());
    let mut wood = Material::new("wood");
    wood.set_diffuse_image(Some(ImageSource::from("wood.png")));
    h.add_cube([0.0, 0.0, 0.0], |o| o.with_material(wood));

    assert_eq!(h.render(), FrameOutcome::Rendered);
    assert_eq!(h.loader.pending(), vec!["wood.png".to_string()]);
    let main = h.pipeline.main_target().id();
    let bound = |h: &Harness| {
        let draw = h
            .draws()
            .into_iter()
            .filter(|d| d.target == main)
            .last()
            .unwrap();
        h.device
            .texture_pixels(draw.textures[0].texture)
            .unwrap()
            .to_vec()
    };
    assert_eq!(bound(&h), vec![255, 255, 255, 255]);
    assert_eq!(h.render(), FrameOutcome::Skipped);

    h.loader
        .complete("wood.png", Ok(DecodedImage::solid([120, 80, 40, 255])));
    assert_eq!(h.render(), FrameOutcome::Rendered);
    assert_eq!(bound(&h), vec![120, 80, 40, 255]);
    assert!(h.loader.pending().is_empty());
}

#[test]
fn texture_loads_from_before_a_loss_are_discarded() {
    let mut h = Harness::new(without_effects());
    let mut wood = Material::new("wood");
    wood.set_diffuse_image(Some(ImageSource::from("wood.png")));
    h.add_cube([0.0, 0.0, 0.0], |o| o.with_material(wood));
    h.render();

    h.device.lose_context();
    assert_eq!(h.render(), FrameOutcome::Paused);
    h.loader
        .complete("wood.png", Ok(DecodedImage::solid([1, 2, 3, 255])));

    h.device.restore_context();
    h.pipeline
        .restore(&mut h.device, &mut h.scene, &mut h.textures)
        .unwrap();
    assert_eq!(h.render(), FrameOutcome::Rendered);
    // refetched after the restore; the stale result never reached the GPU
    assert_eq!(h.loader.pending(), vec!["wood.png".to_string()]);
    let main = h.pipeline.main_target().id();
    let draw = h
        .draws()
        .into_iter()
        .filter(|d| d.target == main)
        .last()
        .unwrap();
    assert_eq!(
        h.device.texture_pixels(draw.textures[0].texture),
        Some(&[255u8, 255, 255, 255][..])
    );
}
