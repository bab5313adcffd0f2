//! Whole frames of the hair system on the recording host.

use glam::{Mat4, Vec3};
use strandfx::device::{
    HeadlessDevice, ImageDesc, ImageFormat, QueueEvent, RenderDevice, ResourceState, SceneTargets,
};
use strandfx::hair::{DynamicPhase, FollowHairParams};
use strandfx::{
    CollisionMeshData, ColliderInput, HairAsset, HairInput, HairSystem, HairSystemConfig, OitMethod, SimulationMode,
};

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

fn scene(device: &mut HeadlessDevice, width: u32, height: u32) -> SceneTargets {
    let color = device
        .create_image(
            &ImageDesc::render_target("scene_color", width, height, ImageFormat::Rgba8UnormSrgb)
                .with_initial_state(ResourceState::RenderTarget),
        )
        .unwrap();
    let depth = device
        .create_image(&ImageDesc::depth("scene_depth", width, height).with_initial_state(ResourceState::DepthStencil))
        .unwrap();
    SceneTargets {
        color,
        depth,
        width,
        height,
    }
}

fn fringe() -> HairAsset {
    let guides: Vec<Vec3> = (0..4)
        .flat_map(|strand| (0..16).map(move |i| Vec3::new(-0.3 + 0.2 * strand as f32, 1.1 - 0.04 * i as f32, 0.9)))
        .collect();
    HairAsset::from_guide_strands(
        "fringe",
        16,
        &guides,
        FollowHairParams {
            count: 3,
            seed: 9,
            ..Default::default()
        },
    )
    .unwrap()
}

fn config(method: OitMethod, async_compute: bool) -> HairSystemConfig {
    let mut config = HairSystemConfig {
        async_compute,
        ..Default::default()
    };
    config.oit.method = method;
    config.collision.num_cells_x = 12;
    config
}

#[test]
fn frames_run_clean_with_either_method() {
    init_logging();
    for method in [OitMethod::Ppll, OitMethod::ShortCut] {
        let mut device = HeadlessDevice::new();
        let targets = scene(&mut device, 64, 48);
        let mut system = HairSystem::new(&mut device, targets, config(method, false)).unwrap();
        let hair = system.create_hair_object(&mut device, fringe()).unwrap();
        let head = system
            .create_collision_mesh(&mut device, CollisionMeshData::uv_sphere("head", 1.0, 8, 16))
            .unwrap();

        for frame in 0..6 {
            let bones = [Mat4::from_rotation_y(0.05 * frame as f32)];
            let summary = system
                .simulate(
                    &mut device,
                    1.0 / 60.0,
                    &[HairInput::new(hair, Some(&bones)).colliding_with(head)],
                    &[ColliderInput::new(head, Some(&bones))],
                )
                .unwrap();
            assert_eq!(summary.collisions, 1);
            system.draw(&mut device).unwrap();
            let reports = system.end_frame(&mut device).unwrap();
            assert!(reports.iter().all(|r| !r.overflowed()), "{:?}", reports);
        }

        assert!(device.violations().is_empty(), "{:?}: {:?}", method, device.violations());
        let object = system.object(hair).unwrap();
        assert_eq!(object.frame(), 6);
        assert_eq!(object.dynamic_state().phase(), DynamicPhase::Render);
        system.destroy(&mut device).unwrap();
        assert_eq!(device.live_allocations(), 2);
    }
}

#[test]
fn switching_methods_mid_session_leaks_nothing() {
    init_logging();
    let mut device = HeadlessDevice::new();
    let targets = scene(&mut device, 40, 30);
    let mut system = HairSystem::new(&mut device, targets, config(OitMethod::Ppll, false)).unwrap();
    let hair = system.create_hair_object(&mut device, fringe()).unwrap();
    let bones = [Mat4::IDENTITY];

    let frame = |system: &mut HairSystem, device: &mut HeadlessDevice| {
        system
            .simulate(device, 1.0 / 60.0, &[HairInput::new(hair, Some(&bones))], &[])
            .unwrap();
        system.draw(device).unwrap();
        system.end_frame(device).unwrap()
    };

    frame(&mut system, &mut device);
    let before = device.live_allocations();
    device.clear_events();

    assert!(system.set_oit_method(&mut device, OitMethod::ShortCut).unwrap());
    assert_eq!(device.events(), &[QueueEvent::Flush]);
    let reports = frame(&mut system, &mut device);
    assert_eq!(reports[0].name, "shortcut evicted fragments");

    assert!(system.set_oit_method(&mut device, OitMethod::Ppll).unwrap());
    assert!(!system.set_oit_method(&mut device, OitMethod::Ppll).unwrap());
    let reports = frame(&mut system, &mut device);
    assert_eq!(reports[0].name, "ppll nodes");
    assert_eq!(reports[0].capacity, 40 * 30 * system.config().oit.average_fragments_per_pixel as u64);

    assert_eq!(device.live_allocations(), before);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn render_transition_twice_is_a_no_op() {
    init_logging();
    let mut device = HeadlessDevice::new();
    let targets = scene(&mut device, 16, 16);
    let mut system = HairSystem::new(&mut device, targets, config(OitMethod::ShortCut, false)).unwrap();
    let hair = system.create_hair_object(&mut device, fringe()).unwrap();

    let object = system.object_mut(hair).unwrap();
    let state = object.dynamic_state_mut();
    assert_eq!(state.transition_to_render(device.graphics_context()), 2);
    assert_eq!(state.transition_to_render(device.graphics_context()), 0);
    assert_eq!(state.phase(), DynamicPhase::Render);
    assert_eq!(state.transition_to_simulation(device.graphics_context()), 2);
    assert_eq!(state.transition_to_simulation(device.graphics_context()), 0);
    device.submit_frame().unwrap();
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn async_compute_overlaps_until_the_draw() {
    init_logging();
    let mut device = HeadlessDevice::new();
    let targets = scene(&mut device, 16, 16);
    let mut system = HairSystem::new(&mut device, targets, config(OitMethod::ShortCut, true)).unwrap();
    let hair = system.create_hair_object(&mut device, fringe()).unwrap();
    let bones = [Mat4::IDENTITY];
    device.clear_events();

    for _ in 0..3 {
        system
            .simulate(
                &mut device,
                1.0 / 60.0,
                &[HairInput::new(hair, Some(&bones)).with_mode(SimulationMode::SkinOnly)],
                &[],
            )
            .unwrap();
        system.draw(&mut device).unwrap();
        system.end_frame(&mut device).unwrap();
    }
    let expected: Vec<QueueEvent> = (0..3)
        .flat_map(|_| {
            [
                QueueEvent::SignalComputeStart,
                QueueEvent::SubmitCompute,
                QueueEvent::WaitForCompute,
                QueueEvent::SubmitFrame,
            ]
        })
        .collect();
    assert_eq!(device.events(), expected.as_slice());
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn resize_to_zero_is_rejected() {
    let mut device = HeadlessDevice::new();
    let targets = scene(&mut device, 16, 16);
    let mut system = HairSystem::new(&mut device, targets, HairSystemConfig::default()).unwrap();
    let empty = SceneTargets {
        width: 0,
        ..targets
    };
    assert!(system.on_resize(&mut device, empty).is_err());
}
