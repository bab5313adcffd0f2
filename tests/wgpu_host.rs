//! Runs the hair system on a real adapter. Skips when none is available.

use glam::{Mat4, Vec3};
use strandfx::device::{BufferDesc, RenderDevice, WgpuDevice};
use strandfx::hair::FollowHairParams;
use strandfx::layouts::LayoutRegistry;
use strandfx::oit::{OitRenderer, PpllRenderer, ShortCutRenderer};
use strandfx::{CollisionMeshData, ColliderInput, HairAsset, HairInput, HairSystem, HairSystemConfig, OitMethod};

fn adapter() -> Option<WgpuDevice> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
    match WgpuDevice::new() {
        Ok(device) => Some(device),
        Err(error) => {
            eprintln!("skipping: {}", error);
            None
        }
    }
}

#[test]
#[ignore = "needs a GPU adapter"]
fn clear_values_read_back() {
    let Some(mut device) = adapter() else { return };
    let buffer = device.create_buffer(&BufferDesc::uint32("counter", 8)).unwrap();
    device.graphics_context().clear_u32(buffer, 0xFFFF_FFFF);
    let words = (&mut device as &mut dyn RenderDevice).read_u32s(buffer).unwrap();
    assert_eq!(words, vec![0xFFFF_FFFF; 8]);
    device.graphics_context().clear_u32(buffer, 0);
    let words = (&mut device as &mut dyn RenderDevice).read_u32s(buffer).unwrap();
    assert_eq!(words, vec![0; 8]);
}

#[test]
#[ignore = "needs a GPU adapter"]
fn transparency_pipelines_build_on_the_adapter() {
    let Some(mut device) = adapter() else { return };
    let scene = device.create_scene_targets(64, 48).unwrap();
    let layouts = LayoutRegistry::new(&mut device).unwrap();

    let ppll = PpllRenderer::new(&mut device, &layouts, scene, 4).unwrap();
    Box::new(ppll).destroy(&mut device);
    let shortcut = ShortCutRenderer::new(&mut device, &layouts, scene).unwrap();
    Box::new(shortcut).destroy(&mut device);

    layouts.destroy(&mut device);
    assert_eq!(device.violations(), 0);
}

#[test]
#[ignore = "needs a GPU adapter"]
fn frames_run_on_the_gpu_with_both_methods() {
    let Some(mut device) = adapter() else { return };
    let scene = device.create_scene_targets(128, 96).unwrap();
    let mut config = HairSystemConfig::default();
    config.collision.num_cells_x = 16;
    config.collision.generate_iso_surface = true;
    let mut system = HairSystem::new(&mut device, scene, config).unwrap();

    let guides: Vec<Vec3> = (0..8)
        .flat_map(|s| (0..16).map(move |i| Vec3::new(-0.4 + 0.1 * s as f32, 1.0 - 0.05 * i as f32, 0.8)))
        .collect();
    let asset = HairAsset::from_guide_strands(
        "gpu",
        16,
        &guides,
        FollowHairParams {
            count: 3,
            ..Default::default()
        },
    )
    .unwrap();
    let hair = system.create_hair_object(&mut device, asset).unwrap();
    let head = system
        .create_collision_mesh(&mut device, CollisionMeshData::uv_sphere("head", 0.7, 10, 20))
        .unwrap();

    for method in [OitMethod::ShortCut, OitMethod::Ppll] {
        system.set_oit_method(&mut device, method).unwrap();
        for frame in 0..4 {
            let bones = [Mat4::from_rotation_y(0.1 * frame as f32)];
            system
                .simulate(
                    &mut device,
                    1.0 / 60.0,
                    &[HairInput::new(hair, Some(&bones)).colliding_with(head)],
                    &[ColliderInput::new(head, Some(&bones))],
                )
                .unwrap();
            system.draw(&mut device).unwrap();
            let reports = system.end_frame(&mut device).unwrap();
            assert!(!reports.is_empty());
        }
    }
    assert_eq!(device.violations(), 0);

    let positions = (&mut device as &mut dyn RenderDevice)
        .read_buffer(system.object(hair).unwrap().positions())
        .unwrap();
    assert!(positions
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .all(f32::is_finite));

    system.destroy(&mut device).unwrap();
}
