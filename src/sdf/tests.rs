use super::*;
use crate::config::{CollisionSettings, RenderingSettings, SimulationSettings};
use crate::constants::INITIAL_DISTANCE;
use crate::device::{
    Attachment, HeadlessDevice, ImageDesc, ImageFormat, RenderDevice, RenderTargetSetDesc, ResourceState,
};
use crate::hair::{FollowHairParams, HairAsset, HairObject};
use glam::{Mat4, Vec3};

fn sphere() -> CollisionMeshData {
    CollisionMeshData::uv_sphere("sphere", 1.0, 12, 24)
}

fn coarse() -> CollisionSettings {
    CollisionSettings {
        num_cells_x: 10,
        ..Default::default()
    }
}

fn sphere_volume() -> SdfVolume {
    let data = sphere();
    let settings = coarse();
    let grid = SdfGrid::new(&Aabb::from_points(&data.positions), &settings).unwrap();
    SdfVolume::build(&grid, &data.positions, &data.indices, settings.collision_margin)
}

#[test]
fn uv_sphere_is_a_valid_closed_mesh() {
    let data = sphere();
    data.validate().unwrap();
    assert_eq!(data.num_triangles(), 2 * 24 * 12 - 2 * 24);

    // Every undirected edge is shared by exactly two triangles with opposite
    // directions.
    let mut directed = rustc_hash::FxHashMap::default();
    for t in data.indices.chunks_exact(3) {
        for (a, b) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
            *directed.entry((a, b)).or_insert(0) += 1;
        }
    }
    for (&(a, b), &count) in &directed {
        assert_eq!(count, 1);
        assert_eq!(directed.get(&(b, a)), Some(&1), "edge {}-{} is open", a, b);
    }
}

#[test]
fn invalid_meshes_are_rejected() {
    let mut data = sphere();
    data.indices.push(0);
    assert!(data.validate().is_err());

    let mut data = sphere();
    data.indices[0] = 10_000;
    assert!(data.validate().is_err());

    let mut data = sphere();
    data.bone_skinning = vec![Default::default(); 3];
    assert!(data.validate().is_err());
}

#[test]
fn sphere_field_is_negative_inside_and_positive_outside() {
    let volume = sphere_volume();
    assert!(volume.values.iter().all(|v| v.is_finite() && v.abs() < 0.5 * INITIAL_DISTANCE));

    let center = volume.sample(Vec3::ZERO);
    assert!((center + 1.0).abs() < 0.05, "center distance {}", center);
    let above = volume.sample(Vec3::new(0.0, 1.3, 0.0));
    assert!((above - 0.3).abs() < 0.05, "distance above the pole {}", above);

    let far = volume.sample(Vec3::new(10.0, 0.0, 0.0));
    assert!(far.is_finite() && far > 0.0);
}

#[test]
fn vertices_inside_the_margin_are_pushed_out() {
    let volume = sphere_volume();
    let margin = 0.005;

    let pushed = volume.collide(Vec3::new(0.5, 0.0, 0.0), margin);
    assert!(pushed.x > 0.95, "pushed to {:?}", pushed);
    assert!(pushed.y.abs() < 0.1 && pushed.z.abs() < 0.1);

    let outside = Vec3::new(0.0, 1.5, 0.0);
    assert_eq!(volume.collide(outside, margin), outside);
    let beyond_grid = Vec3::new(50.0, 0.0, 0.0);
    assert_eq!(volume.collide(beyond_grid, margin), beyond_grid);
}

#[test]
fn iso_surface_of_a_sphere_faces_outward() {
    let volume = sphere_volume();
    let triangles = extract_iso_surface(&volume, 0.0);
    assert!(triangles.len() > 100);

    let mut outward = 0;
    for [a, b, c] in &triangles {
        for p in [a, b, c] {
            assert!((p.length() - 1.0).abs() < 0.1, "vertex {:?} off the surface", p);
        }
        let normal = (*b - *a).cross(*c - *a);
        if normal.dot((*a + *b + *c) / 3.0) > 0.0 {
            outward += 1;
        }
    }
    assert!(outward * 100 >= triangles.len() * 95, "{} of {} outward", outward, triangles.len());
}

struct Scene {
    device: HeadlessDevice,
    layouts: LayoutRegistry,
    kernels: SdfKernels,
}

fn scene() -> Scene {
    let mut device = HeadlessDevice::new();
    let layouts = LayoutRegistry::new(&mut device).unwrap();
    let kernels = SdfKernels::new(&mut device, &layouts).unwrap();
    Scene {
        device,
        layouts,
        kernels,
    }
}

fn hair(scene: &mut Scene) -> HairObject {
    let guides: Vec<Vec3> = (0..8).map(|i| Vec3::new(0.0, 1.2 - 0.05 * i as f32, 0.0)).collect();
    let asset = HairAsset::from_guide_strands("hair", 8, &guides, FollowHairParams::default()).unwrap();
    HairObject::new(
        &mut scene.device,
        &scene.layouts,
        asset,
        &SimulationSettings::default(),
        &RenderingSettings::default(),
    )
    .unwrap()
}

#[test]
fn field_rebuild_runs_three_guarded_passes() {
    let mut s = scene();
    let mut mesh = CollisionMesh::new(&mut s.device, &s.layouts, &s.kernels, sphere(), &coarse()).unwrap();
    assert!(mesh.update(s.device.graphics_context(), &s.kernels, Some(&[Mat4::IDENTITY])));
    s.device.submit_frame().unwrap();

    assert_eq!(
        s.device.executed_pipelines(),
        vec!["initialize_sdf", "construct_sdf", "finalize_sdf"]
    );
    assert!(s.device.violations().is_empty(), "{:?}", s.device.violations());
    assert_eq!(s.device.resource_state(mesh.cells()), Some(ResourceState::ShaderRead));
    assert!(mesh.has_field());

    // A second rebuild starts from the shader-readable field.
    assert!(mesh.update(s.device.graphics_context(), &s.kernels, Some(&[Mat4::from_translation(Vec3::X)])));
    s.device.submit_frame().unwrap();
    assert!(s.device.violations().is_empty());
    assert!(mesh.grid().origin.x > -1.0 - mesh.grid().padding());
}

#[test]
fn missing_bones_keep_the_previous_field() {
    let mut s = scene();
    let mut mesh = CollisionMesh::new(&mut s.device, &s.layouts, &s.kernels, sphere(), &coarse()).unwrap();
    assert!(!mesh.update(s.device.graphics_context(), &s.kernels, None));
    assert!(!mesh.has_field());
    s.device.submit_frame().unwrap();
    assert!(s.device.executed_pipelines().is_empty());
}

#[test]
fn collision_dispatch_follows_the_field_and_keeps_positions_writable() {
    let mut s = scene();
    let mut mesh = CollisionMesh::new(&mut s.device, &s.layouts, &s.kernels, sphere(), &coarse()).unwrap();
    let mut object = hair(&mut s);

    // Without a field there is nothing to collide with.
    mesh.collide_with_hair(s.device.graphics_context(), &s.kernels, &mut object);
    s.device.submit_frame().unwrap();
    assert!(s.device.executed_pipelines().is_empty());

    mesh.update(s.device.graphics_context(), &s.kernels, Some(&[Mat4::IDENTITY]));
    mesh.collide_with_hair(s.device.graphics_context(), &s.kernels, &mut object);
    s.device.submit_frame().unwrap();
    assert_eq!(
        s.device.executed_pipelines().last().map(String::as_str),
        Some("collide_hair_vertices_with_sdf")
    );
    assert_eq!(object.positions_state(), ResourceState::ShaderReadWrite);
    assert!(s.device.violations().is_empty());
}

#[test]
fn iso_surface_overflow_is_reported() {
    let mut s = scene();
    let settings = CollisionSettings {
        generate_iso_surface: true,
        max_marching_cubes_vertices: 300,
        ..coarse()
    };
    let mut mesh = CollisionMesh::new(&mut s.device, &s.layouts, &s.kernels, sphere(), &settings).unwrap();
    mesh.update(s.device.graphics_context(), &s.kernels, Some(&[Mat4::IDENTITY]));
    mesh.generate_iso_surface(s.device.graphics_context(), &s.kernels);
    s.device.submit_frame().unwrap();
    assert_eq!(
        s.device.executed_pipelines(),
        vec![
            "initialize_sdf",
            "construct_sdf",
            "finalize_sdf",
            "initialize_mc_vertices",
            "march_cells"
        ]
    );
    assert!(s.device.violations().is_empty());

    // Emulate the kernel having counted more vertices than the pool holds.
    let counter = mesh.iso_surface().unwrap().counter();
    s.device.write_buffer(counter, 0, &900u32.to_le_bytes()).unwrap();
    let reports = mesh.capacity_report(&mut s.device).unwrap();
    let mc = reports.iter().find(|r| r.name.contains("marching cubes")).unwrap();
    assert_eq!(mc.used, 900);
    assert_eq!(mc.capacity, 300);
    assert!(mc.overflowed());
    let cells = reports.iter().find(|r| r.name.contains("sdf cells")).unwrap();
    assert!(!cells.overflowed());
}

#[test]
fn budget_capped_grid_is_not_an_overflow() {
    let mut s = scene();
    let settings = CollisionSettings {
        allocation_multiplier: 1.5,
        ..coarse()
    };
    let mut mesh = CollisionMesh::new(&mut s.device, &s.layouts, &s.kernels, sphere(), &settings).unwrap();
    assert!(mesh.update(s.device.graphics_context(), &s.kernels, Some(&[Mat4::from_scale(Vec3::splat(3.0))])));
    s.device.submit_frame().unwrap();

    assert_eq!(mesh.capped_frames(), 1);
    assert!(mesh.grid().requested_cells() > mesh.grid().max_cells() as u64);
    let reports = mesh.capacity_report(&mut s.device).unwrap();
    let cells = reports.iter().find(|r| r.name.contains("sdf cells")).unwrap();
    assert_eq!(cells.used, mesh.grid().total_cells() as u64);
    assert!(!cells.overflowed(), "{:?}", cells);
}

#[test]
fn iso_surface_draws_after_generation() {
    let mut s = scene();
    let settings = CollisionSettings {
        generate_iso_surface: true,
        ..coarse()
    };
    let mut mesh = CollisionMesh::new(&mut s.device, &s.layouts, &s.kernels, sphere(), &settings).unwrap();
    let color = s
        .device
        .create_image(&ImageDesc::render_target("color", 64, 64, ImageFormat::Rgba8UnormSrgb))
        .unwrap();
    let depth = s.device.create_image(&ImageDesc::depth("depth", 64, 64)).unwrap();
    let targets = s
        .device
        .create_render_target_set(&RenderTargetSetDesc {
            label: "scene".into(),
            attachments: vec![Attachment::load(color), Attachment::load(depth)],
        })
        .unwrap();
    s.kernels.create_draw_pipeline(&mut s.device, &s.layouts, targets).unwrap();
    let view = crate::layouts::ConstantSet::view(
        &mut s.device,
        &s.layouts,
        &crate::hair::gpu_types::ViewConstants::new(Mat4::IDENTITY, Vec3::Z * 3.0, 64, 64),
    )
    .unwrap();

    mesh.update(s.device.graphics_context(), &s.kernels, Some(&[Mat4::IDENTITY]));
    mesh.generate_iso_surface(s.device.graphics_context(), &s.kernels);
    let ctx = s.device.graphics_context();
    ctx.begin_render_pass(targets, "iso surface");
    mesh.draw_iso_surface(ctx, &s.kernels, view.set);
    ctx.end_render_pass();
    s.device.submit_frame().unwrap();

    assert_eq!(s.device.executed_pipelines().last().map(String::as_str), Some("marching_cubes_draw"));
    let pool = mesh.iso_surface().unwrap();
    assert_eq!(s.device.resource_state(pool.vertices()), Some(ResourceState::ShaderRead));
    assert!(s.device.violations().is_empty());
}

#[test]
fn destroying_everything_releases_every_allocation() {
    let mut s = scene();
    let baseline = s.device.live_allocations();
    let settings = CollisionSettings {
        generate_iso_surface: true,
        ..coarse()
    };
    let mesh = CollisionMesh::new(&mut s.device, &s.layouts, &s.kernels, sphere(), &settings).unwrap();
    assert!(s.device.live_allocations() > baseline);
    mesh.destroy(&mut s.device);
    assert_eq!(s.device.live_allocations(), baseline);

    s.kernels.destroy(&mut s.device);
    s.layouts.destroy(&mut s.device);
    assert_eq!(s.device.live_allocations(), 0);
}
