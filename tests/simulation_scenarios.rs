//! Numeric simulation scenarios, checked against the CPU reference solver.

use glam::{Mat4, Quat, Vec3, Vec4};
use strandfx::config::SimulationSettings;
use strandfx::hair::{FollowHairParams, HairAsset, HairAssetData};
use strandfx::simulation::reference::{tick_constants, ReferenceSolver};

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

fn no_forces() -> SimulationSettings {
    SimulationSettings {
        gravity_magnitude: 0.0,
        wind_magnitude: 0.0,
        ..Default::default()
    }
}

fn single_strand() -> HairAsset {
    HairAsset::new(HairAssetData {
        name: "single".into(),
        vertices_per_strand: 4,
        positions: (0..4).map(|i| Vec3::new(0.0, -0.1 * i as f32, 0.02 * i as f32)).collect(),
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn one_tick_without_forces_keeps_the_rest_pose() {
    init_logging();
    let asset = single_strand();
    assert_eq!(asset.num_total_strands, 1);
    assert_eq!(asset.follow_hairs_per_guide, 0);

    for (frame, reset) in [(0, true), (5, false)] {
        let mut solver = ReferenceSolver::new(&asset);
        let (constants, cpu_local) =
            tick_constants(&asset, &no_forces(), 1.0 / 60.0, &[Mat4::IDENTITY], frame, reset);
        solver.step(&constants, cpu_local);
        for (out, rest) in solver.positions.iter().zip(&asset.positions) {
            assert!(
                (out.truncate() - rest.truncate()).length() < 1e-5,
                "frame {}: {:?} moved from {:?}",
                frame,
                out,
                rest
            );
            assert_eq!(out.w, rest.w);
        }
    }
}

#[test]
fn shape_constraints_converge_to_the_posed_rest_shape() {
    init_logging();
    let guides: Vec<Vec3> = (0..2)
        .flat_map(|strand| {
            (0..16).map(move |i| {
                let t = i as f32 * 0.5;
                Vec3::new(0.1 * strand as f32 + 0.02 * t.sin(), -0.03 * i as f32, 0.02 * t.cos())
            })
        })
        .collect();
    let asset = HairAsset::from_guide_strands(
        "wavy",
        16,
        &guides,
        FollowHairParams {
            count: 1,
            ..Default::default()
        },
    )
    .unwrap();
    let settings = SimulationSettings {
        global_constraints_range: 1.0,
        ..no_forces()
    };
    let pose = Mat4::from_rotation_translation(Quat::from_rotation_z(0.3), Vec3::new(0.0, 0.25, -0.1));

    let mut solver = ReferenceSolver::new(&asset);
    for frame in 0..2 {
        let (constants, cpu) = tick_constants(&asset, &settings, 1.0 / 60.0, &[pose], frame, true);
        solver.step(&constants, cpu);
    }
    // Knock every free vertex off the rest shape.
    for (i, p) in solver.positions.iter_mut().enumerate() {
        if p.w > 0.0 {
            *p += Vec4::new(0.01 * (i % 3) as f32, 0.005, -0.008, 0.0);
        }
    }
    for frame in 2..500 {
        let (constants, cpu) = tick_constants(&asset, &settings, 1.0 / 60.0, &[pose], frame, false);
        solver.step(&constants, cpu);
    }

    let (constants, _) = tick_constants(&asset, &settings, 1.0 / 60.0, &[pose], 500, false);
    let deviation = solver.max_deviation_from_rest(&constants);
    assert!(deviation < 1e-3, "still {} away from the posed rest shape", deviation);

    // Converged means it stays there.
    for frame in 500..520 {
        let (constants, cpu) = tick_constants(&asset, &settings, 1.0 / 60.0, &[pose], frame, false);
        solver.step(&constants, cpu);
    }
    assert!(solver.max_deviation_from_rest(&constants) < 1e-3);
}

#[test]
fn reset_snaps_to_the_skinned_pose() {
    init_logging();
    let asset = single_strand();
    let pose = Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0));
    let mut solver = ReferenceSolver::new(&asset);
    let (constants, cpu) = tick_constants(&asset, &SimulationSettings::default(), 1.0 / 60.0, &[pose], 0, true);
    solver.step(&constants, cpu);
    assert!(solver.max_deviation_from_rest(&constants) < 1e-5);
}
