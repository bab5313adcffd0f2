//! Headless frame capture.
//!
//! Runs a synthetic scene (a fringe of strands over a skinned sphere) on the
//! recording host and prints one JSON report per frame with the recorded
//! command counts and the capacity of every fixed-size pool.
//!
//! Usage: `strand_capture [--frames N] [--method ppll|shortcut] [--async] [--config FILE]`

use anyhow::{bail, Context, Result};
use glam::{Mat4, Vec3};
use serde::Serialize;
use strandfx::device::{
    CommandStats, HeadlessDevice, ImageDesc, ImageFormat, QueueKind, RenderDevice, ResourceState, SceneTargets,
};
use strandfx::hair::FollowHairParams;
use strandfx::{
    CapacityReport, ColliderInput, CollisionMeshData, HairAsset, HairInput, HairSystem, HairSystemConfig, OitMethod,
    SimulateSummary,
};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

#[derive(Debug)]
struct Options {
    frames: u32,
    method: Option<OitMethod>,
    async_compute: bool,
    config: Option<String>,
}

fn parse_options() -> Result<Options> {
    let mut options = Options {
        frames: 8,
        method: None,
        async_compute: false,
        config: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                let value = args.next().context("--frames needs a value")?;
                options.frames = value.parse().with_context(|| format!("bad frame count '{}'", value))?;
            }
            "--method" => {
                options.method = Some(match args.next().as_deref() {
                    Some("ppll") => OitMethod::Ppll,
                    Some("shortcut") => OitMethod::ShortCut,
                    other => bail!("unknown transparency method {:?}", other),
                });
            }
            "--async" => options.async_compute = true,
            "--config" => options.config = Some(args.next().context("--config needs a path")?),
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(options)
}

#[derive(Debug, Serialize)]
struct FrameReport {
    frame: u32,
    method: OitMethod,
    simulate: SimulateSummary,
    graphics: CommandStats,
    compute: CommandStats,
    capacity: Vec<CapacityReport>,
    live_allocations: usize,
}

fn scene_targets(device: &mut HeadlessDevice) -> Result<SceneTargets> {
    let color = device.create_image(
        &ImageDesc::render_target("capture_color", WIDTH, HEIGHT, ImageFormat::Rgba8UnormSrgb)
            .with_initial_state(ResourceState::RenderTarget),
    )?;
    let depth = device.create_image(
        &ImageDesc::depth("capture_depth", WIDTH, HEIGHT).with_initial_state(ResourceState::DepthStencil),
    )?;
    Ok(SceneTargets {
        color,
        depth,
        width: WIDTH,
        height: HEIGHT,
    })
}

fn fringe() -> Result<HairAsset> {
    let guides: Vec<Vec3> = (0..16)
        .flat_map(|strand| {
            let angle = std::f32::consts::PI * (0.25 + 0.5 * strand as f32 / 15.0);
            let root = Vec3::new(angle.cos(), 0.6, angle.sin()) * 1.02;
            (0..32).map(move |i| root + Vec3::new(0.0, -0.03 * i as f32, 0.01 * i as f32))
        })
        .collect();
    Ok(HairAsset::from_guide_strands(
        "fringe",
        32,
        &guides,
        FollowHairParams {
            count: 7,
            radius: 0.02,
            ..Default::default()
        },
    )?)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = parse_options()?;

    let mut config = match &options.config {
        Some(path) => HairSystemConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => HairSystemConfig::default(),
    };
    if let Some(method) = options.method {
        config.oit.method = method;
    }
    config.async_compute |= options.async_compute;
    log::info!("[strand_capture] {} frames, {:?}", options.frames, config.oit.method);

    let mut device = HeadlessDevice::new();
    let targets = scene_targets(&mut device)?;
    let mut system = HairSystem::new(&mut device, targets, config)?;
    let hair = system.create_hair_object(&mut device, fringe()?)?;
    let head = system.create_collision_mesh(&mut device, CollisionMeshData::uv_sphere("head", 1.0, 16, 32))?;

    for frame in 0..options.frames {
        let t = frame as f32 / 60.0;
        let bones = [Mat4::from_rotation_y(0.4 * (2.0 * t).sin())];
        let simulate = system.simulate(
            &mut device,
            1.0 / 60.0,
            &[HairInput::new(hair, Some(&bones)).colliding_with(head)],
            &[ColliderInput::new(head, Some(&bones))],
        )?;
        system.draw(&mut device)?;
        let capacity = system.end_frame(&mut device)?;

        let mut graphics = CommandStats::default();
        let mut compute = CommandStats::default();
        for list in device.take_submitted() {
            match list.queue {
                QueueKind::Graphics => graphics += list.stats(),
                QueueKind::Compute => compute += list.stats(),
            }
        }
        let violations = device.take_violations();
        if !violations.is_empty() {
            log::warn!("[strand_capture] Frame {}: {} barrier violations", frame, violations.len());
        }

        let report = FrameReport {
            frame,
            method: system.oit().method(),
            simulate,
            graphics,
            compute,
            capacity,
            live_allocations: device.live_allocations(),
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    system.destroy(&mut device)?;
    log::info!("[strand_capture] Done, {} allocations left", device.live_allocations());
    Ok(())
}
