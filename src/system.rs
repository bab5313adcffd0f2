//! The hair system facade.
//!
//! [`HairSystem`] owns everything the host would otherwise wire by hand: the
//! bind layouts, the solver, the SDF kernels, the OIT method, every hair
//! object and collision mesh. A frame is `simulate`, `draw`, `end_frame`.

use crate::config::HairSystemConfig;
use crate::device::{Attachment, RenderDevice, RenderTargetSetDesc, RenderTargetSetId, SceneTargets};
use crate::error::{HairError, HairResult};
use crate::hair::gpu_types::{LightConstants, ViewConstants};
use crate::hair::{HairAsset, HairObject};
use crate::layouts::{ConstantSet, LayoutRegistry};
use crate::oit::{OitMethod, OitSystem};
use crate::sdf::{CollisionMesh, CollisionMeshData, SdfKernels};
use crate::simulation::{SimulationMode, SimulationSolver};
use glam::{Mat4, Vec3};
use rustc_hash::FxHashSet;
use serde::Serialize;

/// Fill level of one fixed-size GPU pool after a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityReport {
    pub name: String,
    pub used: u64,
    pub capacity: u64,
}

impl CapacityReport {
    pub fn overflowed(&self) -> bool {
        self.used > self.capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HairObjectId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CollisionMeshId(pub usize);

/// Per-object input of one simulation tick.
#[derive(Debug, Clone, Copy)]
pub struct HairInput<'a> {
    pub object: HairObjectId,
    /// `None` keeps last frame's pose.
    pub bones: Option<&'a [Mat4]>,
    pub mode: SimulationMode,
    /// Collision response against this mesh after the solver stages.
    pub collide_with: Option<CollisionMeshId>,
}

impl<'a> HairInput<'a> {
    pub fn new(object: HairObjectId, bones: Option<&'a [Mat4]>) -> Self {
        Self {
            object,
            bones,
            mode: SimulationMode::Full,
            collide_with: None,
        }
    }

    pub fn colliding_with(mut self, mesh: CollisionMeshId) -> Self {
        self.collide_with = Some(mesh);
        self
    }

    pub fn with_mode(mut self, mode: SimulationMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Per-mesh input of one simulation tick.
#[derive(Debug, Clone, Copy)]
pub struct ColliderInput<'a> {
    pub mesh: CollisionMeshId,
    pub bones: Option<&'a [Mat4]>,
    /// Rebuild the field this tick. Otherwise last frame's field is reused.
    pub update: bool,
}

impl<'a> ColliderInput<'a> {
    pub fn new(mesh: CollisionMeshId, bones: Option<&'a [Mat4]>) -> Self {
        Self {
            mesh,
            bones,
            update: true,
        }
    }
}

/// Counts of one `simulate` call, for tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimulateSummary {
    pub simulated: usize,
    pub fields_rebuilt: usize,
    pub collisions: usize,
    pub async_compute: bool,
}

#[derive(Debug)]
pub struct HairSystem {
    config: HairSystemConfig,
    layouts: LayoutRegistry,
    solver: SimulationSolver,
    kernels: SdfKernels,
    oit: OitSystem,
    scene_targets: RenderTargetSetId,
    view: ConstantSet,
    light: ConstantSet,
    objects: Vec<HairObject>,
    meshes: Vec<CollisionMesh>,
    compute_pending: bool,
    warned: FxHashSet<String>,
}

fn scene_target_set(device: &mut dyn RenderDevice, scene: SceneTargets) -> HairResult<RenderTargetSetId> {
    device.create_render_target_set(&RenderTargetSetDesc {
        label: "hair_scene".to_string(),
        attachments: vec![Attachment::load(scene.color), Attachment::load(scene.depth)],
    })
}

impl HairSystem {
    pub fn new(device: &mut dyn RenderDevice, scene: SceneTargets, config: HairSystemConfig) -> HairResult<Self> {
        config.validate()?;
        let layouts = LayoutRegistry::new(device)?;
        let solver = SimulationSolver::new(device, &layouts)?;
        let mut kernels = SdfKernels::new(device, &layouts)?;
        let scene_targets = scene_target_set(device, scene)?;
        kernels.create_draw_pipeline(device, &layouts, scene_targets)?;
        let oit = OitSystem::new(device, &layouts, scene, &config.oit)?;

        let view = ConstantSet::view(
            device,
            &layouts,
            &ViewConstants::new(Mat4::IDENTITY, Vec3::ZERO, scene.width, scene.height),
        )?;
        let light = ConstantSet::light(
            device,
            &layouts,
            &LightConstants::directional(Vec3::new(0.3, 1.0, 0.5), Vec3::ONE, Vec3::splat(0.15)),
        )?;

        log::info!(
            "[HairSystem] Started at {}x{} with {:?} transparency{}",
            scene.width,
            scene.height,
            config.oit.method,
            if config.async_compute { ", async compute" } else { "" }
        );
        Ok(Self {
            config,
            layouts,
            solver,
            kernels,
            oit,
            scene_targets,
            view,
            light,
            objects: Vec::new(),
            meshes: Vec::new(),
            compute_pending: false,
            warned: FxHashSet::default(),
        })
    }

    pub fn create_hair_object(&mut self, device: &mut dyn RenderDevice, asset: HairAsset) -> HairResult<HairObjectId> {
        let object = HairObject::new(
            device,
            &self.layouts,
            asset,
            &self.config.simulation,
            &self.config.rendering,
        )?;
        log::info!("[HairSystem] Added hair object '{}'", object.name());
        self.objects.push(object);
        Ok(HairObjectId(self.objects.len() - 1))
    }

    pub fn create_collision_mesh(
        &mut self,
        device: &mut dyn RenderDevice,
        data: CollisionMeshData,
    ) -> HairResult<CollisionMeshId> {
        let mesh = CollisionMesh::new(device, &self.layouts, &self.kernels, data, &self.config.collision)?;
        log::info!("[HairSystem] Added collision mesh '{}'", mesh.name());
        self.meshes.push(mesh);
        Ok(CollisionMeshId(self.meshes.len() - 1))
    }

    pub fn set_view(&mut self, device: &mut dyn RenderDevice, view: &ViewConstants) {
        self.view.update(device, view);
    }

    pub fn set_light(&mut self, device: &mut dyn RenderDevice, light: &LightConstants) {
        self.light.update(device, light);
    }

    /// Records one simulation tick on the queue chosen by
    /// `HairSystemConfig::async_compute`.
    pub fn simulate(
        &mut self,
        device: &mut dyn RenderDevice,
        time_step: f32,
        hair: &[HairInput<'_>],
        colliders: &[ColliderInput<'_>],
    ) -> HairResult<SimulateSummary> {
        let async_compute = self.config.async_compute;
        self.simulate_with(device, time_step, async_compute, hair, colliders)
    }

    /// Records one simulation tick.
    ///
    /// Collision fields are rebuilt first, then every listed object runs the
    /// solver and, if asked, collision against its mesh before its constant
    /// slot is flipped. With `async_compute` the work goes to the compute
    /// queue and the graphics queue waits for it in `draw`.
    pub fn simulate_with(
        &mut self,
        device: &mut dyn RenderDevice,
        time_step: f32,
        async_compute: bool,
        hair: &[HairInput<'_>],
        colliders: &[ColliderInput<'_>],
    ) -> HairResult<SimulateSummary> {
        let mut summary = SimulateSummary {
            async_compute,
            ..Default::default()
        };
        if self.compute_pending {
            // The previous tick was never drawn; order it before this one.
            device.wait_for_compute()?;
            self.compute_pending = false;
        }

        let ctx = if async_compute {
            device.signal_compute_start();
            device.compute_context()
        } else {
            device.graphics_context()
        };

        for input in colliders {
            let Some(mesh) = self.meshes.get_mut(input.mesh.0) else {
                log::warn!("[HairSystem] Unknown collision mesh {:?}", input.mesh);
                continue;
            };
            if input.update && mesh.update(ctx, &self.kernels, input.bones) {
                summary.fields_rebuilt += 1;
                if self.config.collision.generate_iso_surface {
                    mesh.generate_iso_surface(ctx, &self.kernels);
                }
            }
        }

        for input in hair {
            let Some(object) = self.objects.get_mut(input.object.0) else {
                log::warn!("[HairSystem] Unknown hair object {:?}", input.object);
                continue;
            };
            object.update_bone_matrices(input.bones);
            self.solver.simulate_object(ctx, object, time_step, input.mode);
            if let Some(id) = input.collide_with {
                match self.meshes.get(id.0) {
                    Some(mesh) if mesh.has_field() => {
                        mesh.collide_with_hair(ctx, &self.kernels, object);
                        summary.collisions += 1;
                    }
                    Some(mesh) => log::warn!(
                        "[HairSystem] '{}': collision mesh '{}' has no field yet, skipping collision",
                        object.name(),
                        mesh.name()
                    ),
                    None => log::warn!(
                        "[HairSystem] '{}': collision mesh {:?} is missing, skipping collision",
                        object.name(),
                        id
                    ),
                }
            }
            object.advance_parity();
            summary.simulated += 1;
        }

        if async_compute {
            device.submit_compute()?;
            self.compute_pending = true;
        }
        log::debug!("[HairSystem] Simulated {:?}", summary);
        Ok(summary)
    }

    /// Draws collision iso-surfaces and then every hair object through the
    /// active transparency method.
    pub fn draw(&mut self, device: &mut dyn RenderDevice) -> HairResult<()> {
        if self.compute_pending {
            device.wait_for_compute()?;
            self.compute_pending = false;
        }
        let ctx = device.graphics_context();
        if self.meshes.iter().any(|m| m.iso_surface().is_some()) {
            ctx.begin_render_pass(self.scene_targets, "collision iso surfaces");
            for mesh in &mut self.meshes {
                mesh.draw_iso_surface(ctx, &self.kernels, self.view.set);
            }
            ctx.end_render_pass();
        }
        self.oit.draw(ctx, &mut self.objects, self.view.set, self.light.set);
        Ok(())
    }

    /// Submits the frame and reads back how full every fixed-size pool got.
    /// An overflowing pool is reported with `warn!` once and with `debug!`
    /// afterwards.
    pub fn end_frame(&mut self, device: &mut dyn RenderDevice) -> HairResult<Vec<CapacityReport>> {
        device.submit_frame()?;
        let mut reports = self.oit.capacity_report(device)?;
        for mesh in &self.meshes {
            reports.extend(mesh.capacity_report(device)?);
        }
        for report in reports.iter().filter(|r| r.overflowed()) {
            if self.warned.insert(report.name.clone()) {
                log::warn!(
                    "[HairSystem] {} exceeded capacity: {} of {}",
                    report.name,
                    report.used,
                    report.capacity
                );
            } else {
                log::debug!("[HairSystem] {} still over capacity ({})", report.name, report.used);
            }
        }
        Ok(reports)
    }

    pub fn set_oit_method(&mut self, device: &mut dyn RenderDevice, method: OitMethod) -> HairResult<bool> {
        let switched = self.oit.set_method(device, method)?;
        if switched {
            self.config.oit.method = method;
        }
        Ok(switched)
    }

    pub fn on_resize(&mut self, device: &mut dyn RenderDevice, scene: SceneTargets) -> HairResult<()> {
        if scene.width == 0 || scene.height == 0 {
            return Err(HairError::Config(format!(
                "cannot resize to {}x{}",
                scene.width, scene.height
            )));
        }
        self.oit.on_resize(device, scene)?;
        let targets = scene_target_set(device, scene)?;
        device.release(std::mem::replace(&mut self.scene_targets, targets).into());
        Ok(())
    }

    pub fn config(&self) -> &HairSystemConfig {
        &self.config
    }

    pub fn layouts(&self) -> &LayoutRegistry {
        &self.layouts
    }

    pub fn oit(&self) -> &OitSystem {
        &self.oit
    }

    pub fn objects(&self) -> &[HairObject] {
        &self.objects
    }

    pub fn object(&self, id: HairObjectId) -> Option<&HairObject> {
        self.objects.get(id.0)
    }

    pub fn object_mut(&mut self, id: HairObjectId) -> Option<&mut HairObject> {
        self.objects.get_mut(id.0)
    }

    pub fn collision_mesh(&self, id: CollisionMeshId) -> Option<&CollisionMesh> {
        self.meshes.get(id.0)
    }

    pub fn compute_pending(&self) -> bool {
        self.compute_pending
    }

    /// Waits for the GPU and releases every device object the system made.
    pub fn destroy(self, device: &mut dyn RenderDevice) -> HairResult<()> {
        device.flush_gpu()?;
        for object in self.objects {
            object.destroy(device);
        }
        for mesh in self.meshes {
            mesh.destroy(device);
        }
        self.oit.destroy(device);
        self.view.destroy(device);
        self.light.destroy(device);
        device.release(self.scene_targets.into());
        self.kernels.destroy(device);
        self.solver.destroy(device);
        self.layouts.destroy(device);
        log::info!("[HairSystem] Destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollisionSettings;
    use crate::device::{HeadlessDevice, ImageDesc, ImageFormat, QueueEvent, QueueKind, ResourceState};
    use crate::hair::FollowHairParams;

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

    fn asset() -> HairAsset {
        let guides: Vec<Vec3> = (0..8).map(|i| Vec3::new(0.0, 1.2 - 0.05 * i as f32, 0.0)).collect();
        HairAsset::from_guide_strands("system", 8, &guides, FollowHairParams::default()).unwrap()
    }

    fn config(async_compute: bool) -> HairSystemConfig {
        HairSystemConfig {
            async_compute,
            collision: CollisionSettings {
                num_cells_x: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn capacity_report_overflow_is_strict() {
        let report = CapacityReport {
            name: "pool".into(),
            used: 4,
            capacity: 4,
        };
        assert!(!report.overflowed());
        assert!(CapacityReport { used: 5, ..report }.overflowed());
    }

    #[test]
    fn collision_runs_between_solver_and_parity_flip() {
        let mut device = HeadlessDevice::new();
        let targets = scene(&mut device, 32, 32);
        let mut system = HairSystem::new(&mut device, targets, config(false)).unwrap();
        let hair = system.create_hair_object(&mut device, asset()).unwrap();
        let sphere = system
            .create_collision_mesh(&mut device, CollisionMeshData::uv_sphere("head", 1.0, 8, 16))
            .unwrap();
        let bones = [Mat4::IDENTITY];

        let summary = system
            .simulate(
                &mut device,
                1.0 / 60.0,
                &[HairInput::new(hair, Some(&bones)).colliding_with(sphere)],
                &[ColliderInput::new(sphere, Some(&bones))],
            )
            .unwrap();
        assert_eq!(summary.simulated, 1);
        assert_eq!(summary.fields_rebuilt, 1);
        assert_eq!(summary.collisions, 1);
        assert_eq!(system.object(hair).unwrap().parity(), 1);

        system.draw(&mut device).unwrap();
        system.end_frame(&mut device).unwrap();
        let executed = device.executed_pipelines();
        let finalize = executed.iter().position(|p| p == "finalize_sdf").unwrap();
        let length = executed.iter().position(|p| p == "length_constraints_and_wind").unwrap();
        let collide = executed.iter().position(|p| p == "collide_hair_vertices_with_sdf").unwrap();
        let fill = executed.iter().position(|p| p == "shortcut_depth_alpha").unwrap();
        assert!(finalize < length && length < collide && collide < fill);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn missing_collision_mesh_skips_only_the_response() {
        let mut device = HeadlessDevice::new();
        let targets = scene(&mut device, 16, 16);
        let mut system = HairSystem::new(&mut device, targets, config(false)).unwrap();
        let hair = system.create_hair_object(&mut device, asset()).unwrap();
        let summary = system
            .simulate(
                &mut device,
                1.0 / 60.0,
                &[HairInput::new(hair, None).colliding_with(CollisionMeshId(3))],
                &[],
            )
            .unwrap();
        assert_eq!(summary.simulated, 1);
        assert_eq!(summary.collisions, 0);
        assert_eq!(system.object(hair).unwrap().frame(), 1);
    }

    #[test]
    fn async_compute_waits_just_before_draw() {
        let mut device = HeadlessDevice::new();
        let targets = scene(&mut device, 16, 16);
        let mut system = HairSystem::new(&mut device, targets, config(true)).unwrap();
        let hair = system.create_hair_object(&mut device, asset()).unwrap();
        let bones = [Mat4::IDENTITY];
        device.clear_events();

        system
            .simulate(&mut device, 1.0 / 60.0, &[HairInput::new(hair, Some(&bones))], &[])
            .unwrap();
        assert!(system.compute_pending());
        assert_eq!(device.events(), &[QueueEvent::SignalComputeStart, QueueEvent::SubmitCompute]);

        system.draw(&mut device).unwrap();
        system.end_frame(&mut device).unwrap();
        assert_eq!(
            device.events(),
            &[
                QueueEvent::SignalComputeStart,
                QueueEvent::SubmitCompute,
                QueueEvent::WaitForCompute,
                QueueEvent::SubmitFrame
            ]
        );
        assert!(device
            .submitted()
            .iter()
            .any(|list| list.queue == QueueKind::Compute && list.stats().dispatches > 0));
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn async_compute_is_chosen_per_tick() {
        let mut device = HeadlessDevice::new();
        let targets = scene(&mut device, 16, 16);
        let mut system = HairSystem::new(&mut device, targets, config(false)).unwrap();
        let hair = system.create_hair_object(&mut device, asset()).unwrap();
        let bones = [Mat4::IDENTITY];
        device.clear_events();

        let summary = system
            .simulate_with(&mut device, 1.0 / 60.0, true, &[HairInput::new(hair, Some(&bones))], &[])
            .unwrap();
        assert!(summary.async_compute);
        system.draw(&mut device).unwrap();
        system.end_frame(&mut device).unwrap();

        let summary = system
            .simulate(&mut device, 1.0 / 60.0, &[HairInput::new(hair, Some(&bones))], &[])
            .unwrap();
        assert!(!summary.async_compute);
        assert!(!system.compute_pending());
        system.draw(&mut device).unwrap();
        system.end_frame(&mut device).unwrap();

        assert_eq!(
            device.events(),
            &[
                QueueEvent::SignalComputeStart,
                QueueEvent::SubmitCompute,
                QueueEvent::WaitForCompute,
                QueueEvent::SubmitFrame,
                QueueEvent::SubmitFrame
            ]
        );
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn destroy_releases_everything() {
        let mut device = HeadlessDevice::new();
        let targets = scene(&mut device, 16, 16);
        let baseline = device.live_allocations();
        let mut system = HairSystem::new(&mut device, targets, config(false)).unwrap();
        system.create_hair_object(&mut device, asset()).unwrap();
        system
            .create_collision_mesh(&mut device, CollisionMeshData::uv_sphere("head", 1.0, 8, 16))
            .unwrap();
        system.set_oit_method(&mut device, OitMethod::Ppll).unwrap();
        let bigger = scene(&mut device, 48, 48);
        system.on_resize(&mut device, bigger).unwrap();

        system.destroy(&mut device).unwrap();
        assert_eq!(device.live_allocations(), baseline + 2);
    }
}
