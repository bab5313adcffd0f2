//! Strand simulation scheduling.
//!
//! [`SimulationSolver`] records the compute passes of one tick for one hair
//! object, in a fixed order with a write-visibility barrier after every
//! dispatch. The kernels live in `hair_simulation.wgsl`; [`reference`] holds a
//! CPU mirror of the same math.

pub mod reference;
pub mod wind;

use crate::constants::{MIN_VERTS_PER_STRAND_FOR_GPU_ITERATION, THREAD_GROUP_SIZE};
use crate::device::{workgroups, CommandContext, ComputePipelineDesc, PipelineId, RenderDevice};
use crate::error::HairResult;
use crate::hair::{HairObject, TickPlan};
use crate::layouts::LayoutRegistry;
use crate::shaders::{self, ShaderSource};

/// Splits the configured local shape iterations between the GPU loop and
/// CPU re-dispatch. Returns `(gpu, cpu)`.
///
/// Strands of at least `MIN_VERTS_PER_STRAND_FOR_GPU_ITERATION` vertices
/// loop inside one dispatch; shorter strands get one pass per dispatch and
/// the pass is dispatched once per iteration.
pub fn local_iteration_split(vertices_per_strand: u32, configured: u32) -> (u32, u32) {
    if vertices_per_strand >= MIN_VERTS_PER_STRAND_FOR_GPU_ITERATION {
        (configured, 1)
    } else {
        (1, configured)
    }
}

/// How much of the solver runs for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum SimulationMode {
    /// Every stage, from integration to follow hair.
    #[default]
    Full,
    /// Rigid skinning of every vertex, no dynamics.
    SkinOnly,
}

#[derive(Debug, Clone, Copy)]
struct SimulationPipelines {
    skin: PipelineId,
    integrate: PipelineId,
    strand_level: PipelineId,
    velocity_shock: PipelineId,
    local_shape: PipelineId,
    length_and_wind: PipelineId,
    follow_hair: PipelineId,
}

impl SimulationPipelines {
    fn all(&self) -> [PipelineId; 7] {
        [
            self.skin,
            self.integrate,
            self.strand_level,
            self.velocity_shock,
            self.local_shape,
            self.length_and_wind,
            self.follow_hair,
        ]
    }
}

#[derive(Debug)]
pub struct SimulationSolver {
    pipelines: SimulationPipelines,
}

impl SimulationSolver {
    pub fn new(device: &mut dyn RenderDevice, layouts: &LayoutRegistry) -> HairResult<Self> {
        let shader = ShaderSource::load(shaders::HAIR_SIMULATION)?;
        let bind_layouts = [layouts.hair_simulation, layouts.hair_generation];
        let mut pipeline = |entry_point: &str| {
            device.create_compute_pipeline(&ComputePipelineDesc {
                label: entry_point,
                shader: &shader,
                entry_point,
                layouts: &bind_layouts,
            })
        };

        let pipelines = SimulationPipelines {
            skin: pipeline("skin_hair_vertices")?,
            integrate: pipeline("integrate_and_global_shape")?,
            strand_level: pipeline("calculate_strand_level_data")?,
            velocity_shock: pipeline("velocity_shock_propagation")?,
            local_shape: pipeline("local_shape_constraints")?,
            length_and_wind: pipeline("length_constraints_and_wind")?,
            follow_hair: pipeline("update_follow_hair_vertices")?,
        };
        log::debug!("[SimulationSolver] Created {} compute pipelines", pipelines.all().len());
        Ok(Self { pipelines })
    }

    /// Records one tick for `object`, up to and including the follow-hair
    /// update. Positions are left simulation-writable so collision may run
    /// next; the caller ends the tick with `HairObject::advance_parity`.
    pub fn simulate_object(
        &self,
        ctx: &mut dyn CommandContext,
        object: &mut HairObject,
        time_step: f32,
        mode: SimulationMode,
    ) -> TickPlan {
        ctx.insert_marker(&format!("simulate {}", object.name()));
        object.dynamic_state_mut().transition_to_simulation(ctx);
        let plan = object.prepare_tick(ctx, time_step);
        let sets = [plan.simulation_set, object.generation_set()];

        let guide_vertices = workgroups(object.num_guide_vertices(), THREAD_GROUP_SIZE);
        let guide_strands = workgroups(object.num_guide_strands(), THREAD_GROUP_SIZE);
        let stage = |ctx: &mut dyn CommandContext, pipeline: PipelineId, groups: u32| {
            ctx.bind_pipeline(pipeline);
            ctx.bind_sets(pipeline, &sets);
            ctx.dispatch(groups);
            object.dynamic_state().uav_barrier(ctx);
        };

        match mode {
            SimulationMode::SkinOnly => {
                stage(ctx, self.pipelines.skin, workgroups(object.num_vertices(), THREAD_GROUP_SIZE));
            }
            SimulationMode::Full => {
                stage(ctx, self.pipelines.integrate, guide_vertices);
                stage(ctx, self.pipelines.strand_level, guide_strands);
                stage(ctx, self.pipelines.velocity_shock, guide_vertices);
                for _ in 0..plan.cpu_local_iterations {
                    stage(ctx, self.pipelines.local_shape, guide_strands);
                }
                stage(ctx, self.pipelines.length_and_wind, guide_vertices);
                if object.follow_hairs_per_guide() > 0 {
                    stage(ctx, self.pipelines.follow_hair, guide_vertices);
                }
            }
        }
        log::trace!(
            "[SimulationSolver] '{}' {:?} tick, {} local shape dispatches",
            object.name(),
            mode,
            plan.cpu_local_iterations
        );
        plan
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        for pipeline in self.pipelines.all() {
            device.release(pipeline.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RenderingSettings, SimulationSettings};
    use crate::device::{Command, HeadlessDevice, RenderDevice};
    use crate::hair::{FollowHairParams, HairAsset};
    use glam::Vec3;

    fn setup(follow: u32) -> (HeadlessDevice, LayoutRegistry, SimulationSolver, HairObject) {
        let mut device = HeadlessDevice::new();
        let layouts = LayoutRegistry::new(&mut device).unwrap();
        let solver = SimulationSolver::new(&mut device, &layouts).unwrap();
        let guides: Vec<Vec3> = (0..8).map(|i| Vec3::new(0.0, -0.02 * i as f32, 0.0)).collect();
        let asset = HairAsset::from_guide_strands(
            "solver",
            8,
            &guides,
            FollowHairParams {
                count: follow,
                ..Default::default()
            },
        )
        .unwrap();
        let object = HairObject::new(
            &mut device,
            &layouts,
            asset,
            &SimulationSettings {
                local_constraints_iterations: 2,
                ..Default::default()
            },
            &RenderingSettings::default(),
        )
        .unwrap();
        (device, layouts, solver, object)
    }

    #[test]
    fn full_tick_runs_stages_in_order() {
        let (mut device, _layouts, solver, mut object) = setup(2);
        solver.simulate_object(device.graphics_context(), &mut object, 0.016, SimulationMode::Full);
        device.submit_frame().unwrap();

        assert_eq!(
            device.executed_pipelines(),
            vec![
                "integrate_and_global_shape",
                "calculate_strand_level_data",
                "velocity_shock_propagation",
                "local_shape_constraints",
                "local_shape_constraints",
                "length_constraints_and_wind",
                "update_follow_hair_vertices",
            ]
        );
        assert!(device.violations().is_empty());
    }

    #[test]
    fn every_dispatch_is_followed_by_a_barrier() {
        let (mut device, _layouts, solver, mut object) = setup(0);
        solver.simulate_object(device.graphics_context(), &mut object, 0.016, SimulationMode::Full);
        let commands = device.pending_graphics().to_vec();
        for (i, command) in commands.iter().enumerate() {
            if matches!(command, Command::Dispatch { .. }) {
                assert!(matches!(commands.get(i + 1), Some(Command::Barrier(_))), "dispatch {} unguarded", i);
            }
        }
    }

    #[test]
    fn skin_only_mode_skips_dynamics() {
        let (mut device, _layouts, solver, mut object) = setup(1);
        solver.simulate_object(device.graphics_context(), &mut object, 0.016, SimulationMode::SkinOnly);
        device.submit_frame().unwrap();
        assert_eq!(device.executed_pipelines(), vec!["skin_hair_vertices"]);
    }

    #[test]
    fn solver_releases_its_pipelines() {
        let mut device = HeadlessDevice::new();
        let layouts = LayoutRegistry::new(&mut device).unwrap();
        let before = device.live_allocations();
        let solver = SimulationSolver::new(&mut device, &layouts).unwrap();
        assert_eq!(device.live_allocations(), before + 7);
        solver.destroy(&mut device);
        assert_eq!(device.live_allocations(), before);
    }
}
