use crate::config::{RenderingSettings, SimulationSettings};
use crate::constants::RESET_FRAMES;
use crate::device::{
    BindSetDesc, BindSetId, BufferDesc, CommandContext, PipelineId, RenderDevice, ResourceId, ResourceState,
};
use crate::error::HairResult;
use crate::hair::dynamic_state::{DynamicPhase, DynamicState};
use crate::hair::gpu_types::{RenderConstants, SimulationConstants, StrandConstants};
use crate::hair::HairAsset;
use crate::layouts::LayoutRegistry;
use crate::simulation::local_iteration_split;
use crate::simulation::wind::wind_pyramid;
use glam::{Mat4, Vec4};

/// What `prepare_tick` decided for the coming tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    /// Simulation set of the slot written for this tick.
    pub simulation_set: BindSetId,
    /// Times the local shape kernel is dispatched from the CPU.
    pub cpu_local_iterations: u32,
    pub reset_positions: bool,
}

/// Immutable buffers the simulation reads every tick.
#[derive(Debug)]
struct GenerationBuffers {
    initial_positions: ResourceId,
    global_rotations: ResourceId,
    ref_vectors: ResourceId,
    rest_lengths: ResourceId,
    follow_root_offsets: ResourceId,
    bone_skinning: ResourceId,
    set: BindSetId,
}

#[derive(Debug)]
struct RenderBuffers {
    render_constants: ResourceId,
    strand_constants: ResourceId,
    strand_tex_coords: ResourceId,
    thickness_coeffs: ResourceId,
    index_buffer: ResourceId,
    set: BindSetId,
}

/// One simulated and rendered hair asset.
///
/// Simulation constants are double buffered: `prepare_tick` writes the slot
/// selected by the current parity and `advance_parity` flips it, so the
/// constants the GPU may still be reading are never overwritten.
#[derive(Debug)]
pub struct HairObject {
    name: String,
    vertices_per_strand: u32,
    follow_hairs_per_guide: u32,
    num_guide_strands: u32,
    num_total_strands: u32,
    indices_per_strand_group: u32,

    dynamic: DynamicState,
    generation: GenerationBuffers,
    render: RenderBuffers,
    simulation_buffers: [ResourceId; 2],
    simulation_sets: [BindSetId; 2],

    constants: Box<SimulationConstants>,
    bones: Vec<Mat4>,
    simulation: SimulationSettings,
    rendering: RenderingSettings,
    parity: usize,
    frame: u32,
    reset_frames_left: u32,
    lod_fraction: f32,
}

impl HairObject {
    pub fn new(
        device: &mut dyn RenderDevice,
        layouts: &LayoutRegistry,
        asset: HairAsset,
        simulation: &SimulationSettings,
        rendering: &RenderingSettings,
    ) -> HairResult<Self> {
        let label = |name: &str| format!("{}_{}", asset.name, name);

        let mut dynamic = DynamicState::new(device, &asset)?;
        dynamic.upload(device.graphics_context(), &asset);

        let rotations: Vec<Vec4> = asset.global_rotations.iter().map(|q| Vec4::from(*q)).collect();
        let initial_positions = read_only(device, label("initial_positions"), bytemuck::cast_slice(&asset.positions))?;
        let global_rotations = read_only(device, label("global_rotations"), bytemuck::cast_slice(&rotations))?;
        let ref_vectors = read_only(device, label("ref_vectors"), bytemuck::cast_slice(&asset.ref_vectors))?;
        let rest_lengths = read_only(device, label("rest_lengths"), bytemuck::cast_slice(&asset.rest_lengths))?;
        let follow_root_offsets =
            read_only(device, label("follow_root_offsets"), bytemuck::cast_slice(&asset.follow_root_offsets))?;
        let bone_skinning = read_only(device, label("bone_skinning"), bytemuck::cast_slice(&asset.bone_skinning))?;
        let generation_set = device.create_bind_set(&BindSetDesc {
            label: label("generation"),
            layout: layouts.hair_generation,
            resources: vec![
                initial_positions,
                global_rotations,
                ref_vectors,
                rest_lengths,
                follow_root_offsets,
                bone_skinning,
            ],
        })?;

        let mut constants = Box::<SimulationConstants>::default();
        constants.counts = [
            asset.vertices_per_strand,
            asset.follow_hairs_per_guide,
            asset.num_guide_strands,
            asset.num_total_strands,
        ];
        let constants_size = std::mem::size_of::<SimulationConstants>() as u64;
        let mut simulation_buffers = [ResourceId(0); 2];
        let mut simulation_sets = [BindSetId(0); 2];
        for slot in 0..2 {
            let buffer = device.create_buffer(&BufferDesc::uniform(label(&format!("sim_constants_{}", slot)), constants_size))?;
            let mut resources = vec![buffer];
            resources.extend(dynamic.simulation_bindings());
            simulation_sets[slot] = device.create_bind_set(&BindSetDesc {
                label: label(&format!("simulation_{}", slot)),
                layout: layouts.hair_simulation,
                resources,
            })?;
            simulation_buffers[slot] = buffer;
        }

        let render_constants = device.create_buffer(&BufferDesc::uniform(
            label("render_constants"),
            std::mem::size_of::<RenderConstants>() as u64,
        ))?;
        let strand_constants = device.create_buffer(&BufferDesc::uniform(
            label("strand_constants"),
            std::mem::size_of::<StrandConstants>() as u64,
        ))?;
        let strand_tex_coords = read_only(device, label("strand_tex_coords"), bytemuck::cast_slice(&asset.strand_tex_coords))?;
        let thickness_coeffs = read_only(device, label("thickness_coeffs"), bytemuck::cast_slice(&asset.thickness_coeffs))?;
        let indices: &[u8] = bytemuck::cast_slice(&asset.triangle_indices);
        let index_buffer = device.create_buffer_with_data(&BufferDesc::index(label("indices"), indices.len() as u64), indices)?;
        let render_set = device.create_bind_set(&BindSetDesc {
            label: label("render"),
            layout: layouts.hair_object,
            resources: vec![
                render_constants,
                strand_constants,
                dynamic.positions.id,
                dynamic.tangents.id,
                strand_tex_coords,
                thickness_coeffs,
            ],
        })?;

        let mut object = Self {
            name: asset.name.clone(),
            vertices_per_strand: asset.vertices_per_strand,
            follow_hairs_per_guide: asset.follow_hairs_per_guide,
            num_guide_strands: asset.num_guide_strands,
            num_total_strands: asset.num_total_strands,
            indices_per_strand_group: asset.indices_per_strand_group(),
            dynamic,
            generation: GenerationBuffers {
                initial_positions,
                global_rotations,
                ref_vectors,
                rest_lengths,
                follow_root_offsets,
                bone_skinning,
                set: generation_set,
            },
            render: RenderBuffers {
                render_constants,
                strand_constants,
                strand_tex_coords,
                thickness_coeffs,
                index_buffer,
                set: render_set,
            },
            simulation_buffers,
            simulation_sets,
            constants,
            bones: vec![Mat4::IDENTITY],
            simulation: simulation.clone(),
            rendering: rendering.clone(),
            parity: 0,
            frame: 0,
            reset_frames_left: RESET_FRAMES,
            lod_fraction: 1.0,
        };
        object.update_rendering_parameters(device.graphics_context(), rendering, 0.0);

        log::info!(
            "[HairObject] Created '{}': {} strands ({} guides), {} vertices",
            object.name,
            object.num_total_strands,
            object.num_guide_strands,
            object.num_vertices()
        );
        Ok(object)
    }

    /// Replaces the bone palette used from the next tick on.
    ///
    /// `None` keeps the previous palette, so the hair holds its last skinned
    /// pose for this frame.
    pub fn update_bone_matrices(&mut self, matrices: Option<&[Mat4]>) {
        match matrices {
            Some(matrices) if !matrices.is_empty() => {
                self.bones.clear();
                self.bones.extend_from_slice(matrices);
            }
            _ => log::warn!(
                "[HairObject] '{}': no bone matrices this frame, keeping the previous pose",
                self.name
            ),
        }
    }

    pub fn update_simulation_parameters(&mut self, settings: &SimulationSettings) {
        self.simulation = settings.clone();
    }

    /// Uploads material and strand constants. `camera_distance` drives the
    /// level of detail when it is enabled.
    pub fn update_rendering_parameters(
        &mut self,
        ctx: &mut dyn CommandContext,
        settings: &RenderingSettings,
        camera_distance: f32,
    ) {
        self.rendering = settings.clone();
        let mut radius = settings.fiber_radius;
        self.lod_fraction = 1.0;
        if settings.enable_lod {
            let span = (settings.lod_end_distance - settings.lod_start_distance).max(1e-4);
            let t = ((camera_distance - settings.lod_start_distance) / span).clamp(0.0, 1.0);
            self.lod_fraction = 1.0 - t * (1.0 - settings.lod_percent.clamp(0.0, 1.0));
            radius *= 1.0 + t * (settings.lod_width_multiplier - 1.0);
        }

        let render = RenderConstants::from_settings(settings);
        let strand = StrandConstants::new(settings, radius, self.vertices_per_strand, self.num_total_strands);
        ctx.update_buffer(self.render.render_constants, bytemuck::bytes_of(&render));
        ctx.update_buffer(self.render.strand_constants, bytemuck::bytes_of(&strand));
    }

    /// Snaps the hair to its skinned rest pose on the next `RESET_FRAMES` ticks.
    pub fn request_reset(&mut self) {
        log::debug!("[HairObject] '{}': position reset requested", self.name);
        self.reset_frames_left = RESET_FRAMES;
    }

    /// Writes the constants of the coming tick into the slot selected by the
    /// current parity.
    pub fn prepare_tick(&mut self, ctx: &mut dyn CommandContext, time_step: f32) -> TickPlan {
        let configured = self.simulation.local_constraints_iterations;
        let (gpu_local, cpu_local) = local_iteration_split(self.vertices_per_strand, configured);
        let reset = self.reset_frames_left > 0;

        self.constants.set_settings(&self.simulation, time_step);
        self.constants.set_wind(wind_pyramid(&self.simulation, self.frame));
        self.constants.set_bones(&self.bones);
        self.constants.iterations = [
            gpu_local,
            self.simulation.length_constraints_iterations,
            reset as u32,
            self.frame,
        ];
        ctx.update_buffer(self.simulation_buffers[self.parity], bytemuck::bytes_of(self.constants.as_ref()));

        TickPlan {
            simulation_set: self.simulation_sets[self.parity],
            cpu_local_iterations: cpu_local,
            reset_positions: reset,
        }
    }

    /// Ends a tick. Afterwards the other constant slot is current and the
    /// frame counter has moved on by one.
    pub fn advance_parity(&mut self) {
        self.parity ^= 1;
        self.frame = self.frame.wrapping_add(1);
        self.reset_frames_left = self.reset_frames_left.saturating_sub(1);
        log::trace!("[HairObject] '{}': parity {} frame {}", self.name, self.parity, self.frame);
    }

    /// Records the strand draw. Set 0 is this object's render set, `extra_sets`
    /// follow from set 1.
    pub fn draw_strands(&self, ctx: &mut dyn CommandContext, pipeline: PipelineId, extra_sets: &[BindSetId]) {
        if self.dynamic.phase() != DynamicPhase::Render {
            log::warn!("[HairObject] '{}': drawn while positions are still simulation-writable", self.name);
        }
        let mut sets = Vec::with_capacity(extra_sets.len() + 1);
        sets.push(self.render.set);
        sets.extend_from_slice(extra_sets);
        ctx.bind_pipeline(pipeline);
        ctx.bind_sets(pipeline, &sets);
        ctx.draw_indexed_instanced(pipeline, self.render.index_buffer, self.lod_index_count(), 1);
    }

    /// Indices drawn at the current level of detail, always whole guide groups.
    pub fn lod_index_count(&self) -> u32 {
        let guides = self.num_guide_strands;
        let drawn = ((guides as f32 * self.lod_fraction).ceil() as u32).clamp(1, guides.max(1));
        drawn * self.indices_per_strand_group
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        for set in self.simulation_sets {
            device.release(set.into());
        }
        for buffer in self.simulation_buffers {
            device.release(buffer.into());
        }
        device.release(self.generation.set.into());
        for buffer in [
            self.generation.initial_positions,
            self.generation.global_rotations,
            self.generation.ref_vectors,
            self.generation.rest_lengths,
            self.generation.follow_root_offsets,
            self.generation.bone_skinning,
        ] {
            device.release(buffer.into());
        }
        device.release(self.render.set.into());
        for buffer in [
            self.render.render_constants,
            self.render.strand_constants,
            self.render.strand_tex_coords,
            self.render.thickness_coeffs,
            self.render.index_buffer,
        ] {
            device.release(buffer.into());
        }
        self.dynamic.destroy(device);
        log::debug!("[HairObject] Destroyed '{}'", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices_per_strand(&self) -> u32 {
        self.vertices_per_strand
    }

    pub fn follow_hairs_per_guide(&self) -> u32 {
        self.follow_hairs_per_guide
    }

    pub fn num_guide_strands(&self) -> u32 {
        self.num_guide_strands
    }

    pub fn num_total_strands(&self) -> u32 {
        self.num_total_strands
    }

    pub fn num_vertices(&self) -> u32 {
        self.num_total_strands * self.vertices_per_strand
    }

    pub fn num_guide_vertices(&self) -> u32 {
        self.num_guide_strands * self.vertices_per_strand
    }

    pub fn parity(&self) -> usize {
        self.parity
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Constants written by the last `prepare_tick`.
    pub fn constants(&self) -> &SimulationConstants {
        &self.constants
    }

    pub fn simulation_settings(&self) -> &SimulationSettings {
        &self.simulation
    }

    pub fn rendering_settings(&self) -> &RenderingSettings {
        &self.rendering
    }

    pub fn dynamic_state(&self) -> &DynamicState {
        &self.dynamic
    }

    pub fn dynamic_state_mut(&mut self) -> &mut DynamicState {
        &mut self.dynamic
    }

    pub fn generation_set(&self) -> BindSetId {
        self.generation.set
    }

    pub fn render_set(&self) -> BindSetId {
        self.render.set
    }

    pub fn simulation_set(&self, slot: usize) -> BindSetId {
        self.simulation_sets[slot & 1]
    }

    pub fn positions(&self) -> ResourceId {
        self.dynamic.positions.id
    }

    pub fn positions_state(&self) -> ResourceState {
        self.dynamic.positions.state
    }
}

fn read_only(device: &mut dyn RenderDevice, label: String, data: &[u8]) -> HairResult<ResourceId> {
    device.create_buffer_with_data(&BufferDesc::read_only(label, data.len().max(4) as u64), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use crate::hair::{FollowHairParams, HairAssetData};
    use glam::Vec3;

    fn strand_asset(n: u32, guides: u32, follow: u32) -> HairAsset {
        let positions: Vec<Vec3> = (0..guides)
            .flat_map(|g| (0..n).map(move |i| Vec3::new(g as f32 * 0.1, -0.05 * i as f32, 0.0)))
            .collect();
        HairAsset::from_guide_strands(
            "object",
            n,
            &positions,
            FollowHairParams {
                count: follow,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn object(device: &mut HeadlessDevice, asset: HairAsset) -> (LayoutRegistry, HairObject) {
        let layouts = LayoutRegistry::new(device).unwrap();
        let object = HairObject::new(
            device,
            &layouts,
            asset,
            &SimulationSettings::default(),
            &RenderingSettings::default(),
        )
        .unwrap();
        (layouts, object)
    }

    #[test]
    fn parity_flips_and_reset_expires() {
        let mut device = HeadlessDevice::new();
        let (_layouts, mut object) = object(&mut device, strand_asset(4, 1, 0));

        let first = object.prepare_tick(device.graphics_context(), 0.016);
        assert!(first.reset_positions);
        object.advance_parity();
        let second = object.prepare_tick(device.graphics_context(), 0.016);
        assert_ne!(first.simulation_set, second.simulation_set);
        assert!(second.reset_positions);
        object.advance_parity();
        let third = object.prepare_tick(device.graphics_context(), 0.016);
        assert!(!third.reset_positions);
        assert_eq!(third.simulation_set, first.simulation_set);

        object.request_reset();
        assert!(object.prepare_tick(device.graphics_context(), 0.016).reset_positions);
    }

    #[test]
    fn short_strands_iterate_local_shape_on_the_cpu() {
        let mut device = HeadlessDevice::new();
        let (_layouts, mut object) = object(&mut device, strand_asset(16, 1, 0));
        object.update_simulation_parameters(&SimulationSettings {
            local_constraints_iterations: 3,
            ..Default::default()
        });
        let plan = object.prepare_tick(device.graphics_context(), 0.016);
        assert_eq!(plan.cpu_local_iterations, 3);
        assert_eq!(object.constants().local_iterations(), 1);
    }

    #[test]
    fn long_strands_iterate_local_shape_on_the_gpu() {
        let mut device = HeadlessDevice::new();
        let (_layouts, mut object) = object(&mut device, strand_asset(64, 1, 0));
        object.update_simulation_parameters(&SimulationSettings {
            local_constraints_iterations: 4,
            ..Default::default()
        });
        let plan = object.prepare_tick(device.graphics_context(), 0.016);
        assert_eq!(plan.cpu_local_iterations, 1);
        assert_eq!(object.constants().local_iterations(), 4);
    }

    #[test]
    fn missing_bones_keep_the_previous_palette() {
        let mut device = HeadlessDevice::new();
        let (_layouts, mut object) = object(&mut device, strand_asset(4, 1, 0));
        let pose = Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0));
        object.update_bone_matrices(Some(&[pose][..]));
        object.update_bone_matrices(None);
        object.prepare_tick(device.graphics_context(), 0.016);
        assert_eq!(object.constants().bone(0), pose);
    }

    #[test]
    fn lod_drops_whole_strand_groups() {
        let mut device = HeadlessDevice::new();
        let (_layouts, mut object) = object(&mut device, strand_asset(4, 10, 2));
        let full = object.lod_index_count();
        assert_eq!(full, 10 * 3 * 3 * 6);

        let settings = RenderingSettings {
            enable_lod: true,
            lod_start_distance: 1.0,
            lod_end_distance: 5.0,
            lod_percent: 0.5,
            ..Default::default()
        };
        object.update_rendering_parameters(device.graphics_context(), &settings, 10.0);
        assert_eq!(object.lod_index_count(), 5 * 3 * 3 * 6);
        object.update_rendering_parameters(device.graphics_context(), &settings, 0.0);
        assert_eq!(object.lod_index_count(), full);
    }

    #[test]
    fn destroy_releases_everything() {
        let mut device = HeadlessDevice::new();
        let (layouts, object) = object(&mut device, strand_asset(8, 2, 1));
        let baseline = 14;
        assert!(device.live_allocations() > baseline);
        object.destroy(&mut device);
        assert_eq!(device.live_allocations(), baseline);
        layouts.destroy(&mut device);
    }

    #[test]
    fn asset_data_round_trips_through_the_upload() {
        let mut device = HeadlessDevice::new();
        let asset = HairAsset::new(HairAssetData {
            name: "uploaded".into(),
            vertices_per_strand: 4,
            positions: (0..4).map(|i| Vec3::new(0.0, 0.0, -(i as f32))).collect(),
            ..Default::default()
        })
        .unwrap();
        let expected = asset.positions.clone();
        let (_layouts, object) = object(&mut device, asset);
        let bytes = device.read_buffer(object.positions()).unwrap();
        assert_eq!(bytes.as_slice(), bytemuck::cast_slice::<Vec4, u8>(&expected));
    }
}
