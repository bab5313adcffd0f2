use crate::device::{
    transition_all, Barrier, BufferDesc, CommandContext, RenderDevice, ResourceId, ResourceState, TrackedResource,
};
use crate::error::HairResult;
use crate::hair::gpu_types::StrandLevelData;
use crate::hair::HairAsset;
use glam::Vec4;

/// Which side of the frame the position and tangent buffers are prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicPhase {
    Simulation,
    Render,
}

/// The per-object buffers the simulation writes every tick.
///
/// Positions and tangents move between `ShaderReadWrite` (simulation and
/// collision) and `ShaderRead` (rendering). The history buffers and the
/// strand-level data never leave the simulation.
#[derive(Debug)]
pub struct DynamicState {
    pub positions: TrackedResource,
    pub tangents: TrackedResource,
    pub positions_prev: ResourceId,
    pub positions_prev_prev: ResourceId,
    pub strand_level_data: ResourceId,
}

impl DynamicState {
    pub fn new(device: &mut dyn RenderDevice, asset: &HairAsset) -> HairResult<Self> {
        let vertex_bytes = (asset.num_vertices() as usize * std::mem::size_of::<Vec4>()) as u64;
        let strand_bytes = (asset.num_guide_strands.max(1) as usize * std::mem::size_of::<StrandLevelData>()) as u64;
        let label = |name: &str| format!("{}_{}", asset.name, name);

        let positions = device.create_buffer(&BufferDesc::storage(label("positions"), vertex_bytes))?;
        let tangents = device.create_buffer(&BufferDesc::storage(label("tangents"), vertex_bytes))?;
        let positions_prev = device.create_buffer(&BufferDesc::storage(label("positions_prev"), vertex_bytes))?;
        let positions_prev_prev =
            device.create_buffer(&BufferDesc::storage(label("positions_prev_prev"), vertex_bytes))?;
        let strand_level_data = device.create_buffer(&BufferDesc::storage(label("strand_level_data"), strand_bytes))?;

        Ok(Self {
            positions: TrackedResource::new(positions, ResourceState::ShaderReadWrite),
            tangents: TrackedResource::new(tangents, ResourceState::ShaderReadWrite),
            positions_prev,
            positions_prev_prev,
            strand_level_data,
        })
    }

    /// Seeds every position buffer with the rest pose.
    pub fn upload(&mut self, ctx: &mut dyn CommandContext, asset: &HairAsset) {
        let positions: &[u8] = bytemuck::cast_slice(&asset.positions);
        let tangents: &[u8] = bytemuck::cast_slice(&asset.tangents);
        self.transition_to_simulation(ctx);
        for buffer in [self.positions.id, self.positions_prev, self.positions_prev_prev] {
            ctx.update_buffer(buffer, positions);
        }
        ctx.update_buffer(self.tangents.id, tangents);
    }

    pub fn phase(&self) -> DynamicPhase {
        if self.positions.state == ResourceState::ShaderRead {
            DynamicPhase::Render
        } else {
            DynamicPhase::Simulation
        }
    }

    /// Makes positions and tangents readable by the hair vertex shader.
    /// Returns the number of barriers emitted; 0 if already there.
    pub fn transition_to_render(&mut self, ctx: &mut dyn CommandContext) -> usize {
        transition_all(ctx, &mut [&mut self.positions, &mut self.tangents], ResourceState::ShaderRead)
    }

    /// Makes positions and tangents writable by simulation and collision.
    pub fn transition_to_simulation(&mut self, ctx: &mut dyn CommandContext) -> usize {
        transition_all(ctx, &mut [&mut self.positions, &mut self.tangents], ResourceState::ShaderReadWrite)
    }

    /// Write-visibility barrier between two dependent simulation dispatches.
    pub fn uav_barrier(&self, ctx: &mut dyn CommandContext) {
        ctx.submit_barrier(&[
            Barrier::uav(self.positions.id),
            Barrier::uav(self.positions_prev),
            Barrier::uav(self.positions_prev_prev),
            Barrier::uav(self.tangents.id),
            Barrier::uav(self.strand_level_data),
        ]);
    }

    /// Buffers in the order of the simulation bind layout, after the constants.
    pub fn simulation_bindings(&self) -> [ResourceId; 5] {
        [
            self.positions.id,
            self.positions_prev,
            self.positions_prev_prev,
            self.tangents.id,
            self.strand_level_data,
        ]
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        for buffer in self.simulation_bindings() {
            device.release(buffer.into());
        }
    }
}
