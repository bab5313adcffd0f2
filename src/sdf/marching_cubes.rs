//! Iso-surface extraction from a finalized distance field.
//!
//! The GPU path writes triangles into a fixed-size vertex pool through an
//! atomic counter; [`extract_iso_surface`] is the CPU mirror of `march_cells`.

use crate::constants::SDF_THREAD_GROUP_SIZE;
use crate::device::{
    workgroups, Barrier, BindSetDesc, BindSetId, BufferDesc, CommandContext, RenderDevice, ResourceId,
    ResourceState, TrackedResource,
};
use crate::error::HairResult;
use crate::hair::gpu_types::MarchingCubesVertex;
use crate::layouts::LayoutRegistry;
use crate::sdf::march_tables::{corner_offset, edge_corners, MARCH_TABLES};
use crate::sdf::reference::SdfVolume;
use crate::sdf::SdfKernels;
use glam::{UVec3, Vec3};
use rayon::prelude::*;

/// Triangles of the `iso` level set, in the order `march_cells` emits them
/// within a cube.
pub fn extract_iso_surface(volume: &SdfVolume, iso: f32) -> Vec<[Vec3; 3]> {
    let grid = &volume.grid;
    let cubes = grid.counts - UVec3::ONE;
    let total = (cubes.x * cubes.y * cubes.z) as usize;

    (0..total)
        .into_par_iter()
        .flat_map_iter(|index| {
            let i = index as u32;
            let cube = UVec3::new(i % cubes.x, (i / cubes.x) % cubes.y, i / (cubes.x * cubes.y));
            let mut values = [0.0f32; 8];
            let mut corners = [Vec3::ZERO; 8];
            let mut case = 0usize;
            for k in 0..8 {
                let [x, y, z] = corner_offset(k);
                let c = cube + UVec3::new(x, y, z);
                values[k] = volume.values[grid.cell_index(c.x, c.y, c.z)];
                corners[k] = grid.cell_position(c.x, c.y, c.z);
                if values[k] < iso {
                    case |= 1 << k;
                }
            }

            let point = |e: usize| {
                let (a, b) = edge_corners(e);
                let delta = values[b] - values[a];
                let t = if delta.abs() > 1e-12 {
                    ((iso - values[a]) / delta).clamp(0.0, 1.0)
                } else {
                    0.5
                };
                corners[a].lerp(corners[b], t)
            };
            MARCH_TABLES
                .triangles(case)
                .map(move |[a, b, c]| [point(a), point(b), point(c)])
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Bounded vertex pool the marching-cubes kernel appends to.
///
/// The counter keeps counting past the capacity; triangles beyond it are
/// dropped and reported by [`IsoSurfacePool::read_counter`].
#[derive(Debug)]
pub struct IsoSurfacePool {
    vertices: TrackedResource,
    counter: TrackedResource,
    compute_set: BindSetId,
    draw_set: BindSetId,
    capacity: u32,
}

impl IsoSurfacePool {
    pub fn new(
        device: &mut dyn RenderDevice,
        layouts: &LayoutRegistry,
        kernels: &SdfKernels,
        label: &str,
        sdf_constants: ResourceId,
        sdf_cells: ResourceId,
        capacity: u32,
    ) -> HairResult<Self> {
        let capacity = capacity.max(3);
        let vertex_bytes = capacity as u64 * std::mem::size_of::<MarchingCubesVertex>() as u64;
        let vertices = device.create_buffer(&BufferDesc::storage(format!("{}_mc_vertices", label), vertex_bytes))?;
        let counter = device.create_buffer(&BufferDesc::uint32(format!("{}_mc_counter", label), 1))?;

        let compute_set = device.create_bind_set(&BindSetDesc {
            label: format!("{}_marching_cubes", label),
            layout: layouts.marching_cubes,
            resources: vec![
                sdf_constants,
                sdf_cells,
                kernels.edge_table(),
                kernels.tri_table(),
                vertices,
                counter,
            ],
        })?;
        let draw_set = device.create_bind_set(&BindSetDesc {
            label: format!("{}_marching_cubes_draw", label),
            layout: layouts.marching_cubes_draw,
            resources: vec![vertices],
        })?;

        Ok(Self {
            vertices: TrackedResource::new(vertices, ResourceState::ShaderReadWrite),
            counter: TrackedResource::new(counter, ResourceState::Undefined),
            compute_set,
            draw_set,
            capacity,
        })
    }

    /// Records pool reset and extraction over `cubes` grid cubes. The SDF
    /// cells must already be shader-readable.
    pub fn generate(&mut self, ctx: &mut dyn CommandContext, kernels: &SdfKernels, cubes: u32) {
        let mut barriers = Vec::new();
        barriers.extend(self.vertices.transition(ResourceState::ShaderReadWrite));
        barriers.extend(self.counter.transition(ResourceState::ShaderReadWrite));
        ctx.submit_barrier(&barriers);

        ctx.bind_pipeline(kernels.pipelines.mc_initialize);
        ctx.bind_sets(kernels.pipelines.mc_initialize, &[self.compute_set]);
        ctx.dispatch(workgroups(self.capacity, SDF_THREAD_GROUP_SIZE));
        ctx.submit_barrier(&[Barrier::uav(self.vertices.id), Barrier::uav(self.counter.id)]);

        ctx.bind_pipeline(kernels.pipelines.march);
        ctx.bind_sets(kernels.pipelines.march, &[self.compute_set]);
        ctx.dispatch(workgroups(cubes, SDF_THREAD_GROUP_SIZE));

        self.vertices.transition_now(ctx, ResourceState::ShaderRead);
    }

    /// Draws the whole pool. Slots past the counter hold zeroed, degenerate
    /// triangles. Must be recorded inside a render pass.
    pub fn draw(&mut self, ctx: &mut dyn CommandContext, kernels: &SdfKernels, view_set: BindSetId) {
        let Some(pipeline) = kernels.pipelines.draw else {
            log::warn!("[IsoSurfacePool] No marching-cubes draw pipeline, skipping draw");
            return;
        };
        if self.vertices.state != ResourceState::ShaderRead {
            log::warn!("[IsoSurfacePool] Drawing a pool that was never generated");
        }
        ctx.bind_pipeline(pipeline);
        ctx.bind_sets(pipeline, &[view_set, self.draw_set]);
        ctx.draw_instanced(pipeline, self.capacity, 1);
    }

    /// Vertices the last extraction tried to emit, possibly above capacity.
    pub fn read_counter(&self, device: &mut dyn RenderDevice) -> HairResult<u32> {
        let words = device.read_u32s(self.counter.id)?;
        Ok(words.first().copied().unwrap_or(0))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn vertices(&self) -> ResourceId {
        self.vertices.id
    }

    pub fn counter(&self) -> ResourceId {
        self.counter.id
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        device.release(self.draw_set.into());
        device.release(self.compute_set.into());
        device.release(self.counter.id.into());
        device.release(self.vertices.id.into());
    }
}
