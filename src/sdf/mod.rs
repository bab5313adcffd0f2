//! Signed distance field collision.
//!
//! Every frame a [`CollisionMesh`] is skinned on the CPU, its grid is refit
//! around the skinned bounds and the field is rebuilt on the GPU in three
//! passes:
//! - reset every cell to `INITIAL_DISTANCE`
//! - splat exact signed distances into a narrow band around each triangle
//! - fill the remaining cells with the nearest distance, signed by the
//!   generalized winding number
//!
//! Hair vertices closer than the collision margin are then pushed out along
//! the field gradient. The field can also be turned into a triangle mesh with
//! marching cubes for debug drawing.

mod collision_mesh;
pub mod grid;
pub mod march_tables;
mod marching_cubes;
pub mod reference;

#[cfg(test)]
mod tests;

pub use collision_mesh::{CollisionMesh, CollisionMeshData};
pub use grid::{Aabb, SdfGrid};
pub use marching_cubes::{extract_iso_surface, IsoSurfacePool};
pub use reference::SdfVolume;

use crate::device::{
    BindLayoutId, BufferDesc, ColorTarget, CompareFunction, ComputePipelineDesc, DepthState, GraphicsPipelineDesc, PipelineId,
    RenderDevice, RenderTargetSetId, ResourceId, Topology,
};
use crate::error::HairResult;
use crate::layouts::LayoutRegistry;
use crate::shaders::{self, ShaderSource};
use march_tables::MARCH_TABLES;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SdfPipelines {
    pub initialize: PipelineId,
    pub construct: PipelineId,
    pub finalize: PipelineId,
    pub collide: PipelineId,
    pub mc_initialize: PipelineId,
    pub march: PipelineId,
    pub draw: Option<PipelineId>,
}

/// Pipelines and lookup tables shared by every collision mesh.
#[derive(Debug)]
pub struct SdfKernels {
    pub(crate) pipelines: SdfPipelines,
    edge_table: ResourceId,
    tri_table: ResourceId,
}

impl SdfKernels {
    pub fn new(device: &mut dyn RenderDevice, layouts: &LayoutRegistry) -> HairResult<Self> {
        let build = ShaderSource::load(shaders::SDF_BUILD)?;
        let collide = ShaderSource::load(shaders::SDF_COLLIDE)?;
        let march = ShaderSource::load(shaders::MARCHING_CUBES)?;

        let mut pipeline = |shader: &ShaderSource, entry_point: &str, bind_layouts: &[BindLayoutId]| {
            device.create_compute_pipeline(&ComputePipelineDesc {
                label: entry_point,
                shader,
                entry_point,
                layouts: bind_layouts,
            })
        };
        let build_layouts = [layouts.sdf_build];
        let collide_layouts = [layouts.hair_simulation, layouts.sdf_sample];
        let march_layouts = [layouts.marching_cubes];
        let pipelines = SdfPipelines {
            initialize: pipeline(&build, "initialize_sdf", &build_layouts)?,
            construct: pipeline(&build, "construct_sdf", &build_layouts)?,
            finalize: pipeline(&build, "finalize_sdf", &build_layouts)?,
            collide: pipeline(&collide, "collide_hair_vertices_with_sdf", &collide_layouts)?,
            mc_initialize: pipeline(&march, "initialize_mc_vertices", &march_layouts)?,
            march: pipeline(&march, "march_cells", &march_layouts)?,
            draw: None,
        };

        let edges: &[u8] = bytemuck::cast_slice(&MARCH_TABLES.edge_table);
        let triangles: &[u8] = bytemuck::cast_slice(&MARCH_TABLES.tri_table);
        let edge_table =
            device.create_buffer_with_data(&BufferDesc::read_only("mc_edge_table", edges.len() as u64), edges)?;
        let tri_table =
            device.create_buffer_with_data(&BufferDesc::read_only("mc_tri_table", triangles.len() as u64), triangles)?;

        log::debug!("[SdfKernels] Created SDF and marching-cubes pipelines");
        Ok(Self {
            pipelines,
            edge_table,
            tri_table,
        })
    }

    /// (Re)creates the debug draw pipeline for a render target set with one
    /// color attachment and a depth attachment.
    pub fn create_draw_pipeline(
        &mut self,
        device: &mut dyn RenderDevice,
        layouts: &LayoutRegistry,
        targets: RenderTargetSetId,
    ) -> HairResult<()> {
        if let Some(old) = self.pipelines.draw.take() {
            device.release(old.into());
        }
        let shader = ShaderSource::load(shaders::MARCHING_CUBES_DRAW)?;
        let pipeline = device.create_graphics_pipeline(&GraphicsPipelineDesc {
            label: "marching_cubes_draw",
            shader: &shader,
            vertex_entry: "mc_vertex",
            fragment_entry: "mc_fragment",
            topology: Topology::TriangleList,
            layouts: &[layouts.view, layouts.marching_cubes_draw],
            targets,
            color_targets: vec![ColorTarget::REPLACE],
            depth: Some(DepthState {
                compare: CompareFunction::LessEqual,
                write: true,
            }),
        })?;
        self.pipelines.draw = Some(pipeline);
        Ok(())
    }

    pub fn edge_table(&self) -> ResourceId {
        self.edge_table
    }

    pub fn tri_table(&self) -> ResourceId {
        self.tri_table
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        let p = self.pipelines;
        for pipeline in [p.initialize, p.construct, p.finalize, p.collide, p.mc_initialize, p.march]
            .into_iter()
            .chain(p.draw)
        {
            device.release(pipeline.into());
        }
        device.release(self.edge_table.into());
        device.release(self.tri_table.into());
    }
}
