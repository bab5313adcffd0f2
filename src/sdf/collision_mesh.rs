use crate::config::CollisionSettings;
use crate::constants::{SDF_THREAD_GROUP_SIZE, THREAD_GROUP_SIZE};
use crate::device::{
    workgroups, Barrier, BindSetDesc, BindSetId, BufferDesc, CommandContext, RenderDevice, ResourceId,
    ResourceState, TrackedResource,
};
use crate::error::{HairError, HairResult};
use crate::hair::gpu_types::{BoneSkinningData, SdfConstants};
use crate::hair::HairObject;
use crate::layouts::LayoutRegistry;
use crate::sdf::{Aabb, IsoSurfacePool, SdfGrid, SdfKernels};
use crate::system::CapacityReport;
use glam::{Mat4, Vec3, Vec4};
use rayon::prelude::*;
use std::f32::consts::PI;

/// A closed triangle mesh the hair collides with.
#[derive(Debug, Clone, Default)]
pub struct CollisionMeshData {
    pub name: String,
    pub positions: Vec<Vec3>,
    /// Counter-clockwise seen from outside.
    pub indices: Vec<u32>,
    /// One entry per vertex, or empty to follow bone 0.
    pub bone_skinning: Vec<BoneSkinningData>,
}

impl CollisionMeshData {
    /// Latitude/longitude sphere around the origin with one vertex at each
    /// pole.
    pub fn uv_sphere(name: impl Into<String>, radius: f32, rings: u32, segments: u32) -> Self {
        let rings = rings.max(2);
        let segments = segments.max(3);
        let mut positions = Vec::with_capacity((2 + (rings - 1) * segments) as usize);
        positions.push(Vec3::Y * radius);
        for i in 1..rings {
            let theta = PI * i as f32 / rings as f32;
            for j in 0..segments {
                let phi = 2.0 * PI * j as f32 / segments as f32;
                positions.push(radius * Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin()));
            }
        }
        positions.push(Vec3::NEG_Y * radius);

        let north = 0;
        let south = positions.len() as u32 - 1;
        let ring = |i: u32, j: u32| 1 + (i - 1) * segments + j % segments;
        let mut indices = Vec::with_capacity((6 * segments * (rings - 1)) as usize);
        for j in 0..segments {
            indices.extend_from_slice(&[north, ring(1, j + 1), ring(1, j)]);
        }
        for i in 1..rings - 1 {
            for j in 0..segments {
                let (a, b) = (ring(i, j), ring(i, j + 1));
                let (c, d) = (ring(i + 1, j), ring(i + 1, j + 1));
                indices.extend_from_slice(&[a, b, c, b, d, c]);
            }
        }
        for j in 0..segments {
            indices.extend_from_slice(&[ring(rings - 1, j), ring(rings - 1, j + 1), south]);
        }

        Self {
            name: name.into(),
            positions,
            indices,
            bone_skinning: Vec::new(),
        }
    }

    pub fn num_triangles(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    pub fn validate(&self) -> HairResult<()> {
        let invalid = |reason: String| HairError::InvalidMesh {
            mesh: self.name.clone(),
            reason,
        };
        if self.positions.is_empty() || self.indices.is_empty() {
            return Err(invalid("mesh has no triangles".to_string()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(invalid(format!("{} indices is not a whole number of triangles", self.indices.len())));
        }
        if let Some(bad) = self.indices.iter().find(|i| **i as usize >= self.positions.len()) {
            return Err(invalid(format!("index {} out of {} vertices", bad, self.positions.len())));
        }
        if !self.bone_skinning.is_empty() && self.bone_skinning.len() != self.positions.len() {
            return Err(invalid(format!(
                "{} skinning entries for {} vertices",
                self.bone_skinning.len(),
                self.positions.len()
            )));
        }
        if self.positions.iter().any(|p| !p.is_finite()) {
            return Err(invalid("non-finite vertex position".to_string()));
        }
        Ok(())
    }

    /// Bind-pose positions moved by the bone palette.
    pub fn skinned_positions(&self, bones: &[Mat4]) -> Vec<Vec3> {
        let palette: Vec<[f32; 16]> = bones.iter().map(Mat4::to_cols_array).collect();
        let rigid = BoneSkinningData::default();
        self.positions
            .par_iter()
            .enumerate()
            .map(|(i, p)| {
                let skin = self.bone_skinning.get(i).unwrap_or(&rigid);
                skin.blend(&palette).transform_point3(*p)
            })
            .collect()
    }
}

/// GPU state of one collision mesh: the skinned triangles, the distance
/// field over them and an optional iso-surface pool.
#[derive(Debug)]
pub struct CollisionMesh {
    data: CollisionMeshData,
    settings: CollisionSettings,
    grid: SdfGrid,
    constants: ResourceId,
    mesh_vertices: ResourceId,
    mesh_indices: ResourceId,
    cells: TrackedResource,
    build_set: BindSetId,
    sample_set: BindSetId,
    iso_surface: Option<IsoSurfacePool>,
    has_field: bool,
    capped_frames: u32,
}

impl CollisionMesh {
    pub fn new(
        device: &mut dyn RenderDevice,
        layouts: &LayoutRegistry,
        kernels: &SdfKernels,
        data: CollisionMeshData,
        settings: &CollisionSettings,
    ) -> HairResult<Self> {
        data.validate()?;
        let grid = SdfGrid::new(&Aabb::from_points(&data.positions), settings).map_err(|e| match e {
            HairError::InvalidMesh { reason, .. } => HairError::InvalidMesh {
                mesh: data.name.clone(),
                reason,
            },
            other => other,
        })?;
        let label = |name: &str| format!("{}_{}", data.name, name);

        let constants = device.create_buffer(&BufferDesc::uniform(
            label("sdf_constants"),
            std::mem::size_of::<SdfConstants>() as u64,
        ))?;
        let mesh_vertices = device.create_buffer(
            &BufferDesc::storage(
                label("mesh_vertices"),
                (data.positions.len() * std::mem::size_of::<Vec4>()) as u64,
            )
            .with_initial_state(ResourceState::ShaderRead),
        )?;
        let index_bytes: &[u8] = bytemuck::cast_slice(&data.indices);
        let mesh_indices = device.create_buffer_with_data(
            &BufferDesc::read_only(label("mesh_indices"), index_bytes.len() as u64),
            index_bytes,
        )?;
        let cells = device.create_buffer(&BufferDesc::uint32(label("sdf_cells"), grid.max_cells() as u64))?;

        let build_set = device.create_bind_set(&BindSetDesc {
            label: label("sdf_build"),
            layout: layouts.sdf_build,
            resources: vec![constants, cells, mesh_vertices, mesh_indices],
        })?;
        let sample_set = device.create_bind_set(&BindSetDesc {
            label: label("sdf_sample"),
            layout: layouts.sdf_sample,
            resources: vec![constants, cells],
        })?;
        let iso_surface = if settings.generate_iso_surface {
            Some(IsoSurfacePool::new(
                device,
                layouts,
                kernels,
                &data.name,
                constants,
                cells,
                settings.max_marching_cubes_vertices,
            )?)
        } else {
            None
        };

        log::info!(
            "[CollisionMesh] Created '{}': {} triangles, grid {:?} at cell {:.4}, budget {} cells",
            data.name,
            data.num_triangles(),
            grid.counts.to_array(),
            grid.cell_size,
            grid.max_cells()
        );
        Ok(Self {
            data,
            settings: settings.clone(),
            grid,
            constants,
            mesh_vertices,
            mesh_indices,
            cells: TrackedResource::new(cells, ResourceState::Undefined),
            build_set,
            sample_set,
            iso_surface,
            has_field: false,
            capped_frames: 0,
        })
    }

    /// Skins the mesh, refits the grid and records the three field passes.
    ///
    /// Returns `false` and keeps the previous field when no bone palette was
    /// supplied this frame.
    pub fn update(&mut self, ctx: &mut dyn CommandContext, kernels: &SdfKernels, bones: Option<&[Mat4]>) -> bool {
        let Some(bones) = bones.filter(|b| !b.is_empty()) else {
            log::warn!("[CollisionMesh] '{}': no bone matrices this frame, keeping the previous field", self.data.name);
            return false;
        };
        ctx.insert_marker(&format!("sdf {}", self.data.name));

        let skinned = self.data.skinned_positions(bones);
        if self.grid.fit(&Aabb::from_points(&skinned)) {
            self.capped_frames += 1;
        }
        let iso_capacity = self.iso_surface.as_ref().map_or(0, IsoSurfacePool::capacity);
        let constants = self.grid.constants(
            &self.settings,
            skinned.len() as u32,
            self.data.num_triangles(),
            iso_capacity,
        );
        let vertices: Vec<Vec4> = skinned.iter().map(|p| p.extend(1.0)).collect();
        ctx.update_buffer(self.constants, bytemuck::bytes_of(&constants));
        ctx.update_buffer(self.mesh_vertices, bytemuck::cast_slice(&vertices));

        self.cells.transition_now(ctx, ResourceState::ShaderReadWrite);
        let cell_groups = workgroups(self.grid.total_cells(), SDF_THREAD_GROUP_SIZE);
        let passes = [
            (kernels.pipelines.initialize, cell_groups),
            (
                kernels.pipelines.construct,
                workgroups(self.data.num_triangles(), SDF_THREAD_GROUP_SIZE),
            ),
            (kernels.pipelines.finalize, cell_groups),
        ];
        for (i, (pipeline, groups)) in passes.into_iter().enumerate() {
            if i > 0 {
                ctx.submit_barrier(&[Barrier::uav(self.cells.id)]);
            }
            ctx.bind_pipeline(pipeline);
            ctx.bind_sets(pipeline, &[self.build_set]);
            ctx.dispatch(groups);
        }
        self.cells.transition_now(ctx, ResourceState::ShaderRead);
        self.has_field = true;
        true
    }

    /// Pushes the vertices of `object` out of the field. Positions must be
    /// simulation-writable; they stay that way afterwards.
    pub fn collide_with_hair(&self, ctx: &mut dyn CommandContext, kernels: &SdfKernels, object: &mut HairObject) {
        if !self.has_field {
            log::debug!("[CollisionMesh] '{}': no field built yet, skipping collision", self.data.name);
            return;
        }
        object.dynamic_state_mut().transition_to_simulation(ctx);
        let pipeline = kernels.pipelines.collide;
        ctx.bind_pipeline(pipeline);
        ctx.bind_sets(pipeline, &[object.simulation_set(object.parity()), self.sample_set]);
        ctx.dispatch(workgroups(object.num_vertices(), THREAD_GROUP_SIZE));
        object.dynamic_state().uav_barrier(ctx);
    }

    /// Records marching cubes over the current field.
    pub fn generate_iso_surface(&mut self, ctx: &mut dyn CommandContext, kernels: &SdfKernels) {
        if !self.has_field {
            return;
        }
        let cubes = self.grid.cubes();
        if let Some(pool) = self.iso_surface.as_mut() {
            pool.generate(ctx, kernels, cubes);
        }
    }

    pub fn draw_iso_surface(&mut self, ctx: &mut dyn CommandContext, kernels: &SdfKernels, view_set: BindSetId) {
        if let Some(pool) = self.iso_surface.as_mut() {
            pool.draw(ctx, kernels, view_set);
        }
    }

    /// Marching-cubes vertices against the pool, and cells the grid holds
    /// against its budget. Refits that hit the budget show up in
    /// [`CollisionMesh::capped_frames`], not as an overflow.
    pub fn capacity_report(&self, device: &mut dyn RenderDevice) -> HairResult<Vec<CapacityReport>> {
        let mut reports = vec![CapacityReport {
            name: format!("{} sdf cells", self.data.name),
            used: self.grid.total_cells() as u64,
            capacity: self.grid.max_cells() as u64,
        }];
        if let Some(pool) = &self.iso_surface {
            reports.push(CapacityReport {
                name: format!("{} marching cubes vertices", self.data.name),
                used: pool.read_counter(device)? as u64,
                capacity: pool.capacity() as u64,
            });
        }
        Ok(reports)
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn data(&self) -> &CollisionMeshData {
        &self.data
    }

    pub fn grid(&self) -> &SdfGrid {
        &self.grid
    }

    pub fn has_field(&self) -> bool {
        self.has_field
    }

    /// Frames whose grid had to be coarsened to fit the cell budget.
    pub fn capped_frames(&self) -> u32 {
        self.capped_frames
    }

    pub fn cells(&self) -> ResourceId {
        self.cells.id
    }

    pub fn cells_state(&self) -> ResourceState {
        self.cells.state
    }

    pub fn iso_surface(&self) -> Option<&IsoSurfacePool> {
        self.iso_surface.as_ref()
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        if let Some(pool) = self.iso_surface {
            pool.destroy(device);
        }
        device.release(self.sample_set.into());
        device.release(self.build_set.into());
        for buffer in [self.constants, self.mesh_vertices, self.mesh_indices, self.cells.id] {
            device.release(buffer.into());
        }
        log::debug!("[CollisionMesh] Destroyed '{}'", self.data.name);
    }
}
