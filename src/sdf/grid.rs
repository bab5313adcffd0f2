//! Grid placement policy for the signed distance field.
//!
//! The cell size and the padding are fixed when the collision mesh is
//! created. Every frame the grid is refit around the skinned bounds; if the
//! padded box would need more cells than the budget allows the cells grow
//! instead of the box shrinking.

use crate::config::CollisionSettings;
use crate::constants::{PADDING_FACTOR, TRIANGLE_BAND_CELLS};
use crate::error::{HairError, HairResult};
use crate::hair::gpu_types::SdfConstants;
use glam::{UVec3, Vec3};
use rayon::prelude::*;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: &[Vec3]) -> Self {
        points
            .par_iter()
            .fold(|| Self::EMPTY, |bounds, p| bounds.including(*p))
            .reduce(|| Self::EMPTY, Self::union)
    }

    pub fn including(self, p: Vec3) -> Self {
        Self {
            min: self.min.min(p),
            max: self.max.max(p),
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn size(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            self.max - self.min
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }
}

/// Uniform grid covering the padded collision mesh bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdfGrid {
    pub origin: Vec3,
    pub cell_size: f32,
    pub counts: UVec3,
    /// Cell size chosen at construction.
    base_cell_size: f32,
    /// World-space padding added on every side of the bounds.
    padding: f32,
    max_cells: u32,
    /// Cells the last fit would have used at the base cell size.
    requested_cells: u64,
}

fn cells_for(extent: Vec3, cell_size: f32) -> UVec3 {
    let cells = (extent / cell_size).ceil();
    UVec3::new(cells.x as u32 + 1, cells.y as u32 + 1, cells.z as u32 + 1).max(UVec3::splat(2))
}

fn total(counts: UVec3) -> u64 {
    counts.x as u64 * counts.y as u64 * counts.z as u64
}

impl SdfGrid {
    /// Derives the fixed cell size and budget from the bind-pose bounds.
    pub fn new(initial: &Aabb, settings: &CollisionSettings) -> HairResult<Self> {
        let size = initial.size();
        if initial.is_empty() || !size.is_finite() || size.max_element() <= 0.0 {
            return Err(HairError::InvalidMesh {
                mesh: String::new(),
                reason: format!("degenerate bounds {:?}", initial),
            });
        }
        let num_cells_x = settings.num_cells_x.max(1);
        // A flat mesh along X still needs a usable cell size.
        let width = if size.x > 0.0 { size.x } else { size.max_element() };
        let cell_size = width / num_cells_x as f32;
        let padding = PADDING_FACTOR * num_cells_x as f32 * cell_size;

        let estimate = total(cells_for(size + Vec3::splat(2.0 * padding), cell_size));
        let budget = (estimate as f64 * settings.allocation_multiplier.max(1.0) as f64).ceil();
        let max_cells = budget.min(u32::MAX as f64) as u32;

        let mut grid = Self {
            origin: Vec3::ZERO,
            cell_size,
            counts: UVec3::splat(2),
            base_cell_size: cell_size,
            padding,
            max_cells,
            requested_cells: 0,
        };
        grid.fit(initial);
        log::debug!(
            "[SdfGrid] cell {:.4}, padding {:.4}, budget {} cells (estimate {})",
            cell_size,
            padding,
            max_cells,
            estimate
        );
        Ok(grid)
    }

    /// Moves the grid over `bounds`. Returns `true` when the cell budget
    /// forced a coarser resolution than the base cell size.
    pub fn fit(&mut self, bounds: &Aabb) -> bool {
        let extent = bounds.size() + Vec3::splat(2.0 * self.padding);
        self.origin = bounds.min - Vec3::splat(self.padding);

        let mut cell_size = self.base_cell_size;
        let mut counts = cells_for(extent, cell_size);
        self.requested_cells = total(counts);
        let capped = self.requested_cells > self.max_cells as u64;
        if capped {
            let ratio = (self.requested_cells as f64 / self.max_cells as f64).cbrt() as f32;
            cell_size *= ratio;
            counts = cells_for(extent, cell_size);
            while total(counts) > self.max_cells as u64 {
                cell_size *= 1.01;
                counts = cells_for(extent, cell_size);
            }
            log::debug!(
                "[SdfGrid] {} cells requested, budget {}: cell size raised to {:.4}",
                self.requested_cells,
                self.max_cells,
                cell_size
            );
        }
        self.cell_size = cell_size;
        self.counts = counts;
        capped
    }

    pub fn base_cell_size(&self) -> f32 {
        self.base_cell_size
    }

    pub fn padding(&self) -> f32 {
        self.padding
    }

    pub fn max_cells(&self) -> u32 {
        self.max_cells
    }

    pub fn requested_cells(&self) -> u64 {
        self.requested_cells
    }

    pub fn total_cells(&self) -> u32 {
        total(self.counts) as u32
    }

    pub fn cubes(&self) -> u32 {
        let c = self.counts - UVec3::ONE;
        c.x * c.y * c.z
    }

    /// Far corner of the last grid point.
    pub fn max_corner(&self) -> Vec3 {
        self.origin + (self.counts - UVec3::ONE).as_vec3() * self.cell_size
    }

    pub fn cell_index(&self, x: u32, y: u32, z: u32) -> usize {
        (x + self.counts.x * (y + self.counts.y * z)) as usize
    }

    pub fn cell_position(&self, x: u32, y: u32, z: u32) -> Vec3 {
        self.origin + Vec3::new(x as f32, y as f32, z as f32) * self.cell_size
    }

    pub fn cell_coords(&self, index: usize) -> UVec3 {
        let i = index as u32;
        let (nx, ny) = (self.counts.x, self.counts.y);
        UVec3::new(i % nx, (i / nx) % ny, i / (nx * ny))
    }

    pub fn constants(
        &self,
        settings: &CollisionSettings,
        vertices: u32,
        triangles: u32,
        iso_vertex_capacity: u32,
    ) -> SdfConstants {
        SdfConstants {
            origin: self.origin.extend(self.cell_size).to_array(),
            counts: [self.counts.x, self.counts.y, self.counts.z, self.total_cells()],
            mesh: [vertices, triangles, TRIANGLE_BAND_CELLS, 0],
            params: [settings.collision_margin, settings.iso_level, 0.0, 0.0],
            limits: [iso_vertex_capacity, self.max_cells, 0, 0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> Aabb {
        Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0))
    }

    #[test]
    fn cell_size_comes_from_the_x_extent() {
        let settings = CollisionSettings {
            num_cells_x: 10,
            ..Default::default()
        };
        let grid = SdfGrid::new(&unit_box(), &settings).unwrap();
        assert!((grid.cell_size - 0.2).abs() < 1e-6);
        assert!((grid.padding() - 1.6).abs() < 1e-5);
        assert!(grid.origin.max_element() <= -2.6 + 1e-5);
        assert!(grid.max_corner().min_element() >= 2.6 - 1e-5);
    }

    #[test]
    fn deformed_bounds_keep_the_cell_size_within_budget() {
        let settings = CollisionSettings {
            num_cells_x: 10,
            ..Default::default()
        };
        let mut grid = SdfGrid::new(&unit_box(), &settings).unwrap();
        let moved = Aabb::new(Vec3::new(4.0, -1.0, -1.0), Vec3::new(6.0, 1.2, 1.0));
        assert!(!grid.fit(&moved));
        assert_eq!(grid.cell_size, grid.base_cell_size());
        assert!(grid.origin.x <= 4.0 - grid.padding() + 1e-5);
    }

    #[test]
    fn oversized_bounds_cap_resolution_not_extent() {
        let settings = CollisionSettings {
            num_cells_x: 10,
            allocation_multiplier: 1.5,
            ..Default::default()
        };
        let mut grid = SdfGrid::new(&unit_box(), &settings).unwrap();
        let stretched = Aabb::new(Vec3::splat(-3.0), Vec3::splat(3.0));
        assert!(grid.fit(&stretched));

        assert!(grid.total_cells() <= grid.max_cells());
        assert!(grid.requested_cells() > grid.max_cells() as u64);
        assert!(grid.cell_size > grid.base_cell_size());
        assert!(grid.origin.max_element() <= -3.0 - grid.padding() + 1e-4);
        assert!(grid.max_corner().min_element() >= 3.0 + grid.padding() - 1e-4);
    }

    #[test]
    fn flat_meshes_still_get_a_grid() {
        let flat = Aabb::new(Vec3::new(0.0, -1.0, -1.0), Vec3::new(0.0, 1.0, 1.0));
        let grid = SdfGrid::new(&flat, &CollisionSettings::default()).unwrap();
        assert!(grid.cell_size > 0.0);
        assert!(SdfGrid::new(&Aabb::EMPTY, &CollisionSettings::default()).is_err());
    }

    #[test]
    fn bounds_reduce_in_parallel() {
        let points: Vec<Vec3> = (0..1000).map(|i| Vec3::new(i as f32, -(i as f32), 0.5)).collect();
        let bounds = Aabb::from_points(&points);
        assert_eq!(bounds.min, Vec3::new(0.0, -999.0, 0.5));
        assert_eq!(bounds.max, Vec3::new(999.0, 0.0, 0.5));
    }
}
