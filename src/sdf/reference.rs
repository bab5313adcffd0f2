//! CPU reference of the SDF kernels.
//!
//! Builds the field with the same three passes as `sdf_build.wgsl` (reset,
//! narrow-band splat with an atomic minimum, winding-number fill) and samples
//! it the way the collision kernel does.

use crate::constants::{INITIAL_DISTANCE, TRIANGLE_BAND_CELLS};
use crate::sdf::grid::SdfGrid;
use glam::{UVec3, Vec3};
use rayon::prelude::*;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic in `|d|`; the sign rides in the lowest mantissa bit.
pub fn encode_distance(d: f32) -> u32 {
    let bits = d.abs().to_bits() & 0xFFFF_FFFE;
    if d < 0.0 {
        bits | 1
    } else {
        bits
    }
}

pub fn decode_distance(key: u32) -> f32 {
    let magnitude = f32::from_bits(key & 0xFFFF_FFFE);
    if key & 1 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

pub fn closest_point_on_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }
    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }
    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        return a + ab * (d1 / (d1 - d3));
    }
    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }
    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        return a + ac * (d2 / (d2 - d6));
    }
    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        return b + (c - b) * ((d4 - d3) / ((d4 - d3) + (d5 - d6)));
    }
    let denom = 1.0 / (va + vb + vc);
    a + ab * (vb * denom) + ac * (vc * denom)
}

/// Distance signed by the counter-clockwise normal of the triangle.
pub fn signed_distance_to_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let q = closest_point_on_triangle(p, a, b, c);
    let d = (p - q).length();
    if (p - q).dot((b - a).cross(c - a)) < 0.0 {
        -d
    } else {
        d
    }
}

fn solid_angle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let (ra, rb, rc) = (a - p, b - p, c - p);
    let (la, lb, lc) = (ra.length(), rb.length(), rc.length());
    let numerator = ra.dot(rb.cross(rc));
    let denominator = la * lb * lc + ra.dot(rb) * lc + ra.dot(rc) * lb + rb.dot(rc) * la;
    2.0 * numerator.atan2(denominator)
}

/// A finalized distance field.
#[derive(Debug, Clone)]
pub struct SdfVolume {
    pub grid: SdfGrid,
    pub values: Vec<f32>,
}

impl SdfVolume {
    /// Builds the field of a closed, counter-clockwise triangle mesh.
    pub fn build(grid: &SdfGrid, vertices: &[Vec3], indices: &[u32], margin: f32) -> Self {
        let cells = grid.total_cells() as usize;
        let triangle = |t: usize| {
            let corner = |k: usize| vertices[indices[t * 3 + k] as usize];
            (corner(0), corner(1), corner(2))
        };
        let triangles = indices.len() / 3;

        let keys: Vec<AtomicU32> = (0..cells)
            .map(|_| AtomicU32::new(encode_distance(INITIAL_DISTANCE)))
            .collect();

        let band = TRIANGLE_BAND_CELLS as f32 * grid.cell_size + margin;
        let upper = (grid.counts - UVec3::ONE).as_vec3();
        (0..triangles).into_par_iter().for_each(|t| {
            let (a, b, c) = triangle(t);
            let lo = ((a.min(b).min(c) - Vec3::splat(band) - grid.origin) / grid.cell_size)
                .floor()
                .clamp(Vec3::ZERO, upper)
                .as_uvec3();
            let hi = ((a.max(b).max(c) + Vec3::splat(band) - grid.origin) / grid.cell_size)
                .ceil()
                .clamp(Vec3::ZERO, upper)
                .as_uvec3();
            for z in lo.z..=hi.z {
                for y in lo.y..=hi.y {
                    for x in lo.x..=hi.x {
                        let d = signed_distance_to_triangle(grid.cell_position(x, y, z), a, b, c);
                        keys[grid.cell_index(x, y, z)].fetch_min(encode_distance(d), Ordering::Relaxed);
                    }
                }
            }
        });

        let values = keys
            .par_iter()
            .enumerate()
            .map(|(index, key)| {
                let d = decode_distance(key.load(Ordering::Relaxed));
                if d.abs() < 0.5 * INITIAL_DISTANCE {
                    return d;
                }
                let cell = grid.cell_coords(index);
                let p = grid.cell_position(cell.x, cell.y, cell.z);
                let mut nearest = INITIAL_DISTANCE;
                let mut winding = 0.0;
                for t in 0..triangles {
                    let (a, b, c) = triangle(t);
                    nearest = nearest.min(signed_distance_to_triangle(p, a, b, c).abs());
                    winding += solid_angle(p, a, b, c);
                }
                if winding / (4.0 * PI) > 0.5 {
                    -nearest
                } else {
                    nearest
                }
            })
            .collect();

        Self { grid: *grid, values }
    }

    fn cell(&self, x: u32, y: u32, z: u32) -> f32 {
        self.values[self.grid.cell_index(x, y, z)]
    }

    /// Trilinear sample, clamped to the grid.
    pub fn sample(&self, p: Vec3) -> f32 {
        let g = (p - self.grid.origin) / self.grid.cell_size;
        let upper = self.grid.counts.as_vec3() - Vec3::splat(1.001);
        let c = g.clamp(Vec3::ZERO, upper);
        let base = c.floor().as_uvec3();
        let f = c - c.floor();

        let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
        let (x, y, z) = (base.x, base.y, base.z);
        let d00 = lerp(self.cell(x, y, z), self.cell(x + 1, y, z), f.x);
        let d10 = lerp(self.cell(x, y + 1, z), self.cell(x + 1, y + 1, z), f.x);
        let d01 = lerp(self.cell(x, y, z + 1), self.cell(x + 1, y, z + 1), f.x);
        let d11 = lerp(self.cell(x, y + 1, z + 1), self.cell(x + 1, y + 1, z + 1), f.x);
        lerp(lerp(d00, d10, f.y), lerp(d01, d11, f.y), f.z)
    }

    pub fn gradient(&self, p: Vec3) -> Vec3 {
        let h = self.grid.cell_size;
        Vec3::new(
            self.sample(p + Vec3::X * h) - self.sample(p - Vec3::X * h),
            self.sample(p + Vec3::Y * h) - self.sample(p - Vec3::Y * h),
            self.sample(p + Vec3::Z * h) - self.sample(p - Vec3::Z * h),
        ) / (2.0 * h)
    }

    pub fn contains(&self, p: Vec3) -> bool {
        let g = (p - self.grid.origin) / self.grid.cell_size;
        let upper = (self.grid.counts - UVec3::ONE).as_vec3();
        g.cmpge(Vec3::ZERO).all() && g.cmple(upper).all()
    }

    /// Where the collision kernel moves a vertex at `p`.
    pub fn collide(&self, p: Vec3, margin: f32) -> Vec3 {
        if !self.contains(p) {
            return p;
        }
        let d = self.sample(p);
        if d >= margin {
            return p;
        }
        let normal = self.gradient(p).normalize_or_zero();
        if normal == Vec3::ZERO {
            return p;
        }
        p + (margin - d) * normal
    }
}
