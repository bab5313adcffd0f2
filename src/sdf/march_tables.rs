//! Marching-cubes lookup tables, generated once at first use.
//!
//! A corner is "inside" when its value is below the iso level. For every
//! inside/outside pattern the crossings on each cube face are joined into
//! segments, the segments are chained into closed loops and each loop is fanned
//! into triangles. Faces with two diagonal inside corners keep those corners
//! apart, and the decision depends only on the face, so neighbouring cubes
//! always agree and the surface is closed. Triangles wind counter-clockwise
//! seen from outside: `cross(b - a, c - a)` points towards larger values.

use crate::constants::MC_TRI_TABLE_STRIDE;
use glam::Vec3;
use lazy_static::lazy_static;

/// Corner `k` of a unit cube. Corners 0-3 go round the `z = 0` face, 4-7
/// round the `z = 1` face.
pub fn corner_offset(k: usize) -> [u32; 3] {
    let k = k as u32;
    [(k & 1) ^ ((k >> 1) & 1), (k >> 1) & 1, (k >> 2) & 1]
}

/// The two corners joined by edge `e`.
pub fn edge_corners(e: usize) -> (usize, usize) {
    match e {
        0..=3 => (e, (e + 1) % 4),
        4..=7 => (e, 4 + (e - 3) % 4),
        _ => (e - 8, e - 4),
    }
}

fn corner_position(k: usize) -> Vec3 {
    let [x, y, z] = corner_offset(k);
    Vec3::new(x as f32, y as f32, z as f32)
}

fn edge_between(a: usize, b: usize) -> usize {
    (0..12)
        .find(|&e| {
            let (c0, c1) = edge_corners(e);
            (c0 == a && c1 == b) || (c0 == b && c1 == a)
        })
        .unwrap_or(0)
}

fn edge_midpoint(e: usize) -> Vec3 {
    let (a, b) = edge_corners(e);
    (corner_position(a) + corner_position(b)) * 0.5
}

/// Cube faces as corner cycles with their outward normals.
const FACES: [([usize; 4], Vec3); 6] = [
    ([0, 1, 2, 3], Vec3::NEG_Z),
    ([4, 5, 6, 7], Vec3::Z),
    ([0, 1, 5, 4], Vec3::NEG_Y),
    ([3, 2, 6, 7], Vec3::Y),
    ([0, 3, 7, 4], Vec3::NEG_X),
    ([1, 2, 6, 5], Vec3::X),
];

/// Directed face segments `(from edge, to edge)` for one corner pattern.
fn face_segments(case: usize) -> Vec<(usize, usize)> {
    let inside = |k: usize| case & (1 << k) != 0;
    let mut segments = Vec::new();

    for (corners, normal) in FACES {
        let crossing: Vec<usize> = (0..4)
            .filter(|&i| inside(corners[i]) != inside(corners[(i + 1) % 4]))
            .collect();

        // Each pair is (edge into the cut-off corner, edge out of it) or two
        // opposite edges.
        let mut pairs: Vec<(usize, usize, Vec3)> = Vec::new();
        match crossing.len() {
            2 => {
                let (i, j) = (crossing[0], crossing[1]);
                let e0 = edge_between(corners[i], corners[(i + 1) % 4]);
                let e1 = edge_between(corners[j], corners[(j + 1) % 4]);
                let mid = (edge_midpoint(e0) + edge_midpoint(e1)) * 0.5;
                let outward = if (j + 4 - i) % 4 == 2 {
                    let centroid = |want: bool| {
                        let picked: Vec<Vec3> = corners
                            .iter()
                            .filter(|&&k| inside(k) == want)
                            .map(|&k| corner_position(k))
                            .collect();
                        picked.iter().copied().sum::<Vec3>() / picked.len() as f32
                    };
                    centroid(false) - centroid(true)
                } else {
                    // Adjacent edges share the corner they cut off.
                    let shared = if (i + 1) % 4 == j { corners[j] } else { corners[i] };
                    let away = mid - corner_position(shared);
                    if inside(shared) {
                        away
                    } else {
                        -away
                    }
                };
                pairs.push((e0, e1, outward));
            }
            4 => {
                for i in 0..4 {
                    let k = corners[i];
                    if !inside(k) {
                        continue;
                    }
                    let prev = corners[(i + 3) % 4];
                    let next = corners[(i + 1) % 4];
                    let e0 = edge_between(prev, k);
                    let e1 = edge_between(k, next);
                    let mid = (edge_midpoint(e0) + edge_midpoint(e1)) * 0.5;
                    pairs.push((e0, e1, mid - corner_position(k)));
                }
            }
            _ => {}
        }

        for (e0, e1, outward) in pairs {
            let direction = outward.cross(normal);
            if (edge_midpoint(e1) - edge_midpoint(e0)).dot(direction) >= 0.0 {
                segments.push((e0, e1));
            } else {
                segments.push((e1, e0));
            }
        }
    }
    segments
}

/// Closed edge loops of one corner pattern.
fn loops(case: usize) -> Vec<Vec<usize>> {
    let segments = face_segments(case);
    let mut next = [usize::MAX; 12];
    for (from, to) in &segments {
        next[*from] = *to;
    }

    let mut visited = [false; 12];
    let mut result = Vec::new();
    for (start, _) in &segments {
        if visited[*start] {
            continue;
        }
        let mut edge_loop = Vec::new();
        let mut e = *start;
        while e != usize::MAX && !visited[e] {
            visited[e] = true;
            edge_loop.push(e);
            e = next[e];
        }
        result.push(edge_loop);
    }
    result
}

#[derive(Debug)]
pub struct MarchTables {
    /// Bit `e` set when edge `e` is crossed.
    pub edge_table: Vec<u32>,
    /// `MC_TRI_TABLE_STRIDE` edge indices per case, terminated by -1.
    pub tri_table: Vec<i32>,
}

impl MarchTables {
    fn generate() -> Self {
        let stride = MC_TRI_TABLE_STRIDE as usize;
        let mut edge_table = vec![0u32; 256];
        let mut tri_table = vec![-1i32; 256 * stride];

        for case in 0..256 {
            for e in 0..12 {
                let (a, b) = edge_corners(e);
                if (case >> a) & 1 != (case >> b) & 1 {
                    edge_table[case] |= 1 << e;
                }
            }
            let row = &mut tri_table[case * stride..(case + 1) * stride];
            let mut cursor = 0;
            for edge_loop in loops(case) {
                for i in 1..edge_loop.len().saturating_sub(1) {
                    for e in [edge_loop[0], edge_loop[i], edge_loop[i + 1]] {
                        row[cursor] = e as i32;
                        cursor += 1;
                    }
                }
            }
        }
        log::debug!("[MarchTables] Generated {} cases", edge_table.len());
        Self { edge_table, tri_table }
    }

    /// Triangles of one case as edge index triples.
    pub fn triangles(&self, case: usize) -> impl Iterator<Item = [usize; 3]> + '_ {
        let stride = MC_TRI_TABLE_STRIDE as usize;
        self.tri_table[case * stride..(case + 1) * stride]
            .chunks_exact(3)
            .take_while(|t| t[0] >= 0)
            .map(|t| [t[0] as usize, t[1] as usize, t[2] as usize])
    }
}

lazy_static! {
    pub static ref MARCH_TABLES: MarchTables = MarchTables::generate();
}
