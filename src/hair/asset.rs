//! Hair asset validation and preprocessing.
//!
//! Loaders hand over decoded strand arrays as [`HairAssetData`]. [`HairAsset::new`]
//! validates them and derives everything the simulation and renderers need:
//! rest lengths, tangents, the rotating frames used by local shape
//! constraints, follow-hair root offsets and render indices.

use crate::constants::{MAX_NUM_BONES, MAX_VERTICES_PER_STRAND, MIN_VERTICES_PER_STRAND};
use crate::error::{HairError, HairResult};
use crate::hair::gpu_types::BoneSkinningData;
use glam::{Quat, Vec3, Vec4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

/// Strand data as decoded by an external loader.
///
/// Strands are stored guide first, each guide immediately followed by its
/// follow strands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HairAssetData {
    pub name: String,
    pub vertices_per_strand: u32,
    pub follow_hairs_per_guide: u32,
    pub positions: Vec<Vec3>,
    /// One entry per strand. Empty binds every strand to bone 0.
    pub bone_skinning: Vec<BoneSkinningData>,
    /// One root UV per strand. Empty spreads strands over `u`.
    pub strand_uvs: Vec<[f32; 2]>,
    /// One per strand. Empty means type 0 everywhere.
    pub strand_types: Vec<u32>,
    /// One per vertex. Empty means uniform thickness.
    pub thickness_coeffs: Vec<f32>,
    /// Seed of the per-strand shade jitter.
    pub seed: u64,
}

/// Follow strands generated around each guide.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FollowHairParams {
    pub count: u32,
    /// Largest root offset from the guide root.
    pub radius: f32,
    /// Spread towards the tip, matching `SimulationSettings::tip_separation`.
    pub tip_separation: f32,
    pub seed: u64,
}

impl Default for FollowHairParams {
    fn default() -> Self {
        Self {
            count: 0,
            radius: 0.01,
            tip_separation: 0.1,
            seed: 0,
        }
    }
}

/// A validated, preprocessed hair asset.
///
/// Consumed by `HairObject::new`; all arrays are laid out as uploaded.
#[derive(Debug, Clone)]
pub struct HairAsset {
    pub name: String,
    pub vertices_per_strand: u32,
    pub follow_hairs_per_guide: u32,
    pub num_guide_strands: u32,
    pub num_total_strands: u32,
    /// xyz rest position, w inverse mass (0 pins the vertex).
    pub positions: Vec<Vec4>,
    pub tangents: Vec<Vec4>,
    /// Distance from each vertex to the next one; 0 for strand tips.
    pub rest_lengths: Vec<f32>,
    /// Frame of every vertex, the root entry seeds the local shape walk.
    pub global_rotations: Vec<Quat>,
    /// Rest segment ending at each vertex, in the frame of its parent.
    pub ref_vectors: Vec<Vec4>,
    /// Per strand root offset from its guide root; zero for guides.
    pub follow_root_offsets: Vec<Vec4>,
    pub bone_skinning: Vec<BoneSkinningData>,
    /// Root u, root v, strand type, shade jitter.
    pub strand_tex_coords: Vec<Vec4>,
    pub strand_types: Vec<u32>,
    pub thickness_coeffs: Vec<f32>,
    pub triangle_indices: Vec<u32>,
}

/// Vertices at the root of every strand that never move on their own.
const PINNED_ROOT_VERTICES: u32 = 2;

impl HairAsset {
    pub fn new(data: HairAssetData) -> HairResult<Self> {
        let name = data.name.clone();
        let fail = |reason: String| HairError::invalid_asset(name.clone(), reason);

        let n = data.vertices_per_strand;
        if !n.is_power_of_two() || !(MIN_VERTICES_PER_STRAND..=MAX_VERTICES_PER_STRAND).contains(&n) {
            return Err(fail(format!(
                "vertices per strand must be a power of two in {}..={}, got {}",
                MIN_VERTICES_PER_STRAND, MAX_VERTICES_PER_STRAND, n
            )));
        }
        if data.positions.is_empty() || data.positions.len() % n as usize != 0 {
            return Err(fail(format!(
                "{} positions do not form whole strands of {} vertices",
                data.positions.len(),
                n
            )));
        }
        if let Some(bad) = data.positions.iter().position(|p| !p.is_finite()) {
            return Err(fail(format!("vertex {} is not finite", bad)));
        }

        let total_strands = (data.positions.len() / n as usize) as u32;
        let group = data.follow_hairs_per_guide + 1;
        if total_strands % group != 0 {
            return Err(fail(format!(
                "{} strands cannot be split into groups of one guide and {} follow strands",
                total_strands, data.follow_hairs_per_guide
            )));
        }

        let strands = total_strands as usize;
        let bone_skinning = if data.bone_skinning.is_empty() {
            vec![BoneSkinningData::default(); strands]
        } else {
            data.bone_skinning.clone()
        };
        check_len(&name, "bone skinning entries", bone_skinning.len(), strands)?;
        for (strand, skin) in bone_skinning.iter().enumerate() {
            if let Some(index) = skin.indices.iter().find(|i| **i as usize >= MAX_NUM_BONES) {
                return Err(fail(format!("strand {} references bone {} (limit {})", strand, index, MAX_NUM_BONES)));
            }
            if skin.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(fail(format!("strand {} has invalid bone weights", strand)));
            }
        }
        if !data.strand_uvs.is_empty() {
            check_len(&name, "strand UVs", data.strand_uvs.len(), strands)?;
        }
        if !data.strand_types.is_empty() {
            check_len(&name, "strand types", data.strand_types.len(), strands)?;
        }
        if !data.thickness_coeffs.is_empty() {
            check_len(&name, "thickness coefficients", data.thickness_coeffs.len(), data.positions.len())?;
        }

        let mut asset = Self {
            name: data.name.clone(),
            vertices_per_strand: n,
            follow_hairs_per_guide: data.follow_hairs_per_guide,
            num_guide_strands: total_strands / group,
            num_total_strands: total_strands,
            positions: Vec::with_capacity(data.positions.len()),
            tangents: Vec::with_capacity(data.positions.len()),
            rest_lengths: Vec::with_capacity(data.positions.len()),
            global_rotations: Vec::with_capacity(data.positions.len()),
            ref_vectors: Vec::with_capacity(data.positions.len()),
            follow_root_offsets: Vec::with_capacity(strands),
            bone_skinning,
            strand_tex_coords: Vec::with_capacity(strands),
            strand_types: if data.strand_types.is_empty() {
                vec![0; strands]
            } else {
                data.strand_types.clone()
            },
            thickness_coeffs: if data.thickness_coeffs.is_empty() {
                vec![1.0; data.positions.len()]
            } else {
                data.thickness_coeffs.clone()
            },
            triangle_indices: Vec::new(),
        };

        for (strand, vertices) in data.positions.chunks_exact(n as usize).enumerate() {
            asset.derive_strand(strand, vertices).map_err(fail)?;
        }

        let mut rng = StdRng::seed_from_u64(data.seed);
        for strand in 0..strands {
            let uv = data
                .strand_uvs
                .get(strand)
                .copied()
                .unwrap_or([(strand as f32 + 0.5) / strands as f32, 0.0]);
            asset.strand_tex_coords.push(Vec4::new(
                uv[0],
                uv[1],
                asset.strand_types[strand] as f32,
                rng.gen::<f32>(),
            ));

            let guide_root = strand - strand % group as usize;
            let offset = data.positions[strand * n as usize] - data.positions[guide_root * n as usize];
            asset.follow_root_offsets.push(offset.extend(0.0));
        }

        asset.triangle_indices = triangle_indices(total_strands, n);

        log::debug!(
            "[HairAsset] '{}': {} guides, {} strands, {} vertices per strand",
            asset.name,
            asset.num_guide_strands,
            asset.num_total_strands,
            n
        );
        Ok(asset)
    }

    /// Builds an asset from guide strands only, generating `follow.count`
    /// follow strands around each guide.
    pub fn from_guide_strands(
        name: &str,
        vertices_per_strand: u32,
        guide_positions: &[Vec3],
        follow: FollowHairParams,
    ) -> HairResult<Self> {
        let n = vertices_per_strand as usize;
        if n == 0 || guide_positions.len() % n != 0 {
            return Err(HairError::invalid_asset(
                name,
                format!("{} guide positions do not form whole strands", guide_positions.len()),
            ));
        }

        let mut rng = StdRng::seed_from_u64(follow.seed);
        let group = follow.count as usize + 1;
        let mut positions = Vec::with_capacity(guide_positions.len() * group);
        for guide in guide_positions.chunks_exact(n) {
            positions.extend_from_slice(guide);
            let root_tangent = guide.get(1).map(|p| *p - guide[0]).unwrap_or(Vec3::Y).normalize_or_zero();
            let (u, v) = if root_tangent == Vec3::ZERO {
                (Vec3::X, Vec3::Z)
            } else {
                root_tangent.any_orthonormal_pair()
            };
            for _ in 0..follow.count {
                let angle = rng.gen::<f32>() * TAU;
                let radius = follow.radius * rng.gen::<f32>().sqrt();
                let offset = (u * angle.cos() + v * angle.sin()) * radius;
                positions.extend(guide.iter().enumerate().map(|(k, p)| {
                    *p + offset * (follow.tip_separation * k as f32 / n as f32 + 1.0)
                }));
            }
        }

        Self::new(HairAssetData {
            name: name.to_string(),
            vertices_per_strand,
            follow_hairs_per_guide: follow.count,
            positions,
            seed: follow.seed,
            ..Default::default()
        })
    }

    fn derive_strand(&mut self, strand: usize, vertices: &[Vec3]) -> Result<(), String> {
        let n = vertices.len();
        for k in 0..n - 1 {
            if (vertices[k + 1] - vertices[k]).length_squared() <= f32::EPSILON * f32::EPSILON {
                return Err(format!("strand {} has a zero-length segment at vertex {}", strand, k));
            }
        }

        for (k, p) in vertices.iter().enumerate() {
            let inverse_mass = if (k as u32) < PINNED_ROOT_VERTICES { 0.0 } else { 1.0 };
            self.positions.push(p.extend(inverse_mass));

            let tangent = if k + 1 < n { vertices[k + 1] - *p } else { *p - vertices[k - 1] };
            self.tangents.push(tangent.normalize().extend(0.0));

            let rest = if k + 1 < n { (vertices[k + 1] - *p).length() } else { 0.0 };
            self.rest_lengths.push(rest);
        }

        // Same recurrence as the local shape kernel, so the rest pose is a
        // fixed point of the constraint.
        let mut frame = Quat::from_rotation_arc(Vec3::X, (vertices[1] - vertices[0]).normalize());
        self.global_rotations.push(frame);
        self.ref_vectors.push(Vec4::ZERO);
        for k in 1..n {
            let local = frame.inverse() * (vertices[k] - vertices[k - 1]);
            self.ref_vectors.push(local.extend(0.0));
            frame = (frame * Quat::from_rotation_arc(Vec3::X, local.normalize())).normalize();
            self.global_rotations.push(frame);
        }
        Ok(())
    }

    pub fn num_vertices(&self) -> u32 {
        self.num_total_strands * self.vertices_per_strand
    }

    pub fn num_guide_vertices(&self) -> u32 {
        self.num_guide_strands * self.vertices_per_strand
    }

    /// Indices drawn for one guide together with its follow strands.
    pub fn indices_per_strand_group(&self) -> u32 {
        (self.follow_hairs_per_guide + 1) * (self.vertices_per_strand - 1) * 6
    }

    /// Axis-aligned bounds of the rest pose.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        self.positions.iter().fold((Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)), |(lo, hi), p| {
            (lo.min(p.truncate()), hi.max(p.truncate()))
        })
    }
}

fn check_len(asset: &str, what: &str, actual: usize, expected: usize) -> HairResult<()> {
    if actual != expected {
        return Err(HairError::invalid_asset(
            asset,
            format!("expected {} {}, got {}", expected, what, actual),
        ));
    }
    Ok(())
}

/// Two triangles per segment; vertex id `2 * vertex + side` is expanded into
/// a camera-facing ribbon by the vertex shader.
fn triangle_indices(total_strands: u32, vertices_per_strand: u32) -> Vec<u32> {
    let mut indices = Vec::with_capacity((total_strands * (vertices_per_strand - 1) * 6) as usize);
    for strand in 0..total_strands {
        for j in 0..vertices_per_strand - 1 {
            let a = 2 * (strand * vertices_per_strand + j);
            let c = a + 2;
            indices.extend_from_slice(&[a, a + 1, c, c, a + 1, c + 1]);
        }
    }
    indices
}
