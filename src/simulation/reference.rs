//! CPU mirror of the simulation kernels.
//!
//! Each method follows the WGSL entry point of the same name step for step,
//! so tests can check convergence and steady-state properties without a GPU.

use crate::config::SimulationSettings;
use crate::constants::MAX_LOCAL_STIFFNESS;
use crate::hair::gpu_types::SimulationConstants;
use crate::hair::HairAsset;
use crate::simulation::local_iteration_split;
use crate::simulation::wind::{strand_wind, wind_pyramid};
use glam::{Mat3, Mat4, Quat, Vec3, Vec4};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrandLevel {
    pub skinning: Quat,
    pub vsp_rotation: Quat,
    pub vsp_translation: Vec3,
    pub vsp_coeff: f32,
}

impl Default for StrandLevel {
    fn default() -> Self {
        Self {
            skinning: Quat::IDENTITY,
            vsp_rotation: Quat::IDENTITY,
            vsp_translation: Vec3::ZERO,
            vsp_coeff: 0.0,
        }
    }
}

/// Dynamic state of one hair object, simulated on the CPU.
#[derive(Debug, Clone)]
pub struct ReferenceSolver<'a> {
    asset: &'a HairAsset,
    pub positions: Vec<Vec4>,
    pub positions_prev: Vec<Vec4>,
    pub positions_prev_prev: Vec<Vec4>,
    pub tangents: Vec<Vec4>,
    pub strand_level: Vec<StrandLevel>,
}

fn is_movable(p: Vec4) -> bool {
    p.w > 0.0
}

fn safe_normalize(v: Vec3) -> Vec3 {
    if v.length() < 1e-6 {
        Vec3::ZERO
    } else {
        v.normalize()
    }
}

/// Rotation of an affine matrix whose columns may be scaled.
pub fn rotation_of(m: &Mat4) -> Quat {
    let cols = Mat3::from_mat4(*m);
    let normalized = Mat3::from_cols(
        safe_normalize(cols.x_axis),
        safe_normalize(cols.y_axis),
        safe_normalize(cols.z_axis),
    );
    Quat::from_mat3(&normalized).normalize()
}

impl<'a> ReferenceSolver<'a> {
    pub fn new(asset: &'a HairAsset) -> Self {
        Self {
            asset,
            positions: asset.positions.clone(),
            positions_prev: asset.positions.clone(),
            positions_prev_prev: asset.positions.clone(),
            tangents: asset.tangents.clone(),
            strand_level: vec![StrandLevel::default(); asset.num_guide_strands as usize],
        }
    }

    fn n(&self) -> usize {
        self.asset.vertices_per_strand as usize
    }

    fn group(&self) -> usize {
        self.asset.follow_hairs_per_guide as usize + 1
    }

    fn bone_matrix(&self, constants: &SimulationConstants, strand: usize) -> Mat4 {
        self.asset.bone_skinning[strand].blend(&constants.bones)
    }

    fn skinned_initial(&self, constants: &SimulationConstants, strand: usize, vertex: usize) -> Vec3 {
        self.bone_matrix(constants, strand)
            .transform_point3(self.asset.positions[vertex].truncate())
    }

    /// Guide vertex index -> (guide strand, global strand, local, global vertex).
    fn guide_vertex(&self, index: usize) -> (usize, usize, usize, usize) {
        let n = self.n();
        let guide = index / n;
        let local = index % n;
        let strand = guide * self.group();
        (guide, strand, local, strand * n + local)
    }

    /// Runs a full tick the way `SimulationSolver` schedules it.
    pub fn step(&mut self, constants: &SimulationConstants, cpu_local_iterations: u32) {
        self.integrate_and_global_shape(constants);
        self.calculate_strand_level_data(constants);
        self.velocity_shock_propagation();
        for _ in 0..cpu_local_iterations {
            self.local_shape_constraints(constants);
        }
        self.length_constraints_and_wind(constants);
        self.update_follow_hair_vertices(constants);
    }

    pub fn skin_hair_vertices(&mut self, constants: &SimulationConstants) {
        let n = self.n();
        for index in 0..self.positions.len() {
            let strand = index / n;
            let local = index % n;
            let p = self
                .skinned_initial(constants, strand, index)
                .extend(self.asset.positions[index].w);
            self.positions[index] = p;
            self.positions_prev[index] = p;
            self.positions_prev_prev[index] = p;
            let tangent = if local + 1 < n {
                self.skinned_initial(constants, strand, index + 1) - p.truncate()
            } else {
                p.truncate() - self.skinned_initial(constants, strand, index - 1)
            };
            self.tangents[index] = safe_normalize(tangent).extend(0.0);
        }
    }

    pub fn integrate_and_global_shape(&mut self, constants: &SimulationConstants) {
        let [damping, _, stiffness, range] = constants.shape;
        let [gravity, dt, clamp, _] = constants.gravity_time;
        let n = self.n();
        for index in 0..self.asset.num_guide_vertices() as usize {
            let (_, strand, local, vertex) = self.guide_vertex(index);
            let initial = self.skinned_initial(constants, strand, vertex);
            let current = self.positions[vertex];
            let previous = self.positions_prev[vertex];

            if constants.reset_positions() {
                let p = initial.extend(current.w);
                self.positions[vertex] = p;
                self.positions_prev[vertex] = p;
                self.positions_prev_prev[vertex] = p;
                continue;
            }

            let mut new_pos = initial.extend(current.w);
            if is_movable(current) {
                let force = Vec3::new(0.0, -gravity, 0.0);
                let mut p = current.truncate()
                    + (1.0 - damping) * (current.truncate() - previous.truncate())
                    + force * dt * dt;
                if stiffness > 0.0 && (local as f32) < range * n as f32 {
                    p += stiffness * (initial - p);
                }
                let delta = p - current.truncate();
                if delta.length() > clamp {
                    p = current.truncate() + delta * (clamp / delta.length());
                }
                new_pos = p.extend(current.w);
            }
            self.positions_prev_prev[vertex] = previous;
            self.positions_prev[vertex] = current;
            self.positions[vertex] = new_pos;
        }
    }

    pub fn calculate_strand_level_data(&mut self, constants: &SimulationConstants) {
        let n = self.n();
        let [vsp_coeff, vsp_threshold, _, _] = constants.vsp;
        for guide in 0..self.asset.num_guide_strands as usize {
            let strand = guide * self.group();
            let root = strand * n;
            let new0 = self.positions[root].truncate();
            let new1 = self.positions[root + 1].truncate();
            let old0 = self.positions_prev[root].truncate();
            let old1 = self.positions_prev[root + 1].truncate();
            let old_old1 = self.positions_prev_prev[root + 1].truncate();

            let u = safe_normalize(old1 - old0);
            let w = safe_normalize(new1 - new0);
            let rotation = if u.length() > 0.5 && w.length() > 0.5 {
                Quat::from_rotation_arc(u, w)
            } else {
                Quat::IDENTITY
            };

            let accel = (new1 - 2.0 * old1 + old_old1).length();
            let coeff = if accel > vsp_threshold { 1.0 } else { vsp_coeff };
            let vsp_rotation = Quat::IDENTITY.lerp(rotation, coeff);
            self.strand_level[guide] = StrandLevel {
                skinning: rotation_of(&self.bone_matrix(constants, strand)),
                vsp_rotation,
                vsp_translation: coeff * (new0 - vsp_rotation * old0),
                vsp_coeff: coeff,
            };
        }
    }

    pub fn velocity_shock_propagation(&mut self) {
        for index in 0..self.asset.num_guide_vertices() as usize {
            let (guide, _, local, vertex) = self.guide_vertex(index);
            let current = self.positions[vertex];
            if local < 2 || !is_movable(current) {
                continue;
            }
            let data = self.strand_level[guide];
            let previous = self.positions_prev[vertex];
            self.positions[vertex] = (data.vsp_rotation * current.truncate() + data.vsp_translation).extend(current.w);
            self.positions_prev[vertex] =
                (data.vsp_rotation * previous.truncate() + data.vsp_translation).extend(previous.w);
        }
    }

    pub fn local_shape_constraints(&mut self, constants: &SimulationConstants) {
        let n = self.n();
        let stiffness = 0.5 * constants.shape[1].min(MAX_LOCAL_STIFFNESS);
        for guide in 0..self.asset.num_guide_strands as usize {
            let root = guide * self.group() * n;
            let skin = self.strand_level[guide].skinning;
            for _ in 0..constants.local_iterations() {
                let mut frame = skin * self.asset.global_rotations[root];
                for k in 1..n {
                    let mut p = self.positions[root + k - 1];
                    let mut q = self.positions[root + k];
                    let goal = p.truncate() + frame * self.asset.ref_vectors[root + k].truncate();
                    let delta = stiffness * (goal - q.truncate());
                    if is_movable(p) {
                        p = (p.truncate() - delta).extend(p.w);
                    }
                    if is_movable(q) {
                        q = (q.truncate() + delta).extend(q.w);
                    }
                    self.positions[root + k - 1] = p;
                    self.positions[root + k] = q;

                    let dir = safe_normalize(q.truncate() - p.truncate());
                    if dir.length() > 0.5 {
                        let local_dir = frame.inverse() * dir;
                        frame = (frame * Quat::from_rotation_arc(Vec3::X, local_dir)).normalize();
                    }
                }
            }
        }
    }

    pub fn length_constraints_and_wind(&mut self, constants: &SimulationConstants) {
        let n = self.n();
        let dt = constants.time_step();
        let corners = constants.wind.map(Vec4::from_array);
        for guide in 0..self.asset.num_guide_strands as usize {
            let strand = guide * self.group();
            let root = strand * n;
            let original: Vec<Vec4> = self.positions[root..root + n].to_vec();
            let mut shared = original.clone();

            let wind = strand_wind(&corners, strand as u32);
            for k in 1..n {
                let pos = original[k];
                if is_movable(pos) {
                    let segment = pos.truncate() - original[k - 1].truncate();
                    let force = segment.cross(wind).cross(segment);
                    shared[k] = (pos.truncate() + force * dt * dt).extend(pos.w);
                }
            }

            for _ in 0..constants.length_iterations() {
                for parity in [0, 1] {
                    for k in (parity..n - 1).step_by(2) {
                        let rest = self.asset.rest_lengths[root + k];
                        apply_length_constraint(&mut shared, k, rest);
                    }
                }
            }

            for k in 0..n {
                let tangent = if k + 1 < n {
                    shared[k + 1].truncate() - shared[k].truncate()
                } else {
                    shared[k].truncate() - shared[k - 1].truncate()
                };
                self.positions[root + k] = shared[k];
                self.tangents[root + k] = safe_normalize(tangent).extend(0.0);
            }
        }
    }

    pub fn update_follow_hair_vertices(&mut self, constants: &SimulationConstants) {
        let n = self.n();
        let tip_separation = constants.gravity_time[3];
        for index in 0..self.asset.num_guide_vertices() as usize {
            let (guide, strand, local, vertex) = self.guide_vertex(index);
            let guide_pos = self.positions[vertex];
            let guide_tangent = self.tangents[vertex];
            let skin = self.strand_level[guide].skinning;
            let factor = tip_separation * local as f32 / n as f32 + 1.0;
            for i in 1..self.group() {
                let follow = strand + i;
                let target = follow * n + local;
                let offset = skin * self.asset.follow_root_offsets[follow].truncate();
                let p = (guide_pos.truncate() + factor * offset).extend(self.positions[target].w);
                self.positions[target] = p;
                self.positions_prev[target] = p;
                self.tangents[target] = guide_tangent;
            }
        }
    }

    /// Largest distance between the current positions and the skinned rest pose.
    pub fn max_deviation_from_rest(&self, constants: &SimulationConstants) -> f32 {
        let n = self.n();
        (0..self.positions.len())
            .map(|i| (self.positions[i].truncate() - self.skinned_initial(constants, i / n, i)).length())
            .fold(0.0, f32::max)
    }
}

/// Constants of one tick, built the way `HairObject::prepare_tick` builds
/// them. Returns the constants and the CPU-side local shape iterations.
pub fn tick_constants(
    asset: &HairAsset,
    settings: &SimulationSettings,
    time_step: f32,
    bones: &[Mat4],
    frame: u32,
    reset: bool,
) -> (SimulationConstants, u32) {
    let (gpu_local, cpu_local) =
        local_iteration_split(asset.vertices_per_strand, settings.local_constraints_iterations);
    let mut constants = SimulationConstants::default();
    constants.set_settings(settings, time_step);
    constants.set_wind(wind_pyramid(settings, frame));
    constants.set_bones(bones);
    constants.counts = [
        asset.vertices_per_strand,
        asset.follow_hairs_per_guide,
        asset.num_guide_strands,
        asset.num_total_strands,
    ];
    constants.iterations = [gpu_local, settings.length_constraints_iterations, reset as u32, frame];
    (constants, cpu_local)
}

fn apply_length_constraint(strand: &mut [Vec4], a: usize, rest: f32) {
    let pa = strand[a];
    let pb = strand[a + 1];
    let delta = pb.truncate() - pa.truncate();
    let len = delta.length();
    let w = pa.w + pb.w;
    if len < 1e-6 || w <= 0.0 {
        return;
    }
    let correction = delta * ((len - rest) / (len * w));
    strand[a] = (pa.truncate() + pa.w * correction).extend(pa.w);
    strand[a + 1] = (pb.truncate() - pb.w * correction).extend(pb.w);
}
