//! GPU-visible data blocks.
//!
//! Every struct here mirrors a WGSL struct field for field. Uniform blocks are
//! built from 16-byte rows so the std140 layout needs no hidden padding.

use crate::config::{RenderingSettings, SimulationSettings};
use crate::constants::MAX_NUM_BONES;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Compile-time validation of a GPU block size and 16-byte alignment.
///
/// Usage: `validate_gpu_type!(ViewConstants, 160);`
macro_rules! validate_gpu_type {
    ($type:ty, $size:expr) => {
        const _: () = assert!(std::mem::size_of::<$type>() == $size);
        const _: () = assert!(std::mem::size_of::<$type>() % 16 == 0);
    };
}

/// Per-tick simulation constants, double buffered by frame parity.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SimulationConstants {
    /// Wind pyramid corners, `xyz * magnitude`.
    pub wind: [[f32; 4]; 4],
    /// damping, local stiffness, global stiffness, global range
    pub shape: [f32; 4],
    /// gravity magnitude, time step, clamp delta, tip separation
    pub gravity_time: [f32; 4],
    /// vsp coefficient, vsp acceleration threshold, unused, unused
    pub vsp: [f32; 4],
    /// vertices per strand, follow strands per guide, guide strands, total strands
    pub counts: [u32; 4],
    /// GPU local iterations, length iterations, reset flag, simulation frame
    pub iterations: [u32; 4],
    pub bones: [[f32; 16]; MAX_NUM_BONES],
}

validate_gpu_type!(SimulationConstants, 144 + 64 * MAX_NUM_BONES);

impl Default for SimulationConstants {
    fn default() -> Self {
        let mut constants = Self::zeroed();
        let identity = Mat4::IDENTITY.to_cols_array();
        for bone in constants.bones.iter_mut() {
            *bone = identity;
        }
        constants
    }
}

impl SimulationConstants {
    pub fn set_settings(&mut self, settings: &SimulationSettings, time_step: f32) {
        self.shape = [
            settings.damping,
            settings.local_constraint_stiffness,
            settings.global_constraint_stiffness,
            settings.global_constraints_range,
        ];
        self.gravity_time = [
            settings.gravity_magnitude,
            time_step,
            settings.clamp_position_delta,
            settings.tip_separation,
        ];
        self.vsp = [settings.vsp_coeff, settings.vsp_accel_threshold, 0.0, 0.0];
        self.iterations[1] = settings.length_constraints_iterations;
    }

    pub fn set_wind(&mut self, corners: [Vec4; 4]) {
        for (slot, corner) in self.wind.iter_mut().zip(corners) {
            *slot = corner.to_array();
        }
    }

    /// Copies `matrices` into the palette; unused slots become identity.
    pub fn set_bones(&mut self, matrices: &[Mat4]) {
        if matrices.len() > MAX_NUM_BONES {
            log::warn!(
                "[SimulationConstants] {} bone matrices supplied, only {} are used",
                matrices.len(),
                MAX_NUM_BONES
            );
        }
        let identity = Mat4::IDENTITY.to_cols_array();
        for (i, slot) in self.bones.iter_mut().enumerate() {
            *slot = matrices.get(i).map(|m| m.to_cols_array()).unwrap_or(identity);
        }
    }

    pub fn bone(&self, index: usize) -> Mat4 {
        Mat4::from_cols_array(&self.bones[index.min(MAX_NUM_BONES - 1)])
    }

    pub fn time_step(&self) -> f32 {
        self.gravity_time[1]
    }

    pub fn local_iterations(&self) -> u32 {
        self.iterations[0]
    }

    pub fn length_iterations(&self) -> u32 {
        self.iterations[1]
    }

    pub fn reset_positions(&self) -> bool {
        self.iterations[2] != 0
    }
}

/// Lighting material of one hair object.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct RenderConstants {
    /// k_diffuse, k_spec1, spec_exp1, k_spec2
    pub shading: [f32; 4],
    /// spec_exp2, shadow alpha, fiber spacing, max shadow fibers
    pub shading2: [f32; 4],
}

validate_gpu_type!(RenderConstants, 32);

impl RenderConstants {
    pub fn from_settings(settings: &RenderingSettings) -> Self {
        Self {
            shading: [settings.k_diffuse, settings.k_spec1, settings.spec_exp1, settings.k_spec2],
            shading2: [
                settings.spec_exp2,
                settings.shadow_alpha,
                settings.fiber_spacing,
                settings.max_shadow_fibers as f32,
            ],
        }
    }
}

/// Strand geometry and coloring of one hair object.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct StrandConstants {
    pub base_color: [f32; 4],
    pub tip_color: [f32; 4],
    /// fiber radius, fiber ratio, tip percentage, strand UV tiling
    pub geometry: [f32; 4],
    /// vertices per strand, total strands, thin tip flag, unused
    pub flags: [u32; 4],
}

validate_gpu_type!(StrandConstants, 64);

impl StrandConstants {
    pub fn new(settings: &RenderingSettings, fiber_radius: f32, vertices_per_strand: u32, total_strands: u32) -> Self {
        Self {
            base_color: settings.base_color,
            tip_color: settings.tip_color,
            geometry: [
                fiber_radius,
                settings.fiber_ratio,
                settings.tip_percentage,
                settings.strand_uv_tiling,
            ],
            flags: [vertices_per_strand, total_strands, settings.enable_thin_tip as u32, 0],
        }
    }
}

/// Camera data supplied by the host for every hair draw.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ViewConstants {
    pub view_proj: [[f32; 4]; 4],
    pub inv_view_proj: [[f32; 4]; 4],
    pub eye: [f32; 4],
    /// width, height, 1 / width, 1 / height
    pub viewport: [f32; 4],
}

validate_gpu_type!(ViewConstants, 160);

impl ViewConstants {
    pub fn new(view_proj: Mat4, eye: Vec3, width: u32, height: u32) -> Self {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            inv_view_proj: view_proj.inverse().to_cols_array_2d(),
            eye: eye.extend(1.0).to_array(),
            viewport: [w, h, 1.0 / w, 1.0 / h],
        }
    }
}

/// A single directional light. Shadowing is the host's business.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightConstants {
    /// Direction towards the light.
    pub direction: [f32; 4],
    pub color: [f32; 4],
    pub ambient: [f32; 4],
    pub params: [f32; 4],
}

validate_gpu_type!(LightConstants, 64);

impl LightConstants {
    pub fn directional(direction: Vec3, color: Vec3, ambient: Vec3) -> Self {
        Self {
            direction: direction.normalize_or_zero().extend(0.0).to_array(),
            color: color.extend(1.0).to_array(),
            ambient: ambient.extend(1.0).to_array(),
            params: [0.0; 4],
        }
    }
}

/// Root motion of one guide strand for the current tick.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct StrandLevelData {
    pub skinning_quat: [f32; 4],
    pub vsp_quat: [f32; 4],
    /// xyz translation, w effective VSP coefficient
    pub vsp_translation: [f32; 4],
}

validate_gpu_type!(StrandLevelData, 48);

/// Up to four bone influences of a strand root.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, serde::Serialize, serde::Deserialize)]
pub struct BoneSkinningData {
    pub indices: [u32; 4],
    pub weights: [f32; 4],
}

validate_gpu_type!(BoneSkinningData, 32);

impl Default for BoneSkinningData {
    fn default() -> Self {
        Self::single(0)
    }
}

impl BoneSkinningData {
    pub fn single(bone: u32) -> Self {
        Self {
            indices: [bone, 0, 0, 0],
            weights: [1.0, 0.0, 0.0, 0.0],
        }
    }

    /// Weighted blend of the referenced bones; identity if no weight is set.
    pub fn blend(&self, bones: &[[f32; 16]]) -> Mat4 {
        let total: f32 = self.weights.iter().sum();
        if total <= f32::EPSILON {
            return Mat4::IDENTITY;
        }
        let mut blended = Mat4::ZERO;
        for (index, weight) in self.indices.iter().zip(self.weights) {
            if weight == 0.0 {
                continue;
            }
            let bone = bones
                .get(*index as usize)
                .map(Mat4::from_cols_array)
                .unwrap_or(Mat4::IDENTITY);
            blended += bone * weight;
        }
        blended * (1.0 / total)
    }
}

/// Parameters shared by both OIT methods.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OitConstants {
    /// width, height, node capacity, depth slots per pixel
    pub dims: [u32; 4],
}

validate_gpu_type!(OitConstants, 16);

/// One entry of the PPLL node pool.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PpllNode {
    pub depth: f32,
    /// RGBA8 unorm, premultiplication happens at resolve.
    pub color: u32,
    pub next: u32,
    pub _pad: u32,
}

validate_gpu_type!(PpllNode, 16);

/// Grid placement and limits shared by the SDF and marching-cubes kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SdfConstants {
    /// xyz grid origin, w cell size
    pub origin: [f32; 4],
    /// cells along x, y, z and in total
    pub counts: [u32; 4],
    /// mesh vertices, mesh triangles, band cells, unused
    pub mesh: [u32; 4],
    /// collision margin, iso level, unused, unused
    pub params: [f32; 4],
    /// marching-cubes vertex capacity, unused
    pub limits: [u32; 4],
}

validate_gpu_type!(SdfConstants, 80);

/// One vertex emitted by the marching-cubes kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MarchingCubesVertex {
    pub position: [f32; 4],
    pub normal: [f32; 4],
}

validate_gpu_type!(MarchingCubesVertex, 32);
