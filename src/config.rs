//! Tunable settings for simulation, rendering, collision and OIT.
//!
//! Every block is plain serde data with defaults tuned for a 60 Hz tick, and
//! the whole set can be loaded from a TOML or JSON file.

use crate::constants::{
    CLAMP_POSITION_DELTA, DEFAULT_NUM_CELLS_X, GRID_ALLOCATION_MULTIPLIER,
    MAX_MARCHING_CUBES_VERTICES, PPLL_AVERAGE_FRAGMENTS_PER_PIXEL,
};
use crate::error::{HairError, HairResult};
use crate::oit::OitMethod;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Physics parameters of one hair object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub damping: f32,
    pub local_constraint_stiffness: f32,
    pub global_constraint_stiffness: f32,
    /// Fraction of each strand (from the root) pulled by global shape matching.
    pub global_constraints_range: f32,
    pub local_constraints_iterations: u32,
    pub length_constraints_iterations: u32,
    pub gravity_magnitude: f32,
    pub wind_direction: [f32; 3],
    pub wind_magnitude: f32,
    pub tip_separation: f32,
    /// Velocity shock propagation coefficient in `[0, 1]`.
    pub vsp_coeff: f32,
    /// Root acceleration above which VSP is applied fully.
    pub vsp_accel_threshold: f32,
    pub clamp_position_delta: f32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            damping: 0.035,
            local_constraint_stiffness: 0.9,
            global_constraint_stiffness: 0.2,
            global_constraints_range: 0.3,
            local_constraints_iterations: 1,
            length_constraints_iterations: 1,
            gravity_magnitude: 9.82,
            wind_direction: [1.0, 0.0, 0.0],
            wind_magnitude: 0.0,
            tip_separation: 0.1,
            vsp_coeff: 0.758,
            vsp_accel_threshold: 1.208,
            clamp_position_delta: CLAMP_POSITION_DELTA,
        }
    }
}

/// Strand appearance and level of detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderingSettings {
    pub fiber_radius: f32,
    /// Radius at the tip relative to the root when thin tips are enabled.
    pub fiber_ratio: f32,
    pub enable_thin_tip: bool,
    pub base_color: [f32; 4],
    pub tip_color: [f32; 4],
    /// Portion of the strand, from the tip, blended towards the tip color.
    pub tip_percentage: f32,
    pub strand_uv_tiling: f32,
    pub k_diffuse: f32,
    pub k_spec1: f32,
    pub spec_exp1: f32,
    pub k_spec2: f32,
    pub spec_exp2: f32,
    pub shadow_alpha: f32,
    pub fiber_spacing: f32,
    pub max_shadow_fibers: u32,
    pub enable_lod: bool,
    pub lod_start_distance: f32,
    pub lod_end_distance: f32,
    /// Strand density kept at `lod_end_distance`.
    pub lod_percent: f32,
    /// Fiber radius multiplier reached at `lod_end_distance`.
    pub lod_width_multiplier: f32,
}

impl Default for RenderingSettings {
    fn default() -> Self {
        Self {
            fiber_radius: 0.002,
            fiber_ratio: 0.06,
            enable_thin_tip: true,
            base_color: [0.40, 0.25, 0.15, 0.63],
            tip_color: [0.55, 0.40, 0.28, 0.63],
            tip_percentage: 0.5,
            strand_uv_tiling: 1.0,
            k_diffuse: 0.22,
            k_spec1: 0.0012,
            spec_exp1: 14.4,
            k_spec2: 0.136,
            spec_exp2: 11.8,
            shadow_alpha: 0.035,
            fiber_spacing: 0.3,
            max_shadow_fibers: 50,
            enable_lod: false,
            lod_start_distance: 1.0,
            lod_end_distance: 5.0,
            lod_percent: 0.5,
            lod_width_multiplier: 3.0,
        }
    }
}

/// Signed distance field grid policy and collision response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionSettings {
    /// Cells along X for the initial bounding box.
    pub num_cells_x: u32,
    /// Multiplier over the initial cell estimate that caps the grid.
    pub allocation_multiplier: f32,
    /// Distance from the surface hair vertices are pushed out to.
    pub collision_margin: f32,
    pub iso_level: f32,
    pub max_marching_cubes_vertices: u32,
    pub generate_iso_surface: bool,
}

impl Default for CollisionSettings {
    fn default() -> Self {
        Self {
            num_cells_x: DEFAULT_NUM_CELLS_X,
            allocation_multiplier: GRID_ALLOCATION_MULTIPLIER,
            collision_margin: 0.005,
            iso_level: 0.0,
            max_marching_cubes_vertices: MAX_MARCHING_CUBES_VERTICES,
            generate_iso_surface: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OitSettings {
    pub method: OitMethod,
    pub average_fragments_per_pixel: u32,
}

impl Default for OitSettings {
    fn default() -> Self {
        Self {
            method: OitMethod::ShortCut,
            average_fragments_per_pixel: PPLL_AVERAGE_FRAGMENTS_PER_PIXEL,
        }
    }
}

/// Configuration format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Some(ConfigFormat::Json),
            Some("toml") => Some(ConfigFormat::Toml),
            _ => None,
        }
    }
}

/// Top-level settings of a `HairSystem`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HairSystemConfig {
    pub simulation: SimulationSettings,
    pub rendering: RenderingSettings,
    pub collision: CollisionSettings,
    pub oit: OitSettings,
    /// Queue used by `HairSystem::simulate`: record simulation on the compute
    /// queue and wait lazily before drawing. `simulate_with` overrides it per tick.
    pub async_compute: bool,
}

impl HairSystemConfig {
    pub fn from_toml_str(text: &str) -> HairResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> HairResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> HairResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads a config file, picking the parser from the extension.
    pub fn load(path: impl AsRef<Path>) -> HairResult<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path).ok_or_else(|| {
            HairError::Config(format!("unsupported config file '{}'", path.display()))
        })?;
        let text = std::fs::read_to_string(path)?;
        log::debug!("[HairSystemConfig] Loading {:?} config from {}", format, path.display());
        match format {
            ConfigFormat::Toml => Self::from_toml_str(&text),
            ConfigFormat::Json => Self::from_json_str(&text),
        }
    }

    pub fn validate(&self) -> HairResult<()> {
        let sim = &self.simulation;
        if !(0.0..=1.0).contains(&sim.damping) {
            return Err(HairError::Config(format!("damping {} outside [0, 1]", sim.damping)));
        }
        if !(0.0..=1.0).contains(&sim.vsp_coeff) {
            return Err(HairError::Config(format!("vsp_coeff {} outside [0, 1]", sim.vsp_coeff)));
        }
        if self.collision.num_cells_x == 0 {
            return Err(HairError::Config("num_cells_x must be positive".to_string()));
        }
        if self.collision.allocation_multiplier < 1.0 {
            return Err(HairError::Config(format!(
                "allocation_multiplier {} must be at least 1",
                self.collision.allocation_multiplier
            )));
        }
        if self.oit.average_fragments_per_pixel == 0 {
            return Err(HairError::Config(
                "average_fragments_per_pixel must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = HairSystemConfig::from_toml_str(
            r#"
            async_compute = true

            [simulation]
            damping = 0.1

            [oit]
            method = "Ppll"
            "#,
        )
        .unwrap();

        assert!(config.async_compute);
        assert_eq!(config.simulation.damping, 0.1);
        assert_eq!(config.simulation.vsp_coeff, SimulationSettings::default().vsp_coeff);
        assert_eq!(config.oit.method, OitMethod::Ppll);
    }

    #[test]
    fn load_picks_format_from_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{ "collision": {{ "num_cells_x": 32 }} }}"#).unwrap();

        let config = HairSystemConfig::load(file.path()).unwrap();
        assert_eq!(config.collision.num_cells_x, 32);
    }

    #[test]
    fn toml_round_trip_is_lossless() {
        let mut config = HairSystemConfig::default();
        config.rendering.enable_lod = true;
        let text = config.to_toml_string().unwrap();
        assert_eq!(HairSystemConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = HairSystemConfig::from_toml_str("[simulation]\ndamping = 2.0").unwrap_err();
        assert!(matches!(err, HairError::Config(_)));
        assert!(HairSystemConfig::load("hair.yaml").is_err());
    }
}
