//! Embedded WGSL sources.
//!
//! Kernels are compiled into the crate with `include_str!` and expanded by
//! [`WgslPreprocessor`] so there is no runtime path resolution. The constant
//! block is generated by `build.rs` from `constants.rs`.

mod preprocessor;

pub use preprocessor::WgslPreprocessor;

use crate::error::{HairError, HairResult};

/// Constants generated from `constants.rs`
pub const HAIR_CONSTANTS_WGSL: &str = include_str!(concat!(env!("OUT_DIR"), "/hair_constants.wgsl"));

/// Quaternion helpers and packing functions
pub const COMMON_WGSL: &str = include_str!("common.wgsl");

/// Strand expansion and shading shared by every hair fill pass
pub const HAIR_RASTER_WGSL: &str = include_str!("hair_raster.wgsl");

/// Full-screen triangle vertex stage
pub const FULLSCREEN_WGSL: &str = include_str!("fullscreen.wgsl");

/// SDF constant block and trilinear sampling
pub const SDF_COMMON_WGSL: &str = include_str!("sdf_common.wgsl");

/// Dynamic hair state bindings shared by the simulation and collision kernels
pub const HAIR_BINDINGS_WGSL: &str = include_str!("hair_bindings.wgsl");

/// Camera and light blocks
pub const VIEW_WGSL: &str = include_str!("view.wgsl");

/// OIT constant block, node layout and pixel addressing
pub const OIT_COMMON_WGSL: &str = include_str!("oit_common.wgsl");

pub const HAIR_SIMULATION: &str = "hair_simulation.wgsl";
pub const SDF_BUILD: &str = "sdf_build.wgsl";
pub const SDF_COLLIDE: &str = "sdf_collide.wgsl";
pub const MARCHING_CUBES: &str = "marching_cubes.wgsl";
pub const MARCHING_CUBES_DRAW: &str = "marching_cubes_draw.wgsl";
pub const PPLL_FILL: &str = "ppll_fill.wgsl";
pub const PPLL_RESOLVE: &str = "ppll_resolve.wgsl";
pub const SHORTCUT_FILL: &str = "shortcut_fill.wgsl";
pub const SHORTCUT_DEPTH_RESOLVE: &str = "shortcut_depth_resolve.wgsl";
pub const SHORTCUT_COLOR_RESOLVE: &str = "shortcut_color_resolve.wgsl";

/// Get shader include content by name
pub fn get_shader_include(name: &str) -> Option<&'static str> {
    match name {
        "hair_constants.wgsl" | "generated/hair_constants.wgsl" => Some(HAIR_CONSTANTS_WGSL),
        "common.wgsl" => Some(COMMON_WGSL),
        "hair_raster.wgsl" => Some(HAIR_RASTER_WGSL),
        "fullscreen.wgsl" => Some(FULLSCREEN_WGSL),
        "sdf_common.wgsl" => Some(SDF_COMMON_WGSL),
        "hair_bindings.wgsl" => Some(HAIR_BINDINGS_WGSL),
        "view.wgsl" => Some(VIEW_WGSL),
        "oit_common.wgsl" => Some(OIT_COMMON_WGSL),
        _ => None,
    }
}

fn get_shader_entry(name: &str) -> Option<&'static str> {
    match name {
        HAIR_SIMULATION => Some(include_str!("hair_simulation.wgsl")),
        SDF_BUILD => Some(include_str!("sdf_build.wgsl")),
        SDF_COLLIDE => Some(include_str!("sdf_collide.wgsl")),
        MARCHING_CUBES => Some(include_str!("marching_cubes.wgsl")),
        MARCHING_CUBES_DRAW => Some(include_str!("marching_cubes_draw.wgsl")),
        PPLL_FILL => Some(include_str!("ppll_fill.wgsl")),
        PPLL_RESOLVE => Some(include_str!("ppll_resolve.wgsl")),
        SHORTCUT_FILL => Some(include_str!("shortcut_fill.wgsl")),
        SHORTCUT_DEPTH_RESOLVE => Some(include_str!("shortcut_depth_resolve.wgsl")),
        SHORTCUT_COLOR_RESOLVE => Some(include_str!("shortcut_color_resolve.wgsl")),
        _ => None,
    }
}

/// A fully preprocessed shader module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub name: String,
    pub source: String,
}

impl ShaderSource {
    /// Loads and preprocesses one of the embedded shader modules.
    pub fn load(name: &str) -> HairResult<Self> {
        let content = get_shader_entry(name).ok_or_else(|| HairError::Shader {
            shader: name.to_string(),
            reason: "no such embedded shader".to_string(),
        })?;
        let source = WgslPreprocessor::new().process_content(content, name)?;
        log::trace!("[Shaders] Preprocessed {} ({} bytes)", name, source.len());
        Ok(Self {
            name: name.to_string(),
            source,
        })
    }

    /// Whether the module defines an entry point function with this name.
    pub fn declares_entry_point(&self, entry: &str) -> bool {
        let needle = format!("fn {}(", entry);
        let staged =
            |text: &str| text.contains("@compute") || text.contains("@vertex") || text.contains("@fragment");
        let mut previous = "";
        for line in self.source.lines() {
            let trimmed = line.trim();
            if trimmed.contains(&needle) && (staged(trimmed) || staged(previous)) {
                return true;
            }
            previous = trimmed;
        }
        false
    }
}
