//! Build script generating the WGSL constant block from `constants.rs`

use std::{env, fs, path::Path};

#[allow(dead_code)]
mod shared {
    include!("constants.rs");
}

use shared::{oit, sdf, simulation};

fn main() {
    println!("cargo:rerun-if-changed=constants.rs");
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    let constants_generated_path = Path::new(&out_dir).join("hair_constants.wgsl");

    fs::write(&constants_generated_path, generate_wgsl_constants())
        .expect("Failed to write generated constants WGSL");
}

/// Formats an f32 so WGSL parses it as a float literal.
fn wgsl_f32(value: f32) -> String {
    let text = format!("{:?}", value);
    if text.contains('.') || text.contains('e') {
        text
    } else {
        format!("{}.0", text)
    }
}

/// Generate WGSL constants
fn generate_wgsl_constants() -> String {
    format!(
        r#"// AUTO-GENERATED HAIR CONSTANTS - DO NOT EDIT
// Generated from constants.rs by build.rs

// Simulation
const THREAD_GROUP_SIZE: u32 = {thread_group_size}u;
const MAX_NUM_BONES: u32 = {max_bones}u;
const CLAMP_POSITION_DELTA: f32 = {clamp_delta};
const WIND_STRAND_BUCKETS: u32 = {wind_buckets}u;
const MAX_LOCAL_STIFFNESS: f32 = {max_local_stiffness};

// Signed distance field
const SDF_INITIAL_DISTANCE: f32 = {sdf_initial};
const SDF_THREAD_GROUP_SIZE: u32 = {sdf_group}u;
const SDF_TRIANGLE_BAND_CELLS: u32 = {band_cells}u;
const MC_TRI_TABLE_STRIDE: u32 = {tri_stride}u;

// Order-independent transparency
const NULL_NODE: u32 = {null_node}u;
const PPLL_KBUFFER_SIZE: u32 = {kbuffer}u;
const PPLL_MAX_LIST_WALK: u32 = {max_walk}u;
const SHORTCUT_K: u32 = {shortcut_k}u;
const FAR_DEPTH_BITS: u32 = {far_depth}u;
const MIN_FRAGMENT_ALPHA: f32 = {min_alpha};
"#,
        thread_group_size = simulation::THREAD_GROUP_SIZE,
        max_bones = simulation::MAX_NUM_BONES,
        clamp_delta = wgsl_f32(simulation::CLAMP_POSITION_DELTA),
        wind_buckets = simulation::WIND_STRAND_BUCKETS,
        max_local_stiffness = wgsl_f32(simulation::MAX_LOCAL_STIFFNESS),
        sdf_initial = wgsl_f32(sdf::INITIAL_DISTANCE),
        sdf_group = sdf::SDF_THREAD_GROUP_SIZE,
        band_cells = sdf::TRIANGLE_BAND_CELLS,
        tri_stride = sdf::MC_TRI_TABLE_STRIDE,
        null_node = oit::NULL_NODE,
        kbuffer = oit::PPLL_KBUFFER_SIZE,
        max_walk = oit::PPLL_MAX_LIST_WALK,
        shortcut_k = oit::SHORTCUT_K,
        far_depth = oit::FAR_DEPTH_BITS,
        min_alpha = wgsl_f32(oit::MIN_FRAGMENT_ALPHA),
    )
}
