// strandfx constants - SINGLE SOURCE OF TRUTH
//
// Shared by the library (through `src/constants.rs`) and by `build.rs`, which
// turns the GPU-visible values into `hair_constants.wgsl`.
//
// Do NOT redefine these values in shaders or elsewhere in the crate.

/// Strand simulation limits
pub mod simulation {
    /// Threads per compute workgroup. Strands never straddle a workgroup.
    pub const THREAD_GROUP_SIZE: u32 = 64;

    /// Largest vertex count a single strand may have.
    pub const MAX_VERTICES_PER_STRAND: u32 = THREAD_GROUP_SIZE;

    /// Smallest vertex count a strand may have (one segment).
    pub const MIN_VERTICES_PER_STRAND: u32 = 2;

    /// Bone matrices carried by the simulation constant block.
    pub const MAX_NUM_BONES: usize = 512;

    /// At or above this strand length the local-shape loop runs on the GPU.
    pub const MIN_VERTS_PER_STRAND_FOR_GPU_ITERATION: u32 = 64;

    /// Nominal tick length the default stiffness values are tuned for.
    pub const NOMINAL_TIME_STEP: f32 = 0.016_666_7;

    /// Per-tick displacement clamp applied after integration.
    pub const CLAMP_POSITION_DELTA: f32 = 20.0;

    /// Number of leading frames that snap hair to its skinned rest pose.
    pub const RESET_FRAMES: u32 = 2;

    /// Half-angle of the wind pyramid around the wind direction.
    pub const WIND_CONE_ANGLE_DEGREES: f32 = 40.0;

    /// Strands are spread over this many wind blend buckets.
    pub const WIND_STRAND_BUCKETS: u32 = 20;

    /// Cap on the local stiffness so the constraint never overshoots.
    pub const MAX_LOCAL_STIFFNESS: f32 = 0.95;
}

/// Signed distance field collision
pub mod sdf {
    /// "Far" distance every cell starts from before triangles are splatted.
    pub const INITIAL_DISTANCE: f32 = 1.0e10;

    /// Padding around the collision mesh bounds, as a fraction of the
    /// initial grid width in cells.
    pub const PADDING_FACTOR: f32 = 0.8;

    /// Default cell budget multiplier over the initial cell estimate.
    pub const GRID_ALLOCATION_MULTIPLIER: f32 = 2.0;

    /// Default grid resolution along X for the initial bounds.
    pub const DEFAULT_NUM_CELLS_X: u32 = 64;

    /// Cells around each triangle that receive exact distances.
    pub const TRIANGLE_BAND_CELLS: u32 = 2;

    /// Workgroup size of every SDF and marching-cubes kernel.
    pub const SDF_THREAD_GROUP_SIZE: u32 = 64;

    /// Default capacity of the marching-cubes vertex pool.
    pub const MAX_MARCHING_CUBES_VERTICES: u32 = 128 * 1024;

    /// Stride of one row of the triangle table (terminated by -1).
    pub const MC_TRI_TABLE_STRIDE: u32 = 32;
}

/// Order-independent transparency
pub mod oit {
    /// Terminates a per-pixel linked list.
    pub const NULL_NODE: u32 = 0xFFFF_FFFF;

    /// Node pool sizing for the PPLL method.
    pub const PPLL_AVERAGE_FRAGMENTS_PER_PIXEL: u32 = 4;

    /// Nearest fragments sorted exactly during PPLL resolve.
    pub const PPLL_KBUFFER_SIZE: u32 = 8;

    /// Upper bound on nodes visited per pixel during PPLL resolve.
    pub const PPLL_MAX_LIST_WALK: u32 = 512;

    /// Depth slots kept per pixel by the ShortCut method.
    pub const SHORTCUT_K: u32 = 3;

    /// Bit pattern stored in an empty ShortCut depth slot.
    pub const FAR_DEPTH_BITS: u32 = 0xFFFF_FFFF;

    /// Fragments with less coverage than this are discarded.
    pub const MIN_FRAGMENT_ALPHA: f32 = 1.0 / 255.0;
}
