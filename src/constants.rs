//! Constants shared by the CPU code and the WGSL kernels.
//!
//! The values live in the root `constants.rs`, which `build.rs` also reads to
//! generate `hair_constants.wgsl`.

include!("../constants.rs");

pub use self::oit::*;
pub use self::sdf::*;
pub use self::simulation::*;
