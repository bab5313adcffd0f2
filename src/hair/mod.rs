//! Hair assets, per-object GPU state and the GPU data blocks they upload.

mod asset;
mod dynamic_state;
pub mod gpu_types;
mod object;

pub use asset::{FollowHairParams, HairAsset, HairAssetData};
pub use dynamic_state::{DynamicPhase, DynamicState};
pub use object::{HairObject, TickPlan};
