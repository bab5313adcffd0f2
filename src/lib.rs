//! strandfx: real-time strand hair.
//!
//! Guide strands are simulated on the GPU (integration, global and local
//! shape constraints, wind, length constraints), follow strands are
//! generated from the guides, collision runs against signed distance fields
//! rebuilt from skinned meshes every frame, and the result is composited with
//! order-independent transparency, either per-pixel linked lists or the
//! two-pass ShortCut approximation.
//!
//! All GPU work goes through the [`device::RenderDevice`] contract, so the
//! same system runs on wgpu or on the recording [`device::HeadlessDevice`].

pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod hair;
pub mod layouts;
pub mod oit;
pub mod sdf;
pub mod shaders;
pub mod simulation;
pub mod system;

pub use config::{CollisionSettings, HairSystemConfig, OitSettings, RenderingSettings, SimulationSettings};
pub use device::{HeadlessDevice, RenderDevice, SceneTargets, WgpuDevice};
pub use error::{HairError, HairResult};
pub use hair::gpu_types::{LightConstants, ViewConstants};
pub use hair::{HairAsset, HairAssetData, HairObject};
pub use oit::OitMethod;
pub use sdf::{CollisionMesh, CollisionMeshData, SdfGrid};
pub use simulation::SimulationMode;
pub use system::{
    CapacityReport, ColliderInput, CollisionMeshId, HairInput, HairObjectId, HairSystem, SimulateSummary,
};
