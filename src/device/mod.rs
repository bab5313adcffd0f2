//! Host rendering contract.
//!
//! The hair system never talks to a graphics API directly. It creates
//! resources through a [`RenderDevice`] and records work into a
//! [`CommandContext`]. Two hosts ship with the crate: [`HeadlessDevice`]
//! (records, validates and counts, used by tests and tooling) and
//! [`WgpuDevice`] (replays recorded work on wgpu).

mod command_list;
mod headless;
mod state;
mod wgpu_host;

pub use command_list::{Command, CommandList, CommandStats};
pub use headless::{HeadlessDevice, QueueEvent, QueueKind, SubmittedList};
pub use state::{Barrier, ResourceState, StateTracker, StateViolation, TrackedResource};
pub(crate) use state::transition_all;
pub use wgpu_host::WgpuDevice;

use crate::error::HairResult;
use crate::shaders::ShaderSource;
use bitflags::bitflags;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

define_handle!(
    /// A buffer, image or sampler.
    ResourceId
);
define_handle!(BindLayoutId);
define_handle!(BindSetId);
define_handle!(PipelineId);
define_handle!(RenderTargetSetId);

/// Any releasable device object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    Resource(ResourceId),
    BindLayout(BindLayoutId),
    BindSet(BindSetId),
    Pipeline(PipelineId),
    RenderTargetSet(RenderTargetSetId),
}

impl From<ResourceId> for Handle {
    fn from(id: ResourceId) -> Self {
        Handle::Resource(id)
    }
}

impl From<BindLayoutId> for Handle {
    fn from(id: BindLayoutId) -> Self {
        Handle::BindLayout(id)
    }
}

impl From<BindSetId> for Handle {
    fn from(id: BindSetId) -> Self {
        Handle::BindSet(id)
    }
}

impl From<PipelineId> for Handle {
    fn from(id: PipelineId) -> Self {
        Handle::Pipeline(id)
    }
}

impl From<RenderTargetSetId> for Handle {
    fn from(id: RenderTargetSetId) -> Self {
        Handle::RenderTargetSet(id)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const UNIFORM = 1 << 0;
        const STORAGE = 1 << 1;
        const INDEX = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const COPY_DST = 1 << 3;
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub initial_state: ResourceState,
}

impl BufferDesc {
    /// Read-write structured buffer, usable as a copy destination.
    pub fn storage(label: impl Into<String>, size: u64) -> Self {
        Self {
            label: label.into(),
            size,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
            initial_state: ResourceState::ShaderReadWrite,
        }
    }

    /// Structured buffer that only shaders read after upload.
    pub fn read_only(label: impl Into<String>, size: u64) -> Self {
        Self {
            initial_state: ResourceState::ShaderRead,
            ..Self::storage(label, size)
        }
    }

    pub fn uniform(label: impl Into<String>, size: u64) -> Self {
        Self {
            label: label.into(),
            size,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            initial_state: ResourceState::ConstantBuffer,
        }
    }

    pub fn index(label: impl Into<String>, size: u64) -> Self {
        Self {
            label: label.into(),
            size,
            usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
            initial_state: ResourceState::IndexBuffer,
        }
    }

    /// One `u32` per element, cleared every frame before use.
    pub fn uint32(label: impl Into<String>, elements: u64) -> Self {
        Self {
            initial_state: ResourceState::Undefined,
            ..Self::storage(label, elements * 4)
        }
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R32Uint,
    R16Float,
    Rgba16Float,
    Rgba8UnormSrgb,
    Bgra8UnormSrgb,
    Depth32Float,
}

impl ImageFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, ImageFormat::Depth32Float)
    }
}

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub usage: ImageUsage,
    pub initial_state: ResourceState,
}

impl ImageDesc {
    pub fn render_target(label: impl Into<String>, width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            format,
            usage: ImageUsage::RENDER_TARGET | ImageUsage::SAMPLED,
            initial_state: ResourceState::Undefined,
        }
    }

    pub fn depth(label: impl Into<String>, width: u32, height: u32) -> Self {
        Self::render_target(label, width, height, ImageFormat::Depth32Float)
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Clamp,
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerDesc {
    pub filter: FilterMode,
    pub address: AddressMode,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

/// What occupies one binding slot of a bind layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Constants,
    ReadOnlyBuffer,
    ReadWriteBuffer,
    SampledImage,
    DepthImage,
    UintImage,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingSlot {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: ShaderStages,
}

impl BindingSlot {
    pub fn new(binding: u32, kind: BindingKind, stages: ShaderStages) -> Self {
        Self { binding, kind, stages }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindLayoutDesc {
    pub label: String,
    pub slots: Vec<BindingSlot>,
}

impl BindLayoutDesc {
    /// Consecutive slots starting at binding 0, all visible to `stages`.
    pub fn sequential(label: impl Into<String>, stages: ShaderStages, kinds: &[BindingKind]) -> Self {
        Self {
            label: label.into(),
            slots: kinds
                .iter()
                .enumerate()
                .map(|(i, kind)| BindingSlot::new(i as u32, *kind, stages))
                .collect(),
        }
    }
}

/// Resources bound to a layout, one per slot in slot order.
#[derive(Debug, Clone)]
pub struct BindSetDesc {
    pub label: String,
    pub layout: BindLayoutId,
    pub resources: Vec<ResourceId>,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDesc<'a> {
    pub label: &'a str,
    pub shader: &'a ShaderSource,
    pub entry_point: &'a str,
    pub layouts: &'a [BindLayoutId],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    LessEqual,
    Greater,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    pub compare: CompareFunction,
    pub write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendComponent {
    pub src: BlendFactor,
    pub dst: BlendFactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    /// `src + dst * (1 - src.a)`
    pub const PREMULTIPLIED: Self = Self::uniform(BlendFactor::One, BlendFactor::OneMinusSrcAlpha);
    /// `src + dst`
    pub const ADDITIVE: Self = Self::uniform(BlendFactor::One, BlendFactor::One);
    /// `dst * src`
    pub const MULTIPLY: Self = Self::uniform(BlendFactor::Zero, BlendFactor::Src);

    pub const fn uniform(src: BlendFactor, dst: BlendFactor) -> Self {
        let component = BlendComponent { src, dst };
        Self {
            color: component,
            alpha: component,
        }
    }
}

/// Output state of one color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTarget {
    pub blend: Option<BlendState>,
    pub write: bool,
}

impl ColorTarget {
    pub const REPLACE: Self = Self { blend: None, write: true };
    pub const MASKED: Self = Self { blend: None, write: false };

    pub fn blended(blend: BlendState) -> Self {
        Self {
            blend: Some(blend),
            write: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc<'a> {
    pub label: &'a str,
    pub shader: &'a ShaderSource,
    pub vertex_entry: &'a str,
    pub fragment_entry: &'a str,
    pub topology: Topology,
    pub layouts: &'a [BindLayoutId],
    /// Attachment formats are taken from this render target set.
    pub targets: RenderTargetSetId,
    pub color_targets: Vec<ColorTarget>,
    pub depth: Option<DepthState>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadAction {
    Load,
    Clear([f32; 4]),
    ClearDepth(f32),
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    pub resource: ResourceId,
    pub load: LoadAction,
    pub store: bool,
}

impl Attachment {
    pub fn load(resource: ResourceId) -> Self {
        Self {
            resource,
            load: LoadAction::Load,
            store: true,
        }
    }

    pub fn clear(resource: ResourceId, color: [f32; 4]) -> Self {
        Self {
            resource,
            load: LoadAction::Clear(color),
            store: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderTargetSetDesc {
    pub label: String,
    pub attachments: Vec<Attachment>,
}

/// Host-owned scene attachments the hair renderers composite into.
///
/// The depth image must be created with `ImageUsage::SAMPLED`; the OIT fill
/// passes test fragments against it manually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneTargets {
    pub color: ResourceId,
    pub depth: ResourceId,
    pub width: u32,
    pub height: u32,
}

/// Records GPU work for one queue.
pub trait CommandContext {
    fn submit_barrier(&mut self, barriers: &[Barrier]);
    fn bind_pipeline(&mut self, pipeline: PipelineId);
    /// Binds `sets` to consecutive set indices starting at 0.
    fn bind_sets(&mut self, pipeline: PipelineId, sets: &[BindSetId]);
    fn dispatch(&mut self, groups_x: u32);
    fn draw_instanced(&mut self, pipeline: PipelineId, vertex_count: u32, instance_count: u32);
    fn draw_indexed_instanced(
        &mut self,
        pipeline: PipelineId,
        index_buffer: ResourceId,
        index_count: u32,
        instance_count: u32,
    );
    fn update_buffer(&mut self, buffer: ResourceId, data: &[u8]);
    fn clear_u32(&mut self, resource: ResourceId, value: u32);
    fn begin_render_pass(&mut self, targets: RenderTargetSetId, label: &str);
    fn end_render_pass(&mut self);
    fn insert_marker(&mut self, label: &str);
}

/// Resource factory and queue control of the host.
pub trait RenderDevice {
    fn create_buffer(&mut self, desc: &BufferDesc) -> HairResult<ResourceId>;
    fn create_image(&mut self, desc: &ImageDesc) -> HairResult<ResourceId>;
    fn create_sampler(&mut self, desc: &SamplerDesc) -> HairResult<ResourceId>;
    fn create_bind_layout(&mut self, desc: &BindLayoutDesc) -> HairResult<BindLayoutId>;
    fn create_bind_set(&mut self, desc: &BindSetDesc) -> HairResult<BindSetId>;
    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc<'_>) -> HairResult<PipelineId>;
    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> HairResult<PipelineId>;
    fn create_render_target_set(&mut self, desc: &RenderTargetSetDesc) -> HairResult<RenderTargetSetId>;

    fn release(&mut self, handle: Handle);
    /// Number of device objects created and not yet released.
    fn live_allocations(&self) -> usize;

    fn graphics_context(&mut self) -> &mut dyn CommandContext;
    fn compute_context(&mut self) -> &mut dyn CommandContext;

    /// Marks the point on the graphics queue the compute queue may start from.
    fn signal_compute_start(&mut self);
    fn submit_compute(&mut self) -> HairResult<()>;
    /// Makes subsequent graphics work wait for the last compute submission.
    fn wait_for_compute(&mut self) -> HairResult<()>;
    fn submit_frame(&mut self) -> HairResult<()>;
    /// Submits pending work and blocks until the GPU is idle.
    fn flush_gpu(&mut self) -> HairResult<()>;

    /// Submits pending graphics work and copies a buffer back to the CPU.
    fn read_buffer(&mut self, buffer: ResourceId) -> HairResult<Vec<u8>>;
}

impl<'a> dyn RenderDevice + 'a {
    /// Creates a buffer and fills it through the graphics context.
    pub fn create_buffer_with_data(&mut self, desc: &BufferDesc, data: &[u8]) -> HairResult<ResourceId> {
        let id = self.create_buffer(desc)?;
        if !data.is_empty() {
            self.graphics_context().update_buffer(id, data);
        }
        Ok(id)
    }

    /// Reads a buffer back as `u32` words.
    pub fn read_u32s(&mut self, buffer: ResourceId) -> HairResult<Vec<u32>> {
        let bytes = self.read_buffer(buffer)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Number of workgroups needed to cover `items` threads.
pub fn workgroups(items: u32, group_size: u32) -> u32 {
    (items + group_size - 1) / group_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroups_round_up() {
        assert_eq!(workgroups(0, 64), 0);
        assert_eq!(workgroups(1, 64), 1);
        assert_eq!(workgroups(64, 64), 1);
        assert_eq!(workgroups(65, 64), 2);
    }

    #[test]
    fn uint32_buffers_start_undefined() {
        let desc = BufferDesc::uint32("heads", 16);
        assert_eq!(desc.size, 64);
        assert_eq!(desc.initial_state, ResourceState::Undefined);
        assert!(desc.usage.contains(BufferUsage::STORAGE));
    }
}
