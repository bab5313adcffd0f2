use super::*;
use crate::error::{HairError, HairErrorContext, HairResult};
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use wgpu::util::DeviceExt;

#[derive(Debug)]
enum WgpuObject {
    Buffer {
        buffer: wgpu::Buffer,
        desc: BufferDesc,
    },
    Image {
        // Kept alive for the view.
        _texture: wgpu::Texture,
        view: wgpu::TextureView,
        desc: ImageDesc,
    },
    Sampler(wgpu::Sampler),
    BindLayout {
        layout: wgpu::BindGroupLayout,
        desc: BindLayoutDesc,
    },
    BindSet(wgpu::BindGroup),
    ComputePipeline {
        pipeline: wgpu::ComputePipeline,
        label: String,
    },
    RenderPipeline {
        pipeline: wgpu::RenderPipeline,
        label: String,
    },
    RenderTargetSet(RenderTargetSetDesc),
}

/// Host that replays recorded command lists on wgpu.
///
/// wgpu tracks resource hazards itself, so barriers are only checked against
/// the tracked state and then dropped. Both contexts are submitted to the one
/// wgpu queue; submission order carries the compute-to-graphics dependency.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    objects: FxHashMap<u32, WgpuObject>,
    next_id: u32,
    graphics: CommandList,
    compute: CommandList,
    tracker: StateTracker,
    violations: usize,
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("objects", &self.objects.len())
            .field("violations", &self.violations)
            .finish()
    }
}

fn texture_format(format: ImageFormat) -> wgpu::TextureFormat {
    match format {
        ImageFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        ImageFormat::R16Float => wgpu::TextureFormat::R16Float,
        ImageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        ImageFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        ImageFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        ImageFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

fn shader_stages(stages: ShaderStages) -> wgpu::ShaderStages {
    let mut out = wgpu::ShaderStages::NONE;
    if stages.contains(ShaderStages::VERTEX) {
        out |= wgpu::ShaderStages::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        out |= wgpu::ShaderStages::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        out |= wgpu::ShaderStages::COMPUTE;
    }
    out
}

fn binding_type(kind: BindingKind) -> wgpu::BindingType {
    let buffer = |ty| wgpu::BindingType::Buffer {
        ty,
        has_dynamic_offset: false,
        min_binding_size: None,
    };
    let texture = |sample_type| wgpu::BindingType::Texture {
        sample_type,
        view_dimension: wgpu::TextureViewDimension::D2,
        multisampled: false,
    };
    match kind {
        BindingKind::Constants => buffer(wgpu::BufferBindingType::Uniform),
        BindingKind::ReadOnlyBuffer => buffer(wgpu::BufferBindingType::Storage { read_only: true }),
        BindingKind::ReadWriteBuffer => buffer(wgpu::BufferBindingType::Storage { read_only: false }),
        BindingKind::SampledImage => texture(wgpu::TextureSampleType::Float { filterable: false }),
        // Depth is read with textureLoad only; the GL backend rejects loads
        // from depth-typed bindings.
        BindingKind::DepthImage => texture(wgpu::TextureSampleType::Float { filterable: false }),
        BindingKind::UintImage => texture(wgpu::TextureSampleType::Uint),
        BindingKind::Sampler => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::Src => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::Dst => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

fn blend_state(blend: BlendState) -> wgpu::BlendState {
    let component = |c: BlendComponent| wgpu::BlendComponent {
        src_factor: blend_factor(c.src),
        dst_factor: blend_factor(c.dst),
        operation: wgpu::BlendOperation::Add,
    };
    wgpu::BlendState {
        color: component(blend.color),
        alpha: component(blend.alpha),
    }
}

fn compare_function(compare: CompareFunction) -> wgpu::CompareFunction {
    match compare {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn color_load(load: LoadAction) -> wgpu::LoadOp<wgpu::Color> {
    match load {
        LoadAction::Load => wgpu::LoadOp::Load,
        LoadAction::Clear([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
            r: r as f64,
            g: g as f64,
            b: b as f64,
            a: a as f64,
        }),
        LoadAction::ClearDepth(_) | LoadAction::DontCare => wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
    }
}

fn depth_load(load: LoadAction) -> wgpu::LoadOp<f32> {
    match load {
        LoadAction::Load => wgpu::LoadOp::Load,
        LoadAction::ClearDepth(depth) => wgpu::LoadOp::Clear(depth),
        LoadAction::Clear([depth, ..]) => wgpu::LoadOp::Clear(depth),
        LoadAction::DontCare => wgpu::LoadOp::Clear(1.0),
    }
}

fn store_op(store: bool) -> wgpu::StoreOp {
    if store {
        wgpu::StoreOp::Store
    } else {
        wgpu::StoreOp::Discard
    }
}

/// Rounds a byte count up to wgpu's copy alignment.
fn aligned(size: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    (size + align - 1) / align * align
}

impl WgpuDevice {
    /// Picks an adapter (high performance, then low power, then fallback)
    /// and opens a device with the adapter's own limits.
    pub fn new() -> HairResult<Self> {
        pollster::block_on(Self::request())
    }

    async fn request() -> HairResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let mut options = wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        };
        let mut adapter = instance.request_adapter(&options).await;
        if adapter.is_none() {
            log::warn!("[WgpuDevice] No high-performance adapter found, trying low power...");
            options.power_preference = wgpu::PowerPreference::LowPower;
            adapter = instance.request_adapter(&options).await;
        }
        if adapter.is_none() {
            log::warn!("[WgpuDevice] No low-power adapter found, trying fallback...");
            options.force_fallback_adapter = true;
            adapter = instance.request_adapter(&options).await;
        }
        let adapter = adapter.ok_or_else(|| HairError::NoAdapter("no wgpu adapter found".to_string()))?;
        let info = adapter.get_info();
        log::info!("[WgpuDevice] Adapter: {} ({:?}, {:?})", info.name, info.device_type, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("strandfx device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| HairError::NoAdapter(e.to_string()))?;
        Ok(Self::from_device(device, queue))
    }

    /// Wraps a device the host already owns.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        device.on_uncaptured_error(Box::new(|error| {
            log::error!("[WgpuDevice] Uncaptured device error: {}", error);
        }));
        Self {
            device,
            queue,
            objects: FxHashMap::default(),
            next_id: 1,
            graphics: CommandList::new(),
            compute: CommandList::new(),
            tracker: StateTracker::new(),
            violations: 0,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Barriers seen so far whose `from` state disagreed with the tracker.
    pub fn violations(&self) -> usize {
        self.violations
    }

    pub fn texture_view(&self, id: ResourceId) -> Option<&wgpu::TextureView> {
        match self.objects.get(&id.0) {
            Some(WgpuObject::Image { view, .. }) => Some(view),
            _ => None,
        }
    }

    /// A color and a sampled depth image the hair renderers can composite into.
    pub fn create_scene_targets(&mut self, width: u32, height: u32) -> HairResult<SceneTargets> {
        let color = self.create_image(
            &ImageDesc::render_target("scene_color", width, height, ImageFormat::Rgba8UnormSrgb)
                .with_initial_state(ResourceState::RenderTarget),
        )?;
        let depth = self.create_image(
            &ImageDesc::depth("scene_depth", width, height).with_initial_state(ResourceState::DepthStencil),
        )?;
        Ok(SceneTargets {
            color,
            depth,
            width,
            height,
        })
    }

    fn insert(&mut self, object: WgpuObject) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(id, object);
        id
    }

    fn buffer(&self, id: ResourceId) -> HairResult<&wgpu::Buffer> {
        match self.objects.get(&id.0) {
            Some(WgpuObject::Buffer { buffer, .. }) => Ok(buffer),
            _ => Err(HairError::unknown_handle("buffer", id.0)),
        }
    }

    fn image(&self, id: ResourceId) -> HairResult<(&wgpu::TextureView, &ImageDesc)> {
        match self.objects.get(&id.0) {
            Some(WgpuObject::Image { view, desc, .. }) => Ok((view, desc)),
            _ => Err(HairError::unknown_handle("image", id.0)),
        }
    }

    fn bind_layout(&self, id: BindLayoutId) -> HairResult<(&wgpu::BindGroupLayout, &BindLayoutDesc)> {
        match self.objects.get(&id.0) {
            Some(WgpuObject::BindLayout { layout, desc }) => Ok((layout, desc)),
            _ => Err(HairError::unknown_handle("bind layout", id.0)),
        }
    }

    fn bind_group(&self, id: BindSetId) -> HairResult<&wgpu::BindGroup> {
        match self.objects.get(&id.0) {
            Some(WgpuObject::BindSet(group)) => Ok(group),
            _ => Err(HairError::unknown_handle("bind set", id.0)),
        }
    }

    fn render_target_set(&self, id: RenderTargetSetId) -> HairResult<&RenderTargetSetDesc> {
        match self.objects.get(&id.0) {
            Some(WgpuObject::RenderTargetSet(desc)) => Ok(desc),
            _ => Err(HairError::unknown_handle("render target set", id.0)),
        }
    }

    fn pipeline_layout(&self, label: &str, layouts: &[BindLayoutId]) -> HairResult<wgpu::PipelineLayout> {
        let layouts = layouts
            .iter()
            .map(|id| self.bind_layout(*id).map(|(layout, _)| layout))
            .collect::<HairResult<Vec<_>>>()?;
        Ok(self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &layouts,
            push_constant_ranges: &[],
        }))
    }

    /// Runs `create` inside a validation error scope so a bad shader or
    /// layout surfaces as an error instead of a device-lost later.
    fn validated<T>(&self, kind: &'static str, label: &str, create: impl FnOnce(&wgpu::Device) -> T) -> HairResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(HairError::resource_creation(kind, label, error.to_string())),
            None => Ok(value),
        }
    }

    fn encode(&self, commands: &[Command], label: &str) -> HairResult<wgpu::CommandBuffer> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        let mut pipeline = None;
        let mut sets: &[BindSetId] = &[];
        let mut i = 0;
        while i < commands.len() {
            match &commands[i] {
                // wgpu tracks hazards; the tracker already checked the states.
                Command::Barrier(_) => {}
                Command::BindPipeline(id) => pipeline = Some(*id),
                Command::BindSets { sets: bound, .. } => sets = bound,
                Command::Dispatch { groups_x } => {
                    let id = pipeline.hair_context("pipeline bound before dispatch")?;
                    let compute = match self.objects.get(&id.0) {
                        Some(WgpuObject::ComputePipeline { pipeline, .. }) => pipeline,
                        _ => return Err(HairError::unknown_handle("compute pipeline", id.0)),
                    };
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: None,
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(compute);
                    for (index, set) in sets.iter().enumerate() {
                        pass.set_bind_group(index as u32, self.bind_group(*set)?, &[]);
                    }
                    pass.dispatch_workgroups(*groups_x, 1, 1);
                }
                Command::UpdateBuffer { buffer, data } => self.encode_upload(&mut encoder, *buffer, data)?,
                Command::ClearU32 { resource, value } => {
                    let target = self.buffer(*resource)?;
                    if *value == 0 {
                        encoder.clear_buffer(target, 0, None);
                    } else {
                        let words = (target.size() / 4) as usize;
                        let fill: Vec<u32> = vec![*value; words];
                        self.encode_upload(&mut encoder, *resource, bytemuck::cast_slice(&fill))?;
                    }
                }
                Command::BeginRenderPass { targets, label } => {
                    let end = commands[i..]
                        .iter()
                        .position(|c| matches!(c, Command::EndRenderPass))
                        .map(|offset| i + offset)
                        .unwrap_or(commands.len());
                    self.encode_render_pass(&mut encoder, *targets, label, &commands[i + 1..end])?;
                    i = end;
                }
                Command::EndRenderPass => log::warn!("[WgpuDevice] End of a render pass that was never begun"),
                Command::Marker(label) => encoder.insert_debug_marker(label),
                Command::Draw { .. } | Command::DrawIndexed { .. } => {
                    log::warn!("[WgpuDevice] Draw outside a render pass dropped")
                }
            }
            i += 1;
        }
        Ok(encoder.finish())
    }

    fn encode_upload(&self, encoder: &mut wgpu::CommandEncoder, id: ResourceId, data: &[u8]) -> HairResult<()> {
        let target = self.buffer(id)?;
        let len = (data.len() as u64).min(target.size());
        if len < data.len() as u64 {
            log::warn!("[WgpuDevice] Upload of {} bytes truncated to {}", data.len(), len);
        }
        let size = aligned(len);
        if size == 0 {
            return Ok(());
        }
        let mut contents = data[..len as usize].to_vec();
        contents.resize(size as usize, 0);
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("strandfx upload"),
            contents: &contents,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        encoder.copy_buffer_to_buffer(&staging, 0, target, 0, size.min(target.size()));
        Ok(())
    }

    fn encode_render_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        targets: RenderTargetSetId,
        label: &str,
        commands: &[Command],
    ) -> HairResult<()> {
        let set = self.render_target_set(targets)?;
        let mut colors = Vec::new();
        let mut depth = None;
        for attachment in &set.attachments {
            let (view, desc) = self.image(attachment.resource)?;
            if desc.format.is_depth() {
                depth = Some(wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: depth_load(attachment.load),
                        store: store_op(attachment.store),
                    }),
                    stencil_ops: None,
                });
            } else {
                colors.push(Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load(attachment.load),
                        store: store_op(attachment.store),
                    },
                }));
            }
        }

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &colors,
            depth_stencil_attachment: depth,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        for command in commands {
            match command {
                Command::BindPipeline(id) => match self.objects.get(&id.0) {
                    Some(WgpuObject::RenderPipeline { pipeline, .. }) => pass.set_pipeline(pipeline),
                    _ => return Err(HairError::unknown_handle("render pipeline", id.0)),
                },
                Command::BindSets { sets, .. } => {
                    for (index, set) in sets.iter().enumerate() {
                        pass.set_bind_group(index as u32, self.bind_group(*set)?, &[]);
                    }
                }
                Command::Draw {
                    vertex_count,
                    instance_count,
                    ..
                } => pass.draw(0..*vertex_count, 0..*instance_count),
                Command::DrawIndexed {
                    index_buffer,
                    index_count,
                    instance_count,
                    ..
                } => {
                    pass.set_index_buffer(self.buffer(*index_buffer)?.slice(..), wgpu::IndexFormat::Uint32);
                    pass.draw_indexed(0..*index_count, 0, 0..*instance_count);
                }
                Command::Marker(label) => pass.insert_debug_marker(label),
                other => log::warn!("[WgpuDevice] {:?} is not allowed inside render pass '{}'", other, label),
            }
        }
        Ok(())
    }

    fn submit(&mut self, queue: QueueKind) -> HairResult<()> {
        let commands = match queue {
            QueueKind::Graphics => self.graphics.take(),
            QueueKind::Compute => self.compute.take(),
        };
        if commands.is_empty() {
            return Ok(());
        }
        let violations = self.tracker.apply_commands(&commands);
        for violation in &violations {
            log::warn!(
                "[WgpuDevice] Barrier on #{} expects {:?} but resource is {:?}",
                violation.barrier.resource.0,
                violation.barrier.from,
                violation.tracked
            );
        }
        self.violations += violations.len();

        let label = match queue {
            QueueKind::Graphics => "strandfx graphics",
            QueueKind::Compute => "strandfx compute",
        };
        let buffer = self.encode(&commands, label)?;
        self.queue.submit(Some(buffer));
        log::trace!("[WgpuDevice] Submitted {} commands ({:?})", commands.len(), queue);
        Ok(())
    }
}

impl RenderDevice for WgpuDevice {
    fn create_buffer(&mut self, desc: &BufferDesc) -> HairResult<ResourceId> {
        if desc.size == 0 {
            return Err(HairError::resource_creation("buffer", &desc.label, "zero-sized buffer"));
        }
        let mut usage = wgpu::BufferUsages::COPY_DST;
        if desc.usage.contains(BufferUsage::UNIFORM) {
            usage |= wgpu::BufferUsages::UNIFORM;
        }
        if desc.usage.contains(BufferUsage::STORAGE) {
            usage |= wgpu::BufferUsages::STORAGE;
        }
        if desc.usage.contains(BufferUsage::INDEX) {
            usage |= wgpu::BufferUsages::INDEX;
        }
        if desc.usage.contains(BufferUsage::COPY_SRC) {
            usage |= wgpu::BufferUsages::COPY_SRC;
        }
        let buffer = self.validated("buffer", &desc.label, |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&desc.label),
                size: aligned(desc.size),
                usage,
                mapped_at_creation: false,
            })
        })?;
        let id = ResourceId(self.insert(WgpuObject::Buffer {
            buffer,
            desc: desc.clone(),
        }));
        self.tracker.register(id, desc.initial_state);
        Ok(id)
    }

    fn create_image(&mut self, desc: &ImageDesc) -> HairResult<ResourceId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(HairError::resource_creation("image", &desc.label, "zero-sized image"));
        }
        let mut usage = wgpu::TextureUsages::empty();
        if desc.usage.contains(ImageUsage::SAMPLED) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if desc.usage.contains(ImageUsage::STORAGE) {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if desc.usage.contains(ImageUsage::RENDER_TARGET) {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC;
        }
        if desc.usage.contains(ImageUsage::COPY_DST) {
            usage |= wgpu::TextureUsages::COPY_DST;
        }
        let texture = self.validated("image", &desc.label, |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: texture_format(desc.format),
                usage,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = ResourceId(self.insert(WgpuObject::Image {
            _texture: texture,
            view,
            desc: desc.clone(),
        }));
        self.tracker.register(id, desc.initial_state);
        Ok(id)
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> HairResult<ResourceId> {
        let filter = match desc.filter {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        };
        let address = match desc.address {
            AddressMode::Clamp => wgpu::AddressMode::ClampToEdge,
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
        };
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("strandfx sampler"),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            ..Default::default()
        });
        Ok(ResourceId(self.insert(WgpuObject::Sampler(sampler))))
    }

    fn create_bind_layout(&mut self, desc: &BindLayoutDesc) -> HairResult<BindLayoutId> {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .slots
            .iter()
            .map(|slot| wgpu::BindGroupLayoutEntry {
                binding: slot.binding,
                visibility: shader_stages(slot.stages),
                ty: binding_type(slot.kind),
                count: None,
            })
            .collect();
        let layout = self.validated("bind layout", &desc.label, |device| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&desc.label),
                entries: &entries,
            })
        })?;
        Ok(BindLayoutId(self.insert(WgpuObject::BindLayout {
            layout,
            desc: desc.clone(),
        })))
    }

    fn create_bind_set(&mut self, desc: &BindSetDesc) -> HairResult<BindSetId> {
        let (layout, layout_desc) = self.bind_layout(desc.layout)?;
        if layout_desc.slots.len() != desc.resources.len() {
            return Err(HairError::resource_creation(
                "bind set",
                &desc.label,
                format!(
                    "layout has {} slots but {} resources were given",
                    layout_desc.slots.len(),
                    desc.resources.len()
                ),
            ));
        }
        let mut entries = Vec::with_capacity(desc.resources.len());
        for (slot, id) in layout_desc.slots.iter().zip(&desc.resources) {
            let resource = match (slot.kind, self.objects.get(&id.0)) {
                (
                    BindingKind::Constants | BindingKind::ReadOnlyBuffer | BindingKind::ReadWriteBuffer,
                    Some(WgpuObject::Buffer { buffer, .. }),
                ) => buffer.as_entire_binding(),
                (
                    BindingKind::SampledImage | BindingKind::DepthImage | BindingKind::UintImage,
                    Some(WgpuObject::Image { view, .. }),
                ) => wgpu::BindingResource::TextureView(view),
                (BindingKind::Sampler, Some(WgpuObject::Sampler(sampler))) => wgpu::BindingResource::Sampler(sampler),
                (kind, _) => {
                    return Err(HairError::resource_creation(
                        "bind set",
                        &desc.label,
                        format!("resource #{} does not fit slot {} ({:?})", id.0, slot.binding, kind),
                    ))
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: slot.binding,
                resource,
            });
        }
        let group = self.validated("bind set", &desc.label, |device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&desc.label),
                layout,
                entries: &entries,
            })
        })?;
        drop(entries);
        Ok(BindSetId(self.insert(WgpuObject::BindSet(group))))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc<'_>) -> HairResult<PipelineId> {
        let layout = self.pipeline_layout(desc.label, desc.layouts)?;
        let pipeline = self.validated("compute pipeline", desc.label, |device| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.shader.name),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&desc.shader.source)),
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&layout),
                module: &module,
                entry_point: desc.entry_point,
            })
        })?;
        log::debug!("[WgpuDevice] Created compute pipeline '{}'", desc.label);
        Ok(PipelineId(self.insert(WgpuObject::ComputePipeline {
            pipeline,
            label: desc.label.to_string(),
        })))
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> HairResult<PipelineId> {
        let layout = self.pipeline_layout(desc.label, desc.layouts)?;
        let set = self.render_target_set(desc.targets)?;
        let mut color_formats = Vec::new();
        let mut depth_format = None;
        for attachment in &set.attachments {
            let (_, image) = self.image(attachment.resource)?;
            if image.format.is_depth() {
                depth_format = Some(texture_format(image.format));
            } else {
                color_formats.push(texture_format(image.format));
            }
        }
        if color_formats.len() != desc.color_targets.len() {
            return Err(HairError::resource_creation(
                "graphics pipeline",
                desc.label,
                format!(
                    "{} color targets described for {} color attachments",
                    desc.color_targets.len(),
                    color_formats.len()
                ),
            ));
        }
        let targets: Vec<Option<wgpu::ColorTargetState>> = color_formats
            .iter()
            .zip(&desc.color_targets)
            .map(|(format, target)| {
                Some(wgpu::ColorTargetState {
                    format: *format,
                    blend: target.blend.map(blend_state),
                    write_mask: if target.write {
                        wgpu::ColorWrites::ALL
                    } else {
                        wgpu::ColorWrites::empty()
                    },
                })
            })
            .collect();
        let depth_stencil = depth_format.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: desc.depth.map(|d| d.write).unwrap_or(false),
            depth_compare: desc
                .depth
                .map(|d| compare_function(d.compare))
                .unwrap_or(wgpu::CompareFunction::Always),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });
        let topology = match desc.topology {
            Topology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        };

        let pipeline = self.validated("graphics pipeline", desc.label, |device| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.shader.name),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&desc.shader.source)),
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: desc.vertex_entry,
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: desc.fragment_entry,
                    targets: &targets,
                }),
                primitive: wgpu::PrimitiveState {
                    topology,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            })
        })?;
        log::debug!("[WgpuDevice] Created render pipeline '{}'", desc.label);
        Ok(PipelineId(self.insert(WgpuObject::RenderPipeline {
            pipeline,
            label: desc.label.to_string(),
        })))
    }

    fn create_render_target_set(&mut self, desc: &RenderTargetSetDesc) -> HairResult<RenderTargetSetId> {
        if desc.attachments.is_empty() {
            return Err(HairError::resource_creation("render target set", &desc.label, "no attachments"));
        }
        for attachment in &desc.attachments {
            self.image(attachment.resource)?;
        }
        Ok(RenderTargetSetId(self.insert(WgpuObject::RenderTargetSet(desc.clone()))))
    }

    fn release(&mut self, handle: Handle) {
        let id = match handle {
            Handle::Resource(id) => {
                self.tracker.forget(id);
                id.0
            }
            Handle::BindLayout(id) => id.0,
            Handle::BindSet(id) => id.0,
            Handle::Pipeline(id) => id.0,
            Handle::RenderTargetSet(id) => id.0,
        };
        match self.objects.remove(&id) {
            Some(WgpuObject::Buffer { buffer, .. }) => buffer.destroy(),
            Some(WgpuObject::ComputePipeline { label, .. } | WgpuObject::RenderPipeline { label, .. }) => {
                log::trace!("[WgpuDevice] Released pipeline '{}'", label)
            }
            Some(_) => {}
            None => log::warn!("[WgpuDevice] Release of unknown handle {:?}", handle),
        }
    }

    fn live_allocations(&self) -> usize {
        self.objects.len()
    }

    fn graphics_context(&mut self) -> &mut dyn CommandContext {
        &mut self.graphics
    }

    fn compute_context(&mut self) -> &mut dyn CommandContext {
        &mut self.compute
    }

    fn signal_compute_start(&mut self) {
        if let Err(error) = self.submit(QueueKind::Graphics) {
            log::error!("[WgpuDevice] Graphics submission before compute failed: {}", error);
        }
    }

    fn submit_compute(&mut self) -> HairResult<()> {
        self.submit(QueueKind::Compute)
    }

    fn wait_for_compute(&mut self) -> HairResult<()> {
        // One wgpu queue: graphics submitted later already runs after compute.
        log::trace!("[WgpuDevice] Compute wait satisfied by submission order");
        Ok(())
    }

    fn submit_frame(&mut self) -> HairResult<()> {
        self.submit(QueueKind::Graphics)
    }

    fn flush_gpu(&mut self) -> HairResult<()> {
        self.submit(QueueKind::Compute)?;
        self.submit(QueueKind::Graphics)?;
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn read_buffer(&mut self, id: ResourceId) -> HairResult<Vec<u8>> {
        self.submit(QueueKind::Graphics)?;
        let (source, label, size) = match self.objects.get(&id.0) {
            Some(WgpuObject::Buffer { buffer, desc }) => (buffer, desc.label.clone(), desc.size),
            _ => return Err(HairError::unknown_handle("buffer", id.0)),
        };
        if !source.usage().contains(wgpu::BufferUsages::COPY_SRC) {
            return Err(HairError::Readback {
                label,
                reason: "buffer was not created as a copy source".to_string(),
            });
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("strandfx readback"),
            size: aligned(size),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("strandfx readback") });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, aligned(size));
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(rx)
            .map_err(|_| HairError::Readback {
                label: label.clone(),
                reason: "map callback dropped".to_string(),
            })?
            .map_err(|e| HairError::Readback {
                label: label.clone(),
                reason: e.to_string(),
            })?;

        let data = slice.get_mapped_range();
        let bytes = data[..size as usize].to_vec();
        drop(data);
        staging.unmap();
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Option<WgpuDevice> {
        match WgpuDevice::new() {
            Ok(device) => Some(device),
            Err(error) => {
                eprintln!("skipping: {}", error);
                None
            }
        }
    }

    #[test]
    fn alignment_rounds_up_to_copy_size() {
        assert_eq!(aligned(0), 0);
        assert_eq!(aligned(1), 4);
        assert_eq!(aligned(8), 8);
    }

    #[test]
    #[ignore = "needs a GPU adapter"]
    fn upload_clear_and_readback_round_trip() {
        let Some(mut device) = device() else { return };
        let buffer = device.create_buffer(&BufferDesc::storage("data", 16)).unwrap();
        device.graphics_context().update_buffer(buffer, &[1, 2, 3, 4, 5]);
        assert_eq!(&device.read_buffer(buffer).unwrap()[..5], &[1, 2, 3, 4, 5]);

        device.graphics_context().clear_u32(buffer, 7);
        let words = (&mut device as &mut dyn RenderDevice).read_u32s(buffer).unwrap();
        assert_eq!(words, vec![7; 4]);
        device.release(buffer.into());
        assert_eq!(device.live_allocations(), 0);
    }
}
