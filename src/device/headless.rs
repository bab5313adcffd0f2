use super::command_list::stats_of;
use super::*;
use crate::error::{HairError, HairResult};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum QueueKind {
    Graphics,
    Compute,
}

/// Queue-level synchronisation observed by the headless host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum QueueEvent {
    SignalComputeStart,
    SubmitCompute,
    WaitForCompute,
    SubmitFrame,
    Flush,
}

#[derive(Debug, Clone)]
pub struct SubmittedList {
    pub queue: QueueKind,
    pub commands: Vec<Command>,
}

impl SubmittedList {
    pub fn stats(&self) -> CommandStats {
        stats_of(&self.commands)
    }
}

#[derive(Debug)]
struct HeadlessBuffer {
    desc: BufferDesc,
    contents: Vec<u8>,
}

#[derive(Debug)]
enum HeadlessObject {
    Buffer(HeadlessBuffer),
    Image(ImageDesc),
    Sampler(SamplerDesc),
    BindLayout(BindLayoutDesc),
    BindSet(BindSetDesc),
    Pipeline { label: String },
    RenderTargetSet(RenderTargetSetDesc),
}

impl HeadlessObject {
    fn kind(&self) -> &'static str {
        match self {
            HeadlessObject::Buffer(_) => "buffer",
            HeadlessObject::Image(_) => "image",
            HeadlessObject::Sampler(_) => "sampler",
            HeadlessObject::BindLayout(_) => "bind layout",
            HeadlessObject::BindSet(_) => "bind set",
            HeadlessObject::Pipeline { .. } => "pipeline",
            HeadlessObject::RenderTargetSet(_) => "render target set",
        }
    }

    fn label(&self) -> String {
        match self {
            HeadlessObject::Buffer(buffer) => buffer.desc.label.clone(),
            HeadlessObject::Image(desc) => desc.label.clone(),
            HeadlessObject::Sampler(desc) => format!("{:?}/{:?}", desc.filter, desc.address),
            HeadlessObject::BindLayout(desc) => desc.label.clone(),
            HeadlessObject::BindSet(desc) => desc.label.clone(),
            HeadlessObject::Pipeline { label } => label.clone(),
            HeadlessObject::RenderTargetSet(desc) => desc.label.clone(),
        }
    }
}

/// Host that records and validates work without a GPU.
///
/// Buffer uploads and clears are applied to CPU-side copies when a list is
/// submitted, so `read_buffer` returns what a GPU would hold if no shader
/// wrote to it. Tests emulate shader writes with [`HeadlessDevice::write_buffer`].
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    objects: FxHashMap<u32, HeadlessObject>,
    next_id: u32,
    graphics: CommandList,
    compute: CommandList,
    tracker: StateTracker,
    violations: Vec<StateViolation>,
    submitted: Vec<SubmittedList>,
    events: Vec<QueueEvent>,
    compute_in_flight: bool,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    fn allocate(&mut self, object: HeadlessObject) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        log::trace!("[HeadlessDevice] Created {} '{}' #{}", object.kind(), object.label(), id);
        self.objects.insert(id, object);
        id
    }

    fn expect_kind(&self, id: u32, kind: &'static str) -> HairResult<&HeadlessObject> {
        match self.objects.get(&id) {
            Some(object) if object.kind() == kind => Ok(object),
            _ => Err(HairError::unknown_handle(kind, id)),
        }
    }

    fn resource_exists(&self, id: ResourceId) -> bool {
        matches!(
            self.objects.get(&id.0),
            Some(HeadlessObject::Buffer(_) | HeadlessObject::Image(_) | HeadlessObject::Sampler(_))
        )
    }

    fn apply(&mut self, queue: QueueKind, commands: Vec<Command>) {
        let violations = self.tracker.apply_commands(&commands);
        for violation in &violations {
            log::warn!(
                "[HeadlessDevice] Barrier on #{} expects {:?} but resource is {:?}",
                violation.barrier.resource.0,
                violation.barrier.from,
                violation.tracked
            );
        }
        self.violations.extend(violations);

        for command in &commands {
            match command {
                Command::UpdateBuffer { buffer, data } => {
                    if let Some(HeadlessObject::Buffer(target)) = self.objects.get_mut(&buffer.0) {
                        let len = data.len().min(target.contents.len());
                        if len < data.len() {
                            log::warn!(
                                "[HeadlessDevice] Upload of {} bytes truncated to buffer '{}' ({} bytes)",
                                data.len(),
                                target.desc.label,
                                target.contents.len()
                            );
                        }
                        target.contents[..len].copy_from_slice(&data[..len]);
                    } else {
                        log::warn!("[HeadlessDevice] Upload to unknown buffer #{}", buffer.0);
                    }
                }
                Command::ClearU32 { resource, value } => {
                    if let Some(HeadlessObject::Buffer(target)) = self.objects.get_mut(&resource.0) {
                        for word in target.contents.chunks_exact_mut(4) {
                            word.copy_from_slice(&value.to_le_bytes());
                        }
                    }
                }
                Command::BindSets { sets, .. } => {
                    for set in sets {
                        match self.objects.get(&set.0) {
                            Some(HeadlessObject::BindSet(desc)) => {
                                if let Some(stale) = desc.resources.iter().find(|r| !self.resource_exists(**r)) {
                                    log::warn!(
                                        "[HeadlessDevice] Bind set '{}' references released resource #{}",
                                        desc.label,
                                        stale.0
                                    );
                                }
                            }
                            _ => log::warn!("[HeadlessDevice] Bound unknown bind set #{}", set.0),
                        }
                    }
                }
                _ => {}
            }
        }

        if !commands.is_empty() {
            self.submitted.push(SubmittedList { queue, commands });
        }
    }

    /// Barriers whose `from` state did not match the tracked state.
    pub fn violations(&self) -> &[StateViolation] {
        &self.violations
    }

    pub fn take_violations(&mut self) -> Vec<StateViolation> {
        std::mem::take(&mut self.violations)
    }

    /// Drains the violation log, failing with the first entry if any.
    pub fn check_transitions(&mut self) -> HairResult<()> {
        let violations = self.take_violations();
        match violations.first() {
            Some(violation) => {
                let label = self.object_label(violation.barrier.resource.0);
                Err(violation.into_error(label.unwrap_or_else(|| format!("#{}", violation.barrier.resource.0))))
            }
            None => Ok(()),
        }
    }

    /// Label a live object was created with.
    pub fn object_label(&self, id: u32) -> Option<String> {
        self.objects.get(&id).map(HeadlessObject::label)
    }

    pub fn submitted(&self) -> &[SubmittedList] {
        &self.submitted
    }

    pub fn take_submitted(&mut self) -> Vec<SubmittedList> {
        std::mem::take(&mut self.submitted)
    }

    pub fn events(&self) -> &[QueueEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Commands recorded on the graphics context and not yet submitted.
    pub fn pending_graphics(&self) -> &[Command] {
        self.graphics.commands()
    }

    pub fn pending_compute(&self) -> &[Command] {
        self.compute.commands()
    }

    pub fn resource_state(&self, id: ResourceId) -> Option<ResourceState> {
        self.tracker.state(id)
    }

    /// Emulates a shader writing into a buffer.
    pub fn write_buffer(&mut self, id: ResourceId, offset: usize, data: &[u8]) -> HairResult<()> {
        match self.objects.get_mut(&id.0) {
            Some(HeadlessObject::Buffer(target)) => {
                let end = offset + data.len();
                if end > target.contents.len() {
                    return Err(HairError::Readback {
                        label: target.desc.label.clone(),
                        reason: format!("write of {} bytes at {} overruns buffer", data.len(), offset),
                    });
                }
                target.contents[offset..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(HairError::unknown_handle("buffer", id.0)),
        }
    }

    pub fn buffer_desc(&self, id: ResourceId) -> Option<&BufferDesc> {
        match self.objects.get(&id.0) {
            Some(HeadlessObject::Buffer(buffer)) => Some(&buffer.desc),
            _ => None,
        }
    }

    pub fn image_desc(&self, id: ResourceId) -> Option<&ImageDesc> {
        match self.objects.get(&id.0) {
            Some(HeadlessObject::Image(desc)) => Some(desc),
            _ => None,
        }
    }

    pub fn pipeline_label(&self, id: PipelineId) -> Option<&str> {
        match self.objects.get(&id.0) {
            Some(HeadlessObject::Pipeline { label }) => Some(label.as_str()),
            _ => None,
        }
    }

    /// Labels of pipelines dispatched or drawn, in submission order.
    pub fn executed_pipelines(&self) -> Vec<String> {
        let mut labels = Vec::new();
        let mut bound = None;
        for list in &self.submitted {
            for command in &list.commands {
                match command {
                    Command::BindPipeline(id) => bound = Some(*id),
                    Command::Dispatch { .. } => {
                        if let Some(label) = bound.and_then(|id| self.pipeline_label(id)) {
                            labels.push(label.to_string());
                        }
                    }
                    Command::Draw { pipeline, .. } | Command::DrawIndexed { pipeline, .. } => {
                        if let Some(label) = self.pipeline_label(*pipeline) {
                            labels.push(label.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
        labels
    }

    /// Ids of every live buffer whose label matches.
    pub fn buffers_labelled(&self, label: &str) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self
            .objects
            .iter()
            .filter_map(|(id, object)| match object {
                HeadlessObject::Buffer(buffer) if buffer.desc.label == label => Some(ResourceId(*id)),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }
}

impl RenderDevice for HeadlessDevice {
    fn create_buffer(&mut self, desc: &BufferDesc) -> HairResult<ResourceId> {
        if desc.size == 0 {
            return Err(HairError::resource_creation("buffer", &desc.label, "zero-sized buffer"));
        }
        let size = usize::try_from(desc.size)
            .map_err(|_| HairError::resource_creation("buffer", &desc.label, "size exceeds host memory"))?;
        let id = ResourceId(self.allocate(HeadlessObject::Buffer(HeadlessBuffer {
            desc: desc.clone(),
            contents: vec![0; size],
        })));
        self.tracker.register(id, desc.initial_state);
        Ok(id)
    }

    fn create_image(&mut self, desc: &ImageDesc) -> HairResult<ResourceId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(HairError::resource_creation("image", &desc.label, "zero-sized image"));
        }
        let id = ResourceId(self.allocate(HeadlessObject::Image(desc.clone())));
        self.tracker.register(id, desc.initial_state);
        Ok(id)
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> HairResult<ResourceId> {
        Ok(ResourceId(self.allocate(HeadlessObject::Sampler(*desc))))
    }

    fn create_bind_layout(&mut self, desc: &BindLayoutDesc) -> HairResult<BindLayoutId> {
        Ok(BindLayoutId(self.allocate(HeadlessObject::BindLayout(desc.clone()))))
    }

    fn create_bind_set(&mut self, desc: &BindSetDesc) -> HairResult<BindSetId> {
        let slots = match self.expect_kind(desc.layout.0, "bind layout")? {
            HeadlessObject::BindLayout(layout) => layout.slots.len(),
            _ => 0,
        };
        if slots != desc.resources.len() {
            return Err(HairError::resource_creation(
                "bind set",
                &desc.label,
                format!("layout has {} slots but {} resources were given", slots, desc.resources.len()),
            ));
        }
        if let Some(missing) = desc.resources.iter().find(|r| !self.resource_exists(**r)) {
            return Err(HairError::unknown_handle("resource", missing.0));
        }
        Ok(BindSetId(self.allocate(HeadlessObject::BindSet(desc.clone()))))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc<'_>) -> HairResult<PipelineId> {
        for layout in desc.layouts {
            self.expect_kind(layout.0, "bind layout")?;
        }
        if !desc.shader.declares_entry_point(desc.entry_point) {
            return Err(HairError::resource_creation(
                "compute pipeline",
                desc.label,
                format!("shader '{}' has no entry point '{}'", desc.shader.name, desc.entry_point),
            ));
        }
        Ok(PipelineId(self.allocate(HeadlessObject::Pipeline {
            label: desc.label.to_string(),
        })))
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> HairResult<PipelineId> {
        for layout in desc.layouts {
            self.expect_kind(layout.0, "bind layout")?;
        }
        let color_attachments = match self.expect_kind(desc.targets.0, "render target set")? {
            HeadlessObject::RenderTargetSet(set) => set
                .attachments
                .iter()
                .filter(|a| !matches!(self.objects.get(&a.resource.0), Some(HeadlessObject::Image(image)) if image.format.is_depth()))
                .count(),
            _ => 0,
        };
        if color_attachments != desc.color_targets.len() {
            return Err(HairError::resource_creation(
                "graphics pipeline",
                desc.label,
                format!(
                    "{} color targets described for {} color attachments",
                    desc.color_targets.len(),
                    color_attachments
                ),
            ));
        }
        for entry in [desc.vertex_entry, desc.fragment_entry] {
            if !desc.shader.declares_entry_point(entry) {
                return Err(HairError::resource_creation(
                    "graphics pipeline",
                    desc.label,
                    format!("shader '{}' has no entry point '{}'", desc.shader.name, entry),
                ));
            }
        }
        Ok(PipelineId(self.allocate(HeadlessObject::Pipeline {
            label: desc.label.to_string(),
        })))
    }

    fn create_render_target_set(&mut self, desc: &RenderTargetSetDesc) -> HairResult<RenderTargetSetId> {
        if desc.attachments.is_empty() {
            return Err(HairError::resource_creation("render target set", &desc.label, "no attachments"));
        }
        for attachment in &desc.attachments {
            self.expect_kind(attachment.resource.0, "image")?;
        }
        Ok(RenderTargetSetId(self.allocate(HeadlessObject::RenderTargetSet(desc.clone()))))
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
        if self.objects.remove(&id).is_none() {
            log::warn!("[HeadlessDevice] Release of unknown handle {:?}", handle);
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
        // Graphics work recorded so far must be ordered before the compute list.
        let commands = self.graphics.take();
        self.apply(QueueKind::Graphics, commands);
        self.events.push(QueueEvent::SignalComputeStart);
    }

    fn submit_compute(&mut self) -> HairResult<()> {
        let commands = self.compute.take();
        self.apply(QueueKind::Compute, commands);
        self.events.push(QueueEvent::SubmitCompute);
        self.compute_in_flight = true;
        Ok(())
    }

    fn wait_for_compute(&mut self) -> HairResult<()> {
        if !self.compute_in_flight {
            log::debug!("[HeadlessDevice] Wait for compute with nothing in flight");
        }
        self.compute_in_flight = false;
        self.events.push(QueueEvent::WaitForCompute);
        Ok(())
    }

    fn submit_frame(&mut self) -> HairResult<()> {
        let commands = self.graphics.take();
        self.apply(QueueKind::Graphics, commands);
        self.events.push(QueueEvent::SubmitFrame);
        Ok(())
    }

    fn flush_gpu(&mut self) -> HairResult<()> {
        let compute = self.compute.take();
        self.apply(QueueKind::Compute, compute);
        let graphics = self.graphics.take();
        self.apply(QueueKind::Graphics, graphics);
        self.compute_in_flight = false;
        self.events.push(QueueEvent::Flush);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: ResourceId) -> HairResult<Vec<u8>> {
        let commands = self.graphics.take();
        self.apply(QueueKind::Graphics, commands);
        match self.objects.get(&buffer.0) {
            Some(HeadlessObject::Buffer(target)) => Ok(target.contents.clone()),
            _ => Err(HairError::unknown_handle("buffer", buffer.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(device: &mut HeadlessDevice, label: &str, bytes: u64) -> ResourceId {
        device.create_buffer(&BufferDesc::storage(label, bytes)).unwrap()
    }

    #[test]
    fn uploads_and_clears_apply_on_submit() {
        let mut device = HeadlessDevice::new();
        let buffer = storage(&mut device, "data", 16);

        device.graphics_context().update_buffer(buffer, &[1, 2, 3, 4]);
        assert_eq!(&device.read_buffer(buffer).unwrap()[..4], &[1, 2, 3, 4]);

        device.graphics_context().clear_u32(buffer, 0xFFFF_FFFF);
        let words = (&mut device as &mut dyn RenderDevice).read_u32s(buffer).unwrap();
        assert_eq!(words, vec![0xFFFF_FFFF; 4]);
    }

    #[test]
    fn release_returns_allocation_count_to_baseline() {
        let mut device = HeadlessDevice::new();
        let baseline = device.live_allocations();
        let buffer = storage(&mut device, "a", 4);
        let layout = device
            .create_bind_layout(&BindLayoutDesc::sequential("l", ShaderStages::COMPUTE, &[BindingKind::ReadWriteBuffer]))
            .unwrap();
        let set = device
            .create_bind_set(&BindSetDesc {
                label: "s".into(),
                layout,
                resources: vec![buffer],
            })
            .unwrap();
        assert_eq!(device.live_allocations(), baseline + 3);

        device.release(set.into());
        device.release(layout.into());
        device.release(buffer.into());
        assert_eq!(device.live_allocations(), baseline);
    }

    #[test]
    fn bind_set_must_match_layout() {
        let mut device = HeadlessDevice::new();
        let layout = device
            .create_bind_layout(&BindLayoutDesc::sequential(
                "two",
                ShaderStages::COMPUTE,
                &[BindingKind::ReadWriteBuffer, BindingKind::ReadWriteBuffer],
            ))
            .unwrap();
        let buffer = storage(&mut device, "only", 4);
        let result = device.create_bind_set(&BindSetDesc {
            label: "short".into(),
            layout,
            resources: vec![buffer],
        });
        assert!(result.is_err());
    }

    #[test]
    fn mismatched_barrier_is_recorded_as_violation() {
        let mut device = HeadlessDevice::new();
        let buffer = storage(&mut device, "positions", 16);
        device.graphics_context().submit_barrier(&[Barrier::transition(
            buffer,
            ResourceState::ShaderRead,
            ResourceState::ShaderReadWrite,
        )]);
        device.submit_frame().unwrap();
        assert_eq!(device.violations().len(), 1);
        assert_eq!(device.resource_state(buffer), Some(ResourceState::ShaderReadWrite));

        match device.check_transitions() {
            Err(HairError::InvalidTransition { label, expected, actual }) => {
                assert_eq!(label, "positions");
                assert_eq!(expected, ResourceState::ShaderRead);
                assert_eq!(actual, ResourceState::ShaderReadWrite);
            }
            other => panic!("expected an invalid transition, got {:?}", other),
        }
        assert!(device.violations().is_empty());
        assert!(device.check_transitions().is_ok());
    }

    #[test]
    fn objects_keep_their_creation_labels() {
        let mut device = HeadlessDevice::new();
        let buffer = storage(&mut device, "nodes", 16);
        let sampler = device
            .create_sampler(&SamplerDesc {
                filter: FilterMode::Linear,
                address: AddressMode::Clamp,
            })
            .unwrap();
        let layout = device
            .create_bind_layout(&BindLayoutDesc {
                label: "one_buffer".into(),
                slots: vec![BindingSlot::new(0, BindingKind::ReadWriteBuffer, ShaderStages::COMPUTE)],
            })
            .unwrap();
        let set = device
            .create_bind_set(&BindSetDesc {
                label: "nodes_set".into(),
                layout,
                resources: vec![buffer],
            })
            .unwrap();

        assert_eq!(device.object_label(buffer.0).as_deref(), Some("nodes"));
        assert_eq!(device.object_label(sampler.0).as_deref(), Some("Linear/Clamp"));
        assert_eq!(device.object_label(set.0).as_deref(), Some("nodes_set"));
        device.release(set.into());
        assert_eq!(device.object_label(set.0), None);
    }

    #[test]
    fn compute_submission_is_logged_in_order() {
        let mut device = HeadlessDevice::new();
        device.signal_compute_start();
        device.compute_context().insert_marker("sim");
        device.submit_compute().unwrap();
        device.wait_for_compute().unwrap();
        device.submit_frame().unwrap();

        assert_eq!(
            device.events(),
            &[
                QueueEvent::SignalComputeStart,
                QueueEvent::SubmitCompute,
                QueueEvent::WaitForCompute,
                QueueEvent::SubmitFrame
            ]
        );
        assert_eq!(device.submitted()[0].queue, QueueKind::Compute);
    }
}
