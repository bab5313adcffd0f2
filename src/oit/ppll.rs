use crate::constants::NULL_NODE;
use crate::device::{
    transition_all, Attachment, BindSetDesc, BindSetId, BlendState, BufferDesc, ColorTarget, CommandContext,
    GraphicsPipelineDesc, PipelineId, RenderDevice, RenderTargetSetDesc, RenderTargetSetId, ResourceId,
    ResourceState, SceneTargets, Topology, TrackedResource,
};
use crate::error::HairResult;
use crate::hair::gpu_types::{OitConstants, PpllNode};
use crate::hair::HairObject;
use crate::layouts::LayoutRegistry;
use crate::oit::{OitMethod, OitRenderer, SceneState};
use crate::shaders::{self, ShaderSource};
use crate::system::CapacityReport;

/// Per-pixel linked lists: every hair fragment in front of the scene is
/// stored, then each pixel's list is sorted and blended in one resolve pass.
#[derive(Debug)]
pub struct PpllRenderer {
    scene: SceneState,
    heads: TrackedResource,
    nodes: TrackedResource,
    counter: TrackedResource,
    constants: ResourceId,
    node_capacity: u32,
    fill_set: BindSetId,
    resolve_set: BindSetId,
    targets: RenderTargetSetId,
    fill_pipeline: PipelineId,
    resolve_pipeline: PipelineId,
}

impl PpllRenderer {
    pub fn new(
        device: &mut dyn RenderDevice,
        layouts: &LayoutRegistry,
        scene: SceneTargets,
        average_fragments_per_pixel: u32,
    ) -> HairResult<Self> {
        let pixels = scene.width as u64 * scene.height as u64;
        let node_capacity = (pixels * average_fragments_per_pixel.max(1) as u64).min(u32::MAX as u64 - 1) as u32;

        let heads = device.create_buffer(&BufferDesc::uint32("ppll_heads", pixels))?;
        let nodes = device.create_buffer(&BufferDesc::storage(
            "ppll_nodes",
            node_capacity as u64 * std::mem::size_of::<PpllNode>() as u64,
        ))?;
        let counter = device.create_buffer(&BufferDesc::uint32("ppll_counter", 1))?;
        let oit = OitConstants {
            dims: [scene.width, scene.height, node_capacity, 0],
        };
        let constants = device.create_buffer_with_data(
            &BufferDesc::uniform("ppll_constants", std::mem::size_of::<OitConstants>() as u64),
            bytemuck::bytes_of(&oit),
        )?;

        let fill_set = device.create_bind_set(&BindSetDesc {
            label: "ppll_fill".to_string(),
            layout: layouts.ppll_fill,
            resources: vec![heads, nodes, counter, constants, scene.depth],
        })?;
        let resolve_set = device.create_bind_set(&BindSetDesc {
            label: "ppll_resolve".to_string(),
            layout: layouts.ppll_resolve,
            resources: vec![heads, nodes, constants],
        })?;
        let targets = device.create_render_target_set(&RenderTargetSetDesc {
            label: "ppll_color".to_string(),
            attachments: vec![Attachment::load(scene.color)],
        })?;

        let fill_shader = ShaderSource::load(shaders::PPLL_FILL)?;
        let fill_pipeline = device.create_graphics_pipeline(&GraphicsPipelineDesc {
            label: "ppll_fill",
            shader: &fill_shader,
            vertex_entry: "hair_vertex",
            fragment_entry: "ppll_fill",
            topology: Topology::TriangleList,
            layouts: &[layouts.hair_object, layouts.view, layouts.light, layouts.ppll_fill],
            targets,
            color_targets: vec![ColorTarget::MASKED],
            depth: None,
        })?;
        let resolve_shader = ShaderSource::load(shaders::PPLL_RESOLVE)?;
        let resolve_pipeline = device.create_graphics_pipeline(&GraphicsPipelineDesc {
            label: "ppll_resolve",
            shader: &resolve_shader,
            vertex_entry: "fullscreen_vertex",
            fragment_entry: "ppll_resolve",
            topology: Topology::TriangleList,
            layouts: &[layouts.ppll_resolve],
            targets,
            color_targets: vec![ColorTarget::blended(BlendState::PREMULTIPLIED)],
            depth: None,
        })?;

        log::info!(
            "[PpllRenderer] {}x{}, {} nodes ({} per pixel)",
            scene.width,
            scene.height,
            node_capacity,
            average_fragments_per_pixel
        );
        Ok(Self {
            scene: SceneState::new(scene),
            heads: TrackedResource::new(heads, ResourceState::Undefined),
            nodes: TrackedResource::new(nodes, ResourceState::ShaderReadWrite),
            counter: TrackedResource::new(counter, ResourceState::Undefined),
            constants,
            node_capacity,
            fill_set,
            resolve_set,
            targets,
            fill_pipeline,
            resolve_pipeline,
        })
    }

    pub fn node_capacity(&self) -> u32 {
        self.node_capacity
    }

    pub fn heads(&self) -> ResourceId {
        self.heads.id
    }

    pub fn counter(&self) -> ResourceId {
        self.counter.id
    }

    fn clear(&mut self, ctx: &mut dyn CommandContext) {
        // On the first frame the heads and counter leave `Undefined` here.
        transition_all(
            ctx,
            &mut [&mut self.heads, &mut self.nodes, &mut self.counter],
            ResourceState::ShaderReadWrite,
        );
        ctx.clear_u32(self.heads.id, NULL_NODE);
        ctx.clear_u32(self.counter.id, 0);
    }
}

impl OitRenderer for PpllRenderer {
    fn method(&self) -> OitMethod {
        OitMethod::Ppll
    }

    fn draw(&mut self, ctx: &mut dyn CommandContext, objects: &mut [HairObject], view_set: BindSetId, light_set: BindSetId) {
        ctx.insert_marker("ppll");
        self.clear(ctx);
        for object in objects.iter_mut() {
            object.dynamic_state_mut().transition_to_render(ctx);
        }
        self.scene.depth_to_sampled(ctx);

        ctx.begin_render_pass(self.targets, "ppll fill");
        for object in objects.iter() {
            object.draw_strands(ctx, self.fill_pipeline, &[view_set, light_set, self.fill_set]);
        }
        ctx.end_render_pass();

        transition_all(ctx, &mut [&mut self.heads, &mut self.nodes], ResourceState::ShaderRead);

        ctx.begin_render_pass(self.targets, "ppll resolve");
        ctx.bind_pipeline(self.resolve_pipeline);
        ctx.bind_sets(self.resolve_pipeline, &[self.resolve_set]);
        ctx.draw_instanced(self.resolve_pipeline, 3, 1);
        ctx.end_render_pass();

        self.scene.depth_to_attachment(ctx);
        log::trace!("[PpllRenderer] Recorded fill and resolve for {} objects", objects.len());
    }

    fn capacity_report(&self, device: &mut dyn RenderDevice) -> HairResult<Vec<CapacityReport>> {
        let used = device.read_u32s(self.counter.id)?.first().copied().unwrap_or(0);
        Ok(vec![CapacityReport {
            name: "ppll nodes".to_string(),
            used: used as u64,
            capacity: self.node_capacity as u64,
        }])
    }

    fn destroy(self: Box<Self>, device: &mut dyn RenderDevice) {
        device.release(self.fill_pipeline.into());
        device.release(self.resolve_pipeline.into());
        device.release(self.targets.into());
        device.release(self.fill_set.into());
        device.release(self.resolve_set.into());
        for buffer in [self.heads.id, self.nodes.id, self.counter.id, self.constants] {
            device.release(buffer.into());
        }
        log::debug!("[PpllRenderer] Destroyed");
    }
}
