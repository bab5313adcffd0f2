use crate::constants::{FAR_DEPTH_BITS, SHORTCUT_K};
use crate::device::{
    transition_all, Attachment, BindSetDesc, BindSetId, BlendState, BufferDesc, ColorTarget, CommandContext,
    CompareFunction, DepthState, GraphicsPipelineDesc, ImageDesc, ImageFormat, PipelineId, RenderDevice,
    RenderTargetSetDesc, RenderTargetSetId, ResourceId, ResourceState, SceneTargets, Topology, TrackedResource,
};
use crate::error::HairResult;
use crate::hair::gpu_types::OitConstants;
use crate::hair::HairObject;
use crate::layouts::LayoutRegistry;
use crate::oit::{OitMethod, OitRenderer, SceneState};
use crate::shaders::{self, ShaderSource};
use crate::system::CapacityReport;

#[derive(Debug, Clone, Copy)]
struct ShortCutPipelines {
    depth_alpha: PipelineId,
    depth_resolve: PipelineId,
    color: PipelineId,
    color_resolve: PipelineId,
}

#[derive(Debug, Clone, Copy)]
struct ShortCutTargets {
    depth_alpha: RenderTargetSetId,
    depth_resolve: RenderTargetSetId,
    color: RenderTargetSetId,
    color_resolve: RenderTargetSetId,
}

/// Fixed-slot approximation: the nearest `SHORTCUT_K` depths per pixel are
/// kept, the K-th is written into the scene depth buffer and only fragments in
/// front of it are shaded. Hair is drawn twice per frame.
#[derive(Debug)]
pub struct ShortCutRenderer {
    scene: SceneState,
    depth_slots: TrackedResource,
    evicted: TrackedResource,
    constants: ResourceId,
    inverse_alpha: TrackedResource,
    color_accum: TrackedResource,
    fill_set: BindSetId,
    depth_resolve_set: BindSetId,
    color_resolve_set: BindSetId,
    targets: ShortCutTargets,
    pipelines: ShortCutPipelines,
}

impl ShortCutRenderer {
    pub fn new(device: &mut dyn RenderDevice, layouts: &LayoutRegistry, scene: SceneTargets) -> HairResult<Self> {
        let (width, height) = (scene.width, scene.height);
        let pixels = width as u64 * height as u64;

        let depth_slots = device.create_buffer(&BufferDesc::uint32("shortcut_depth_slots", pixels * SHORTCUT_K as u64))?;
        let evicted = device.create_buffer(&BufferDesc::uint32("shortcut_evicted", 1))?;
        let oit = OitConstants {
            dims: [width, height, 0, SHORTCUT_K],
        };
        let constants = device.create_buffer_with_data(
            &BufferDesc::uniform("shortcut_constants", std::mem::size_of::<OitConstants>() as u64),
            bytemuck::bytes_of(&oit),
        )?;
        let inverse_alpha =
            device.create_image(&ImageDesc::render_target("shortcut_inverse_alpha", width, height, ImageFormat::R16Float))?;
        let color_accum =
            device.create_image(&ImageDesc::render_target("shortcut_color_accum", width, height, ImageFormat::Rgba16Float))?;

        let fill_set = device.create_bind_set(&BindSetDesc {
            label: "shortcut_fill".to_string(),
            layout: layouts.shortcut_fill,
            resources: vec![depth_slots, evicted, constants, scene.depth],
        })?;
        let depth_resolve_set = device.create_bind_set(&BindSetDesc {
            label: "shortcut_depth_resolve".to_string(),
            layout: layouts.shortcut_depth_resolve,
            resources: vec![depth_slots, constants],
        })?;
        let color_resolve_set = device.create_bind_set(&BindSetDesc {
            label: "shortcut_color_resolve".to_string(),
            layout: layouts.shortcut_color_resolve,
            resources: vec![inverse_alpha, color_accum],
        })?;

        let mut target_set = |label: &str, attachments: Vec<Attachment>| {
            device.create_render_target_set(&RenderTargetSetDesc {
                label: label.to_string(),
                attachments,
            })
        };
        let targets = ShortCutTargets {
            depth_alpha: target_set("shortcut_depth_alpha", vec![Attachment::clear(inverse_alpha, [1.0; 4])])?,
            depth_resolve: target_set("shortcut_depth_resolve", vec![Attachment::load(scene.depth)])?,
            color: target_set(
                "shortcut_color",
                vec![Attachment::clear(color_accum, [0.0; 4]), Attachment::load(scene.depth)],
            )?,
            color_resolve: target_set("shortcut_color_resolve", vec![Attachment::load(scene.color)])?,
        };

        let fill_shader = ShaderSource::load(shaders::SHORTCUT_FILL)?;
        let depth_resolve_shader = ShaderSource::load(shaders::SHORTCUT_DEPTH_RESOLVE)?;
        let color_resolve_shader = ShaderSource::load(shaders::SHORTCUT_COLOR_RESOLVE)?;
        let hair_layouts = [layouts.hair_object, layouts.view, layouts.light];
        let fill_layouts = [layouts.hair_object, layouts.view, layouts.light, layouts.shortcut_fill];

        let pipelines = ShortCutPipelines {
            depth_alpha: device.create_graphics_pipeline(&GraphicsPipelineDesc {
                label: "shortcut_depth_alpha",
                shader: &fill_shader,
                vertex_entry: "hair_vertex",
                fragment_entry: "shortcut_depth_alpha",
                topology: Topology::TriangleList,
                layouts: &fill_layouts,
                targets: targets.depth_alpha,
                color_targets: vec![ColorTarget::blended(BlendState::MULTIPLY)],
                depth: None,
            })?,
            depth_resolve: device.create_graphics_pipeline(&GraphicsPipelineDesc {
                label: "shortcut_depth_resolve",
                shader: &depth_resolve_shader,
                vertex_entry: "fullscreen_vertex",
                fragment_entry: "shortcut_depth_resolve",
                topology: Topology::TriangleList,
                layouts: &[layouts.shortcut_depth_resolve],
                targets: targets.depth_resolve,
                color_targets: Vec::new(),
                depth: Some(DepthState {
                    compare: CompareFunction::Less,
                    write: true,
                }),
            })?,
            color: device.create_graphics_pipeline(&GraphicsPipelineDesc {
                label: "shortcut_color",
                shader: &fill_shader,
                vertex_entry: "hair_vertex",
                fragment_entry: "shortcut_color",
                topology: Topology::TriangleList,
                layouts: &hair_layouts,
                targets: targets.color,
                color_targets: vec![ColorTarget::blended(BlendState::ADDITIVE)],
                depth: Some(DepthState {
                    compare: CompareFunction::LessEqual,
                    write: false,
                }),
            })?,
            color_resolve: device.create_graphics_pipeline(&GraphicsPipelineDesc {
                label: "shortcut_color_resolve",
                shader: &color_resolve_shader,
                vertex_entry: "fullscreen_vertex",
                fragment_entry: "shortcut_color_resolve",
                topology: Topology::TriangleList,
                layouts: &[layouts.shortcut_color_resolve],
                targets: targets.color_resolve,
                color_targets: vec![ColorTarget::blended(BlendState::PREMULTIPLIED)],
                depth: None,
            })?,
        };

        log::info!("[ShortCutRenderer] {}x{}, {} depth slots per pixel", width, height, SHORTCUT_K);
        Ok(Self {
            scene: SceneState::new(scene),
            depth_slots: TrackedResource::new(depth_slots, ResourceState::Undefined),
            evicted: TrackedResource::new(evicted, ResourceState::Undefined),
            constants,
            inverse_alpha: TrackedResource::new(inverse_alpha, ResourceState::Undefined),
            color_accum: TrackedResource::new(color_accum, ResourceState::Undefined),
            fill_set,
            depth_resolve_set,
            color_resolve_set,
            targets,
            pipelines,
        })
    }

    pub fn depth_slots(&self) -> ResourceId {
        self.depth_slots.id
    }

    pub fn evicted_counter(&self) -> ResourceId {
        self.evicted.id
    }

    fn fullscreen(&self, ctx: &mut dyn CommandContext, pipeline: PipelineId, set: BindSetId) {
        ctx.bind_pipeline(pipeline);
        ctx.bind_sets(pipeline, &[set]);
        ctx.draw_instanced(pipeline, 3, 1);
    }
}

impl OitRenderer for ShortCutRenderer {
    fn method(&self) -> OitMethod {
        OitMethod::ShortCut
    }

    fn draw(&mut self, ctx: &mut dyn CommandContext, objects: &mut [HairObject], view_set: BindSetId, light_set: BindSetId) {
        ctx.insert_marker("shortcut");
        // On the first frame the slots and targets leave `Undefined` here.
        transition_all(
            ctx,
            &mut [&mut self.depth_slots, &mut self.evicted],
            ResourceState::ShaderReadWrite,
        );
        ctx.clear_u32(self.depth_slots.id, FAR_DEPTH_BITS);
        ctx.clear_u32(self.evicted.id, 0);
        for object in objects.iter_mut() {
            object.dynamic_state_mut().transition_to_render(ctx);
        }

        self.inverse_alpha.transition_now(ctx, ResourceState::RenderTarget);
        self.scene.depth_to_sampled(ctx);
        ctx.begin_render_pass(self.targets.depth_alpha, "shortcut depth alpha");
        for object in objects.iter() {
            object.draw_strands(ctx, self.pipelines.depth_alpha, &[view_set, light_set, self.fill_set]);
        }
        ctx.end_render_pass();

        self.depth_slots.transition_now(ctx, ResourceState::ShaderRead);
        self.scene.depth_to_attachment(ctx);
        ctx.begin_render_pass(self.targets.depth_resolve, "shortcut depth resolve");
        self.fullscreen(ctx, self.pipelines.depth_resolve, self.depth_resolve_set);
        ctx.end_render_pass();

        self.color_accum.transition_now(ctx, ResourceState::RenderTarget);
        ctx.begin_render_pass(self.targets.color, "shortcut color");
        for object in objects.iter() {
            object.draw_strands(ctx, self.pipelines.color, &[view_set, light_set]);
        }
        ctx.end_render_pass();

        transition_all(
            ctx,
            &mut [&mut self.inverse_alpha, &mut self.color_accum],
            ResourceState::ShaderRead,
        );
        ctx.begin_render_pass(self.targets.color_resolve, "shortcut color resolve");
        self.fullscreen(ctx, self.pipelines.color_resolve, self.color_resolve_set);
        ctx.end_render_pass();
        log::trace!("[ShortCutRenderer] Recorded four passes for {} objects", objects.len());
    }

    /// Fragments pushed out of the K slots; their coverage still counts but
    /// their color does not.
    fn capacity_report(&self, device: &mut dyn RenderDevice) -> HairResult<Vec<CapacityReport>> {
        let evicted = device.read_u32s(self.evicted.id)?.first().copied().unwrap_or(0);
        Ok(vec![CapacityReport {
            name: "shortcut evicted fragments".to_string(),
            used: evicted as u64,
            capacity: 0,
        }])
    }

    fn destroy(self: Box<Self>, device: &mut dyn RenderDevice) {
        let p = self.pipelines;
        for pipeline in [p.depth_alpha, p.depth_resolve, p.color, p.color_resolve] {
            device.release(pipeline.into());
        }
        let t = self.targets;
        for targets in [t.depth_alpha, t.depth_resolve, t.color, t.color_resolve] {
            device.release(targets.into());
        }
        for set in [self.fill_set, self.depth_resolve_set, self.color_resolve_set] {
            device.release(set.into());
        }
        for resource in [
            self.depth_slots.id,
            self.evicted.id,
            self.constants,
            self.inverse_alpha.id,
            self.color_accum.id,
        ] {
            device.release(resource.into());
        }
        log::debug!("[ShortCutRenderer] Destroyed");
    }
}
