//! Order-independent transparency for hair.
//!
//! Two methods share one entry point, [`OitRenderer::draw`]: per-pixel linked
//! lists ([`PpllRenderer`]) store and sort every fragment, ShortCut
//! ([`ShortCutRenderer`]) keeps the nearest few depths and accumulates color
//! in front of them. [`OitSystem`] owns the active method and swaps it at
//! runtime.

mod ppll;
pub mod reference;
mod shortcut;

pub use ppll::PpllRenderer;
pub use shortcut::ShortCutRenderer;

use crate::config::OitSettings;
use crate::device::{BindSetId, CommandContext, RenderDevice, ResourceState, SceneTargets, TrackedResource};
use crate::error::HairResult;
use crate::hair::HairObject;
use crate::layouts::LayoutRegistry;
use crate::system::CapacityReport;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OitMethod {
    /// Per-pixel linked lists.
    Ppll,
    /// K-buffer depth approximation with weighted color.
    #[default]
    ShortCut,
}

/// One transparency method.
pub trait OitRenderer: std::fmt::Debug {
    fn method(&self) -> OitMethod;

    /// Composites `objects` into the scene color. Objects are transitioned to
    /// their render state first.
    fn draw(&mut self, ctx: &mut dyn CommandContext, objects: &mut [HairObject], view_set: BindSetId, light_set: BindSetId);

    /// Usage of the fixed-size pools this method filled last frame.
    fn capacity_report(&self, device: &mut dyn RenderDevice) -> HairResult<Vec<CapacityReport>>;

    fn destroy(self: Box<Self>, device: &mut dyn RenderDevice);
}

/// The host scene attachments plus the state the OIT passes leave them in.
///
/// The host hands the depth buffer over as a depth attachment and gets it
/// back the same way; in between the fill passes sample it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SceneState {
    targets: SceneTargets,
    depth: TrackedResource,
}

impl SceneState {
    pub(crate) fn new(targets: SceneTargets) -> Self {
        Self {
            targets,
            depth: TrackedResource::new(targets.depth, ResourceState::DepthStencil),
        }
    }

    pub(crate) fn depth_to_sampled(&mut self, ctx: &mut dyn CommandContext) {
        self.depth.transition_now(ctx, ResourceState::ShaderRead);
    }

    pub(crate) fn depth_to_attachment(&mut self, ctx: &mut dyn CommandContext) {
        self.depth.transition_now(ctx, ResourceState::DepthStencil);
    }

    #[allow(dead_code)]
    pub(crate) fn targets(&self) -> SceneTargets {
        self.targets
    }
}

fn create_renderer(
    device: &mut dyn RenderDevice,
    layouts: &LayoutRegistry,
    scene: SceneTargets,
    settings: &OitSettings,
) -> HairResult<Box<dyn OitRenderer>> {
    Ok(match settings.method {
        OitMethod::Ppll => Box::new(PpllRenderer::new(
            device,
            layouts,
            scene,
            settings.average_fragments_per_pixel,
        )?),
        OitMethod::ShortCut => Box::new(ShortCutRenderer::new(device, layouts, scene)?),
    })
}

/// Owns the active transparency method and recreates it on method or
/// resolution changes.
#[derive(Debug)]
pub struct OitSystem {
    settings: OitSettings,
    layouts: LayoutRegistry,
    scene: SceneTargets,
    renderer: Box<dyn OitRenderer>,
}

impl OitSystem {
    pub fn new(
        device: &mut dyn RenderDevice,
        layouts: &LayoutRegistry,
        scene: SceneTargets,
        settings: &OitSettings,
    ) -> HairResult<Self> {
        let renderer = create_renderer(device, layouts, scene, settings)?;
        Ok(Self {
            settings: settings.clone(),
            layouts: *layouts,
            scene,
            renderer,
        })
    }

    pub fn method(&self) -> OitMethod {
        self.renderer.method()
    }

    pub fn scene(&self) -> SceneTargets {
        self.scene
    }

    pub fn renderer(&self) -> &dyn OitRenderer {
        self.renderer.as_ref()
    }

    /// Switches methods. In-flight work is flushed before the old method's
    /// resources are released. Returns `false` if `method` is already active.
    pub fn set_method(&mut self, device: &mut dyn RenderDevice, method: OitMethod) -> HairResult<bool> {
        if method == self.renderer.method() {
            return Ok(false);
        }
        let previous = self.renderer.method();
        self.settings.method = method;
        if let Err(error) = self.recreate(device, self.scene) {
            self.settings.method = previous;
            return Err(error);
        }
        log::info!("[OitSystem] Switched from {:?} to {:?}", previous, method);
        Ok(true)
    }

    /// Resizes every per-pixel resource to the new scene attachments.
    pub fn on_resize(&mut self, device: &mut dyn RenderDevice, scene: SceneTargets) -> HairResult<()> {
        self.recreate(device, scene)?;
        log::info!("[OitSystem] Resized to {}x{}", scene.width, scene.height);
        Ok(())
    }

    fn recreate(&mut self, device: &mut dyn RenderDevice, scene: SceneTargets) -> HairResult<()> {
        device.flush_gpu()?;
        // The old renderer stays alive until its replacement exists.
        let renderer = create_renderer(device, &self.layouts, scene, &self.settings)?;
        let old = std::mem::replace(&mut self.renderer, renderer);
        old.destroy(device);
        self.scene = scene;
        Ok(())
    }

    pub fn draw(&mut self, ctx: &mut dyn CommandContext, objects: &mut [HairObject], view_set: BindSetId, light_set: BindSetId) {
        self.renderer.draw(ctx, objects, view_set, light_set);
    }

    pub fn capacity_report(&self, device: &mut dyn RenderDevice) -> HairResult<Vec<CapacityReport>> {
        self.renderer.capacity_report(device)
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        self.renderer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RenderingSettings, SimulationSettings};
    use crate::device::{HeadlessDevice, ImageDesc, ImageFormat, QueueEvent};
    use crate::hair::gpu_types::{LightConstants, ViewConstants};
    use crate::hair::{FollowHairParams, HairAsset};
    use crate::layouts::ConstantSet;
    use glam::{Mat4, Vec3};

    struct Frame {
        device: HeadlessDevice,
        layouts: LayoutRegistry,
        scene: SceneTargets,
        view: ConstantSet,
        light: ConstantSet,
        objects: Vec<HairObject>,
    }

    fn scene_targets(device: &mut HeadlessDevice, width: u32, height: u32) -> SceneTargets {
        let color = device
            .create_image(
                &ImageDesc::render_target("scene_color", width, height, ImageFormat::Rgba8UnormSrgb)
                    .with_initial_state(ResourceState::RenderTarget),
            )
            .unwrap();
        let depth = device
            .create_image(&ImageDesc::depth("scene_depth", width, height).with_initial_state(ResourceState::DepthStencil))
            .unwrap();
        SceneTargets {
            color,
            depth,
            width,
            height,
        }
    }

    fn frame() -> Frame {
        let mut device = HeadlessDevice::new();
        let layouts = LayoutRegistry::new(&mut device).unwrap();
        let scene = scene_targets(&mut device, 32, 16);
        let view = ConstantSet::view(
            &mut device,
            &layouts,
            &ViewConstants::new(Mat4::IDENTITY, Vec3::new(0.0, 0.0, 3.0), 32, 16),
        )
        .unwrap();
        let light = ConstantSet::light(
            &mut device,
            &layouts,
            &LightConstants::directional(Vec3::NEG_Y, Vec3::ONE, Vec3::splat(0.1)),
        )
        .unwrap();
        let guides: Vec<Vec3> = (0..8).map(|i| Vec3::new(0.0, -0.05 * i as f32, 0.0)).collect();
        let asset = HairAsset::from_guide_strands("oit", 8, &guides, FollowHairParams::default()).unwrap();
        let object = HairObject::new(
            &mut device,
            &layouts,
            asset,
            &SimulationSettings::default(),
            &RenderingSettings::default(),
        )
        .unwrap();
        Frame {
            device,
            layouts,
            scene,
            view,
            light,
            objects: vec![object],
        }
    }

    fn settings(method: OitMethod) -> OitSettings {
        OitSettings {
            method,
            ..Default::default()
        }
    }

    fn draw(f: &mut Frame, oit: &mut OitSystem) {
        oit.draw(f.device.graphics_context(), &mut f.objects, f.view.set, f.light.set);
        f.device.submit_frame().unwrap();
    }

    #[test]
    fn ppll_records_fill_then_resolve_across_frames() {
        let mut f = frame();
        let mut oit = OitSystem::new(&mut f.device, &f.layouts, f.scene, &settings(OitMethod::Ppll)).unwrap();
        draw(&mut f, &mut oit);
        draw(&mut f, &mut oit);

        assert_eq!(
            f.device.executed_pipelines(),
            vec!["ppll_fill", "ppll_resolve", "ppll_fill", "ppll_resolve"]
        );
        assert!(f.device.violations().is_empty(), "{:?}", f.device.violations());
        assert_eq!(f.device.resource_state(f.scene.depth), Some(ResourceState::DepthStencil));
        assert_eq!(f.device.resource_state(f.objects[0].positions()), Some(ResourceState::ShaderRead));
    }

    #[test]
    fn shortcut_records_four_passes_across_frames() {
        let mut f = frame();
        let mut oit = OitSystem::new(&mut f.device, &f.layouts, f.scene, &settings(OitMethod::ShortCut)).unwrap();
        draw(&mut f, &mut oit);
        draw(&mut f, &mut oit);

        let passes = ["shortcut_depth_alpha", "shortcut_depth_resolve", "shortcut_color", "shortcut_color_resolve"];
        let expected: Vec<&str> = passes.iter().chain(passes.iter()).copied().collect();
        assert_eq!(f.device.executed_pipelines(), expected);
        assert!(f.device.violations().is_empty(), "{:?}", f.device.violations());
        assert_eq!(f.device.resource_state(f.scene.depth), Some(ResourceState::DepthStencil));
    }

    #[test]
    fn switching_methods_round_trip_leaks_nothing() {
        let mut f = frame();
        let mut oit = OitSystem::new(&mut f.device, &f.layouts, f.scene, &settings(OitMethod::Ppll)).unwrap();
        draw(&mut f, &mut oit);
        let before = f.device.live_allocations();

        assert!(oit.set_method(&mut f.device, OitMethod::ShortCut).unwrap());
        assert_eq!(oit.method(), OitMethod::ShortCut);
        draw(&mut f, &mut oit);
        assert!(oit.set_method(&mut f.device, OitMethod::Ppll).unwrap());
        draw(&mut f, &mut oit);

        assert_eq!(f.device.live_allocations(), before);
        assert_eq!(f.device.events().iter().filter(|e| **e == QueueEvent::Flush).count(), 2);
        assert!(f.device.violations().is_empty(), "{:?}", f.device.violations());
        assert!(!oit.set_method(&mut f.device, OitMethod::Ppll).unwrap());
    }

    #[test]
    fn resize_resizes_the_node_pool() {
        let mut f = frame();
        let mut oit = OitSystem::new(&mut f.device, &f.layouts, f.scene, &settings(OitMethod::Ppll)).unwrap();
        let reports = oit.capacity_report(&mut f.device).unwrap();
        assert_eq!(reports[0].capacity, 32 * 16 * 4);

        let bigger = scene_targets(&mut f.device, 64, 64);
        oit.on_resize(&mut f.device, bigger).unwrap();
        let reports = oit.capacity_report(&mut f.device).unwrap();
        assert_eq!(reports[0].capacity, 64 * 64 * 4);
        assert_eq!(oit.scene(), bigger);
        draw(&mut f, &mut oit);
        assert!(f.device.violations().is_empty());
    }

    #[test]
    fn ppll_overflow_is_reported() {
        let mut f = frame();
        let renderer = PpllRenderer::new(&mut f.device, &f.layouts, f.scene, 1).unwrap();
        assert_eq!(renderer.node_capacity(), 32 * 16);

        f.device
            .write_buffer(renderer.counter(), 0, &(32u32 * 16 + 100).to_le_bytes())
            .unwrap();
        let report = renderer.capacity_report(&mut f.device).unwrap().remove(0);
        assert_eq!(report.name, "ppll nodes");
        assert!(report.overflowed());
    }

    #[test]
    fn frame_clear_resets_heads_and_eviction_counter() {
        let mut f = frame();
        let mut ppll = PpllRenderer::new(&mut f.device, &f.layouts, f.scene, 4).unwrap();
        f.device.write_buffer(ppll.heads(), 0, &7u32.to_le_bytes()).unwrap();
        ppll.draw(f.device.graphics_context(), &mut f.objects, f.view.set, f.light.set);
        let heads = (&mut f.device as &mut dyn RenderDevice).read_u32s(ppll.heads()).unwrap();
        assert!(heads.iter().all(|h| *h == crate::constants::NULL_NODE));

        let mut shortcut = ShortCutRenderer::new(&mut f.device, &f.layouts, f.scene).unwrap();
        f.device.write_buffer(shortcut.evicted_counter(), 0, &9u32.to_le_bytes()).unwrap();
        shortcut.draw(f.device.graphics_context(), &mut f.objects, f.view.set, f.light.set);
        let report = shortcut.capacity_report(&mut f.device).unwrap().remove(0);
        assert_eq!(report.used, 0);
        assert!(!report.overflowed());
    }
}
