//! Bind layouts shared by every hair component.
//!
//! All layouts are created once when the hair system starts and handed to
//! components by reference. Nothing here is mutated after construction.

use crate::device::{
    BindLayoutDesc, BindLayoutId, BindSetDesc, BindSetId, BindingKind, BufferDesc, RenderDevice, ResourceId,
    ShaderStages,
};
use crate::error::HairResult;
use crate::hair::gpu_types::{LightConstants, ViewConstants};

use BindingKind::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRegistry {
    /// Simulation constants and the five dynamic-state buffers.
    pub hair_simulation: BindLayoutId,
    /// Immutable per-object simulation inputs.
    pub hair_generation: BindLayoutId,
    /// Render constants, strand constants and render-time buffers.
    pub hair_object: BindLayoutId,
    pub view: BindLayoutId,
    pub light: BindLayoutId,
    pub sdf_build: BindLayoutId,
    pub sdf_sample: BindLayoutId,
    pub marching_cubes: BindLayoutId,
    pub marching_cubes_draw: BindLayoutId,
    pub ppll_fill: BindLayoutId,
    pub ppll_resolve: BindLayoutId,
    pub shortcut_fill: BindLayoutId,
    pub shortcut_depth_resolve: BindLayoutId,
    pub shortcut_color_resolve: BindLayoutId,
}

impl LayoutRegistry {
    pub fn new(device: &mut dyn RenderDevice) -> HairResult<Self> {
        let compute = ShaderStages::COMPUTE;
        let graphics = ShaderStages::GRAPHICS;
        let fragment = ShaderStages::FRAGMENT;

        let mut layout = |label: &str, stages: ShaderStages, kinds: &[BindingKind]| {
            device.create_bind_layout(&BindLayoutDesc::sequential(label, stages, kinds))
        };

        let registry = Self {
            hair_simulation: layout(
                "hair_simulation",
                compute,
                &[
                    Constants,
                    ReadWriteBuffer,
                    ReadWriteBuffer,
                    ReadWriteBuffer,
                    ReadWriteBuffer,
                    ReadWriteBuffer,
                ],
            )?,
            hair_generation: layout("hair_generation", compute, &[ReadOnlyBuffer; 6])?,
            hair_object: layout(
                "hair_object",
                graphics,
                &[
                    Constants,
                    Constants,
                    ReadOnlyBuffer,
                    ReadOnlyBuffer,
                    ReadOnlyBuffer,
                    ReadOnlyBuffer,
                ],
            )?,
            view: layout("view", graphics, &[Constants])?,
            light: layout("light", graphics, &[Constants])?,
            sdf_build: layout(
                "sdf_build",
                compute,
                &[Constants, ReadWriteBuffer, ReadOnlyBuffer, ReadOnlyBuffer],
            )?,
            sdf_sample: layout("sdf_sample", compute, &[Constants, ReadOnlyBuffer])?,
            marching_cubes: layout(
                "marching_cubes",
                compute,
                &[
                    Constants,
                    ReadOnlyBuffer,
                    ReadOnlyBuffer,
                    ReadOnlyBuffer,
                    ReadWriteBuffer,
                    ReadWriteBuffer,
                ],
            )?,
            marching_cubes_draw: layout("marching_cubes_draw", ShaderStages::VERTEX, &[ReadOnlyBuffer])?,
            ppll_fill: layout(
                "ppll_fill",
                fragment,
                &[ReadWriteBuffer, ReadWriteBuffer, ReadWriteBuffer, Constants, DepthImage],
            )?,
            ppll_resolve: layout("ppll_resolve", fragment, &[ReadOnlyBuffer, ReadOnlyBuffer, Constants])?,
            shortcut_fill: layout(
                "shortcut_fill",
                fragment,
                &[ReadWriteBuffer, ReadWriteBuffer, Constants, DepthImage],
            )?,
            shortcut_depth_resolve: layout("shortcut_depth_resolve", fragment, &[ReadOnlyBuffer, Constants])?,
            shortcut_color_resolve: layout("shortcut_color_resolve", fragment, &[SampledImage, SampledImage])?,
        };
        log::debug!("[LayoutRegistry] Created {} bind layouts", registry.all().len());
        Ok(registry)
    }

    fn all(&self) -> [BindLayoutId; 14] {
        [
            self.hair_simulation,
            self.hair_generation,
            self.hair_object,
            self.view,
            self.light,
            self.sdf_build,
            self.sdf_sample,
            self.marching_cubes,
            self.marching_cubes_draw,
            self.ppll_fill,
            self.ppll_resolve,
            self.shortcut_fill,
            self.shortcut_depth_resolve,
            self.shortcut_color_resolve,
        ]
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        for layout in self.all() {
            device.release(layout.into());
        }
    }
}

/// A constant block plus the single-slot bind set exposing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantSet {
    pub buffer: ResourceId,
    pub set: BindSetId,
}

impl ConstantSet {
    fn create(
        device: &mut dyn RenderDevice,
        layout: BindLayoutId,
        label: &str,
        data: &[u8],
    ) -> HairResult<Self> {
        let buffer = device.create_buffer_with_data(&BufferDesc::uniform(label, data.len() as u64), data)?;
        let set = device.create_bind_set(&BindSetDesc {
            label: label.to_string(),
            layout,
            resources: vec![buffer],
        })?;
        Ok(Self { buffer, set })
    }

    /// Camera constants bound at set 1 of every hair draw.
    pub fn view(device: &mut dyn RenderDevice, layouts: &LayoutRegistry, view: &ViewConstants) -> HairResult<Self> {
        Self::create(device, layouts.view, "view_constants", bytemuck::bytes_of(view))
    }

    /// Light constants bound at set 2 of every hair draw.
    pub fn light(device: &mut dyn RenderDevice, layouts: &LayoutRegistry, light: &LightConstants) -> HairResult<Self> {
        Self::create(device, layouts.light, "light_constants", bytemuck::bytes_of(light))
    }

    pub fn update<T: bytemuck::Pod>(&self, device: &mut dyn RenderDevice, value: &T) {
        device.graphics_context().update_buffer(self.buffer, bytemuck::bytes_of(value));
    }

    pub fn destroy(self, device: &mut dyn RenderDevice) {
        device.release(self.set.into());
        device.release(self.buffer.into());
    }
}
