use super::{Barrier, BindSetId, CommandContext, PipelineId, RenderTargetSetId, ResourceId};
use serde::Serialize;

/// One recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier(Vec<Barrier>),
    BindPipeline(PipelineId),
    BindSets {
        pipeline: PipelineId,
        sets: Vec<BindSetId>,
    },
    Dispatch {
        groups_x: u32,
    },
    Draw {
        pipeline: PipelineId,
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        pipeline: PipelineId,
        index_buffer: ResourceId,
        index_count: u32,
        instance_count: u32,
    },
    UpdateBuffer {
        buffer: ResourceId,
        data: Vec<u8>,
    },
    ClearU32 {
        resource: ResourceId,
        value: u32,
    },
    BeginRenderPass {
        targets: RenderTargetSetId,
        label: String,
    },
    EndRenderPass,
    Marker(String),
}

/// Counts of what a command list contains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    pub commands: usize,
    pub dispatches: usize,
    pub draws: usize,
    pub barriers: usize,
    pub render_passes: usize,
    pub uploads: usize,
    pub clears: usize,
}

impl std::ops::AddAssign for CommandStats {
    fn add_assign(&mut self, rhs: Self) {
        self.commands += rhs.commands;
        self.dispatches += rhs.dispatches;
        self.draws += rhs.draws;
        self.barriers += rhs.barriers;
        self.render_passes += rhs.render_passes;
        self.uploads += rhs.uploads;
        self.clears += rhs.clears;
    }
}

/// Backend-neutral command recording shared by every host.
#[derive(Debug, Default, Clone)]
pub struct CommandList {
    commands: Vec<Command>,
    in_render_pass: bool,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    /// Takes the recorded commands, leaving the list empty.
    pub fn take(&mut self) -> Vec<Command> {
        if self.in_render_pass {
            log::warn!("[CommandList] Taking commands while a render pass is still open");
            self.in_render_pass = false;
        }
        std::mem::take(&mut self.commands)
    }

    pub fn stats(&self) -> CommandStats {
        stats_of(&self.commands)
    }
}

pub(crate) fn stats_of(commands: &[Command]) -> CommandStats {
    let mut stats = CommandStats {
        commands: commands.len(),
        ..Default::default()
    };
    for command in commands {
        match command {
            Command::Barrier(batch) => stats.barriers += batch.len(),
            Command::Dispatch { .. } => stats.dispatches += 1,
            Command::Draw { .. } | Command::DrawIndexed { .. } => stats.draws += 1,
            Command::BeginRenderPass { .. } => stats.render_passes += 1,
            Command::UpdateBuffer { .. } => stats.uploads += 1,
            Command::ClearU32 { .. } => stats.clears += 1,
            _ => {}
        }
    }
    stats
}

impl CommandContext for CommandList {
    fn submit_barrier(&mut self, barriers: &[Barrier]) {
        if barriers.is_empty() {
            return;
        }
        self.commands.push(Command::Barrier(barriers.to_vec()));
    }

    fn bind_pipeline(&mut self, pipeline: PipelineId) {
        self.commands.push(Command::BindPipeline(pipeline));
    }

    fn bind_sets(&mut self, pipeline: PipelineId, sets: &[BindSetId]) {
        self.commands.push(Command::BindSets {
            pipeline,
            sets: sets.to_vec(),
        });
    }

    fn dispatch(&mut self, groups_x: u32) {
        if groups_x == 0 {
            return;
        }
        self.commands.push(Command::Dispatch { groups_x });
    }

    fn draw_instanced(&mut self, pipeline: PipelineId, vertex_count: u32, instance_count: u32) {
        self.commands.push(Command::Draw {
            pipeline,
            vertex_count,
            instance_count,
        });
    }

    fn draw_indexed_instanced(
        &mut self,
        pipeline: PipelineId,
        index_buffer: ResourceId,
        index_count: u32,
        instance_count: u32,
    ) {
        self.commands.push(Command::DrawIndexed {
            pipeline,
            index_buffer,
            index_count,
            instance_count,
        });
    }

    fn update_buffer(&mut self, buffer: ResourceId, data: &[u8]) {
        self.commands.push(Command::UpdateBuffer {
            buffer,
            data: data.to_vec(),
        });
    }

    fn clear_u32(&mut self, resource: ResourceId, value: u32) {
        self.commands.push(Command::ClearU32 { resource, value });
    }

    fn begin_render_pass(&mut self, targets: RenderTargetSetId, label: &str) {
        if self.in_render_pass {
            log::warn!("[CommandList] Render pass '{}' begun inside another pass", label);
        }
        self.in_render_pass = true;
        self.commands.push(Command::BeginRenderPass {
            targets,
            label: label.to_string(),
        });
    }

    fn end_render_pass(&mut self) {
        self.in_render_pass = false;
        self.commands.push(Command::EndRenderPass);
    }

    fn insert_marker(&mut self, label: &str) {
        self.commands.push(Command::Marker(label.to_string()));
    }
}
