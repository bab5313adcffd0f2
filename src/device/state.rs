use super::{CommandContext, ResourceId};
use rustc_hash::FxHashMap;

/// Usage state of a GPU resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ResourceState {
    Undefined,
    /// Read by shaders (SRV).
    ShaderRead,
    /// Read and written by shaders (UAV).
    ShaderReadWrite,
    CopyDest,
    CopySource,
    RenderTarget,
    DepthStencil,
    IndexBuffer,
    ConstantBuffer,
}

/// A state transition of one resource.
///
/// `from == to == ShaderReadWrite` is a write-visibility barrier between two
/// dependent dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub resource: ResourceId,
    pub from: ResourceState,
    pub to: ResourceState,
}

impl Barrier {
    pub fn transition(resource: ResourceId, from: ResourceState, to: ResourceState) -> Self {
        Self { resource, from, to }
    }

    pub fn uav(resource: ResourceId) -> Self {
        Self::transition(resource, ResourceState::ShaderReadWrite, ResourceState::ShaderReadWrite)
    }
}

/// A barrier whose `from` state disagreed with the tracked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateViolation {
    pub barrier: Barrier,
    pub tracked: ResourceState,
}

impl StateViolation {
    pub fn into_error(self, label: String) -> crate::error::HairError {
        crate::error::HairError::InvalidTransition {
            label,
            expected: self.barrier.from,
            actual: self.tracked,
        }
    }
}

/// Tracks the state of every resource across submitted command lists.
#[derive(Debug, Default)]
pub struct StateTracker {
    states: FxHashMap<ResourceId, ResourceState>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: ResourceId, state: ResourceState) {
        self.states.insert(resource, state);
    }

    pub fn forget(&mut self, resource: ResourceId) {
        self.states.remove(&resource);
    }

    pub fn state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.states.get(&resource).copied()
    }

    /// Applies a barrier. The tracked state follows `to` even on a mismatch
    /// so a single bad barrier is reported once.
    pub fn apply(&mut self, barrier: &Barrier) -> Result<(), StateViolation> {
        let tracked = self
            .states
            .insert(barrier.resource, barrier.to)
            .unwrap_or(ResourceState::Undefined);
        if tracked == barrier.from {
            Ok(())
        } else {
            Err(StateViolation {
                barrier: *barrier,
                tracked,
            })
        }
    }
}

impl StateTracker {
    /// Applies every barrier of a submitted list in order.
    pub fn apply_commands(&mut self, commands: &[super::Command]) -> Vec<StateViolation> {
        let mut violations = Vec::new();
        for command in commands {
            if let super::Command::Barrier(batch) = command {
                for barrier in batch {
                    if let Err(violation) = self.apply(barrier) {
                        violations.push(violation);
                    }
                }
            }
        }
        violations
    }
}

/// A resource together with the state it was last transitioned to.
///
/// Transitions to the current state emit nothing, so a boundary may be
/// crossed from either side without double barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedResource {
    pub id: ResourceId,
    pub state: ResourceState,
}

impl TrackedResource {
    pub fn new(id: ResourceId, state: ResourceState) -> Self {
        Self { id, state }
    }

    /// Returns the barrier needed to reach `to`, updating the tracked state.
    pub fn transition(&mut self, to: ResourceState) -> Option<Barrier> {
        if self.state == to {
            return None;
        }
        let barrier = Barrier::transition(self.id, self.state, to);
        self.state = to;
        Some(barrier)
    }

    pub fn transition_now(&mut self, ctx: &mut dyn CommandContext, to: ResourceState) {
        if let Some(barrier) = self.transition(to) {
            ctx.submit_barrier(&[barrier]);
        }
    }
}

/// Transitions several tracked resources with one barrier batch.
pub(crate) fn transition_all(
    ctx: &mut dyn CommandContext,
    resources: &mut [&mut TrackedResource],
    to: ResourceState,
) -> usize {
    let barriers: Vec<Barrier> = resources.iter_mut().filter_map(|r| r.transition(to)).collect();
    if !barriers.is_empty() {
        ctx.submit_barrier(&barriers);
    }
    barriers.len()
}
