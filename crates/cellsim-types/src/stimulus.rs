//! Inputs a cell buffers between ticks.

use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;
use crate::ids::AgentId;
use crate::records::{Entity, EntityRef, EventRecord};

/// An external request against a cell's contents.
///
/// Stimuli are applied in arrival order during deliberate, after movement
/// has been resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExternalStimulus {
    /// Spawn a new entity; rejected on duplicate id or collidable overlap.
    Create(Entity),
    /// Remove an entity permanently.
    Destroy(EntityRef),
    /// Replace an existing entity's record.
    Modify(Entity),
    /// Hand over an entity migrating from another cell.
    Add(Entity),
    /// Hand over an entity leaving for another cell.
    Remove(EntityRef),
    /// Raise an event.
    Trigger(EventRecord),
}

impl ExternalStimulus {
    /// Reference to the entity this stimulus targets.
    pub const fn target(&self) -> EntityRef {
        match self {
            Self::Create(e) | Self::Modify(e) | Self::Add(e) => e.entity_ref(),
            Self::Destroy(r) | Self::Remove(r) => *r,
            Self::Trigger(event) => EntityRef::Event(event.id),
        }
    }

    /// Short name used in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Destroy(_) => "destroy",
            Self::Modify(_) => "modify",
            Self::Add(_) => "add",
            Self::Remove(_) => "remove",
            Self::Trigger(_) => "trigger",
        }
    }
}

/// Desired motion for one agent, produced by its behavior or by a user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intention {
    /// The agent the intention belongs to.
    pub agent_id: AgentId,
    /// Desired velocity in world units per second.
    pub velocity: Vec3,
    /// Desired heading; when absent the heading follows the velocity.
    pub heading: Option<f64>,
}

impl Intention {
    /// An intention to move with `velocity`.
    pub const fn moving(agent_id: AgentId, velocity: Vec3) -> Self {
        Self {
            agent_id,
            velocity,
            heading: None,
        }
    }

    /// An intention to stop.
    pub const fn halt(agent_id: AgentId) -> Self {
        Self::moving(agent_id, Vec3::ZERO)
    }
}
