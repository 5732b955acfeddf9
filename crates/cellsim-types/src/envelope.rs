//! Messages exchanged over the publish/subscribe bus.
//!
//! The bus carries [`Envelope`]s on logical [`Topic`]s. How an envelope is
//! encoded on the wire is up to the bus adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{Entity, EntityRef};
use crate::region_id::RegionId;
use crate::stimulus::ExternalStimulus;
use crate::structure::{PolicyKind, StructuralChange};

/// Logical bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Requests to spawn entities.
    EntityCreate,
    /// Requests to remove entities.
    EntityDestroy,
    /// Other external stimuli.
    ExternalStimulus,
    /// A simulation phase finished.
    PhaseCompletion,
    /// The partition changed shape.
    CellStructureChange,
    /// Swap the active reorganization policy.
    ReorganizationStrategyChange,
    /// A cell asks for help with its load.
    AssistanceRequest,
    /// A lightly loaded cell proposes merging with its sibling.
    SiblingOffer,
}

impl Topic {
    /// Every topic.
    pub const ALL: [Self; 8] = [
        Self::EntityCreate,
        Self::EntityDestroy,
        Self::ExternalStimulus,
        Self::PhaseCompletion,
        Self::CellStructureChange,
        Self::ReorganizationStrategyChange,
        Self::AssistanceRequest,
        Self::SiblingOffer,
    ];

    /// Stable topic name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EntityCreate => "entity-create",
            Self::EntityDestroy => "entity-destroy",
            Self::ExternalStimulus => "external-stimulus",
            Self::PhaseCompletion => "phase-completion",
            Self::CellStructureChange => "cell-structure-change",
            Self::ReorganizationStrategyChange => "reorganization-strategy-change",
            Self::AssistanceRequest => "assistance-request",
            Self::SiblingOffer => "sibling-offer",
        }
    }
}

/// The two halves of a simulation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Cells react, deliberate, and publish state.
    Environment,
    /// Agents decide on their next intentions.
    Agent,
}

/// Command-tagged bus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Command {
    /// Spawn an entity wherever it lands.
    EntityCreate(Entity),
    /// Remove an entity.
    EntityDestroy(EntityRef),
    /// Deliver a stimulus to the owning cell.
    Stimulus(ExternalStimulus),
    /// A phase finished.
    PhaseCompleted {
        /// Which phase.
        phase: Phase,
        /// Tick the phase belonged to.
        tick: u64,
        /// Leaf count at completion.
        leaves: usize,
    },
    /// A structural change was applied.
    StructureChanged {
        /// The applied change.
        change: StructuralChange,
        /// Leaf count after the change.
        leaves: usize,
    },
    /// Switch the reorganization policy.
    StrategyChange(PolicyKind),
    /// A cell is overloaded.
    AssistanceRequest {
        /// The overloaded leaf.
        region: RegionId,
        /// Its current load.
        load: f64,
    },
    /// A cell proposes merging with its sibling.
    SiblingOffer {
        /// The offering leaf.
        from: RegionId,
        /// Its sibling.
        to: RegionId,
        /// The offering leaf's load.
        load: f64,
    },
}

impl Command {
    /// The topic this command is published on.
    pub const fn topic(&self) -> Topic {
        match self {
            Self::EntityCreate(_) => Topic::EntityCreate,
            Self::EntityDestroy(_) => Topic::EntityDestroy,
            Self::Stimulus(_) => Topic::ExternalStimulus,
            Self::PhaseCompleted { .. } => Topic::PhaseCompletion,
            Self::StructureChanged { .. } => Topic::CellStructureChange,
            Self::StrategyChange(_) => Topic::ReorganizationStrategyChange,
            Self::AssistanceRequest { .. } => Topic::AssistanceRequest,
            Self::SiblingOffer { .. } => Topic::SiblingOffer,
        }
    }
}

/// A command stamped with the tick and wall-clock send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The payload.
    pub command: Command,
    /// Simulation tick at send time.
    pub tick: u64,
    /// Wall-clock send time.
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Wrap `command` stamped with `tick` and the current time.
    pub fn new(command: Command, tick: u64) -> Self {
        Self {
            command,
            tick,
            sent_at: Utc::now(),
        }
    }

    /// Topic of the wrapped command.
    pub const fn topic(&self) -> Topic {
        self.command.topic()
    }
}
