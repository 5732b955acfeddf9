//! Structural change requests and reorganization policy names.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::region_id::RegionId;

/// Where a split places its plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Midpoint of the longer horizontal axis.
    #[default]
    Midpoint,
    /// Centroid of the contained agents along the longer horizontal axis.
    Demographic,
}

/// A request to restructure the partition.
///
/// Requests are queued and applied serially by the orchestrator; a request
/// that no longer fits the tree when drained is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructuralChange {
    /// Split the leaf `cell` into two children.
    Split {
        /// Leaf to split.
        cell: RegionId,
        /// Plane placement.
        strategy: SplitStrategy,
    },
    /// Merge the leaf `cell` with its sibling into their parent.
    Merge {
        /// Either leaf of the sibling pair.
        cell: RegionId,
    },
}

impl StructuralChange {
    /// The region the request names.
    pub const fn cell(&self) -> RegionId {
        match self {
            Self::Split { cell, .. } | Self::Merge { cell } => *cell,
        }
    }
}

impl fmt::Display for StructuralChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split { cell, strategy } => write!(f, "split {cell} ({strategy:?})"),
            Self::Merge { cell } => write!(f, "merge {cell}"),
        }
    }
}

/// Named reorganization policies selectable from config or at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Never reorganize.
    NoOp,
    /// Merge leaves until a single cell remains.
    CollapseToOne,
    /// Threshold on agent count, cells visited in region order.
    #[default]
    AgentThreshold,
    /// Threshold on agent and object load, cells visited in region order.
    EntityThreshold,
    /// Threshold on agent count, heaviest cells first.
    GreedyAgent,
    /// Threshold on entity load, heaviest cells first.
    GreedyEntity,
    /// Greedy agent threshold with cell budget and hysteresis.
    FairAgent,
    /// Greedy entity threshold with cell budget and hysteresis.
    FairEntity,
    /// Neighbor-weighted urgency ranking.
    Urgency,
    /// React to the single most urgent assistance alert.
    BottomUp,
    /// Bottom-up alerts with hysteresis and idle merging.
    Autonomic,
}
