//! Error types for the `cellsim-space` crate.
//!
//! [`StructuralError`] and [`RoutingError`] are recoverable: the caller drops
//! the offending request and carries on. [`InvariantViolation`] means the
//! tree itself is corrupt and the simulation cannot continue.

use cellsim_types::{EntityRef, RegionId, Vec3};

/// A split or merge request that cannot be applied to the current tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    /// The root has no sibling to merge with.
    #[error("cannot merge the root region")]
    MergeOnRoot,

    /// The sibling of the merge target has been split further.
    #[error("cannot merge {region}: sibling {sibling} is not a leaf")]
    SiblingNotLeaf {
        /// The merge target.
        region: RegionId,
        /// Its non-leaf sibling.
        sibling: RegionId,
    },

    /// Only leaves can be split.
    #[error("cannot split {0}: not a leaf")]
    SplitNonLeaf(RegionId),

    /// Only leaves can be merged with their sibling.
    #[error("cannot merge {0}: not a leaf")]
    MergeNonLeaf(RegionId),

    /// The region is not part of the tree.
    #[error("unknown region {0}")]
    UnknownRegion(RegionId),

    /// The child bounds do not partition the parent along one axis.
    #[error("child bounds do not partition {0}")]
    InvalidPartition(RegionId),

    /// The region is already at the maximum tree depth.
    #[error("cannot split {0}: maximum depth reached")]
    DepthExhausted(RegionId),
}

/// An entity or point that no cell owns.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutingError {
    /// The point lies outside the root region.
    #[error("point {0:?} lies outside the world")]
    OutsideWorld(Vec3),

    /// No cell holds the referenced entity.
    #[error("no cell holds {0:?}")]
    UnknownEntity(EntityRef),
}

/// A broken structural invariant of the region tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("region tree invariant violated at {region}: {detail}")]
pub struct InvariantViolation {
    /// Where the violation was found.
    pub region: RegionId,
    /// What is wrong.
    pub detail: String,
}

impl InvariantViolation {
    /// Build a violation report.
    pub fn new(region: RegionId, detail: impl Into<String>) -> Self {
        Self {
            region,
            detail: detail.into(),
        }
    }
}
