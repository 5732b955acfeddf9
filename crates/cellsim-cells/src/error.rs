//! Error types for the `cellsim-cells` crate.

use cellsim_types::{EntityRef, GeometryError, ObjectId, RegionId};

/// Errors that can occur while mutating a cell.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CellError {
    /// Merge was attempted between cells that do not share a parent.
    #[error("cells {region} and {other} are not siblings")]
    NotSiblings {
        /// The receiving cell.
        region: RegionId,
        /// The cell offered for merging.
        other: RegionId,
    },

    /// The region cannot be subdivided further.
    #[error("region {0} is at maximum depth")]
    DepthExhausted(RegionId),

    /// An entity with the same id already exists in the cell.
    #[error("duplicate entity {0:?}")]
    DuplicateEntity(EntityRef),

    /// The entity would overlap a collidable object.
    #[error("{entity:?} collides with object {object}")]
    Collides {
        /// The rejected entity.
        entity: EntityRef,
        /// The object it would overlap.
        object: ObjectId,
    },

    /// The cell holds no such entity.
    #[error("unknown entity {0:?}")]
    UnknownEntity(EntityRef),

    /// Invalid geometry while splitting.
    #[error("geometry error: {source}")]
    Geometry {
        /// The underlying geometry error.
        #[from]
        source: GeometryError,
    },
}
