//! Error types for geometry validation.

use crate::geometry::{Axis, Vec3};

/// Errors raised when constructing or splitting [`Bounds`](crate::Bounds).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    /// A coordinate was NaN or infinite.
    #[error("non-finite coordinate in {0:?}")]
    NonFinite(Vec3),

    /// The minimum corner exceeds the maximum corner on some axis.
    #[error("invalid bounds: min {min:?} exceeds max {max:?}")]
    InvertedBounds {
        /// Requested minimum corner.
        min: Vec3,
        /// Requested maximum corner.
        max: Vec3,
    },

    /// A split plane does not lie strictly inside the region.
    #[error("split plane {coordinate} on {axis:?} lies outside ({min}, {max})")]
    SplitOutside {
        /// Axis of the split plane.
        axis: Axis,
        /// Requested plane coordinate.
        coordinate: f64,
        /// Region minimum on that axis.
        min: f64,
        /// Region maximum on that axis.
        max: f64,
    },
}
