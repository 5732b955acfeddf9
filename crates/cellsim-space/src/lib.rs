//! Spatial partitioning for the cellsim engine.
//!
//! The world is a single root region recursively split into two children,
//! forming a binary tree whose leaves are the cells that own entities.
//!
//! # Modules
//!
//! - [`error`] -- Structural, routing, and invariant errors.
//! - [`spatial_index`] -- The [`SpatialIndex`] tree: point location,
//!   split/merge, and shape-intersection queries.

pub mod error;
pub mod spatial_index;

pub use error::{InvariantViolation, RoutingError, StructuralError};
pub use spatial_index::{IndexNode, SpatialIndex};
