//! Shared type definitions for the cellsim spatial engine.
//!
//! This crate is the single source of truth for the values that flow between
//! the spatial index, the cell controllers, the orchestrator, and the
//! messaging collaborator.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for agents, objects, events, and hosts
//! - [`region_id`] -- [`RegionId`], the bit-path identifier of a tree node
//! - [`geometry`] -- [`Vec3`], [`Bounds`], and view [`Shape`]s
//! - [`records`] -- Agent, object, and event records held by a cell
//! - [`stimulus`] -- External stimuli and agent intentions
//! - [`structure`] -- Structural change requests and reorganization policy kinds
//! - [`envelope`] -- Command-tagged envelopes and bus topics
//! - [`error`] -- Geometry validation errors

pub mod envelope;
pub mod error;
pub mod geometry;
pub mod ids;
pub mod records;
pub mod region_id;
pub mod stimulus;
pub mod structure;

// Re-export all public types at crate root for convenience.
pub use envelope::{Command, Envelope, Phase, Topic};
pub use error::GeometryError;
pub use geometry::{Axis, Bounds, Shape, Vec3, ViewSector};
pub use ids::{AgentId, EventId, HostId, ObjectId};
pub use records::{
    AgentRecord, COLLISION_CAPACITY, Capabilities, Collision, CollisionLog, Entity, EntityKind,
    EntityRef, EventRecord, Kinematics, ObjectRecord, VisionRange,
};
pub use region_id::{RegionId, Side};
pub use stimulus::{ExternalStimulus, Intention};
pub use structure::{PolicyKind, SplitStrategy, StructuralChange};
