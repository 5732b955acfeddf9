//! Cells: the leaf regions of the partition and the entities they own.
//!
//! A [`CellController`] owns one [`CellState`] and drives it through the
//! two-phase tick: `react` turns buffered stimuli into proposed agent moves
//! without touching committed state, and `deliberate` resolves conflicts,
//! commits the survivors, and applies external stimuli. The orchestrator
//! runs the two halves of `deliberate` separately (plan, then commit) so
//! moves reaching into a neighbouring cell can be checked in between.
//!
//! # Modules
//!
//! - [`conflict`] -- Movement conflict resolution ("earlier wins").
//! - [`controller`] -- [`CellController`], the locked wrapper driven by the
//!   orchestrator's worker pool.
//! - [`error`] -- Error types for cell operations.
//! - [`inbox`] -- [`StimulusBuffer`], stimuli queued between ticks.
//! - [`state`] -- [`CellState`]: contents, split, merge, react, deliberate.
//! - [`workload`] -- Workload weights and samples.

pub mod conflict;
pub mod controller;
pub mod error;
pub mod inbox;
pub mod state;
pub mod workload;

pub use conflict::{Blocker, MoveOutcome, MovePlan, ProposedAgent, resolve_moves};
pub use controller::{CellController, PendingStep, StepSettings};
pub use error::CellError;
pub use inbox::StimulusBuffer;
pub use state::{CellSplit, CellState, Deliberation, split_sides};
pub use workload::{WorkloadSample, WorkloadWeights, count_f64};
