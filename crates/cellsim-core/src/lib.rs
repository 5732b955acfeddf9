//! Orchestration for the cellsim spatial engine.
//!
//! This crate ties the partition, the cells and the collaborators together
//! into a running simulation: the two-phase tick, perception, periodic
//! reorganization, and the async loop with its operator controls.
//!
//! # Modules
//!
//! - [`behavior`] -- [`AgentBehavior`] trait, [`IdleBehavior`] and [`RandomWalk`].
//! - [`bus`] -- [`MessageBus`] seam and the synchronous [`InProcessBus`].
//! - [`clock`] -- Tick counter enforcing phase order.
//! - [`config`] -- Configuration loading from `cellsim-config.yaml` into
//!   strongly-typed structs.
//! - [`coordinator`] -- Periodic workload sampling and policy evaluation.
//! - [`environment`] -- [`Environment`], the tick orchestrator and router.
//! - [`operator`] -- Pause, resume, speed and stop controls.
//! - [`perception`] -- Per-agent subscriptions and combined states.
//! - [`policy`] -- Reorganization policies.
//! - [`runner`] -- The async simulation loop and reorganizer task.

pub mod behavior;
pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
mod crossing;
pub mod environment;
pub mod operator;
pub mod perception;
pub mod policy;
pub mod runner;

pub use behavior::{AgentBehavior, IdleBehavior, RandomWalk};
pub use bus::{BusError, Handler, InProcessBus, MessageBus, publish_or_warn};
pub use clock::{ClockError, SimulationClock};
pub use config::{ConfigError, SimulationConfig};
pub use coordinator::{Coordinator, urgency_map};
pub use environment::{
    AgentReport, Environment, EnvironmentError, EnvironmentReport, EnvironmentSettings,
};
pub use operator::{OperatorState, SimulationEndReason, SimulationStatus};
pub use perception::{
    CombinedState, Geometry, PerceptionReport, PerceptionSubscriptionService, StandardGeometry,
};
pub use policy::{AssistanceAlert, ReorganizationPolicy};
pub use runner::{
    NoOpCallback, RunnerError, SimulationResult, TickCallback, TickSummary, run_simulation,
    run_tick, spawn_reorganizer,
};
