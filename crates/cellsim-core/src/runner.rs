//! Simulation loop runner with operator controls.
//!
//! [`run_simulation`] drives the tick loop:
//!
//! - **Bounded simulation**: stop after `max_ticks` or `max_real_time_seconds`
//! - **Pause/resume**: the operator can halt and continue the loop
//! - **Variable tick speed**: tick interval adjustable at runtime
//! - **Operator stop**: clean stop between ticks
//!
//! Both phases of a tick run on a blocking task, since they block on the
//! worker pool. [`spawn_reorganizer`] runs a [`Coordinator`] on its own
//! timer alongside the loop; it only ever enqueues structural changes.

use std::sync::Arc;
use std::time::Duration;

use cellsim_types::ExternalStimulus;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::behavior::AgentBehavior;
use crate::coordinator::Coordinator;
use crate::environment::{AgentReport, Environment, EnvironmentError, EnvironmentReport};
use crate::operator::{OperatorState, SimulationEndReason};

/// Errors that can occur during the simulation run.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// A phase failed.
    #[error("environment error: {source}")]
    Environment {
        /// The underlying environment error.
        #[from]
        source: EnvironmentError,
    },

    /// A blocking phase task panicked or was cancelled.
    #[error("phase task failed: {source}")]
    Join {
        /// The underlying join error.
        #[from]
        source: tokio::task::JoinError,
    },
}

/// Outcome of one full tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Environment phase report.
    pub environment: EnvironmentReport,
    /// Agent phase report.
    pub agent: AgentReport,
}

impl TickSummary {
    /// The tick that ran.
    pub const fn tick(&self) -> u64 {
        self.environment.tick
    }
}

/// Result of the simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The reason the simulation ended.
    pub end_reason: SimulationEndReason,
    /// The last tick summary, if any tick completed.
    pub final_summary: Option<TickSummary>,
    /// Total number of ticks executed.
    pub total_ticks: u64,
}

/// Callback invoked after each tick completes.
pub trait TickCallback: Send {
    /// Called after a tick completes successfully.
    fn on_tick(&mut self, summary: &TickSummary, env: &Environment);
}

/// A tick callback that does nothing.
pub struct NoOpCallback;

impl TickCallback for NoOpCallback {
    fn on_tick(&mut self, _summary: &TickSummary, _env: &Environment) {}
}

/// Run one tick (both phases) on a blocking task.
///
/// # Errors
///
/// Returns [`RunnerError`] if either phase fails or the task is lost.
pub async fn run_tick(
    env: &Arc<Environment>,
    behavior: &Arc<dyn AgentBehavior>,
) -> Result<TickSummary, RunnerError> {
    let env = Arc::clone(env);
    let behavior = Arc::clone(behavior);
    let summary = tokio::task::spawn_blocking(move || -> Result<TickSummary, EnvironmentError> {
        let environment = env.run_environment_phase()?;
        let agent = env.run_agent_phase(behavior.as_ref())?;
        Ok(TickSummary { environment, agent })
    })
    .await??;
    Ok(summary)
}

/// Route operator-injected stimuli, logging the ones that cannot be placed.
///
/// Routing takes the restructure lock and reads cell state, so it runs on
/// a blocking task like the phases.
fn route_injected(env: &Environment, stimuli: Vec<ExternalStimulus>) {
    for stimulus in stimuli {
        let name = stimulus.name();
        if let Err(error) = env.route_stimulus(stimulus) {
            warn!(stimulus = name, %error, "Injected stimulus dropped");
        }
    }
}

/// Run the simulation loop until a termination condition is met.
///
/// Stimuli queued on the operator are routed before each tick; routing
/// failures are logged and dropped.
///
/// # Errors
///
/// Returns [`RunnerError`] if a tick fails unrecoverably.
pub async fn run_simulation(
    env: &Arc<Environment>,
    behavior: Arc<dyn AgentBehavior>,
    operator: &Arc<OperatorState>,
    callback: &mut dyn TickCallback,
) -> Result<SimulationResult, RunnerError> {
    let mut last_summary: Option<TickSummary> = None;
    let mut total_ticks: u64 = 0;

    info!(
        max_ticks = operator.max_ticks(),
        max_real_time_seconds = operator.max_real_time_seconds(),
        tick_interval_ms = operator.tick_interval_ms(),
        leaves = env.leaf_count(),
        "Simulation starting"
    );

    let end_reason = loop {
        // --- Check pause ---
        if operator.is_paused() {
            info!("Simulation paused, waiting for resume...");
            operator.wait_if_paused().await;
            info!("Simulation resumed");
        }

        // --- Check stop request (before tick) ---
        if operator.is_stop_requested() {
            info!("Operator stop requested");
            break SimulationEndReason::OperatorStop;
        }

        // --- Check time limit (before tick) ---
        if operator.time_limit_reached() {
            info!(
                max_seconds = operator.max_real_time_seconds(),
                elapsed = operator.elapsed_seconds(),
                "Real-time limit reached"
            );
            break SimulationEndReason::MaxRealTimeReached;
        }

        // --- Route injected stimuli ---
        let injected = operator.drain_injected().await;
        if !injected.is_empty() {
            let env = Arc::clone(env);
            tokio::task::spawn_blocking(move || route_injected(&env, injected)).await?;
        }

        // --- Execute tick ---
        let summary = run_tick(env, &behavior).await?;
        total_ticks = total_ticks.saturating_add(1);
        callback.on_tick(&summary, env);
        last_summary = Some(summary);

        // --- Check tick limit (after tick) ---
        if operator.tick_limit_reached(summary.tick()) {
            info!(
                tick = summary.tick(),
                max_ticks = operator.max_ticks(),
                "Tick limit reached"
            );
            break SimulationEndReason::MaxTicksReached;
        }

        // --- Sleep for tick interval ---
        let interval_ms = operator.tick_interval_ms();
        if interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    };

    operator.set_end_reason(end_reason).await;
    Ok(SimulationResult {
        end_reason,
        final_summary: last_summary,
        total_ticks,
    })
}

/// Run `coordinator` every `period` until the operator requests a stop.
///
/// Cycles are skipped while paused. The task resolves to the number of
/// cycles run.
pub fn spawn_reorganizer(
    coordinator: Arc<Coordinator>,
    env: Arc<Environment>,
    operator: Arc<OperatorState>,
    period: Duration,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles: u64 = 0;
        loop {
            tokio::select! {
                () = operator.stopped() => break,
                _ = interval.tick() => {}
            }
            if operator.is_paused() {
                continue;
            }
            let coordinator = Arc::clone(&coordinator);
            let env = Arc::clone(&env);
            match tokio::task::spawn_blocking(move || coordinator.run_cycle(&env)).await {
                Ok(change) => {
                    cycles = cycles.saturating_add(1);
                    debug!(cycles, change = ?change, "Reorganizer cycle");
                }
                Err(error) => warn!(%error, "Reorganizer cycle failed"),
            }
        }
        info!(cycles, "Reorganizer stopped");
        cycles
    })
}

/// Log the end of the run.
pub fn log_simulation_end(result: &SimulationResult) {
    info!(
        reason = ?result.end_reason,
        total_ticks = result.total_ticks,
        final_tick = result.final_summary.as_ref().map(TickSummary::tick),
        final_leaves = result.final_summary.as_ref().map(|s| s.environment.leaves),
        "Simulation ended"
    );
    if result.final_summary.is_none() {
        warn!("Simulation ended with no ticks executed");
    }
}
