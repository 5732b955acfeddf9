//! Engine binary for the cellsim spatial simulation.
//!
//! Wires the environment, the reorganization coordinator, the message bus
//! and the operator controls together and runs the tick loop until a
//! termination condition is met.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `cellsim-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Spawn the initial population into the root cell
//! 4. Connect the message bus (NATS, or in-process as fallback)
//! 5. Bootstrap the environment and subscribe it to inbound topics
//! 6. Start the reorganizer on its own timer
//! 7. Run the simulation loop
//! 8. Stop the reorganizer and log the result

mod error;
mod nats_bus;
mod spawner;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cellsim_core::{
    AgentBehavior, Coordinator, Environment, EnvironmentSettings, InProcessBus, MessageBus,
    OperatorState, RandomWalk, SimulationConfig, TickCallback, TickSummary, runner,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::nats_bus::NatsBus;

/// Logs a progress line every `every` ticks.
struct ProgressLog {
    every: u64,
}

impl TickCallback for ProgressLog {
    fn on_tick(&mut self, summary: &TickSummary, env: &Environment) {
        let tick = summary.tick();
        debug!(
            tick,
            intentions = summary.agent.intentions,
            emigrated = summary.environment.emigrated,
            "Tick complete"
        );
        if self.every > 0 && tick.is_multiple_of(self.every) {
            info!(
                tick,
                leaves = summary.environment.leaves,
                pending_changes = env.pending_changes(),
                perceivers = summary.environment.perceivers,
                "Progress"
            );
        }
    }
}

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any initialization step or the simulation fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config = load_config()?;

    // 2. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_target(true)
        .init();

    info!(
        world_name = config.world.name,
        seed = config.world.seed,
        tick_interval_ms = config.world.tick_interval_ms,
        policy = ?config.reorganization.policy,
        "cellsim-engine starting"
    );

    // 3. Spawn the initial population.
    let (root, _summary) = spawner::spawn_population(&config)?;

    // 4. Connect the message bus.
    let bus = connect_bus(&config).await;

    // 5. Bootstrap the environment.
    let settings = EnvironmentSettings::from_config(&config)?;
    let env = Arc::new(Environment::bootstrap(root, settings, Arc::clone(&bus))?);
    env.attach()?;

    let coordinator = Arc::new(Coordinator::from_config(&config));
    coordinator.attach(bus.as_ref())?;

    let operator = Arc::new(OperatorState::new(
        config.world.tick_interval_ms,
        &config.simulation,
    ));
    {
        let operator = Arc::clone(&operator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping");
                operator.request_stop();
            }
        });
    }

    // 6. Start the reorganizer.
    let reorganizer = runner::spawn_reorganizer(
        Arc::clone(&coordinator),
        Arc::clone(&env),
        Arc::clone(&operator),
        Duration::from_millis(config.reorganization.period_ms),
    );

    // 7. Run the simulation.
    let behavior: Arc<dyn AgentBehavior> = Arc::new(RandomWalk::new(
        config.population.walk_speed,
        config.world.seed,
    ));
    let mut progress = ProgressLog { every: 100 };
    let result = runner::run_simulation(&env, behavior, &operator, &mut progress).await;

    // 8. Shut down.
    operator.request_stop();
    match reorganizer.await {
        Ok(cycles) => debug!(cycles, "Reorganizer joined"),
        Err(e) => warn!(error = %e, "Reorganizer task failed"),
    }
    let result = result.map_err(EngineError::from)?;
    runner::log_simulation_end(&result);

    let agents: usize = env.snapshots().iter().map(|c| c.agents().len()).sum();
    let status = operator.status(env.tick(), env.leaf_count(), agents).await;
    match serde_json::to_string(&status) {
        Ok(json) => info!(status = %json, "cellsim-engine shutdown complete"),
        Err(e) => warn!(error = %e, "Failed to encode final status"),
    }
    Ok(())
}

/// Load `cellsim-config.yaml` from the working directory, or defaults.
fn load_config() -> Result<SimulationConfig, EngineError> {
    let config_path = Path::new("cellsim-config.yaml");
    if config_path.exists() {
        Ok(SimulationConfig::from_file(config_path)?)
    } else {
        Ok(SimulationConfig::parse("")?)
    }
}

/// NATS when enabled and reachable, otherwise the in-process bus.
async fn connect_bus(config: &SimulationConfig) -> Arc<dyn MessageBus> {
    let messaging = &config.messaging;
    if !messaging.enabled {
        info!("Messaging disabled, using in-process bus");
        return Arc::new(InProcessBus::new());
    }
    match NatsBus::connect(&messaging.nats_url, &messaging.subject_prefix).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            warn!(error = %e, "NATS unavailable, falling back to in-process bus");
            Arc::new(InProcessBus::new())
        }
    }
}
