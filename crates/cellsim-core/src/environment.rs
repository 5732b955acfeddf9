//! Environment orchestrator: owns the partition and drives the tick.
//!
//! Each tick has two phases, each ending at a barrier:
//!
//! 1. **Environment** -- advance the clock, drain the structural-change
//!    queue under the restructure lock, plan every leaf's moves on the
//!    worker pool, overturn moves that collide across a leaf boundary,
//!    commit every leaf on the worker pool, settle agents that crossed
//!    into another leaf, collect sibling offers and assistance alerts, run
//!    the perception pass, and announce completion.
//!
//! 2. **Agent** -- run every agent's behavior against its last combined
//!    perception state on the worker pool and buffer the resulting
//!    intentions in the owning cells.
//!
//! The partition only changes inside the drain step. Inbound stimuli are
//! routed while holding the same restructure lock, so nothing is ever
//! delivered to a region that a concurrent split or merge just removed.
//! Creations and modifications are checked for clearance against every
//! leaf the entity lands in before anything is delivered.
//!
//! Lock order: restructure, index, cells, then a single cell's locks.
//! Bus messages are published after every lock is released.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

use cellsim_cells::{
    CellController, CellError, CellState, Deliberation, PendingStep, StepSettings, StimulusBuffer,
    WorkloadSample, WorkloadWeights, split_sides,
};
use cellsim_space::{InvariantViolation, RoutingError, SpatialIndex, StructuralError};
use cellsim_types::{
    AgentId, AgentRecord, Axis, Bounds, Command, Entity, EntityRef, Envelope, ExternalStimulus,
    HostId, Intention, Phase, RegionId, Shape, SplitStrategy, StructuralChange, Topic,
};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, warn};

use crate::behavior::AgentBehavior;
use crate::bus::{BusError, MessageBus, publish_or_warn};
use crate::clock::{ClockError, SimulationClock};
use crate::config::{ConfigError, SimulationConfig};
use crate::coordinator::urgency_map;
use crate::crossing;
use crate::perception::{CombinedState, PerceptionSubscriptionService};
use crate::policy::AssistanceAlert;

/// Errors that can occur while running the environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    /// A phase was started out of order or the tick overflowed.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },

    /// A structural change did not fit the tree.
    #[error("structural error: {source}")]
    Structural {
        /// The underlying index error.
        #[from]
        source: StructuralError,
    },

    /// A stimulus had no owning cell.
    #[error("routing error: {source}")]
    Routing {
        /// The underlying routing error.
        #[from]
        source: RoutingError,
    },

    /// A cell refused an operation.
    #[error("cell error: {source}")]
    Cell {
        /// The underlying cell error.
        #[from]
        source: CellError,
    },

    /// The region tree or the cell map is inconsistent.
    #[error("partition invariant violated: {source}")]
    Invariant {
        /// The violated invariant.
        #[from]
        source: InvariantViolation,
    },

    /// A leaf has no controller.
    #[error("no cell controller for leaf {0}")]
    MissingCell(RegionId),

    /// Bootstrap was handed a cell other than the root.
    #[error("initial state must be the root cell, got {0}")]
    NotRoot(RegionId),

    /// Settings could not be derived from the config.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// The worker pool could not be built.
    #[error("failed to build worker pool: {source}")]
    Pool {
        /// The underlying rayon error.
        #[from]
        source: rayon::ThreadPoolBuildError,
    },
}

/// Tunables the orchestrator needs every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentSettings {
    /// Step length and world bounds handed to every cell.
    pub step: StepSettings,
    /// Weights for cell workload.
    pub weights: WorkloadWeights,
    /// Weight of neighbor load in urgency.
    pub neighbor_weight: f64,
    /// Cells below this load offer a merge to their sibling.
    pub sibling_offer_threshold: f64,
    /// Minimum ticks between two offers from the same cell.
    pub offer_cooldown_ticks: u64,
    /// Cells above this load raise an assistance alert.
    pub alert_threshold: f64,
    /// TTL stamped on triggered events that carry none.
    pub event_ttl_ticks: Option<u64>,
    /// Worker pool size.
    pub threads: usize,
}

impl EnvironmentSettings {
    /// Settings taken from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configured world bounds are invalid.
    pub fn from_config(config: &SimulationConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_step(config, config.step_settings()?))
    }

    /// Default settings for a world spanning `world`.
    pub fn for_world(world: Bounds) -> Self {
        let config = SimulationConfig::default();
        let step = StepSettings {
            tick_seconds: config.world.tick_seconds,
            world,
        };
        Self::with_step(&config, step)
    }

    fn with_step(config: &SimulationConfig, step: StepSettings) -> Self {
        let ttl = config.cells.event_ttl_ticks;
        Self {
            step,
            weights: config.workload.weights(),
            neighbor_weight: config.workload.neighbor_weight,
            sibling_offer_threshold: config.cells.sibling_offer_threshold,
            offer_cooldown_ticks: config.cells.offer_cooldown_ticks,
            alert_threshold: config.reorganization.alert_threshold,
            event_ttl_ticks: (ttl > 0).then_some(ttl),
            threads: config.workers.threads,
        }
    }
}

/// Outcome of one environment phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvironmentReport {
    /// The tick that ran.
    pub tick: u64,
    /// Structural changes applied by the drain step.
    pub changes_applied: usize,
    /// Leaves after the drain step.
    pub leaves: usize,
    /// Moves committed.
    pub accepted: usize,
    /// Moves rejected by conflict resolution.
    pub rejected: usize,
    /// Moves overturned because they collided across a leaf boundary.
    pub overturned: usize,
    /// Stimuli cells refused.
    pub refused: usize,
    /// Agents that moved to another leaf.
    pub emigrated: usize,
    /// Assistance alerts raised.
    pub alerts: usize,
    /// Sibling merges queued from offers.
    pub offers_accepted: usize,
    /// Agents with a combined perception state.
    pub perceivers: usize,
}

/// Outcome of one agent phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentReport {
    /// The tick that ran.
    pub tick: u64,
    /// Agents consulted.
    pub agents: usize,
    /// Intentions buffered.
    pub intentions: usize,
}

type CellMap = BTreeMap<RegionId, CellController>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// The simulation environment.
pub struct Environment {
    index: RwLock<SpatialIndex>,
    cells: RwLock<CellMap>,
    restructure: Mutex<()>,
    changes: Mutex<VecDeque<StructuralChange>>,
    alerts: Mutex<BTreeMap<RegionId, AssistanceAlert>>,
    perception: RwLock<PerceptionSubscriptionService>,
    clock: Mutex<SimulationClock>,
    pool: ThreadPool,
    bus: Arc<dyn MessageBus>,
    settings: EnvironmentSettings,
    host: HostId,
}

impl core::fmt::Debug for Environment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Environment")
            .field("tick", &self.tick())
            .field("leaves", &self.leaf_count())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Start from a single root cell.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::NotRoot`] if `root` is not the root
    /// region, or [`EnvironmentError::Pool`] if the worker pool fails.
    pub fn bootstrap(
        root: CellState,
        settings: EnvironmentSettings,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, EnvironmentError> {
        if !root.region().is_root() {
            return Err(EnvironmentError::NotRoot(root.region()));
        }
        let index = SpatialIndex::new(root.bounds(), HostId::new());
        Self::from_cells(index, vec![root], settings, bus)
    }

    /// Start from an existing partition and one state per leaf.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::Invariant`] unless `states` covers every
    /// leaf of `index` exactly once with matching bounds.
    pub fn from_cells(
        index: SpatialIndex,
        states: Vec<CellState>,
        settings: EnvironmentSettings,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, EnvironmentError> {
        let supplied = states.len();
        let cells: CellMap = states
            .into_iter()
            .map(|s| (s.region(), CellController::new(s)))
            .collect();
        if cells.len() != supplied {
            return Err(InvariantViolation::new(index.root(), "duplicate cell states").into());
        }
        verify_partition(&index, &cells)?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.threads)
            .thread_name(|i| format!("cellsim-worker-{i}"))
            .build()?;
        let host = index.owner(index.root()).unwrap_or_default();
        info!(
            leaves = cells.len(),
            threads = pool.current_num_threads(),
            "Environment ready"
        );
        Ok(Self {
            index: RwLock::new(index),
            cells: RwLock::new(cells),
            restructure: Mutex::new(()),
            changes: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(BTreeMap::new()),
            perception: RwLock::new(PerceptionSubscriptionService::default()),
            clock: Mutex::new(SimulationClock::new()),
            pool,
            bus,
            settings,
            host,
        })
    }

    /// Swap the perception service (e.g. for a custom geometry).
    #[must_use]
    pub fn with_perception(self, service: PerceptionSubscriptionService) -> Self {
        *write(&self.perception) = service;
        self
    }

    /// Subscribe to inbound entity and stimulus topics on the bus.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if a subscription fails.
    pub fn attach(self: &Arc<Self>) -> Result<(), BusError> {
        for topic in [
            Topic::EntityCreate,
            Topic::EntityDestroy,
            Topic::ExternalStimulus,
        ] {
            let weak: Weak<Self> = Arc::downgrade(self);
            self.bus.subscribe(
                topic,
                Arc::new(move |envelope: &Envelope| {
                    if let Some(env) = weak.upgrade() {
                        env.handle_inbound(&envelope.command);
                    }
                }),
            )?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------

    /// Current tick.
    pub fn tick(&self) -> u64 {
        lock(&self.clock).tick()
    }

    /// Orchestrator settings.
    pub const fn settings(&self) -> &EnvironmentSettings {
        &self.settings
    }

    /// The message bus.
    pub const fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Current leaves in region order.
    pub fn leaves(&self) -> Vec<RegionId> {
        read(&self.index).leaves()
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        read(&self.index).leaf_count()
    }

    /// Run `f` against the current partition.
    pub fn with_index<R>(&self, f: impl FnOnce(&SpatialIndex) -> R) -> R {
        f(&read(&self.index))
    }

    /// A copy of the current partition.
    pub fn index_snapshot(&self) -> SpatialIndex {
        read(&self.index).clone()
    }

    /// Committed state of one leaf.
    pub fn snapshot(&self, region: RegionId) -> Option<CellState> {
        read(&self.cells).get(&region).map(CellController::snapshot)
    }

    /// Committed state of every leaf, in region order.
    pub fn snapshots(&self) -> Vec<CellState> {
        read(&self.cells).values().map(CellController::snapshot).collect()
    }

    /// Leaf currently holding `agent`.
    pub fn locate_agent(&self, agent: AgentId) -> Option<RegionId> {
        agent_holder(&read(&self.cells), agent)
    }

    /// Fresh workload sample from every leaf.
    pub fn workload_samples(&self) -> Vec<WorkloadSample> {
        read(&self.cells)
            .values()
            .map(|c| c.workload(&self.settings.weights))
            .collect()
    }

    /// Combined perception state produced for `agent` by the last pass.
    pub fn combined_state_for(&self, agent: AgentId) -> Option<CombinedState> {
        read(&self.perception)
            .retrieve_combined_state_for(agent)
            .cloned()
    }

    /// Whether the last perception pass produced a state for `agent`.
    pub fn has_combined_state_for(&self, agent: AgentId) -> bool {
        read(&self.perception).has_combined_state_for(agent)
    }

    /// Cells `agent` subscribed to in the last perception pass.
    pub fn subscriptions_for(&self, agent: AgentId) -> Option<BTreeSet<RegionId>> {
        read(&self.perception).subscriptions_for(agent).cloned()
    }

    /// Check the region tree and that every leaf has a matching cell.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::Invariant`], after logging it, on the
    /// first inconsistency found.
    pub fn check_invariants(&self) -> Result<(), EnvironmentError> {
        let index = read(&self.index);
        let cells = read(&self.cells);
        verify_partition(&index, &cells).map_err(fail_fast)
    }

    // -------------------------------------------------------------------
    // Structural change queue
    // -------------------------------------------------------------------

    /// Queue a structural change for the next environment phase.
    ///
    /// A request identical to one already queued is ignored.
    pub fn enqueue(&self, change: StructuralChange) {
        let mut queue = lock(&self.changes);
        if queue.contains(&change) {
            debug!(%change, "Structural change already queued");
            return;
        }
        queue.push_back(change);
    }

    /// Number of queued structural changes.
    pub fn pending_changes(&self) -> usize {
        lock(&self.changes).len()
    }

    /// Take the alerts raised since the last call, one per leaf.
    pub fn take_alerts(&self) -> Vec<AssistanceAlert> {
        std::mem::take(&mut *lock(&self.alerts))
            .into_values()
            .collect()
    }

    /// Apply every queued change in order, under the restructure lock.
    fn drain_changes(&self, tick: u64) -> Result<Vec<Command>, EnvironmentError> {
        let _restructure = lock(&self.restructure);
        let pending: Vec<StructuralChange> = lock(&self.changes).drain(..).collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut index = write(&self.index);
        let mut cells = write(&self.cells);
        let mut applied = Vec::new();
        for change in pending {
            let outcome = match change {
                StructuralChange::Split { cell, strategy } => {
                    apply_split(&mut index, &mut cells, cell, strategy, self.host)
                }
                StructuralChange::Merge { cell } => apply_merge(&mut index, &mut cells, cell),
            };
            match outcome {
                Ok(()) => {
                    let leaves = index.leaf_count();
                    info!(tick, %change, leaves, "Structural change applied");
                    applied.push(Command::StructureChanged { change, leaves });
                }
                Err(EnvironmentError::Invariant { source }) => return Err(fail_fast(source)),
                Err(error) => warn!(tick, %change, %error, "Structural change dropped"),
            }
        }
        verify_partition(&index, &cells).map_err(fail_fast)?;
        Ok(applied)
    }

    // -------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------

    /// Deliver an external stimulus to the cell(s) that own it.
    ///
    /// Creations go where the entity lands (every overlapped leaf for an
    /// object), events where they are raised, and removals to the cells
    /// currently holding the target. A modification is re-placed: holders
    /// the new record still lands in get the update, new leaves get the
    /// entity added, and holders it left get it removed. Returns the
    /// receiving leaves.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::Routing`] if the target lies outside the
    /// world or is held by no cell, and [`EnvironmentError::Cell`] if a
    /// created id is taken or the entity would overlap a collidable object
    /// in any leaf. Nothing is delivered on error.
    pub fn route_stimulus(
        &self,
        stimulus: ExternalStimulus,
    ) -> Result<Vec<RegionId>, EnvironmentError> {
        let stimulus = self.stamp_event_ttl(stimulus);
        let _restructure = lock(&self.restructure);
        let index = read(&self.index);
        let cells = read(&self.cells);
        let deliveries = deliveries_for(&index, &cells, &stimulus)?;
        let targets: Vec<RegionId> = deliveries.iter().map(|(r, _)| *r).collect();
        deliver(&cells, deliveries)?;
        debug!(
            stimulus = stimulus.name(),
            targets = targets.len(),
            "Stimulus routed"
        );
        Ok(targets)
    }

    /// Deliver a user command to the leaf holding its agent.
    ///
    /// Commands take precedence over the agent's own intention.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::Routing`] if no leaf holds the agent.
    pub fn route_command(&self, command: Intention) -> Result<RegionId, EnvironmentError> {
        let _restructure = lock(&self.restructure);
        let cells = read(&self.cells);
        let region = agent_holder(&cells, command.agent_id)
            .ok_or(RoutingError::UnknownEntity(EntityRef::Agent(command.agent_id)))?;
        cells
            .get(&region)
            .ok_or(EnvironmentError::MissingCell(region))?
            .push_command(command);
        Ok(region)
    }

    /// Route an inbound bus command, logging anything that cannot be routed.
    ///
    /// Returns whether the command was delivered to a cell.
    pub fn handle_inbound(&self, command: &Command) -> bool {
        let stimulus = match command {
            Command::EntityCreate(entity) => ExternalStimulus::Create(entity.clone()),
            Command::EntityDestroy(target) => ExternalStimulus::Destroy(*target),
            Command::Stimulus(stimulus) => stimulus.clone(),
            _ => return false,
        };
        let name = stimulus.name();
        match self.route_stimulus(stimulus) {
            Ok(_) => true,
            Err(error) => {
                warn!(stimulus = name, %error, "Inbound stimulus dropped");
                false
            }
        }
    }

    fn stamp_event_ttl(&self, stimulus: ExternalStimulus) -> ExternalStimulus {
        match (stimulus, self.settings.event_ttl_ticks) {
            (ExternalStimulus::Trigger(mut event), Some(ttl)) if event.ttl_ticks.is_none() => {
                event.ttl_ticks = Some(ttl);
                ExternalStimulus::Trigger(event)
            }
            (stimulus, _) => stimulus,
        }
    }

    // -------------------------------------------------------------------
    // Phases
    // -------------------------------------------------------------------

    /// Run the environment phase of the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::Clock`] if the tick overflows, or
    /// [`EnvironmentError::Invariant`] if the partition became inconsistent.
    pub fn run_environment_phase(&self) -> Result<EnvironmentReport, EnvironmentError> {
        // --- Clock ---
        let tick = lock(&self.clock).begin_environment()?;

        // --- Structural changes ---
        let mut outbox = self.drain_changes(tick)?;

        let report = {
            let index = read(&self.index);
            let cells = read(&self.cells);
            let mut report = EnvironmentReport {
                tick,
                changes_applied: outbox.len(),
                leaves: cells.len(),
                ..EnvironmentReport::default()
            };

            // --- React and resolve ---
            let step = self.settings.step;
            let mut plans: BTreeMap<RegionId, PendingStep> = self.pool.install(|| {
                cells
                    .par_iter()
                    .map(|(region, cell)| (*region, cell.plan(&step)))
                    .collect()
            });

            // --- Cross-cell conflicts ---
            report.overturned = crossing::reconcile(&index, &cells, &mut plans);

            // --- Commit ---
            let deliberations: Vec<(RegionId, Deliberation)> = self.pool.install(|| {
                plans
                    .into_par_iter()
                    .filter_map(|(region, pending)| {
                        cells
                            .get(&region)
                            .map(|cell| (region, cell.commit(pending, tick, &step)))
                    })
                    .collect()
            });
            roll_back_partial_creations(&cells, &deliberations);
            let mut emigrants = Vec::new();
            let mut stale = Vec::new();
            for (region, deliberation) in deliberations {
                report.accepted = report.accepted.saturating_add(deliberation.accepted);
                report.rejected = report.rejected.saturating_add(deliberation.rejected);
                report.refused = report.refused.saturating_add(deliberation.refused.len());
                emigrants.extend(deliberation.emigrants.into_iter().map(|a| (region, a)));
                stale.extend(deliberation.stale);
            }

            // --- Migration ---
            report.emigrated = settle(&index, &cells, emigrants);
            reroute_stale(&index, &cells, stale, tick);

            // --- Offers and alerts ---
            let samples: BTreeMap<RegionId, WorkloadSample> = cells
                .iter()
                .map(|(region, cell)| (*region, cell.workload(&self.settings.weights)))
                .collect();
            let alerts = self.raise_alerts(tick, &index, &samples);
            report.alerts = alerts.len();
            outbox.extend(alerts);
            let offers = self.collect_offers(tick, &cells, &samples);
            report.offers_accepted = offers.accepted;
            outbox.extend(offers.commands);

            // --- Perception ---
            let published: Vec<CellState> = cells.values().map(CellController::snapshot).collect();
            let perception = self
                .pool
                .install(|| write(&self.perception).run_pass(&index, &published));
            report.perceivers = perception.perceivers;
            report
        };

        info!(
            tick,
            leaves = report.leaves,
            accepted = report.accepted,
            rejected = report.rejected,
            overturned = report.overturned,
            emigrated = report.emigrated,
            "Environment phase complete"
        );
        outbox.push(Command::PhaseCompleted {
            phase: Phase::Environment,
            tick,
            leaves: report.leaves,
        });
        for command in outbox {
            publish_or_warn(self.bus.as_ref(), command, tick);
        }
        Ok(report)
    }

    /// Run the agent phase of the current tick.
    ///
    /// # Errors
    ///
    /// Returns [`EnvironmentError::Clock`] unless the environment phase of
    /// this tick ran last.
    pub fn run_agent_phase(
        &self,
        behavior: &dyn AgentBehavior,
    ) -> Result<AgentReport, EnvironmentError> {
        let tick = lock(&self.clock).begin_agent()?;

        let report = {
            let cells = read(&self.cells);
            let perception = read(&self.perception);
            let agents: Vec<(RegionId, AgentRecord)> = cells
                .iter()
                .flat_map(|(region, cell)| {
                    cell.state()
                        .agents()
                        .values()
                        .map(|a| (*region, a.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();

            let intentions: Vec<(RegionId, Intention)> = self.pool.install(|| {
                agents
                    .par_iter()
                    .filter_map(|(region, agent)| {
                        let view = perception.retrieve_combined_state_for(agent.id);
                        behavior
                            .react(agent, view, tick)
                            .map(|intention| (*region, intention))
                    })
                    .collect()
            });
            for (region, intention) in &intentions {
                if let Some(cell) = cells.get(region) {
                    cell.push_intention(*intention);
                }
            }
            AgentReport {
                tick,
                agents: agents.len(),
                intentions: intentions.len(),
            }
        };

        debug!(
            tick,
            agents = report.agents,
            intentions = report.intentions,
            "Agent phase complete"
        );
        publish_or_warn(
            self.bus.as_ref(),
            Command::PhaseCompleted {
                phase: Phase::Agent,
                tick,
                leaves: self.leaf_count(),
            },
            tick,
        );
        Ok(report)
    }

    /// Record an alert for every leaf above the alert threshold.
    fn raise_alerts(
        &self,
        tick: u64,
        index: &SpatialIndex,
        samples: &BTreeMap<RegionId, WorkloadSample>,
    ) -> Vec<Command> {
        let urgency = urgency_map(index, samples, self.settings.neighbor_weight);
        let mut alerts = lock(&self.alerts);
        samples
            .iter()
            .filter(|(_, s)| s.load > self.settings.alert_threshold)
            .map(|(region, sample)| {
                let alert = AssistanceAlert {
                    region: *region,
                    load: sample.load,
                    urgency: urgency.get(region).copied().unwrap_or(sample.load),
                    tick,
                };
                debug!(region = %region, load = sample.load, urgency = alert.urgency, "Assistance requested");
                alerts.insert(*region, alert);
                Command::AssistanceRequest {
                    region: *region,
                    load: sample.load,
                }
            })
            .collect()
    }

    /// Let lightly loaded leaves offer a merge to their sibling.
    ///
    /// The merge is queued when the sibling is a leaf and lightly loaded
    /// too, and no merge of the pair is already queued.
    fn collect_offers(
        &self,
        tick: u64,
        cells: &CellMap,
        samples: &BTreeMap<RegionId, WorkloadSample>,
    ) -> Offers {
        let threshold = self.settings.sibling_offer_threshold;
        let mut offers = Offers::default();
        let mut queue = lock(&self.changes);
        for (region, controller) in cells {
            let Some(sample) = samples.get(region) else {
                continue;
            };
            let Some(sibling) =
                controller.sibling_offer(tick, sample.load, threshold, self.settings.offer_cooldown_ticks)
            else {
                continue;
            };
            offers.commands.push(Command::SiblingOffer {
                from: *region,
                to: sibling,
                load: sample.load,
            });
            let sibling_light = samples.get(&sibling).is_some_and(|s| s.load < threshold);
            let queued = queue.iter().any(|c| {
                matches!(c, StructuralChange::Merge { cell } if *cell == *region || *cell == sibling)
            });
            if sibling_light && !queued {
                debug!(region = %region, sibling = %sibling, tick, "Sibling offer accepted");
                queue.push_back(StructuralChange::Merge { cell: *region });
                offers.accepted = offers.accepted.saturating_add(1);
            }
        }
        offers
    }
}

#[derive(Default)]
struct Offers {
    commands: Vec<Command>,
    accepted: usize,
}

fn fail_fast(violation: InvariantViolation) -> EnvironmentError {
    error!(
        region = %violation.region,
        detail = %violation.detail,
        "Partition invariant violated"
    );
    EnvironmentError::Invariant { source: violation }
}

/// Every leaf has exactly one controller with the same bounds.
fn verify_partition(index: &SpatialIndex, cells: &CellMap) -> Result<(), InvariantViolation> {
    index.check_invariants()?;
    for leaf in index.leaves() {
        let Some(cell) = cells.get(&leaf) else {
            return Err(InvariantViolation::new(leaf, "leaf has no cell controller"));
        };
        let cell_bounds = cell.state().bounds();
        if !index.bounds(leaf).is_some_and(|b| b.approx_eq(&cell_bounds)) {
            return Err(InvariantViolation::new(
                leaf,
                "cell bounds differ from index bounds",
            ));
        }
    }
    if let Some(stray) = cells.keys().find(|r| !index.is_leaf(**r)) {
        return Err(InvariantViolation::new(
            *stray,
            "cell controller for a non-leaf region",
        ));
    }
    Ok(())
}

fn agent_holder(cells: &CellMap, agent: AgentId) -> Option<RegionId> {
    cells
        .iter()
        .find(|(_, c)| c.state().agent(agent).is_some())
        .map(|(r, _)| *r)
}

fn holders_of(cells: &CellMap, target: EntityRef) -> Vec<RegionId> {
    cells
        .iter()
        .filter(|(_, c)| c.state().holds(target))
        .map(|(r, _)| *r)
        .collect()
}

/// Leaves an entity is placed into on arrival.
///
/// Objects go to every leaf they overlap plus the leaf owning their min
/// corner, matching how a split distributes them.
fn placement(index: &SpatialIndex, entity: &Entity) -> Result<Vec<RegionId>, RoutingError> {
    match entity {
        Entity::Object(object) => {
            let footprint = object.bounds;
            let mut owners: BTreeSet<RegionId> = index
                .regions_intersecting(index.root(), &Shape::Box(footprint))
                .into_iter()
                .filter(|r| index.bounds(*r).is_some_and(|b| b.overlaps(&footprint)))
                .collect();
            if let Ok(corner) = index.locate(footprint.min()) {
                owners.insert(corner);
            }
            if owners.is_empty() {
                return Err(RoutingError::OutsideWorld(footprint.center()));
            }
            Ok(owners.into_iter().collect())
        }
        Entity::Agent(agent) => Ok(vec![index.locate(agent.position())?]),
        Entity::Event(event) => Ok(vec![index.locate(event.position)?]),
    }
}

/// Reject `entity` if it would overlap a collidable object in any leaf.
fn check_clearance(
    index: &SpatialIndex,
    cells: &CellMap,
    entity: &Entity,
) -> Result<(), EnvironmentError> {
    let volume = match entity {
        Entity::Agent(agent) => agent.bounding_box(),
        Entity::Object(object) => object.bounds,
        Entity::Event(_) => return Ok(()),
    };
    let target = entity.entity_ref();
    for region in index.regions_intersecting(index.root(), &Shape::Box(volume)) {
        if let Some(cell) = cells.get(&region) {
            cell.state().check_clear(target, &volume)?;
        }
    }
    Ok(())
}

/// Which leaf receives what for `stimulus`.
fn deliveries_for(
    index: &SpatialIndex,
    cells: &CellMap,
    stimulus: &ExternalStimulus,
) -> Result<Vec<(RegionId, ExternalStimulus)>, EnvironmentError> {
    let to_all = |regions: Vec<RegionId>| {
        regions
            .into_iter()
            .map(|r| (r, stimulus.clone()))
            .collect::<Vec<_>>()
    };
    match stimulus {
        ExternalStimulus::Create(entity) => {
            let target = entity.entity_ref();
            if !holders_of(cells, target).is_empty() {
                return Err(CellError::DuplicateEntity(target).into());
            }
            let regions = placement(index, entity)?;
            check_clearance(index, cells, entity)?;
            Ok(to_all(regions))
        }
        ExternalStimulus::Add(entity) => Ok(to_all(placement(index, entity)?)),
        ExternalStimulus::Trigger(event) => Ok(to_all(vec![index.locate(event.position)?])),
        ExternalStimulus::Modify(entity) => {
            let target = entity.entity_ref();
            let holders = holders_of(cells, target);
            if holders.is_empty() {
                return Err(RoutingError::UnknownEntity(target).into());
            }
            let regions = placement(index, entity)?;
            check_clearance(index, cells, entity)?;
            let mut deliveries: Vec<(RegionId, ExternalStimulus)> = regions
                .iter()
                .map(|r| {
                    let update = if holders.contains(r) {
                        ExternalStimulus::Modify(entity.clone())
                    } else {
                        ExternalStimulus::Add(entity.clone())
                    };
                    (*r, update)
                })
                .collect();
            deliveries.extend(
                holders
                    .into_iter()
                    .filter(|r| !regions.contains(r))
                    .map(|r| (r, ExternalStimulus::Remove(target))),
            );
            Ok(deliveries)
        }
        ExternalStimulus::Destroy(_) | ExternalStimulus::Remove(_) => {
            let target = stimulus.target();
            let holders = holders_of(cells, target);
            if holders.is_empty() {
                return Err(RoutingError::UnknownEntity(target).into());
            }
            Ok(to_all(holders))
        }
    }
}

fn deliver(
    cells: &CellMap,
    deliveries: Vec<(RegionId, ExternalStimulus)>,
) -> Result<(), EnvironmentError> {
    for (region, stimulus) in deliveries {
        cells
            .get(&region)
            .ok_or(EnvironmentError::MissingCell(region))?
            .push_stimulus(stimulus);
    }
    Ok(())
}

/// Undo creations that another leaf refused for a collision.
///
/// An object spanning several leaves is created in each of them; it only
/// exists if every one of them accepted it.
fn roll_back_partial_creations(cells: &CellMap, deliberations: &[(RegionId, Deliberation)]) {
    let collided: BTreeSet<EntityRef> = deliberations
        .iter()
        .flat_map(|(_, d)| &d.refused)
        .filter_map(|error| match error {
            CellError::Collides { entity, .. } => Some(*entity),
            _ => None,
        })
        .collect();
    if collided.is_empty() {
        return;
    }
    for (region, deliberation) in deliberations {
        for created in deliberation.created.iter().filter(|e| collided.contains(*e)) {
            let Some(cell) = cells.get(region) else {
                continue;
            };
            if cell.state().remove(*created).is_ok() {
                warn!(entity = ?created, region = %region, "Creation collided in another leaf, rolled back");
            }
        }
    }
}

/// Route stimuli whose target left the cell they were delivered to.
///
/// They reach the target's current holders next tick; a target no cell
/// holds any more is gone and the stimulus is dropped.
fn reroute_stale(index: &SpatialIndex, cells: &CellMap, stale: Vec<ExternalStimulus>, tick: u64) {
    for stimulus in stale {
        let name = stimulus.name();
        let target = stimulus.target();
        match deliveries_for(index, cells, &stimulus).and_then(|d| deliver(cells, d)) {
            Ok(()) => debug!(tick, stimulus = name, entity = ?target, "Stale stimulus rerouted"),
            Err(error) => {
                warn!(tick, stimulus = name, entity = ?target, %error, "Stale stimulus dropped");
            }
        }
    }
}

/// Put every emigrant into the leaf that now owns its position.
///
/// Returns how many changed leaf.
fn settle(index: &SpatialIndex, cells: &CellMap, emigrants: Vec<(RegionId, AgentRecord)>) -> usize {
    let mut settled = 0_usize;
    for (from, agent) in emigrants {
        let destination = match index.locate(agent.position()) {
            Ok(region) if cells.contains_key(&region) => region,
            Ok(_) | Err(_) => {
                warn!(agent = %agent.id, region = %from, "Emigrant has no destination, keeping it home");
                from
            }
        };
        if let Some(cell) = cells.get(&destination) {
            debug!(agent = %agent.id, from = %from, to = %destination, "Agent migrated");
            cell.state().admit(Entity::Agent(agent));
            if destination != from {
                settled = settled.saturating_add(1);
            }
        }
    }
    settled
}

fn refill(controller: &CellController, inbox: StimulusBuffer) {
    let (intentions, commands, external) = inbox.into_parts();
    for intention in intentions {
        controller.push_intention(intention);
    }
    for command in commands {
        controller.push_command(command);
    }
    for stimulus in external {
        controller.push_stimulus(stimulus);
    }
}

fn apply_split(
    index: &mut SpatialIndex,
    cells: &mut CellMap,
    cell: RegionId,
    strategy: SplitStrategy,
    host: HostId,
) -> Result<(), EnvironmentError> {
    if !index.is_leaf(cell) {
        let error = if index.contains(cell) {
            StructuralError::SplitNonLeaf(cell)
        } else {
            StructuralError::UnknownRegion(cell)
        };
        return Err(error.into());
    }
    let controller = cells
        .remove(&cell)
        .ok_or(EnvironmentError::MissingCell(cell))?;
    let (mut state, inbox) = controller.into_parts();

    let halves = match state.split(strategy) {
        Ok(halves) => halves,
        Err(error) => {
            let restored = CellController::new(state);
            refill(&restored, inbox);
            cells.insert(cell, restored);
            return Err(error.into());
        }
    };
    let (axis, coordinate) = (halves.axis, halves.coordinate);
    let (mut low, mut high) = (halves.low, halves.high);
    if let Err(error) = index.split(cell, low.bounds(), high.bounds(), host) {
        low.merge(&mut high)?;
        let restored = CellController::new(low);
        refill(&restored, inbox);
        cells.insert(cell, restored);
        return Err(error.into());
    }

    let children = [low.region(), high.region()];
    cells.insert(low.region(), CellController::new(low));
    cells.insert(high.region(), CellController::new(high));
    reroute_split(cells, children, axis, coordinate, inbox);
    debug!(region = %cell, ?axis, coordinate, "Leaf split");
    Ok(())
}

/// Hand a split cell's undelivered inbox to its children.
///
/// Placements follow the split rule. Stimuli naming an existing entity go
/// to the child holding it, or to both when neither does yet (the entity
/// may be created by an earlier stimulus in the same inbox); the child
/// without it refuses.
fn reroute_split(
    cells: &CellMap,
    children: [RegionId; 2],
    axis: Axis,
    coordinate: f64,
    inbox: StimulusBuffer,
) {
    let [low, high] = children;
    let pick = |(to_low, to_high): (bool, bool)| {
        [(to_low, low), (to_high, high)]
            .into_iter()
            .filter_map(|(hit, region)| hit.then_some(region))
            .collect::<Vec<_>>()
    };
    let (intentions, commands, external) = inbox.into_parts();

    for (intention, is_command) in intentions
        .into_iter()
        .map(|i| (i, false))
        .chain(commands.into_iter().map(|c| (c, true)))
    {
        let holder = children
            .iter()
            .find(|r| cells.get(r).is_some_and(|c| c.state().agent(intention.agent_id).is_some()))
            .and_then(|r| cells.get(r));
        match holder {
            Some(cell) if is_command => cell.push_command(intention),
            Some(cell) => cell.push_intention(intention),
            None => debug!(agent = %intention.agent_id, "Dropped intention for departed agent"),
        }
    }

    for stimulus in external {
        let targets = match &stimulus {
            ExternalStimulus::Create(entity) | ExternalStimulus::Add(entity) => {
                pick(split_sides(axis, coordinate, &entity.footprint()))
            }
            ExternalStimulus::Trigger(event) => pick(split_sides(
                axis,
                coordinate,
                &Bounds::around(event.position, 0.0),
            )),
            ExternalStimulus::Modify(_)
            | ExternalStimulus::Destroy(_)
            | ExternalStimulus::Remove(_) => {
                let target = stimulus.target();
                let holders: Vec<RegionId> = children
                    .into_iter()
                    .filter(|r| cells.get(r).is_some_and(|c| c.state().holds(target)))
                    .collect();
                if holders.is_empty() {
                    children.to_vec()
                } else {
                    holders
                }
            }
        };
        let deliveries = targets.into_iter().map(|r| (r, stimulus.clone())).collect();
        if let Err(error) = deliver(cells, deliveries) {
            warn!(stimulus = stimulus.name(), %error, "Buffered stimulus dropped during split");
        }
    }
}

fn apply_merge(
    index: &mut SpatialIndex,
    cells: &mut CellMap,
    cell: RegionId,
) -> Result<(), EnvironmentError> {
    let parent = index.merge(cell)?;
    let [low_id, high_id] = parent
        .children()
        .ok_or(StructuralError::DepthExhausted(parent))?;
    let (Some(low), Some(high)) = (cells.remove(&low_id), cells.remove(&high_id)) else {
        return Err(InvariantViolation::new(parent, "merged leaves had no cell controllers").into());
    };
    let (mut merged, low_inbox) = low.into_parts();
    let (mut other, high_inbox) = high.into_parts();
    merged.merge(&mut other)?;

    let controller = CellController::new(merged);
    refill(&controller, low_inbox);
    refill(&controller, high_inbox);
    cells.insert(parent, controller);
    debug!(region = %parent, "Leaves merged");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use cellsim_types::{EventId, EventRecord, ObjectId, ObjectRecord, Vec3};

    use super::*;
    use crate::behavior::IdleBehavior;
    use crate::bus::InProcessBus;

    fn world() -> Bounds {
        Bounds::new(Vec3::ZERO, Vec3::new(100.0, 100.0, 10.0)).unwrap()
    }

    fn settings() -> EnvironmentSettings {
        let mut settings = EnvironmentSettings::for_world(world());
        settings.step.tick_seconds = 1.0;
        settings.threads = 2;
        settings.sibling_offer_threshold = 0.0;
        settings
    }

    fn env_with(agents: &[Vec3]) -> (Environment, Vec<AgentId>) {
        let mut root = CellState::new(RegionId::ROOT, world());
        let mut ids = Vec::new();
        for p in agents {
            let agent = AgentRecord::new(AgentId::new(), *p);
            ids.push(agent.id);
            root.insert(Entity::Agent(agent)).unwrap();
        }
        let env =
            Environment::bootstrap(root, settings(), Arc::new(InProcessBus::new())).unwrap();
        (env, ids)
    }

    fn split_root(env: &Environment) {
        env.enqueue(StructuralChange::Split {
            cell: RegionId::ROOT,
            strategy: SplitStrategy::Midpoint,
        });
        env.run_environment_phase().unwrap();
        env.run_agent_phase(&IdleBehavior).unwrap();
    }

    fn tick(env: &Environment) -> EnvironmentReport {
        let report = env.run_environment_phase().unwrap();
        env.run_agent_phase(&IdleBehavior).unwrap();
        report
    }

    fn object(min: (f64, f64), max: (f64, f64)) -> ObjectRecord {
        ObjectRecord::new(
            ObjectId::new(),
            "block",
            Bounds::new(Vec3::new(min.0, min.1, 0.0), Vec3::new(max.0, max.1, 4.0)).unwrap(),
        )
    }

    fn holders(env: &Environment, target: EntityRef) -> Vec<RegionId> {
        env.snapshots()
            .iter()
            .filter(|c| c.holds(target))
            .map(CellState::region)
            .collect()
    }

    #[test]
    fn bootstrap_rejects_non_root() {
        let state = CellState::new("r0".parse().unwrap(), world());
        let result = Environment::bootstrap(state, settings(), Arc::new(InProcessBus::new()));
        assert!(matches!(result, Err(EnvironmentError::NotRoot(_))));
    }

    #[test]
    fn split_then_merge_restores_contents() {
        let (env, ids) = env_with(&[Vec3::new(10.0, 10.0, 1.0), Vec3::new(80.0, 10.0, 1.0)]);
        split_root(&env);
        assert_eq!(env.leaf_count(), 2);
        let [low, high] = RegionId::ROOT.children().unwrap();
        let holders: Vec<_> = ids.iter().map(|id| env.locate_agent(*id)).collect();
        assert_eq!(holders, vec![Some(low), Some(high)]);

        env.enqueue(StructuralChange::Merge { cell: high });
        let report = env.run_environment_phase().unwrap();
        assert_eq!(report.changes_applied, 1);
        assert_eq!(env.leaves(), vec![RegionId::ROOT]);
        let root = env.snapshot(RegionId::ROOT).unwrap();
        assert_eq!(root.agents().len(), 2);
        assert!(root.bounds().approx_eq(&world()));
    }

    #[test]
    fn invalid_change_is_dropped_not_fatal() {
        let (env, _) = env_with(&[]);
        env.enqueue(StructuralChange::Merge {
            cell: RegionId::ROOT,
        });
        env.enqueue(StructuralChange::Split {
            cell: "r01".parse().unwrap(),
            strategy: SplitStrategy::Midpoint,
        });
        let report = env.run_environment_phase().unwrap();
        assert_eq!(report.changes_applied, 0);
        assert_eq!(env.leaf_count(), 1);
        env.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_requests_collapse() {
        let (env, _) = env_with(&[]);
        let change = StructuralChange::Split {
            cell: RegionId::ROOT,
            strategy: SplitStrategy::Midpoint,
        };
        env.enqueue(change);
        env.enqueue(change);
        assert_eq!(env.pending_changes(), 1);
    }

    #[test]
    fn creation_routes_by_position() {
        let (env, _) = env_with(&[]);
        split_root(&env);
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(75.0, 20.0, 1.0));
        let id = agent.id;
        let targets = env
            .route_stimulus(ExternalStimulus::Create(Entity::Agent(agent)))
            .unwrap();
        let [_, high] = RegionId::ROOT.children().unwrap();
        assert_eq!(targets, vec![high]);
        env.run_environment_phase().unwrap();
        assert_eq!(env.locate_agent(id), Some(high));
    }

    #[test]
    fn straddling_object_reaches_both_halves() {
        let (env, _) = env_with(&[]);
        split_root(&env);
        let object = ObjectRecord::new(
            ObjectId::new(),
            "wall",
            Bounds::new(Vec3::new(45.0, 10.0, 0.0), Vec3::new(55.0, 12.0, 5.0)).unwrap(),
        );
        let targets = env
            .route_stimulus(ExternalStimulus::Create(Entity::Object(object)))
            .unwrap();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn outside_world_is_a_routing_error() {
        let (env, _) = env_with(&[]);
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(500.0, 20.0, 1.0));
        let result = env.route_stimulus(ExternalStimulus::Create(Entity::Agent(agent)));
        assert!(matches!(
            result,
            Err(EnvironmentError::Routing {
                source: RoutingError::OutsideWorld(_)
            })
        ));
        let missing = env.route_stimulus(ExternalStimulus::Destroy(EntityRef::Agent(AgentId::new())));
        assert!(matches!(
            missing,
            Err(EnvironmentError::Routing {
                source: RoutingError::UnknownEntity(_)
            })
        ));
    }

    #[test]
    fn agent_crossing_plane_migrates() {
        let (env, ids) = env_with(&[Vec3::new(49.5, 10.0, 1.0)]);
        let walker = ids.first().copied().unwrap();
        split_root(&env);
        let [low, high] = RegionId::ROOT.children().unwrap();
        assert_eq!(env.locate_agent(walker), Some(low));

        env.route_command(Intention::moving(walker, Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();
        let report = env.run_environment_phase().unwrap();
        assert_eq!(report.emigrated, 1);
        assert_eq!(env.locate_agent(walker), Some(high));
    }

    #[test]
    fn pending_inbox_follows_split() {
        let (env, _) = env_with(&[]);
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(80.0, 80.0, 1.0));
        let id = agent.id;
        env.route_stimulus(ExternalStimulus::Create(Entity::Agent(agent)))
            .unwrap();
        // Split is drained before the buffered creation is applied.
        split_root(&env);
        let [_, high] = RegionId::ROOT.children().unwrap();
        assert_eq!(env.locate_agent(id), Some(high));
    }

    #[test]
    fn agent_phase_requires_environment_phase() {
        let (env, _) = env_with(&[]);
        assert!(matches!(
            env.run_agent_phase(&IdleBehavior),
            Err(EnvironmentError::Clock { .. })
        ));
    }

    #[test]
    fn triggered_events_get_default_ttl() {
        let mut settings = settings();
        settings.event_ttl_ticks = Some(2);
        let env = Environment::bootstrap(
            CellState::new(RegionId::ROOT, world()),
            settings,
            Arc::new(InProcessBus::new()),
        )
        .unwrap();
        let event = EventRecord::new(EventId::new(), "bang", Vec3::new(5.0, 5.0, 1.0), 1);
        env.route_stimulus(ExternalStimulus::Trigger(event)).unwrap();
        env.run_environment_phase().unwrap();
        assert_eq!(env.snapshot(RegionId::ROOT).unwrap().events().len(), 1);
        env.run_agent_phase(&IdleBehavior).unwrap();
        env.run_environment_phase().unwrap();
        env.run_agent_phase(&IdleBehavior).unwrap();
        env.run_environment_phase().unwrap();
        assert!(env.snapshot(RegionId::ROOT).unwrap().events().is_empty());
    }

    #[test]
    fn light_siblings_merge_through_offers() {
        let mut settings = settings();
        settings.sibling_offer_threshold = 1.0;
        settings.offer_cooldown_ticks = 0;
        let env = Environment::bootstrap(
            CellState::new(RegionId::ROOT, world()),
            settings,
            Arc::new(InProcessBus::new()),
        )
        .unwrap();
        split_root(&env);
        // Both halves were empty: the offer queued a merge for the next tick.
        assert_eq!(env.pending_changes(), 1);
        env.run_environment_phase().unwrap();
        assert_eq!(env.leaf_count(), 1);
    }

    #[test]
    fn creation_blocked_in_any_leaf_is_refused() {
        let (env, _) = env_with(&[]);
        split_root(&env);
        let rock = object((51.0, 10.0), (60.0, 11.0));
        env.route_stimulus(ExternalStimulus::Create(Entity::Object(rock)))
            .unwrap();
        tick(&env);

        let wall = object((45.0, 10.0), (55.0, 11.0));
        let wall_ref = EntityRef::Object(wall.id);
        let result = env.route_stimulus(ExternalStimulus::Create(Entity::Object(wall)));
        assert!(matches!(
            result,
            Err(EnvironmentError::Cell {
                source: CellError::Collides { .. }
            })
        ));
        tick(&env);
        assert!(holders(&env, wall_ref).is_empty());
    }

    #[test]
    fn duplicate_creation_is_refused_at_routing() {
        let (env, _) = env_with(&[]);
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(20.0, 20.0, 1.0));
        env.route_stimulus(ExternalStimulus::Create(Entity::Agent(agent.clone())))
            .unwrap();
        tick(&env);
        let again = env.route_stimulus(ExternalStimulus::Create(Entity::Agent(agent)));
        assert!(matches!(
            again,
            Err(EnvironmentError::Cell {
                source: CellError::DuplicateEntity(_)
            })
        ));
    }

    #[test]
    fn modified_object_follows_its_new_bounds() {
        let (env, _) = env_with(&[]);
        split_root(&env);
        let [low, high] = RegionId::ROOT.children().unwrap();
        let rock = object((10.0, 10.0), (12.0, 12.0));
        let rock_ref = EntityRef::Object(rock.id);
        env.route_stimulus(ExternalStimulus::Create(Entity::Object(rock.clone())))
            .unwrap();
        tick(&env);
        assert_eq!(holders(&env, rock_ref), vec![low]);

        let mut widened = rock.clone();
        widened.bounds = Bounds::new(Vec3::new(45.0, 10.0, 0.0), Vec3::new(55.0, 12.0, 4.0)).unwrap();
        let targets = env
            .route_stimulus(ExternalStimulus::Modify(Entity::Object(widened)))
            .unwrap();
        assert_eq!(targets, vec![low, high]);
        tick(&env);
        assert_eq!(holders(&env, rock_ref), vec![low, high]);

        let mut shifted = rock;
        shifted.bounds = Bounds::new(Vec3::new(70.0, 10.0, 0.0), Vec3::new(72.0, 12.0, 4.0)).unwrap();
        env.route_stimulus(ExternalStimulus::Modify(Entity::Object(shifted)))
            .unwrap();
        tick(&env);
        assert_eq!(holders(&env, rock_ref), vec![high]);
    }

    #[test]
    fn modification_into_a_wall_is_refused() {
        let (env, ids) = env_with(&[Vec3::new(20.0, 20.0, 1.0)]);
        let id = ids.first().copied().unwrap();
        env.route_stimulus(ExternalStimulus::Create(Entity::Object(object(
            (30.0, 15.0),
            (35.0, 25.0),
        ))))
        .unwrap();
        tick(&env);

        let agent = AgentRecord::new(id, Vec3::new(32.0, 20.0, 1.0));
        let result = env.route_stimulus(ExternalStimulus::Modify(Entity::Agent(agent)));
        assert!(matches!(
            result,
            Err(EnvironmentError::Cell {
                source: CellError::Collides { .. }
            })
        ));
        tick(&env);
        let root = env.snapshot(RegionId::ROOT).unwrap();
        assert_eq!(root.agent(id).unwrap().position(), Vec3::new(20.0, 20.0, 1.0));
    }

    #[test]
    fn stale_destroy_follows_the_agent() {
        let (env, ids) = env_with(&[Vec3::new(49.5, 10.0, 1.0)]);
        let walker = ids.first().copied().unwrap();
        split_root(&env);
        let [low, high] = RegionId::ROOT.children().unwrap();
        env.route_command(Intention::moving(walker, Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();
        tick(&env);
        assert_eq!(env.locate_agent(walker), Some(high));

        // Delivered to the old holder while the agent was crossing.
        read(&env.cells)
            .get(&low)
            .unwrap()
            .push_stimulus(ExternalStimulus::Destroy(EntityRef::Agent(walker)));
        tick(&env);
        assert_eq!(env.locate_agent(walker), Some(high));
        tick(&env);
        assert_eq!(env.locate_agent(walker), None);
    }
}
