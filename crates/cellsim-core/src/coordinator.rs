//! Reorganization coordinator.
//!
//! The coordinator runs on its own timer, independent of the tick. Each
//! cycle it throws away the previous workload samples, samples every leaf
//! afresh, asks the active [`ReorganizationPolicy`] for at most one change,
//! and enqueues it with the [`Environment`]. It never mutates the partition.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use cellsim_cells::WorkloadSample;
use cellsim_space::SpatialIndex;
use cellsim_types::{Command, Envelope, PolicyKind, RegionId, StructuralChange, Topic};
use tracing::{debug, info};

use crate::bus::{BusError, MessageBus};
use crate::config::{ReorganizationConfig, SimulationConfig};
use crate::environment::Environment;
use crate::policy::{PolicyContext, ReorganizationPolicy};

/// `load + weight × Σ load(face-adjacent leaves)` for every sampled leaf.
pub fn urgency_map(
    index: &SpatialIndex,
    samples: &BTreeMap<RegionId, WorkloadSample>,
    neighbor_weight: f64,
) -> BTreeMap<RegionId, f64> {
    samples
        .iter()
        .map(|(region, sample)| {
            let around: f64 = index
                .neighbors(*region)
                .iter()
                .filter_map(|n| samples.get(n))
                .map(|n| n.load)
                .sum();
            (*region, neighbor_weight.mul_add(around, sample.load))
        })
        .collect()
}

struct ActivePolicy {
    kind: Option<PolicyKind>,
    policy: ReorganizationPolicy,
}

/// Periodic reorganization driver.
pub struct Coordinator {
    config: ReorganizationConfig,
    neighbor_weight: f64,
    active: Mutex<ActivePolicy>,
    samples: Mutex<BTreeMap<RegionId, WorkloadSample>>,
}

impl core::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coordinator")
            .field("policy", &self.policy_kind())
            .field("neighbor_weight", &self.neighbor_weight)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Coordinator {
    /// Coordinator running the preset named in `config`.
    pub fn new(config: ReorganizationConfig, neighbor_weight: f64) -> Self {
        let policy = ReorganizationPolicy::from_kind(config.policy, &config);
        Self {
            active: Mutex::new(ActivePolicy {
                kind: Some(config.policy),
                policy,
            }),
            config,
            neighbor_weight,
            samples: Mutex::new(BTreeMap::new()),
        }
    }

    /// Coordinator configured from the full simulation config.
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.reorganization.clone(), config.workload.neighbor_weight)
    }

    /// Replace the preset with a hand-built policy.
    #[must_use]
    pub fn with_policy(self, policy: ReorganizationPolicy) -> Self {
        *lock(&self.active) = ActivePolicy { kind: None, policy };
        self
    }

    /// Name of the active preset, or `None` for a hand-built policy.
    pub fn policy_kind(&self) -> Option<PolicyKind> {
        lock(&self.active).kind
    }

    /// Switch to the preset `kind`, discarding any hysteresis history.
    pub fn set_policy(&self, kind: PolicyKind) {
        let policy = ReorganizationPolicy::from_kind(kind, &self.config);
        let mut active = lock(&self.active);
        info!(from = ?active.kind, to = ?kind, "Reorganization policy changed");
        *active = ActivePolicy {
            kind: Some(kind),
            policy,
        };
    }

    /// Subscribe to runtime strategy changes on `bus`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the subscription fails.
    pub fn attach(self: &Arc<Self>, bus: &dyn MessageBus) -> Result<(), BusError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        bus.subscribe(
            Topic::ReorganizationStrategyChange,
            Arc::new(move |envelope: &Envelope| {
                if let Command::StrategyChange(kind) = envelope.command
                    && let Some(coordinator) = weak.upgrade()
                {
                    coordinator.set_policy(kind);
                }
            }),
        )
    }

    /// Replace the sample map with fresh samples from every leaf.
    pub fn sample(&self, env: &Environment) -> usize {
        let fresh = env.workload_samples();
        let count = fresh.len();
        let mut samples = lock(&self.samples);
        samples.clear();
        samples.extend(fresh.into_iter().map(|s| (s.region, s)));
        count
    }

    /// Samples taken by the last cycle.
    pub fn samples(&self) -> BTreeMap<RegionId, WorkloadSample> {
        lock(&self.samples).clone()
    }

    /// Urgency of `region` from the last cycle's samples.
    pub fn urgency(&self, env: &Environment, region: RegionId) -> Option<f64> {
        let samples = self.samples();
        env.with_index(|index| urgency_map(index, &samples, self.neighbor_weight))
            .get(&region)
            .copied()
    }

    /// Run one reorganization cycle and enqueue its decision.
    pub fn run_cycle(&self, env: &Environment) -> Option<StructuralChange> {
        let sampled = self.sample(env);
        let alerts = env.take_alerts();
        let samples = self.samples();
        let change = env.with_index(|index| {
            let urgency = urgency_map(index, &samples, self.neighbor_weight);
            let ctx = PolicyContext {
                index,
                samples: &samples,
                urgency: &urgency,
                alerts: &alerts,
            };
            lock(&self.active).policy.reorganize(&ctx)
        });
        debug!(
            sampled,
            alerts = alerts.len(),
            change = ?change,
            "Reorganization cycle complete"
        );
        if let Some(change) = change {
            env.enqueue(change);
        }
        change
    }
}
