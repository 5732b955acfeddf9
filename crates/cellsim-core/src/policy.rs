//! Reorganization policies.
//!
//! A policy looks at the latest workload samples and picks at most one
//! [`StructuralChange`] per invocation. It never touches the partition
//! itself; the coordinator hands the request to the orchestrator's queue.
//!
//! There are three control-loop shapes:
//!
//! - **threshold**: visit leaves (in region order or heaviest first), split
//!   the first one over the split threshold, otherwise merge the first
//!   sibling pair whose combined load fits under the merge threshold;
//! - **urgency**: rank leaves by neighbor-weighted urgency and act on the
//!   extremes;
//! - **bottom-up**: act on the most urgent assistance alert raised by the
//!   cells themselves.
//!
//! The named presets of [`PolicyKind`] are parameterizations of these.
//!
//! Comparisons are fixed for every variant: a leaf splits when its load is
//! strictly greater than the split threshold, a pair merges when its
//! combined load is less than or equal to the merge threshold.

use std::collections::{BTreeMap, VecDeque};

use cellsim_cells::{WorkloadSample, count_f64};
use cellsim_space::SpatialIndex;
use cellsim_types::{PolicyKind, RegionId, Side, SplitStrategy, StructuralChange};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ReorganizationConfig;

/// Which quantity a threshold policy compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMetric {
    /// Number of agents in the cell.
    Agents,
    /// Weighted agent and object load.
    Entities,
}

impl LoadMetric {
    /// Value of this metric for `sample`.
    pub fn of(self, sample: &WorkloadSample) -> f64 {
        match self {
            Self::Agents => count_f64(sample.agents),
            Self::Entities => sample.load,
        }
    }
}

/// Order in which a threshold policy visits leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOrder {
    /// Region id order.
    Region,
    /// Heaviest leaves first for splits, lightest pairs first for merges.
    DescendingLoad,
}

/// An overloaded cell asking for a split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssistanceAlert {
    /// The overloaded leaf.
    pub region: RegionId,
    /// Its load when the alert was raised.
    pub load: f64,
    /// Its urgency when the alert was raised.
    pub urgency: f64,
    /// Tick the alert was raised at.
    pub tick: u64,
}

/// Rolling mean of the highest load seen per cycle.
///
/// Splits are allowed only while the mean exceeds the split threshold and
/// merges only while it is at most `merge_ratio` times the split threshold,
/// which keeps a population hovering around the threshold from flapping
/// between split and merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Hysteresis {
    window: usize,
    merge_ratio: f64,
    history: VecDeque<f64>,
}

impl Hysteresis {
    /// Average over `window` cycles (at least one).
    pub fn new(window: usize, merge_ratio: f64) -> Self {
        let window = window.max(1);
        Self {
            window,
            merge_ratio,
            history: VecDeque::with_capacity(window),
        }
    }

    /// Record this cycle's highest load.
    pub fn observe(&mut self, max_load: f64) {
        if self.history.len() >= self.window {
            self.history.pop_front();
        }
        self.history.push_back(max_load);
    }

    /// Current rolling mean, if anything was observed.
    pub fn mean(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().sum::<f64>() / count_f64(self.history.len()))
    }

    /// Whether the recent trend allows a split at `threshold`.
    pub fn allows_split(&self, threshold: f64) -> bool {
        self.mean().is_some_and(|m| m > threshold)
    }

    /// Whether the recent trend allows a merge relative to `threshold`.
    pub fn allows_merge(&self, threshold: f64) -> bool {
        self.mean().is_some_and(|m| m <= self.merge_ratio * threshold)
    }
}

/// Cell budget plus hysteresis.
#[derive(Debug, Clone, PartialEq)]
pub struct Fairness {
    /// Maximum number of leaves.
    pub max_cells: usize,
    /// Trend filter.
    pub hysteresis: Hysteresis,
}

/// Snapshot a policy decides on.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    /// Current partition.
    pub index: &'a SpatialIndex,
    /// Latest sample per leaf.
    pub samples: &'a BTreeMap<RegionId, WorkloadSample>,
    /// Neighbor-weighted urgency per leaf.
    pub urgency: &'a BTreeMap<RegionId, f64>,
    /// Alerts raised since the last cycle.
    pub alerts: &'a [AssistanceAlert],
}

impl PolicyContext<'_> {
    /// Leaves with a sample, in region order, with their metric value.
    fn leaf_values(&self, metric: LoadMetric) -> Vec<(RegionId, f64)> {
        self.index
            .leaves()
            .into_iter()
            .filter_map(|r| self.samples.get(&r).map(|s| (r, metric.of(s))))
            .collect()
    }

    /// Sibling pairs of leaves (named by their low child) with their
    /// combined metric value, in region order.
    fn leaf_pairs(&self, values: &[(RegionId, f64)]) -> Vec<(RegionId, f64)> {
        let by_region: BTreeMap<RegionId, f64> = values.iter().copied().collect();
        values
            .iter()
            .filter(|(r, _)| r.side() == Some(Side::Low))
            .filter_map(|(r, v)| {
                let sibling = r.sibling()?;
                let other = by_region.get(&sibling)?;
                self.index.is_leaf(sibling).then_some((*r, v + other))
            })
            .collect()
    }

    /// Whether `region` can take another split plane: it is not at maximum
    /// depth and is wider than the split tolerance.
    fn splittable(&self, region: RegionId) -> bool {
        region.children().is_some()
            && self
                .index
                .bounds(region)
                .is_some_and(|b| b.split_midpoint().is_ok())
    }

    /// Whether another leaf fits in `max_cells`.
    fn has_room(&self, max_cells: usize) -> bool {
        self.index.leaf_count() < max_cells
    }
}

/// Sort descending by value, ties by region id.
fn heaviest_first(values: &mut [(RegionId, f64)]) {
    values.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
}

/// Sort ascending by value, ties by region id.
fn lightest_first(values: &mut [(RegionId, f64)]) {
    values.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
}

/// Local-threshold balancing.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPolicy {
    /// Quantity compared against the thresholds.
    pub metric: LoadMetric,
    /// Visit order.
    pub order: VisitOrder,
    /// Split when a leaf's value is above this.
    pub split_threshold: f64,
    /// Merge when a pair's combined value is at or below this.
    pub merge_threshold: f64,
    /// Plane placement for splits.
    pub strategy: SplitStrategy,
    /// Optional budget and hysteresis.
    pub fairness: Option<Fairness>,
}

impl ThresholdPolicy {
    fn reorganize(&mut self, ctx: &PolicyContext<'_>) -> Option<StructuralChange> {
        let mut values = ctx.leaf_values(self.metric);
        let max_load = values.iter().map(|(_, v)| *v).fold(0.0_f64, f64::max);
        if let Some(fair) = self.fairness.as_mut() {
            fair.hysteresis.observe(max_load);
        }

        let (may_split, may_merge) = self.fairness.as_ref().map_or((true, true), |fair| {
            (
                ctx.has_room(fair.max_cells) && fair.hysteresis.allows_split(self.split_threshold),
                fair.hysteresis.allows_merge(self.split_threshold),
            )
        });

        if may_split {
            if self.order == VisitOrder::DescendingLoad {
                heaviest_first(&mut values);
            }
            let target = values
                .iter()
                .find(|(r, v)| *v > self.split_threshold && ctx.splittable(*r));
            if let Some((cell, _)) = target {
                return Some(StructuralChange::Split {
                    cell: *cell,
                    strategy: self.strategy,
                });
            }
        }

        if may_merge {
            let mut pairs = ctx.leaf_pairs(&values);
            if self.order == VisitOrder::DescendingLoad {
                lightest_first(&mut pairs);
            }
            let target = pairs.iter().find(|(_, v)| *v <= self.merge_threshold);
            if let Some((cell, _)) = target {
                return Some(StructuralChange::Merge { cell: *cell });
            }
        }
        None
    }
}

/// Neighbor-weighted urgency ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct UrgencyPolicy {
    /// Split the most urgent leaf when its urgency is above this.
    pub split_threshold: f64,
    /// Merge the least urgent pair when its combined load is at or below this.
    pub merge_threshold: f64,
    /// Maximum number of leaves.
    pub max_cells: usize,
    /// Plane placement for splits.
    pub strategy: SplitStrategy,
}

impl UrgencyPolicy {
    fn reorganize(&self, ctx: &PolicyContext<'_>) -> Option<StructuralChange> {
        let mut ranked: Vec<(RegionId, f64)> = ctx
            .index
            .leaves()
            .into_iter()
            .filter_map(|r| ctx.urgency.get(&r).map(|u| (r, *u)))
            .collect();
        heaviest_first(&mut ranked);
        if let Some((cell, urgency)) = ranked.first()
            && *urgency > self.split_threshold
            && ctx.has_room(self.max_cells)
            && ctx.splittable(*cell)
        {
            return Some(StructuralChange::Split {
                cell: *cell,
                strategy: self.strategy,
            });
        }

        let loads = ctx.leaf_values(LoadMetric::Entities);
        let loads_by_region: BTreeMap<RegionId, f64> = loads.iter().copied().collect();
        let mut pairs = ctx.leaf_pairs(&ranked);
        lightest_first(&mut pairs);
        pairs.into_iter().find_map(|(cell, _)| {
            let sibling = cell.sibling()?;
            let combined = loads_by_region.get(&cell)? + loads_by_region.get(&sibling)?;
            (combined <= self.merge_threshold).then_some(StructuralChange::Merge { cell })
        })
    }
}

/// Purely reactive policy driven by cell alerts.
#[derive(Debug, Clone, PartialEq)]
pub struct BottomUpPolicy {
    /// Maximum number of leaves.
    pub max_cells: usize,
    /// Plane placement for splits.
    pub strategy: SplitStrategy,
    /// When set, splits and idle merges are filtered by this trend, and
    /// idle sibling pairs are merged when no alert is pending.
    pub autonomic: Option<Autonomic>,
}

/// Extra settings for the autonomic form of [`BottomUpPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct Autonomic {
    /// Trend filter over the highest load per cycle.
    pub hysteresis: Hysteresis,
    /// Threshold the trend is compared with.
    pub split_threshold: f64,
    /// Idle pairs merge when their combined load is at or below this.
    pub merge_threshold: f64,
}

impl BottomUpPolicy {
    fn reorganize(&mut self, ctx: &PolicyContext<'_>) -> Option<StructuralChange> {
        if let Some(auto) = self.autonomic.as_mut() {
            let values = ctx.leaf_values(LoadMetric::Entities);
            let max_load = values.iter().map(|(_, v)| *v).fold(0.0_f64, f64::max);
            auto.hysteresis.observe(max_load);
        }

        let most_urgent = ctx
            .alerts
            .iter()
            .filter(|a| ctx.index.is_leaf(a.region))
            .max_by(|a, b| a.urgency.total_cmp(&b.urgency).then(b.region.cmp(&a.region)));
        if let Some(alert) = most_urgent {
            let trend_ok = self
                .autonomic
                .as_ref()
                .is_none_or(|auto| auto.hysteresis.allows_split(auto.split_threshold));
            if trend_ok && ctx.has_room(self.max_cells) && ctx.splittable(alert.region) {
                return Some(StructuralChange::Split {
                    cell: alert.region,
                    strategy: self.strategy,
                });
            }
            return None;
        }

        let auto = self.autonomic.as_ref()?;
        if !auto.hysteresis.allows_merge(auto.split_threshold) {
            return None;
        }
        let mut pairs = ctx.leaf_pairs(&ctx.leaf_values(LoadMetric::Entities));
        lightest_first(&mut pairs);
        pairs
            .into_iter()
            .find(|(_, v)| *v <= auto.merge_threshold)
            .map(|(cell, _)| StructuralChange::Merge { cell })
    }
}

/// The active reorganization policy.
#[derive(Debug, Clone, PartialEq)]
pub enum ReorganizationPolicy {
    /// Never reorganize.
    NoOp,
    /// Merge the deepest sibling pair each cycle until one leaf remains.
    CollapseToOne,
    /// Local-threshold balancing.
    Threshold(ThresholdPolicy),
    /// Neighbor-weighted urgency ranking.
    Urgency(UrgencyPolicy),
    /// Alert-driven.
    BottomUp(BottomUpPolicy),
}

impl ReorganizationPolicy {
    /// Build the preset named by `kind` from `config`.
    pub fn from_kind(kind: PolicyKind, config: &ReorganizationConfig) -> Self {
        let split_threshold = config.split_threshold;
        let merge_threshold = config.merge_threshold();
        let strategy = config.split_strategy;
        let fairness = || Fairness {
            max_cells: config.max_cells,
            hysteresis: Hysteresis::new(config.hysteresis_window, config.merge_ratio),
        };
        let threshold = |metric: LoadMetric, order: VisitOrder, fairness: Option<Fairness>| {
            Self::Threshold(ThresholdPolicy {
                metric,
                order,
                split_threshold,
                merge_threshold,
                strategy,
                fairness,
            })
        };
        match kind {
            PolicyKind::NoOp => Self::NoOp,
            PolicyKind::CollapseToOne => Self::CollapseToOne,
            PolicyKind::AgentThreshold => threshold(LoadMetric::Agents, VisitOrder::Region, None),
            PolicyKind::EntityThreshold => {
                threshold(LoadMetric::Entities, VisitOrder::Region, None)
            }
            PolicyKind::GreedyAgent => {
                threshold(LoadMetric::Agents, VisitOrder::DescendingLoad, None)
            }
            PolicyKind::GreedyEntity => {
                threshold(LoadMetric::Entities, VisitOrder::DescendingLoad, None)
            }
            PolicyKind::FairAgent => threshold(
                LoadMetric::Agents,
                VisitOrder::DescendingLoad,
                Some(fairness()),
            ),
            PolicyKind::FairEntity => threshold(
                LoadMetric::Entities,
                VisitOrder::DescendingLoad,
                Some(fairness()),
            ),
            PolicyKind::Urgency => Self::Urgency(UrgencyPolicy {
                split_threshold,
                merge_threshold,
                max_cells: config.max_cells,
                strategy,
            }),
            PolicyKind::BottomUp => Self::BottomUp(BottomUpPolicy {
                max_cells: config.max_cells,
                strategy,
                autonomic: None,
            }),
            PolicyKind::Autonomic => Self::BottomUp(BottomUpPolicy {
                max_cells: config.max_cells,
                strategy,
                autonomic: Some(Autonomic {
                    hysteresis: Hysteresis::new(config.hysteresis_window, config.merge_ratio),
                    split_threshold,
                    merge_threshold,
                }),
            }),
        }
    }

    /// Pick at most one structural change.
    pub fn reorganize(&mut self, ctx: &PolicyContext<'_>) -> Option<StructuralChange> {
        let change = match self {
            Self::NoOp => None,
            Self::CollapseToOne => collapse_step(ctx.index),
            Self::Threshold(policy) => policy.reorganize(ctx),
            Self::Urgency(policy) => policy.reorganize(ctx),
            Self::BottomUp(policy) => policy.reorganize(ctx),
        };
        if let Some(change) = change {
            debug!(%change, "Policy requested structural change");
        }
        change
    }
}

/// The deepest low-side leaf whose sibling is also a leaf.
///
/// The deepest leaf's sibling is always a leaf, so this only returns
/// `None` when the partition is a single cell.
fn collapse_step(index: &SpatialIndex) -> Option<StructuralChange> {
    index
        .leaves()
        .into_iter()
        .filter(|r| r.side() == Some(Side::Low))
        .filter(|r| r.sibling().is_some_and(|s| index.is_leaf(s)))
        .max_by(|a, b| a.depth().cmp(&b.depth()).then(b.cmp(a)))
        .map(|cell| StructuralChange::Merge { cell })
}
