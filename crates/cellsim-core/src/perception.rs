//! Perception subscriptions and combined per-agent views.
//!
//! Every environment phase, after the cells have published their state,
//! the [`PerceptionSubscriptionService`] works out which leaves each agent
//! can perceive and merges their contents into one [`CombinedState`] per
//! agent:
//!
//! - a vision-capable agent subscribes to every leaf its view sector
//!   touches, found with [`SpatialIndex::regions_intersecting`] starting
//!   from the agent's own cell;
//! - a hearing- or smell-capable agent always subscribes to its own cell.
//!
//! Subscriptions and accumulators are rebuilt from scratch on every pass.
//! Nothing is cached across ticks.

use std::collections::{BTreeMap, BTreeSet};

use cellsim_cells::CellState;
use cellsim_space::SpatialIndex;
use cellsim_types::{
    AgentId, AgentRecord, Bounds, Capabilities, EventId, EventRecord, ObjectId, ObjectRecord,
    RegionId, Shape, Vec3, ViewSector,
};
use rayon::prelude::*;
use tracing::debug;

/// Geometry collaborator used to scope perception.
pub trait Geometry: Send + Sync {
    /// Whether `shape` touches `region`.
    fn bounds_intersects(&self, region: &Bounds, shape: &Shape) -> bool;

    /// Whether `point` lies in `region`.
    fn region_contains(&self, region: &Bounds, point: Vec3) -> bool;

    /// The view shape of `agent`, or `None` if it cannot see.
    fn visible_region(&self, agent: &AgentRecord) -> Option<Shape>;
}

/// View sectors built from each agent's heading and vision range.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardGeometry;

impl Geometry for StandardGeometry {
    fn bounds_intersects(&self, region: &Bounds, shape: &Shape) -> bool {
        shape.intersects(region)
    }

    fn region_contains(&self, region: &Bounds, point: Vec3) -> bool {
        region.contains(point)
    }

    fn visible_region(&self, agent: &AgentRecord) -> Option<Shape> {
        if !agent.capabilities.contains(Capabilities::VISION) {
            return None;
        }
        Some(Shape::Sector(ViewSector::new(
            agent.position(),
            agent.kinematics.heading,
            agent.vision.field_of_view,
            agent.vision.distance,
        )))
    }
}

/// Union of the contents of every cell an agent perceives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombinedState {
    /// Latest tick among the merged cells.
    pub timestamp: u64,
    /// Cells merged into this view.
    pub sources: BTreeSet<RegionId>,
    /// Perceived agents (including the perceiver).
    pub agents: BTreeMap<AgentId, AgentRecord>,
    /// Perceived objects.
    pub objects: BTreeMap<ObjectId, ObjectRecord>,
    /// Perceived events.
    pub events: BTreeMap<EventId, EventRecord>,
}

impl CombinedState {
    /// Merge one published cell into the view.
    pub fn merge_cell(&mut self, cell: &CellState) {
        self.sources.insert(cell.region());
        self.timestamp = self.timestamp.max(cell.tick());
        self.agents
            .extend(cell.agents().iter().map(|(id, a)| (*id, a.clone())));
        self.objects
            .extend(cell.objects().iter().map(|(id, o)| (*id, o.clone())));
        self.events
            .extend(cell.events().iter().map(|(id, e)| (*id, e.clone())));
    }
}

/// Counts from one perception pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerceptionReport {
    /// Agents with at least one subscription.
    pub perceivers: usize,
    /// Total agent-to-cell subscriptions.
    pub subscriptions: usize,
}

/// Computes per-agent subscriptions and combined states each tick.
pub struct PerceptionSubscriptionService {
    geometry: Box<dyn Geometry>,
    subscriptions: BTreeMap<AgentId, BTreeSet<RegionId>>,
    combined: BTreeMap<AgentId, CombinedState>,
}

impl core::fmt::Debug for PerceptionSubscriptionService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerceptionSubscriptionService")
            .field("subscriptions", &self.subscriptions.len())
            .field("combined", &self.combined.len())
            .finish_non_exhaustive()
    }
}

impl Default for PerceptionSubscriptionService {
    fn default() -> Self {
        Self::new(Box::new(StandardGeometry))
    }
}

impl PerceptionSubscriptionService {
    /// Create a service using `geometry` to scope views.
    pub fn new(geometry: Box<dyn Geometry>) -> Self {
        Self {
            geometry,
            subscriptions: BTreeMap::new(),
            combined: BTreeMap::new(),
        }
    }

    /// Cells `agent` subscribed to in the last pass.
    pub fn subscriptions_for(&self, agent: AgentId) -> Option<&BTreeSet<RegionId>> {
        self.subscriptions.get(&agent)
    }

    /// Whether the last pass produced a combined state for `agent`.
    pub fn has_combined_state_for(&self, agent: AgentId) -> bool {
        self.combined.contains_key(&agent)
    }

    /// The combined state produced for `agent` by the last pass.
    pub fn retrieve_combined_state_for(&self, agent: AgentId) -> Option<&CombinedState> {
        self.combined.get(&agent)
    }

    /// Cells one agent perceives from `cell`.
    fn subscribe(
        &self,
        index: &SpatialIndex,
        cell: &CellState,
        agent: &AgentRecord,
    ) -> BTreeSet<RegionId> {
        let mut regions = BTreeSet::new();
        if let Some(shape) = self.geometry.visible_region(agent) {
            regions.extend(
                index
                    .regions_intersecting(cell.region(), &shape)
                    .into_iter()
                    .filter(|r| {
                        index
                            .bounds(*r)
                            .is_some_and(|b| self.geometry.bounds_intersects(&b, &shape))
                    }),
            );
        }
        if agent.capabilities.senses_own_cell() {
            regions.insert(cell.region());
        }
        regions
    }

    /// Rebuild every subscription and combined state from `published`.
    ///
    /// `published` holds the state each leaf committed this tick. Work is
    /// spread over the current rayon pool.
    pub fn run_pass(&mut self, index: &SpatialIndex, published: &[CellState]) -> PerceptionReport {
        self.subscriptions.clear();
        self.combined.clear();

        let this = &*self;
        let subscriptions: BTreeMap<AgentId, BTreeSet<RegionId>> = published
            .par_iter()
            .flat_map_iter(|cell| {
                cell.agents()
                    .values()
                    .map(move |agent| (agent.id, this.subscribe(index, cell, agent)))
            })
            .filter(|(_, regions)| !regions.is_empty())
            .collect();

        let mut subscribers: BTreeMap<RegionId, Vec<AgentId>> = BTreeMap::new();
        for (agent, regions) in &subscriptions {
            for region in regions {
                subscribers.entry(*region).or_default().push(*agent);
            }
        }

        let by_region: BTreeMap<RegionId, &CellState> =
            published.iter().map(|c| (c.region(), c)).collect();
        let combined: BTreeMap<AgentId, CombinedState> = subscriptions
            .par_iter()
            .map(|(agent, regions)| {
                let mut view = CombinedState::default();
                for cell in regions.iter().filter_map(|r| by_region.get(r)) {
                    view.merge_cell(cell);
                }
                (*agent, view)
            })
            .collect();

        let report = PerceptionReport {
            perceivers: subscriptions.len(),
            subscriptions: subscribers.values().map(Vec::len).sum(),
        };
        self.subscriptions = subscriptions;
        self.combined = combined;
        debug!(
            perceivers = report.perceivers,
            subscriptions = report.subscriptions,
            "Perception pass complete"
        );
        report
    }

    /// Whether `point` lies in `region`, according to the geometry collaborator.
    pub fn region_contains(&self, region: &Bounds, point: Vec3) -> bool {
        self.geometry.region_contains(region, point)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use core::f64::consts::FRAC_PI_2;

    use cellsim_types::{Entity, HostId, SplitStrategy};

    use super::*;

    fn world() -> Bounds {
        Bounds::new(Vec3::ZERO, Vec3::new(100.0, 100.0, 10.0)).unwrap()
    }

    /// Root split at x = 50; left half split at y = 50.
    fn partitioned() -> (SpatialIndex, Vec<CellState>) {
        let mut index = SpatialIndex::new(world(), HostId::new());
        let mut root = CellState::new(RegionId::ROOT, world());
        let halves = root.split(SplitStrategy::Midpoint).unwrap();
        index
            .split(RegionId::ROOT, halves.low.bounds(), halves.high.bounds(), HostId::new())
            .unwrap();
        let mut left = halves.low;
        let quarters = left.split(SplitStrategy::Midpoint).unwrap();
        index
            .split(left.region(), quarters.low.bounds(), quarters.high.bounds(), HostId::new())
            .unwrap();
        (index, vec![quarters.low, quarters.high, halves.high])
    }

    #[test]
    fn hearing_only_agent_perceives_own_cell() {
        let (index, mut cells) = partitioned();
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(10.0, 10.0, 1.0))
            .with_capabilities(Capabilities::HEARING);
        let id = agent.id;
        cells.first_mut().unwrap().insert(Entity::Agent(agent)).unwrap();

        let mut service = PerceptionSubscriptionService::default();
        service.run_pass(&index, &cells);
        let subs = service.subscriptions_for(id).unwrap();
        assert_eq!(subs.len(), 1);
        assert!(subs.contains(&cells.first().unwrap().region()));
    }

    #[test]
    fn blind_deaf_agent_gets_no_view() {
        let (index, mut cells) = partitioned();
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(10.0, 10.0, 1.0))
            .with_capabilities(Capabilities::empty());
        let id = agent.id;
        cells.first_mut().unwrap().insert(Entity::Agent(agent)).unwrap();

        let mut service = PerceptionSubscriptionService::default();
        service.run_pass(&index, &cells);
        assert!(!service.has_combined_state_for(id));
        assert!(service.retrieve_combined_state_for(id).is_none());
    }

    #[test]
    fn vision_reaches_cells_ahead_only() {
        let (index, mut cells) = partitioned();
        // Looking along +y from the lower-left quarter: sees the upper-left
        // quarter but not the right half.
        let mut agent = AgentRecord::new(AgentId::new(), Vec3::new(10.0, 40.0, 1.0))
            .with_capabilities(Capabilities::VISION);
        agent.kinematics.heading = FRAC_PI_2;
        agent.vision.field_of_view = 0.2;
        agent.vision.distance = 20.0;
        let id = agent.id;
        cells.first_mut().unwrap().insert(Entity::Agent(agent)).unwrap();

        let mut service = PerceptionSubscriptionService::default();
        service.run_pass(&index, &cells);
        let subs = service.subscriptions_for(id).unwrap();
        let regions: Vec<RegionId> = cells.iter().map(CellState::region).collect();
        assert_eq!(subs.iter().copied().collect::<Vec<_>>(), regions.get(..2).unwrap());
    }

    #[test]
    fn pass_resets_previous_views() {
        let (index, mut cells) = partitioned();
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(10.0, 10.0, 1.0));
        let id = agent.id;
        cells.first_mut().unwrap().insert(Entity::Agent(agent)).unwrap();

        let mut service = PerceptionSubscriptionService::default();
        service.run_pass(&index, &cells);
        assert!(service.has_combined_state_for(id));

        cells.first_mut().unwrap().remove(cellsim_types::EntityRef::Agent(id)).unwrap();
        service.run_pass(&index, &cells);
        assert!(!service.has_combined_state_for(id));
    }
}
