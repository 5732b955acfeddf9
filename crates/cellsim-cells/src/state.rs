//! Per-region container of agents, objects, and pending events.
//!
//! A [`CellState`] is created when a region is carved by a split (or as the
//! bootstrap root) and absorbed when its region is merged back into the
//! parent.
//!
//! # Placement rules
//!
//! Agents and events belong to the child whose side of the split plane
//! holds their position; a position exactly on the plane goes to the high
//! child. Objects belong to every child their bounds reach into, so an
//! object straddling the plane is copied into both halves and deduplicated
//! by id when the halves merge again.

use std::collections::BTreeMap;

use cellsim_types::{
    AgentId, AgentRecord, Axis, Bounds, Collision, Entity, EntityRef, EventId, EventRecord,
    ExternalStimulus, ObjectId, ObjectRecord, RegionId, SplitStrategy, Vec3, geometry::EPSILON,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conflict::{Blocker, MoveOutcome, MovePlan, ProposedAgent};
use crate::error::CellError;
use crate::inbox::StimulusBuffer;
use crate::workload::{WorkloadSample, WorkloadWeights, count_f64};

/// Contents of one leaf region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    region: RegionId,
    bounds: Bounds,
    tick: u64,
    agents: BTreeMap<AgentId, AgentRecord>,
    objects: BTreeMap<ObjectId, ObjectRecord>,
    events: BTreeMap<EventId, EventRecord>,
}

/// The two halves produced by [`CellState::split`].
#[derive(Debug, Clone, PartialEq)]
pub struct CellSplit {
    /// Axis of the split plane.
    pub axis: Axis,
    /// Position of the split plane.
    pub coordinate: f64,
    /// Half below the plane.
    pub low: CellState,
    /// Half on or above the plane.
    pub high: CellState,
}

/// Summary of one deliberate step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deliberation {
    /// Tick the step committed.
    pub tick: u64,
    /// Moves committed.
    pub accepted: usize,
    /// Moves rejected by conflict resolution.
    pub rejected: usize,
    /// External stimuli applied.
    pub applied: usize,
    /// External stimuli refused, with the reason.
    pub refused: Vec<CellError>,
    /// Stimuli naming an entity the cell no longer holds, to be routed
    /// again to wherever it went.
    pub stale: Vec<ExternalStimulus>,
    /// Entities created here this tick.
    pub created: Vec<EntityRef>,
    /// Events that outlived their TTL.
    pub expired: usize,
    /// Agents whose committed position left the cell.
    pub emigrants: Vec<AgentRecord>,
}

/// Which halves of a split at `coordinate` on `axis` receive `footprint`.
///
/// A box goes to every half it reaches into. A point (or a box lying flat
/// on the plane) goes low only when strictly below the plane.
pub fn split_sides(axis: Axis, coordinate: f64, footprint: &Bounds) -> (bool, bool) {
    let min = footprint.min().get(axis);
    let max = footprint.max().get(axis);
    (min < coordinate, max > coordinate || min >= coordinate)
}

impl CellState {
    /// An empty cell covering `bounds`.
    pub const fn new(region: RegionId, bounds: Bounds) -> Self {
        Self {
            region,
            bounds,
            tick: 0,
            agents: BTreeMap::new(),
            objects: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }

    /// The region this cell covers.
    pub const fn region(&self) -> RegionId {
        self.region
    }

    /// The cell's bounds.
    pub const fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Tick of the last committed deliberate.
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Agents by id.
    pub const fn agents(&self) -> &BTreeMap<AgentId, AgentRecord> {
        &self.agents
    }

    /// Objects by id.
    pub const fn objects(&self) -> &BTreeMap<ObjectId, ObjectRecord> {
        &self.objects
    }

    /// Pending events by id.
    pub const fn events(&self) -> &BTreeMap<EventId, EventRecord> {
        &self.events
    }

    /// Look up an agent.
    pub fn agent(&self, id: AgentId) -> Option<&AgentRecord> {
        self.agents.get(&id)
    }

    /// Whether the cell holds no entities.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.objects.is_empty() && self.events.is_empty()
    }

    /// Whether the cell holds the referenced entity.
    pub fn holds(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Agent(id) => self.agents.contains_key(&id),
            EntityRef::Object(id) => self.objects.contains_key(&id),
            EntityRef::Event(id) => self.events.contains_key(&id),
        }
    }

    /// Workload of the cell at its current tick.
    pub fn workload(&self, weights: &WorkloadWeights) -> WorkloadSample {
        WorkloadSample {
            region: self.region,
            load: weights.load(self.agents.len(), self.objects.len()),
            agents: self.agents.len(),
            objects: self.objects.len(),
            tick: self.tick,
        }
    }

    // -------------------------------------------------------------------
    // Entity mutation
    // -------------------------------------------------------------------

    /// Create a new entity in the cell.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::DuplicateEntity`] if the id is taken, or
    /// [`CellError::Collides`] if an agent or object would overlap a
    /// collidable object.
    pub fn insert(&mut self, entity: Entity) -> Result<(), CellError> {
        let entity_ref = entity.entity_ref();
        if self.holds(entity_ref) {
            return Err(CellError::DuplicateEntity(entity_ref));
        }
        match entity {
            Entity::Agent(agent) => {
                self.check_clear(entity_ref, &agent.bounding_box())?;
                self.agents.insert(agent.id, agent);
            }
            Entity::Object(object) => {
                self.check_clear(entity_ref, &object.bounds)?;
                self.objects.insert(object.id, object);
            }
            Entity::Event(event) => {
                self.events.insert(event.id, event);
            }
        }
        Ok(())
    }

    /// Accept an entity handed over from another cell, without validation.
    pub fn admit(&mut self, entity: Entity) {
        match entity {
            Entity::Agent(agent) => {
                self.agents.insert(agent.id, agent);
            }
            Entity::Object(object) => {
                self.objects.insert(object.id, object);
            }
            Entity::Event(event) => {
                self.events.insert(event.id, event);
            }
        }
    }

    /// Replace an existing entity's record.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::UnknownEntity`] if the cell does not hold it.
    pub fn modify(&mut self, entity: Entity) -> Result<(), CellError> {
        let entity_ref = entity.entity_ref();
        if !self.holds(entity_ref) {
            return Err(CellError::UnknownEntity(entity_ref));
        }
        self.admit(entity);
        Ok(())
    }

    /// Remove an entity and return its record.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::UnknownEntity`] if the cell does not hold it.
    pub fn remove(&mut self, entity: EntityRef) -> Result<Entity, CellError> {
        let removed = match entity {
            EntityRef::Agent(id) => self.agents.remove(&id).map(Entity::Agent),
            EntityRef::Object(id) => self.objects.remove(&id).map(Entity::Object),
            EntityRef::Event(id) => self.events.remove(&id).map(Entity::Event),
        };
        removed.ok_or(CellError::UnknownEntity(entity))
    }

    /// Apply one external stimulus.
    ///
    /// # Errors
    ///
    /// Propagates the error of the underlying mutation.
    pub fn apply(&mut self, stimulus: ExternalStimulus) -> Result<(), CellError> {
        match stimulus {
            ExternalStimulus::Create(entity) => self.insert(entity),
            ExternalStimulus::Destroy(entity) | ExternalStimulus::Remove(entity) => {
                self.remove(entity).map(drop)
            }
            ExternalStimulus::Modify(entity) => self.modify(entity),
            ExternalStimulus::Add(entity) => {
                self.admit(entity);
                Ok(())
            }
            ExternalStimulus::Trigger(event) => self.insert(Entity::Event(event)),
        }
    }

    /// The first collidable object other than `entity` overlapping `volume`.
    pub fn blocking_object(&self, entity: EntityRef, volume: &Bounds) -> Option<ObjectId> {
        self.objects
            .values()
            .find(|o| o.collidable && EntityRef::Object(o.id) != entity && o.bounds.overlaps(volume))
            .map(|o| o.id)
    }

    /// Check that `entity` may occupy `volume`.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::Collides`] naming the first blocking object.
    pub fn check_clear(&self, entity: EntityRef, volume: &Bounds) -> Result<(), CellError> {
        match self.blocking_object(entity, volume) {
            Some(object) => Err(CellError::Collides { entity, object }),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------
    // Structure
    // -------------------------------------------------------------------

    /// Split the cell in two along its longer horizontal axis.
    ///
    /// [`SplitStrategy::Demographic`] places the plane at the agent
    /// centroid and falls back to the midpoint when the cell has no agents
    /// or the centroid lies on or outside the cell edge. On success the
    /// cell itself is left empty.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::DepthExhausted`] at maximum depth, or
    /// [`CellError::Geometry`] if the cell is too thin to split.
    pub fn split(&mut self, strategy: SplitStrategy) -> Result<CellSplit, CellError> {
        let [low_id, high_id] = self
            .region
            .children()
            .ok_or(CellError::DepthExhausted(self.region))?;
        let axis = self.bounds.longer_horizontal_axis();
        let midpoint = self.bounds.center().get(axis);
        let coordinate = match strategy {
            SplitStrategy::Midpoint => midpoint,
            SplitStrategy::Demographic => self.agent_centroid(axis).unwrap_or(midpoint),
        };
        let (coordinate, (low_bounds, high_bounds)) = match self.bounds.split_at(axis, coordinate)
        {
            Ok(halves) => (coordinate, halves),
            Err(_) => (midpoint, self.bounds.split_at(axis, midpoint)?),
        };

        let mut low = Self::new(low_id, low_bounds);
        let mut high = Self::new(high_id, high_bounds);
        low.tick = self.tick;
        high.tick = self.tick;
        let below = |p: Vec3| p.get(axis) < coordinate;

        for (id, agent) in std::mem::take(&mut self.agents) {
            let half = if below(agent.position()) { &mut low } else { &mut high };
            half.agents.insert(id, agent);
        }
        for (id, event) in std::mem::take(&mut self.events) {
            let half = if below(event.position) { &mut low } else { &mut high };
            half.events.insert(id, event);
        }
        for (id, object) in std::mem::take(&mut self.objects) {
            let (to_low, to_high) = split_sides(axis, coordinate, &object.bounds);
            if to_low {
                low.objects.insert(id, object.clone());
            }
            if to_high {
                high.objects.insert(id, object);
            }
        }

        debug!(
            region = %self.region,
            ?axis,
            coordinate,
            low_agents = low.agents.len(),
            high_agents = high.agents.len(),
            "Cell split"
        );
        Ok(CellSplit {
            axis,
            coordinate,
            low,
            high,
        })
    }

    /// Mean agent position along `axis`, if it lies strictly inside the cell.
    fn agent_centroid(&self, axis: Axis) -> Option<f64> {
        if self.agents.is_empty() {
            return None;
        }
        let sum: f64 = self.agents.values().map(|a| a.position().get(axis)).sum();
        let centroid = sum / count_f64(self.agents.len());
        let min = self.bounds.min().get(axis);
        let max = self.bounds.max().get(axis);
        (centroid > min + EPSILON && centroid < max - EPSILON).then_some(centroid)
    }

    /// Absorb `sibling`, turning this cell into the parent region.
    ///
    /// Objects present in both cells are kept once. On success `sibling` is
    /// left empty; on error neither cell is modified.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::NotSiblings`] unless both cells share a parent.
    pub fn merge(&mut self, sibling: &mut Self) -> Result<(), CellError> {
        let not_siblings = CellError::NotSiblings {
            region: self.region,
            other: sibling.region,
        };
        if self.region.sibling() != Some(sibling.region) {
            return Err(not_siblings);
        }
        let parent = self.region.parent().ok_or(not_siblings)?;

        self.bounds = self.bounds.union(&sibling.bounds);
        self.region = parent;
        self.tick = self.tick.max(sibling.tick);
        self.agents.append(&mut sibling.agents);
        self.events.append(&mut sibling.events);
        for (id, object) in std::mem::take(&mut sibling.objects) {
            self.objects.entry(id).or_insert(object);
        }
        debug!(region = %parent, agents = self.agents.len(), "Cells merged");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Two-phase tick
    // -------------------------------------------------------------------

    /// Propose next kinematics for every agent, in agent-id order.
    ///
    /// The buffered intention (user commands first) sets the velocity and,
    /// if given, the heading; otherwise an agent keeps its velocity. A
    /// moving agent without an explicit heading faces its direction of
    /// travel. Committed state is not touched.
    pub fn react(&self, buffer: &StimulusBuffer, tick_seconds: f64) -> Vec<ProposedAgent> {
        self.agents
            .values()
            .map(|agent| {
                let current = agent.kinematics;
                let mut next = current;
                let intention = buffer.intention_for(agent.id);
                if let Some(intention) = intention {
                    next.velocity = intention.velocity;
                }
                match intention.and_then(|i| i.heading) {
                    Some(heading) => next.heading = heading,
                    None if next.velocity.horizontal_length() > EPSILON => {
                        next.heading = next.velocity.y.atan2(next.velocity.x);
                    }
                    None => {}
                }
                next.position = current.position + next.velocity * tick_seconds;
                ProposedAgent {
                    id: agent.id,
                    current,
                    next,
                }
            })
            .collect()
    }

    /// Propose and resolve this tick's moves against the cell's own
    /// contents, without committing them.
    pub fn plan_moves(
        &self,
        buffer: &StimulusBuffer,
        tick_seconds: f64,
        world: &Bounds,
    ) -> MovePlan {
        MovePlan::resolve(self.react(buffer, tick_seconds), &self.objects, world)
    }

    /// Resolve and commit `proposals`, apply `stimuli`, and stamp `tick`.
    ///
    /// Shorthand for [`MovePlan::resolve`] followed by [`Self::commit`].
    pub fn deliberate(
        &mut self,
        proposals: &[ProposedAgent],
        stimuli: Vec<ExternalStimulus>,
        tick: u64,
        world: &Bounds,
    ) -> Deliberation {
        let plan = MovePlan::resolve(proposals.to_vec(), &self.objects, world);
        self.commit(&plan, stimuli, tick, world)
    }

    /// Commit `plan`, apply `stimuli`, and stamp `tick`.
    ///
    /// Rejected movers hold position with zero velocity and, together with
    /// any blocking agent, record the collision. Stimuli are applied in
    /// order; failures are reported, not fatal, and stimuli whose target has
    /// left the cell are handed back as stale. Events past their TTL are
    /// dropped, and agents that no longer belong to the cell are returned
    /// as emigrants.
    pub fn commit(
        &mut self,
        plan: &MovePlan,
        stimuli: Vec<ExternalStimulus>,
        tick: u64,
        world: &Bounds,
    ) -> Deliberation {
        let mut report = Deliberation {
            tick,
            ..Deliberation::default()
        };

        for proposal in &plan.proposals {
            match plan.outcomes.get(&proposal.id) {
                Some(MoveOutcome::Accepted) => {
                    if let Some(agent) = self.agents.get_mut(&proposal.id) {
                        agent.kinematics = proposal.next;
                        report.accepted = report.accepted.saturating_add(1);
                    }
                }
                Some(MoveOutcome::Rejected { blocker }) => {
                    self.hold_position(proposal.id, *blocker, tick);
                    report.rejected = report.rejected.saturating_add(1);
                }
                None => {}
            }
        }
        for (id, mover) in &plan.bumped {
            if let Some(agent) = self.agents.get_mut(id) {
                agent.collisions.record(Collision {
                    other: EntityRef::Agent(*mover),
                    tick,
                });
            }
        }

        for stimulus in stimuli {
            let name = stimulus.name();
            let target = stimulus.target();
            let retry = matches!(
                stimulus,
                ExternalStimulus::Modify(_) | ExternalStimulus::Destroy(_)
            )
            .then(|| stimulus.clone());
            let creates = matches!(stimulus, ExternalStimulus::Create(_));
            match (self.apply(stimulus), retry) {
                (Ok(()), _) => {
                    report.applied = report.applied.saturating_add(1);
                    if creates {
                        report.created.push(target);
                    }
                }
                (Err(CellError::UnknownEntity(_)), Some(stimulus)) => {
                    debug!(region = %self.region, tick, stimulus = name, "Stimulus target not held here");
                    report.stale.push(stimulus);
                }
                (Err(error), _) => {
                    debug!(region = %self.region, tick, stimulus = name, %error, "Stimulus refused");
                    report.refused.push(error);
                }
            }
        }

        let before = self.events.len();
        self.events.retain(|_, event| !event.is_expired(tick));
        report.expired = before.saturating_sub(self.events.len());

        let leaving: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| !self.bounds.owns(a.position(), world))
            .map(|a| a.id)
            .collect();
        for id in leaving {
            if let Some(agent) = self.agents.remove(&id) {
                report.emigrants.push(agent);
            }
        }

        self.tick = tick;
        debug!(
            region = %self.region,
            tick,
            accepted = report.accepted,
            rejected = report.rejected,
            applied = report.applied,
            emigrants = report.emigrants.len(),
            "Cell deliberated"
        );
        report
    }

    fn hold_position(&mut self, id: AgentId, blocker: Blocker, tick: u64) {
        if let Some(agent) = self.agents.get_mut(&id) {
            agent.kinematics.velocity = Vec3::ZERO;
            let other = match blocker {
                Blocker::Object(object) => Some(EntityRef::Object(object)),
                Blocker::Agent(other) => Some(EntityRef::Agent(other)),
                Blocker::WorldEdge => None,
            };
            if let Some(other) = other {
                agent.collisions.record(Collision { other, tick });
            }
        }
        if let Blocker::Agent(other) = blocker
            && let Some(blocking) = self.agents.get_mut(&other)
        {
            blocking.collisions.record(Collision {
                other: EntityRef::Agent(id),
                tick,
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use cellsim_types::{Intention, ObjectId};

    use super::*;

    fn world() -> Bounds {
        Bounds::new(Vec3::ZERO, Vec3::new(100.0, 100.0, 10.0)).unwrap()
    }

    fn root_cell() -> CellState {
        CellState::new(RegionId::ROOT, world())
    }

    fn agent_at(x: f64, y: f64) -> AgentRecord {
        AgentRecord::new(AgentId::new(), Vec3::new(x, y, 1.0))
    }

    fn object(min: (f64, f64), max: (f64, f64)) -> ObjectRecord {
        ObjectRecord::new(
            ObjectId::new(),
            "crate",
            Bounds::new(Vec3::new(min.0, min.1, 0.0), Vec3::new(max.0, max.1, 2.0)).unwrap(),
        )
    }

    #[test]
    fn midpoint_split_places_agent_in_low_child() {
        let mut cell = root_cell();
        let agent = agent_at(10.0, 10.0);
        let id = agent.id;
        cell.insert(Entity::Agent(agent)).unwrap();

        let split = cell.split(SplitStrategy::Midpoint).unwrap();
        assert_eq!(split.axis, Axis::X);
        assert_eq!(split.coordinate, 50.0);
        assert!(split.low.agent(id).is_some());
        assert!(split.high.agent(id).is_none());
        assert_eq!(split.low.bounds().max().x, 50.0);
        assert!(cell.is_empty());
    }

    #[test]
    fn agent_on_plane_goes_to_high_child_only() {
        let mut cell = root_cell();
        let agent = agent_at(50.0, 20.0);
        let id = agent.id;
        cell.insert(Entity::Agent(agent)).unwrap();
        let split = cell.split(SplitStrategy::Midpoint).unwrap();
        assert!(split.low.agent(id).is_none());
        assert!(split.high.agent(id).is_some());
    }

    #[test]
    fn demographic_split_uses_centroid() {
        let mut cell = root_cell();
        for x in [10.0, 20.0, 30.0] {
            cell.insert(Entity::Agent(agent_at(x, 5.0))).unwrap();
        }
        let split = cell.split(SplitStrategy::Demographic).unwrap();
        assert_eq!(split.coordinate, 20.0);
        assert_eq!(split.low.agents().len(), 1);
        assert_eq!(split.high.agents().len(), 2);
    }

    #[test]
    fn demographic_split_without_agents_falls_back_to_midpoint() {
        let mut cell = root_cell();
        let split = cell.split(SplitStrategy::Demographic).unwrap();
        assert_eq!(split.coordinate, 50.0);
    }

    #[test]
    fn demographic_split_with_centroid_on_edge_falls_back_to_midpoint() {
        let mut cell = root_cell();
        cell.insert(Entity::Agent(agent_at(0.0, 5.0))).unwrap();
        cell.insert(Entity::Agent(agent_at(0.0, 50.0))).unwrap();
        let split = cell.split(SplitStrategy::Demographic).unwrap();
        assert_eq!(split.coordinate, 50.0);
        assert_eq!(split.low.agents().len(), 2);
    }

    #[test]
    fn straddling_object_lands_in_both_children() {
        let mut cell = root_cell();
        let wide = object((40.0, 10.0), (60.0, 20.0));
        let touching = object((45.0, 30.0), (50.0, 40.0));
        let (wide_id, touching_id) = (wide.id, touching.id);
        cell.insert(Entity::Object(wide)).unwrap();
        cell.insert(Entity::Object(touching)).unwrap();

        let split = cell.split(SplitStrategy::Midpoint).unwrap();
        assert!(split.low.objects().contains_key(&wide_id));
        assert!(split.high.objects().contains_key(&wide_id));
        assert!(split.low.objects().contains_key(&touching_id));
        assert!(!split.high.objects().contains_key(&touching_id));
    }

    #[test]
    fn split_then_merge_round_trips() {
        let mut cell = root_cell();
        cell.insert(Entity::Agent(agent_at(10.0, 10.0))).unwrap();
        cell.insert(Entity::Agent(agent_at(70.0, 90.0))).unwrap();
        cell.insert(Entity::Object(object((40.0, 10.0), (60.0, 20.0))))
            .unwrap();
        cell.insert(Entity::Event(EventRecord::new(
            EventId::new(),
            "bell",
            Vec3::new(80.0, 80.0, 1.0),
            0,
        )))
        .unwrap();
        let original = cell.clone();

        let mut split = cell.split(SplitStrategy::Midpoint).unwrap();
        split.low.merge(&mut split.high).unwrap();
        assert_eq!(split.low, original);
        assert!(split.high.is_empty());
    }

    #[test]
    fn merge_rejects_non_siblings() {
        let mut cell = root_cell();
        let split = cell.split(SplitStrategy::Midpoint).unwrap();
        let mut low = split.low;
        let mut high_half = split.high.clone();
        let mut grandchildren = high_half.split(SplitStrategy::Midpoint).unwrap();
        let result = low.merge(&mut grandchildren.low);
        assert!(matches!(result, Err(CellError::NotSiblings { .. })));
        assert_eq!(low.region(), "r0".parse::<RegionId>().unwrap());
        grandchildren.low.merge(&mut grandchildren.high).unwrap();
        assert_eq!(grandchildren.low.region(), "r1".parse::<RegionId>().unwrap());
    }

    #[test]
    fn creation_rejected_on_collidable_overlap_or_duplicate() {
        let mut cell = root_cell();
        let rock = object((10.0, 10.0), (20.0, 20.0));
        let rock_id = rock.id;
        cell.insert(Entity::Object(rock.clone())).unwrap();

        let overlapping = object((15.0, 15.0), (25.0, 25.0));
        assert!(matches!(
            cell.insert(Entity::Object(overlapping)),
            Err(CellError::Collides { object, .. }) if object == rock_id
        ));
        assert!(matches!(
            cell.insert(Entity::Agent(agent_at(15.0, 15.0))),
            Err(CellError::Collides { .. })
        ));
        assert!(matches!(
            cell.insert(Entity::Object(rock)),
            Err(CellError::DuplicateEntity(_))
        ));
    }

    #[test]
    fn react_does_not_mutate_state() {
        let mut cell = root_cell();
        let agent = agent_at(10.0, 10.0);
        let id = agent.id;
        cell.insert(Entity::Agent(agent)).unwrap();
        let mut buffer = StimulusBuffer::new();
        buffer.push_intention(Intention::moving(id, Vec3::new(0.0, 2.0, 0.0)));

        let proposals = cell.react(&buffer, 0.5);
        assert_eq!(proposals.len(), 1);
        let proposal = proposals.first().unwrap();
        assert_eq!(proposal.next.position, Vec3::new(10.0, 11.0, 1.0));
        assert!((proposal.next.heading - core::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert_eq!(cell.agent(id).unwrap().position(), Vec3::new(10.0, 10.0, 1.0));
    }

    #[test]
    fn contested_move_keeps_later_agent_in_place() {
        let mut cell = root_cell();
        let first = agent_at(10.0, 10.0);
        let second = agent_at(14.0, 10.0);
        let (a, b) = (first.id, second.id);
        cell.insert(Entity::Agent(first)).unwrap();
        cell.insert(Entity::Agent(second)).unwrap();

        let mut buffer = StimulusBuffer::new();
        buffer.push_intention(Intention::moving(a, Vec3::new(2.0, 0.0, 0.0)));
        buffer.push_intention(Intention::moving(b, Vec3::new(-2.0, 0.0, 0.0)));
        let proposals = cell.react(&buffer, 1.0);
        let report = cell.deliberate(&proposals, Vec::new(), 1, &world());

        assert_eq!((report.accepted, report.rejected), (1, 1));
        assert_eq!(cell.agent(a).unwrap().position(), Vec3::new(12.0, 10.0, 1.0));
        let held = cell.agent(b).unwrap();
        assert_eq!(held.position(), Vec3::new(14.0, 10.0, 1.0));
        assert_eq!(held.kinematics.velocity, Vec3::ZERO);
        assert_eq!(
            held.collisions.latest().map(|c| c.other),
            Some(EntityRef::Agent(a))
        );
        assert_eq!(
            cell.agent(a).unwrap().collisions.latest().map(|c| c.other),
            Some(EntityRef::Agent(b))
        );
        assert_eq!(cell.tick(), 1);
    }

    #[test]
    fn deliberate_returns_emigrants() {
        let mut cell = root_cell();
        let mut halves = cell.split(SplitStrategy::Midpoint).unwrap();
        let agent = agent_at(49.0, 10.0);
        let id = agent.id;
        halves.low.insert(Entity::Agent(agent)).unwrap();

        let mut buffer = StimulusBuffer::new();
        buffer.push_intention(Intention::moving(id, Vec3::new(2.0, 0.0, 0.0)));
        let proposals = halves.low.react(&buffer, 1.0);
        let report = halves.low.deliberate(&proposals, Vec::new(), 3, &world());
        assert_eq!(report.emigrants.len(), 1);
        assert!(halves.low.agent(id).is_none());
    }

    #[test]
    fn stimuli_apply_in_order_and_events_expire() {
        let mut cell = root_cell();
        let mut flare = EventRecord::new(EventId::new(), "flare", Vec3::new(5.0, 5.0, 1.0), 1);
        flare.ttl_ticks = Some(2);
        let flare_ref = EntityRef::Event(flare.id);
        let agent = agent_at(30.0, 30.0);
        let agent_ref = EntityRef::Agent(agent.id);

        let stimuli = vec![
            ExternalStimulus::Trigger(flare),
            ExternalStimulus::Create(Entity::Agent(agent.clone())),
            ExternalStimulus::Create(Entity::Agent(agent)),
            ExternalStimulus::Destroy(agent_ref),
        ];
        let report = cell.deliberate(&[], stimuli, 1, &world());
        assert_eq!(report.applied, 3);
        assert_eq!(report.refused, vec![CellError::DuplicateEntity(agent_ref)]);
        assert!(cell.holds(flare_ref));
        assert!(!cell.holds(agent_ref));

        let report = cell.deliberate(&[], Vec::new(), 3, &world());
        assert_eq!(report.expired, 1);
        assert!(!cell.holds(flare_ref));
    }

    #[test]
    fn stimuli_for_departed_entities_are_stale() {
        let mut cell = root_cell();
        let gone = EntityRef::Agent(AgentId::new());
        let rock = object((10.0, 10.0), (12.0, 12.0));
        let rock_ref = EntityRef::Object(rock.id);
        let stimuli = vec![
            ExternalStimulus::Create(Entity::Object(rock)),
            ExternalStimulus::Destroy(gone),
            ExternalStimulus::Remove(gone),
        ];
        let report = cell.deliberate(&[], stimuli, 1, &world());
        assert_eq!(report.created, vec![rock_ref]);
        assert_eq!(report.stale, vec![ExternalStimulus::Destroy(gone)]);
        assert_eq!(report.refused.len(), 1);
    }

    #[test]
    fn blocking_object_ignores_the_entity_itself() {
        let mut cell = root_cell();
        let rock = object((10.0, 10.0), (12.0, 12.0));
        let rock_ref = EntityRef::Object(rock.id);
        let volume = rock.bounds;
        cell.insert(Entity::Object(rock)).unwrap();
        assert_eq!(cell.blocking_object(rock_ref, &volume), None);
        let other = EntityRef::Object(ObjectId::new());
        assert!(matches!(
            cell.check_clear(other, &volume),
            Err(CellError::Collides { .. })
        ));
    }

    #[test]
    fn bumped_agents_record_foreign_collisions() {
        let mut cell = root_cell();
        let sitter = agent_at(10.0, 10.0);
        let id = sitter.id;
        cell.insert(Entity::Agent(sitter)).unwrap();
        let mut plan = cell.plan_moves(&StimulusBuffer::new(), 1.0, &world());
        let mover = AgentId::new();
        plan.bump(id, mover);
        cell.commit(&plan, Vec::new(), 4, &world());
        assert_eq!(
            cell.agent(id).unwrap().collisions.latest().map(|c| (c.other, c.tick)),
            Some((EntityRef::Agent(mover), 4))
        );
    }

    #[test]
    fn workload_counts_entities() {
        let mut cell = root_cell();
        for x in [10.0, 20.0, 30.0] {
            cell.insert(Entity::Agent(agent_at(x, 60.0))).unwrap();
        }
        cell.insert(Entity::Object(object((80.0, 80.0), (90.0, 90.0))))
            .unwrap();
        let sample = cell.workload(&WorkloadWeights::default());
        assert_eq!(sample.agents, 3);
        assert_eq!(sample.objects, 1);
        assert_eq!(sample.load, 4.0);
    }
}
