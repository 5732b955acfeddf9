//! Movement conflict resolution within a cell.
//!
//! Each tick every agent proposes its next kinematics. Proposals are
//! resolved one at a time in agent-id order against a table of reserved
//! volumes that starts as every agent's current bounding box. When a move
//! is accepted the agent's reservation moves to its next box, so:
//!
//! 1. a move into a collidable object is rejected;
//! 2. a move onto another agent's current box, or onto a box already
//!    accepted this tick, is rejected (earlier ids win);
//! 3. a move whose position leaves the world is rejected.
//!
//! Rejection is normal policy, not an error: the agent holds position.
//!
//! A [`MovePlan`] only sees the cell's own agents and objects. Boxes that
//! reach past the cell edge are checked against neighbouring cells by the
//! orchestrator before the plan is committed, which may overturn accepted
//! moves with [`MovePlan::reject`].

use std::collections::BTreeMap;

use cellsim_types::{AgentId, Bounds, Kinematics, ObjectId, ObjectRecord};

/// An agent's proposed next kinematics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposedAgent {
    /// The moving agent.
    pub id: AgentId,
    /// Committed kinematics before the move.
    pub current: Kinematics,
    /// Proposed kinematics after the move.
    pub next: Kinematics,
}

impl ProposedAgent {
    /// Whether the proposal changes the agent's position.
    pub fn moves(&self) -> bool {
        self.current.position != self.next.position
    }
}

/// What stopped a rejected move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocker {
    /// A collidable object.
    Object(ObjectId),
    /// Another agent's current or accepted next volume.
    Agent(AgentId),
    /// The edge of the world.
    WorldEdge,
}

/// Outcome of one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The proposal is committed as-is.
    Accepted,
    /// The agent keeps its current position.
    Rejected {
        /// What the move ran into.
        blocker: Blocker,
    },
}

/// Resolved but uncommitted moves of one cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MovePlan {
    /// Proposals in agent-id order.
    pub proposals: Vec<ProposedAgent>,
    /// Outcome per agent.
    pub outcomes: BTreeMap<AgentId, MoveOutcome>,
    /// Agents of this cell that blocked a mover from another cell, paired
    /// with that mover.
    pub bumped: Vec<(AgentId, AgentId)>,
}

impl MovePlan {
    /// Resolve `proposals` against the cell's own contents.
    pub fn resolve(
        proposals: Vec<ProposedAgent>,
        objects: &BTreeMap<ObjectId, ObjectRecord>,
        world: &Bounds,
    ) -> Self {
        let outcomes = resolve_moves(&proposals, objects, world);
        Self {
            proposals,
            outcomes,
            bumped: Vec::new(),
        }
    }

    /// The proposal for `id`.
    pub fn proposal(&self, id: AgentId) -> Option<&ProposedAgent> {
        self.proposals.iter().find(|p| p.id == id)
    }

    /// Whether `id` changes position if the plan is committed as it stands.
    pub fn moved(&self, id: AgentId) -> bool {
        self.outcomes.get(&id) == Some(&MoveOutcome::Accepted)
            && self.proposal(id).is_some_and(ProposedAgent::moves)
    }

    /// Volume `id` occupies once the plan is committed.
    pub fn committed_box(&self, id: AgentId) -> Option<Bounds> {
        let proposal = self.proposal(id)?;
        Some(if self.moved(id) {
            proposal.next.bounding_box()
        } else {
            proposal.current.bounding_box()
        })
    }

    /// Overturn `id`'s move: it holds position, stopped by `blocker`.
    pub fn reject(&mut self, id: AgentId, blocker: Blocker) {
        if self.outcomes.contains_key(&id) {
            self.outcomes.insert(id, MoveOutcome::Rejected { blocker });
        }
    }

    /// Note that `id` blocked `mover`, an agent of another cell.
    pub fn bump(&mut self, id: AgentId, mover: AgentId) {
        self.bumped.push((id, mover));
    }

    /// Number of overturned or rejected moves.
    pub fn rejected(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, MoveOutcome::Rejected { .. }))
            .count()
    }
}

/// Resolve every proposal in agent-id order.
///
/// `objects` are the cell's objects; only collidable ones block. `world`
/// bounds the positions agents may move to (closed).
pub fn resolve_moves(
    proposals: &[ProposedAgent],
    objects: &BTreeMap<ObjectId, ObjectRecord>,
    world: &Bounds,
) -> BTreeMap<AgentId, MoveOutcome> {
    let mut sorted: Vec<&ProposedAgent> = proposals.iter().collect();
    sorted.sort_by_key(|p| p.id);

    let mut reserved: BTreeMap<AgentId, Bounds> = sorted
        .iter()
        .map(|p| (p.id, p.current.bounding_box()))
        .collect();
    let mut outcomes = BTreeMap::new();

    for proposal in sorted {
        if !proposal.moves() {
            outcomes.insert(proposal.id, MoveOutcome::Accepted);
            continue;
        }
        let next_box = proposal.next.bounding_box();
        let blocker = find_blocker(proposal, &next_box, objects, &reserved, world);
        match blocker {
            Some(blocker) => {
                outcomes.insert(proposal.id, MoveOutcome::Rejected { blocker });
            }
            None => {
                reserved.insert(proposal.id, next_box);
                outcomes.insert(proposal.id, MoveOutcome::Accepted);
            }
        }
    }
    outcomes
}

fn find_blocker(
    proposal: &ProposedAgent,
    next_box: &Bounds,
    objects: &BTreeMap<ObjectId, ObjectRecord>,
    reserved: &BTreeMap<AgentId, Bounds>,
    world: &Bounds,
) -> Option<Blocker> {
    if !world.contains_closed(proposal.next.position) {
        return Some(Blocker::WorldEdge);
    }
    if let Some(object) = objects
        .values()
        .find(|o| o.collidable && o.bounds.overlaps(next_box))
    {
        return Some(Blocker::Object(object.id));
    }
    reserved
        .iter()
        .find(|&(id, volume)| *id != proposal.id && volume.overlaps(next_box))
        .map(|(id, _)| Blocker::Agent(*id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cellsim_types::Vec3;

    use super::*;

    fn world() -> Bounds {
        Bounds::new(Vec3::ZERO, Vec3::new(100.0, 100.0, 10.0)).unwrap()
    }

    fn proposal(id: AgentId, from: Vec3, to: Vec3) -> ProposedAgent {
        ProposedAgent {
            id,
            current: Kinematics::at(from),
            next: Kinematics::at(to),
        }
    }

    #[test]
    fn earlier_id_wins_contested_spot() {
        let first = AgentId::new();
        let second = AgentId::new();
        let target = Vec3::new(12.0, 10.0, 1.0);
        // Submitted in reverse order; resolution still follows id order.
        let proposals = [
            proposal(second, Vec3::new(14.0, 10.0, 1.0), target),
            proposal(first, Vec3::new(10.0, 10.0, 1.0), target),
        ];
        let outcomes = resolve_moves(&proposals, &BTreeMap::new(), &world());
        assert_eq!(outcomes.get(&first), Some(&MoveOutcome::Accepted));
        assert_eq!(
            outcomes.get(&second),
            Some(&MoveOutcome::Rejected {
                blocker: Blocker::Agent(first)
            })
        );
    }

    #[test]
    fn collidable_objects_block_moves() {
        let agent = AgentId::new();
        let wall = ObjectRecord::new(
            ObjectId::new(),
            "wall",
            Bounds::new(Vec3::new(20.0, 0.0, 0.0), Vec3::new(21.0, 100.0, 10.0)).unwrap(),
        );
        let wall_id = wall.id;
        let mut objects = BTreeMap::from([(wall_id, wall)]);
        let proposals = [proposal(
            agent,
            Vec3::new(18.0, 5.0, 1.0),
            Vec3::new(20.2, 5.0, 1.0),
        )];
        let outcomes = resolve_moves(&proposals, &objects, &world());
        assert_eq!(
            outcomes.get(&agent),
            Some(&MoveOutcome::Rejected {
                blocker: Blocker::Object(wall_id)
            })
        );

        objects.get_mut(&wall_id).unwrap().collidable = false;
        let outcomes = resolve_moves(&proposals, &objects, &world());
        assert_eq!(outcomes.get(&agent), Some(&MoveOutcome::Accepted));
    }

    #[test]
    fn leaving_the_world_is_rejected() {
        let agent = AgentId::new();
        let proposals = [proposal(
            agent,
            Vec3::new(99.0, 5.0, 1.0),
            Vec3::new(101.0, 5.0, 1.0),
        )];
        let outcomes = resolve_moves(&proposals, &BTreeMap::new(), &world());
        assert_eq!(
            outcomes.get(&agent),
            Some(&MoveOutcome::Rejected {
                blocker: Blocker::WorldEdge
            })
        );
    }

    #[test]
    fn vacated_space_can_be_taken_by_later_agent() {
        let leader = AgentId::new();
        let follower = AgentId::new();
        let proposals = [
            proposal(leader, Vec3::new(10.0, 10.0, 1.0), Vec3::new(12.0, 10.0, 1.0)),
            proposal(follower, Vec3::new(8.0, 10.0, 1.0), Vec3::new(10.0, 10.0, 1.0)),
        ];
        let outcomes = resolve_moves(&proposals, &BTreeMap::new(), &world());
        assert!(outcomes.values().all(|o| *o == MoveOutcome::Accepted));
    }

    #[test]
    fn overturned_move_falls_back_to_current_box() {
        let agent = AgentId::new();
        let from = Vec3::new(10.0, 10.0, 1.0);
        let to = Vec3::new(12.0, 10.0, 1.0);
        let mut plan = MovePlan::resolve(
            vec![proposal(agent, from, to)],
            &BTreeMap::new(),
            &world(),
        );
        assert!(plan.moved(agent));
        assert_eq!(plan.committed_box(agent), Some(Kinematics::at(to).bounding_box()));

        let other = AgentId::new();
        plan.reject(agent, Blocker::Agent(other));
        assert!(!plan.moved(agent));
        assert_eq!(plan.committed_box(agent), Some(Kinematics::at(from).bounding_box()));
        assert_eq!(plan.rejected(), 1);
        // Agents the plan does not know are ignored.
        plan.reject(other, Blocker::WorldEdge);
        assert_eq!(plan.outcomes.len(), 1);
    }

    #[test]
    fn stationary_agents_are_always_accepted() {
        let agent = AgentId::new();
        let here = Vec3::new(5.0, 5.0, 1.0);
        let outcomes = resolve_moves(&[proposal(agent, here, here)], &BTreeMap::new(), &world());
        assert_eq!(outcomes.get(&agent), Some(&MoveOutcome::Accepted));
    }
}
