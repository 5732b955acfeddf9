//! Moves that reach past a cell's edge.
//!
//! Each cell resolves its own moves against its own contents. Leaves only
//! share faces, so two agents in different leaves (or an agent and an
//! object held elsewhere) can only overlap when a box leaves its own cell.
//! This pass checks exactly those boxes against every leaf they reach into
//! and overturns the offending move:
//!
//! - against a collidable object, the mover holds position;
//! - between two movers, the later id holds position;
//! - between a mover and an agent standing still, the mover holds position.
//!
//! An overturned agent falls back to its current box, which can clash with
//! another crossing mover, so the pass repeats until nothing changes. Every
//! round turns one mover into a stander, so it terminates.

use std::collections::BTreeMap;

use cellsim_cells::{Blocker, CellController, PendingStep};
use cellsim_space::SpatialIndex;
use cellsim_types::{AgentId, EntityRef, RegionId, Shape};
use tracing::debug;

/// One overturned move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Clash {
    region: RegionId,
    agent: AgentId,
    blocker: Blocker,
    winner: Option<(RegionId, AgentId)>,
}

impl Clash {
    const fn between(loser: (RegionId, AgentId), winner: (RegionId, AgentId)) -> Self {
        Self {
            region: loser.0,
            agent: loser.1,
            blocker: Blocker::Agent(winner.1),
            winner: Some(winner),
        }
    }
}

/// Overturn planned moves that collide across a leaf boundary.
///
/// Returns how many moves were overturned.
pub(crate) fn reconcile(
    index: &SpatialIndex,
    cells: &BTreeMap<RegionId, CellController>,
    plans: &mut BTreeMap<RegionId, PendingStep>,
) -> usize {
    let mut overturned = 0_usize;
    while let Some(clash) = find_clash(index, cells, plans) {
        if let Some(pending) = plans.get_mut(&clash.region) {
            pending.plan.reject(clash.agent, clash.blocker);
        }
        if let Some((region, winner)) = clash.winner
            && let Some(pending) = plans.get_mut(&region)
        {
            pending.plan.bump(winner, clash.agent);
        }
        debug!(
            agent = %clash.agent,
            region = %clash.region,
            blocker = ?clash.blocker,
            "Cross-cell move overturned"
        );
        overturned = overturned.saturating_add(1);
    }
    overturned
}

/// The first clash in region then agent order.
fn find_clash(
    index: &SpatialIndex,
    cells: &BTreeMap<RegionId, CellController>,
    plans: &BTreeMap<RegionId, PendingStep>,
) -> Option<Clash> {
    for (region, pending) in plans {
        let Some(own) = index.bounds(*region) else {
            continue;
        };
        for proposal in &pending.plan.proposals {
            let id = proposal.id;
            let Some(volume) = pending.plan.committed_box(id) else {
                continue;
            };
            if own.contains_bounds(&volume) {
                continue;
            }
            let moved = pending.plan.moved(id);

            for other in index.regions_intersecting(*region, &Shape::Box(volume)) {
                if other == *region {
                    continue;
                }
                if moved {
                    let object = cells
                        .get(&other)
                        .and_then(|c| c.state().blocking_object(EntityRef::Agent(id), &volume));
                    if let Some(object) = object {
                        return Some(Clash {
                            region: *region,
                            agent: id,
                            blocker: Blocker::Object(object),
                            winner: None,
                        });
                    }
                }

                let Some(theirs) = plans.get(&other) else {
                    continue;
                };
                for their in &theirs.plan.proposals {
                    let overlapping = theirs
                        .plan
                        .committed_box(their.id)
                        .is_some_and(|b| b.overlaps(&volume));
                    if !overlapping {
                        continue;
                    }
                    let mine = (*region, id);
                    let yours = (other, their.id);
                    let clash = match (moved, theirs.plan.moved(their.id)) {
                        (true, true) if id < their.id => Clash::between(yours, mine),
                        (true, _) => Clash::between(mine, yours),
                        (false, true) => Clash::between(yours, mine),
                        (false, false) => continue,
                    };
                    return Some(clash);
                }
            }
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cellsim_cells::{CellState, MoveOutcome, StepSettings};
    use cellsim_types::{
        AgentRecord, Bounds, Entity, HostId, Intention, ObjectId, ObjectRecord, SplitStrategy, Vec3,
    };

    use super::*;

    fn settings() -> StepSettings {
        StepSettings {
            tick_seconds: 1.0,
            world: Bounds::new(Vec3::ZERO, Vec3::new(100.0, 100.0, 10.0)).unwrap(),
        }
    }

    /// The world split at x = 50, with a controller per half.
    fn halves() -> (SpatialIndex, BTreeMap<RegionId, CellController>, [RegionId; 2]) {
        let world = settings().world;
        let host = HostId::new();
        let mut index = SpatialIndex::new(world, host);
        let split = CellState::new(RegionId::ROOT, world)
            .split(SplitStrategy::Midpoint)
            .unwrap();
        index
            .split(RegionId::ROOT, split.low.bounds(), split.high.bounds(), host)
            .unwrap();
        let ids = [split.low.region(), split.high.region()];
        let cells = [split.low, split.high]
            .into_iter()
            .map(|s| (s.region(), CellController::new(s)))
            .collect();
        (index, cells, ids)
    }

    fn agent_in(cells: &BTreeMap<RegionId, CellController>, region: RegionId, x: f64) -> AgentId {
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(x, 10.0, 1.0));
        let id = agent.id;
        cells.get(&region).unwrap().state().insert(Entity::Agent(agent)).unwrap();
        id
    }

    fn plan_all(cells: &BTreeMap<RegionId, CellController>) -> BTreeMap<RegionId, PendingStep> {
        cells
            .iter()
            .map(|(r, c)| (*r, c.plan(&settings())))
            .collect()
    }

    fn step_x(cells: &BTreeMap<RegionId, CellController>, region: RegionId, id: AgentId, dx: f64) {
        cells.get(&region).unwrap().push_intention(Intention::moving(id, Vec3::new(dx, 0.0, 0.0)));
    }

    #[test]
    fn mover_holds_at_a_wall_held_next_door() {
        let (index, cells, [low, high]) = halves();
        let mover = agent_in(&cells, low, 49.0);
        let wall = ObjectRecord::new(
            ObjectId::new(),
            "wall",
            Bounds::new(Vec3::new(50.8, 0.0, 0.0), Vec3::new(52.0, 100.0, 10.0)).unwrap(),
        );
        let wall_id = wall.id;
        cells.get(&high).unwrap().state().insert(Entity::Object(wall)).unwrap();
        step_x(&cells, low, mover, 2.0);

        let mut plans = plan_all(&cells);
        assert!(plans.get(&low).unwrap().plan.moved(mover));
        assert_eq!(reconcile(&index, &cells, &mut plans), 1);
        assert!(!plans.get(&low).unwrap().plan.moved(mover));
        assert_eq!(
            plans.get(&low).unwrap().plan.outcomes.get(&mover),
            Some(&MoveOutcome::Rejected {
                blocker: Blocker::Object(wall_id)
            })
        );
    }

    #[test]
    fn later_mover_yields_across_the_boundary() {
        let (index, cells, [low, high]) = halves();
        let first = agent_in(&cells, low, 48.0);
        let second = agent_in(&cells, high, 52.0);
        step_x(&cells, low, first, 2.0);
        step_x(&cells, high, second, -2.0);

        let mut plans = plan_all(&cells);
        assert_eq!(reconcile(&index, &cells, &mut plans), 1);
        assert!(plans.get(&low).unwrap().plan.moved(first));
        assert!(!plans.get(&high).unwrap().plan.moved(second));
        assert_eq!(plans.get(&low).unwrap().plan.bumped, vec![(first, second)]);
    }

    #[test]
    fn mover_yields_to_an_agent_standing_still() {
        let (index, cells, [low, high]) = halves();
        let mover = agent_in(&cells, low, 49.0);
        let sitter = agent_in(&cells, high, 51.2);
        step_x(&cells, low, mover, 2.0);

        let mut plans = plan_all(&cells);
        assert_eq!(reconcile(&index, &cells, &mut plans), 1);
        assert_eq!(
            plans.get(&low).unwrap().plan.outcomes.get(&mover),
            Some(&MoveOutcome::Rejected {
                blocker: Blocker::Agent(sitter)
            })
        );
        assert_eq!(plans.get(&high).unwrap().plan.bumped, vec![(sitter, mover)]);
    }

    #[test]
    fn moves_inside_a_cell_are_left_alone() {
        let (index, cells, [low, high]) = halves();
        let a = agent_in(&cells, low, 20.0);
        let b = agent_in(&cells, high, 80.0);
        step_x(&cells, low, a, 2.0);
        step_x(&cells, high, b, -2.0);

        let mut plans = plan_all(&cells);
        assert_eq!(reconcile(&index, &cells, &mut plans), 0);
        assert!(plans.get(&low).unwrap().plan.moved(a));
        assert!(plans.get(&high).unwrap().plan.moved(b));
    }
}
