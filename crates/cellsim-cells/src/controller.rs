//! The locked per-cell wrapper driven by the orchestrator.
//!
//! Entity maps and the stimulus inbox sit behind separate mutexes: routing
//! an incoming stimulus only touches the inbox, so it never waits for a
//! running react/deliberate, and two concurrent creations targeting the
//! same cell are serialized on the state lock.

use std::sync::{Mutex, MutexGuard, PoisonError};

use cellsim_types::{Bounds, ExternalStimulus, Intention, RegionId};

use crate::conflict::MovePlan;
use crate::inbox::StimulusBuffer;
use crate::state::{CellState, Deliberation};
use crate::workload::{WorkloadSample, WorkloadWeights};

/// Per-tick parameters shared by every cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSettings {
    /// Simulated seconds per tick.
    pub tick_seconds: f64,
    /// Bounds of the whole world.
    pub world: Bounds,
}

/// A cell's tick between planning and commit.
#[derive(Debug, Clone, Default)]
pub struct PendingStep {
    /// Resolved, uncommitted moves.
    pub plan: MovePlan,
    /// External stimuli taken from the inbox, in arrival order.
    pub stimuli: Vec<ExternalStimulus>,
}

/// Owner of one leaf [`CellState`].
#[derive(Debug)]
pub struct CellController {
    region: RegionId,
    state: Mutex<CellState>,
    inbox: Mutex<StimulusBuffer>,
    last_offer: Mutex<Option<u64>>,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CellController {
    /// Wrap `state`.
    pub fn new(state: CellState) -> Self {
        Self {
            region: state.region(),
            state: Mutex::new(state),
            inbox: Mutex::new(StimulusBuffer::new()),
            last_offer: Mutex::new(None),
        }
    }

    /// The region this controller owns.
    pub const fn region(&self) -> RegionId {
        self.region
    }

    /// Lock the cell's entity maps.
    pub fn state(&self) -> MutexGuard<'_, CellState> {
        lock(&self.state)
    }

    /// A copy of the committed state.
    pub fn snapshot(&self) -> CellState {
        lock(&self.state).clone()
    }

    /// Buffer an agent intention for the next tick.
    pub fn push_intention(&self, intention: Intention) {
        lock(&self.inbox).push_intention(intention);
    }

    /// Buffer a user command for the next tick.
    pub fn push_command(&self, command: Intention) {
        lock(&self.inbox).push_command(command);
    }

    /// Buffer an external stimulus for the next tick.
    pub fn push_stimulus(&self, stimulus: ExternalStimulus) {
        lock(&self.inbox).push_stimulus(stimulus);
    }

    /// Number of buffered items.
    pub fn pending(&self) -> usize {
        lock(&self.inbox).len()
    }

    /// Take everything buffered so far.
    pub fn take_inbox(&self) -> StimulusBuffer {
        std::mem::take(&mut *lock(&self.inbox))
    }

    /// Take the inbox and resolve this tick's moves without committing.
    pub fn plan(&self, settings: &StepSettings) -> PendingStep {
        let buffer = self.take_inbox();
        let plan = lock(&self.state).plan_moves(&buffer, settings.tick_seconds, &settings.world);
        let (_, _, stimuli) = buffer.into_parts();
        PendingStep { plan, stimuli }
    }

    /// Commit a planned step for `tick`.
    pub fn commit(&self, pending: PendingStep, tick: u64, settings: &StepSettings) -> Deliberation {
        lock(&self.state).commit(&pending.plan, pending.stimuli, tick, &settings.world)
    }

    /// Plan and commit in one go, for a cell with no neighbours to check.
    pub fn step(&self, tick: u64, settings: &StepSettings) -> Deliberation {
        let pending = self.plan(settings);
        self.commit(pending, tick, settings)
    }

    /// Current workload.
    pub fn workload(&self, weights: &WorkloadWeights) -> WorkloadSample {
        lock(&self.state).workload(weights)
    }

    /// Offer a merge to the sibling if `load` is below `threshold`.
    ///
    /// At most one offer is made per `cooldown` ticks. Returns the sibling
    /// the offer goes to.
    pub fn sibling_offer(
        &self,
        tick: u64,
        load: f64,
        threshold: f64,
        cooldown: u64,
    ) -> Option<RegionId> {
        let sibling = self.region.sibling()?;
        if load >= threshold {
            return None;
        }
        let mut last = lock(&self.last_offer);
        if !last.is_none_or(|at| tick.saturating_sub(at) >= cooldown) {
            return None;
        }
        *last = Some(tick);
        Some(sibling)
    }

    /// Tear down the controller, returning its state and undelivered inbox.
    pub fn into_parts(self) -> (CellState, StimulusBuffer) {
        (
            self.state.into_inner().unwrap_or_else(PoisonError::into_inner),
            self.inbox.into_inner().unwrap_or_else(PoisonError::into_inner),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cellsim_types::{AgentId, AgentRecord, Entity, SplitStrategy, Vec3};

    use super::*;

    fn settings() -> StepSettings {
        StepSettings {
            tick_seconds: 1.0,
            world: Bounds::new(Vec3::ZERO, Vec3::new(100.0, 100.0, 10.0)).unwrap(),
        }
    }

    fn controller() -> CellController {
        CellController::new(CellState::new(RegionId::ROOT, settings().world))
    }

    #[test]
    fn step_consumes_inbox() {
        let cell = controller();
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(10.0, 10.0, 1.0));
        let id = agent.id;
        cell.push_stimulus(ExternalStimulus::Create(Entity::Agent(agent)));
        assert_eq!(cell.pending(), 1);

        let report = cell.step(1, &settings());
        assert_eq!(report.applied, 1);
        assert_eq!(cell.pending(), 0);

        cell.push_intention(Intention::moving(id, Vec3::new(1.0, 0.0, 0.0)));
        cell.step(2, &settings());
        let snapshot = cell.snapshot();
        assert_eq!(snapshot.agent(id).unwrap().position(), Vec3::new(11.0, 10.0, 1.0));
        assert_eq!(snapshot.tick(), 2);
    }

    #[test]
    fn planned_moves_wait_for_commit() {
        let cell = controller();
        let agent = AgentRecord::new(AgentId::new(), Vec3::new(10.0, 10.0, 1.0));
        let id = agent.id;
        cell.state().insert(Entity::Agent(agent)).unwrap();
        cell.push_intention(Intention::moving(id, Vec3::new(3.0, 0.0, 0.0)));

        let pending = cell.plan(&settings());
        assert!(pending.plan.moved(id));
        assert_eq!(cell.pending(), 0);
        assert_eq!(cell.snapshot().agent(id).unwrap().position(), Vec3::new(10.0, 10.0, 1.0));

        let report = cell.commit(pending, 1, &settings());
        assert_eq!(report.accepted, 1);
        assert_eq!(cell.snapshot().agent(id).unwrap().position(), Vec3::new(13.0, 10.0, 1.0));
    }

    #[test]
    fn root_never_offers() {
        assert_eq!(controller().sibling_offer(10, 0.0, 5.0, 3), None);
    }

    #[test]
    fn sibling_offer_respects_cooldown_and_threshold() {
        let mut root = CellState::new(RegionId::ROOT, settings().world);
        let split = root.split(SplitStrategy::Midpoint).unwrap();
        let cell = CellController::new(split.low);
        let sibling = split.high.region();

        assert_eq!(cell.sibling_offer(10, 6.0, 5.0, 3), None);
        assert_eq!(cell.sibling_offer(10, 1.0, 5.0, 3), Some(sibling));
        assert_eq!(cell.sibling_offer(12, 1.0, 5.0, 3), None);
        assert_eq!(cell.sibling_offer(13, 1.0, 5.0, 3), Some(sibling));
    }
}
