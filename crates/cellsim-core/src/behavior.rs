//! Agent behavior trait and built-in behaviors.
//!
//! During the agent phase every agent is shown its [`CombinedState`] (if the
//! last perception pass produced one) and may answer with an
//! [`Intention`]. The intention is buffered in the agent's cell and applied
//! by the next environment phase. [`AgentBehavior`] abstracts where those
//! intentions come from: a scripted walker, an external controller, or a
//! test stub.

use core::f64::consts::TAU;

use cellsim_types::{AgentRecord, Intention, Vec3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::perception::CombinedState;

/// A source of agent intentions.
///
/// Implementations are called concurrently from the worker pool, once per
/// agent per tick.
pub trait AgentBehavior: Send + Sync {
    /// Decide what `agent` wants to do next, given what it perceives.
    ///
    /// Returning `None` leaves the agent's current velocity in place.
    fn react(
        &self,
        agent: &AgentRecord,
        perception: Option<&CombinedState>,
        tick: u64,
    ) -> Option<Intention>;
}

/// A behavior that never expresses an intention.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleBehavior;

impl IdleBehavior {
    /// Create an idle behavior.
    pub const fn new() -> Self {
        Self
    }
}

impl AgentBehavior for IdleBehavior {
    fn react(&self, _: &AgentRecord, _: Option<&CombinedState>, _: u64) -> Option<Intention> {
        None
    }
}

/// Wander on the horizontal plane at a fixed speed.
///
/// Each agent keeps its heading until it bumps into something, then picks
/// a new one. Headings are drawn from an RNG seeded by the world seed, the
/// agent id and the tick, so runs are reproducible regardless of which
/// worker handles which agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomWalk {
    speed: f64,
    seed: u64,
}

impl RandomWalk {
    /// Walk at `speed` units per second, seeded by `seed`.
    pub const fn new(speed: f64, seed: u64) -> Self {
        Self { speed, seed }
    }

    fn rng_for(&self, agent: &AgentRecord, tick: u64) -> SmallRng {
        let (high, low) = agent.id.into_inner().as_u64_pair();
        SmallRng::seed_from_u64(self.seed ^ high ^ low.rotate_left(17) ^ tick)
    }

    fn heading_velocity(&self, heading: f64) -> Vec3 {
        Vec3::new(heading.cos(), heading.sin(), 0.0) * self.speed
    }
}

impl AgentBehavior for RandomWalk {
    fn react(
        &self,
        agent: &AgentRecord,
        _: Option<&CombinedState>,
        tick: u64,
    ) -> Option<Intention> {
        let bumped = agent
            .collisions
            .latest()
            .is_some_and(|c| tick.saturating_sub(c.tick) <= 1);
        let stalled = agent.kinematics.velocity.horizontal_length() <= f64::EPSILON;
        if !bumped && !stalled {
            return None;
        }
        let heading = self.rng_for(agent, tick).random_range(0.0..TAU);
        Some(Intention {
            agent_id: agent.id,
            velocity: self.heading_velocity(heading),
            heading: Some(heading),
        })
    }
}
