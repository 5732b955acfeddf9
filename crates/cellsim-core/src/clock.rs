//! Simulation clock.
//!
//! The tick counter is the single source of temporal truth. Each tick has
//! an environment phase followed by an agent phase; the clock records which
//! phase ran last so the orchestrator can refuse to run phases out of
//! order. All arithmetic is checked.

use cellsim_types::Phase;

/// Errors that can occur during clock operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// Tick counter would overflow.
    #[error("tick counter overflow: cannot advance beyond u64::MAX")]
    TickOverflow,

    /// A phase was started out of order.
    #[error("phase {requested:?} cannot follow {last:?} at tick {tick}")]
    OutOfOrder {
        /// The phase that ran last.
        last: Option<Phase>,
        /// The phase that was requested.
        requested: Phase,
        /// Current tick.
        tick: u64,
    },
}

/// Tick counter plus the phase that completed last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimulationClock {
    tick: u64,
    last_phase: Option<Phase>,
}

impl SimulationClock {
    /// A clock at tick 0 with no phase run yet.
    pub const fn new() -> Self {
        Self {
            tick: 0,
            last_phase: None,
        }
    }

    /// A clock resumed at `tick`, ready for its next environment phase.
    pub const fn from_tick(tick: u64) -> Self {
        Self {
            tick,
            last_phase: Some(Phase::Agent),
        }
    }

    /// Current tick.
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Phase that completed last.
    pub const fn last_phase(&self) -> Option<Phase> {
        self.last_phase
    }

    /// Start the environment phase of the next tick and return that tick.
    ///
    /// An environment phase may follow an agent phase or start the run; a
    /// skipped agent phase is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::TickOverflow`] if the counter would overflow.
    pub fn begin_environment(&mut self) -> Result<u64, ClockError> {
        self.tick = self.tick.checked_add(1).ok_or(ClockError::TickOverflow)?;
        self.last_phase = Some(Phase::Environment);
        Ok(self.tick)
    }

    /// Start the agent phase of the current tick.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::OutOfOrder`] unless the environment phase of
    /// this tick ran last.
    pub fn begin_agent(&mut self) -> Result<u64, ClockError> {
        if self.last_phase != Some(Phase::Environment) {
            return Err(ClockError::OutOfOrder {
                last: self.last_phase,
                requested: Phase::Agent,
                tick: self.tick,
            });
        }
        self.last_phase = Some(Phase::Agent);
        Ok(self.tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_advances_tick() {
        let mut clock = SimulationClock::new();
        assert_eq!(clock.begin_environment(), Ok(1));
        assert_eq!(clock.begin_agent(), Ok(1));
        assert_eq!(clock.begin_environment(), Ok(2));
        assert_eq!(clock.last_phase(), Some(Phase::Environment));
    }

    #[test]
    fn agent_phase_requires_environment_first() {
        let mut clock = SimulationClock::new();
        assert!(matches!(
            clock.begin_agent(),
            Err(ClockError::OutOfOrder { last: None, .. })
        ));
        clock.begin_environment().ok();
        clock.begin_agent().ok();
        assert!(clock.begin_agent().is_err());
    }

    #[test]
    fn overflow_is_reported() {
        let mut clock = SimulationClock::from_tick(u64::MAX);
        assert_eq!(clock.begin_environment(), Err(ClockError::TickOverflow));
        assert_eq!(clock.tick(), u64::MAX);
    }
}
