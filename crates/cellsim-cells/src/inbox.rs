//! Stimuli buffered for a cell between ticks.

use std::collections::BTreeMap;

use cellsim_types::{AgentId, ExternalStimulus, Intention};

/// Everything a cell has been asked to do since its last tick.
///
/// Intentions come from the agent phase; user commands override them for
/// the same agent. External stimuli keep their arrival order.
#[derive(Debug, Clone, Default)]
pub struct StimulusBuffer {
    intentions: BTreeMap<AgentId, Intention>,
    commands: BTreeMap<AgentId, Intention>,
    external: Vec<ExternalStimulus>,
}

impl StimulusBuffer {
    /// Create an empty buffer.
    pub const fn new() -> Self {
        Self {
            intentions: BTreeMap::new(),
            commands: BTreeMap::new(),
            external: Vec::new(),
        }
    }

    /// Buffer an agent intention, replacing any earlier one for that agent.
    pub fn push_intention(&mut self, intention: Intention) {
        self.intentions.insert(intention.agent_id, intention);
    }

    /// Buffer a user command, replacing any earlier one for that agent.
    pub fn push_command(&mut self, command: Intention) {
        self.commands.insert(command.agent_id, command);
    }

    /// Append an external stimulus.
    pub fn push_stimulus(&mut self, stimulus: ExternalStimulus) {
        self.external.push(stimulus);
    }

    /// The intention that drives `agent` this tick, commands first.
    pub fn intention_for(&self, agent: AgentId) -> Option<&Intention> {
        self.commands
            .get(&agent)
            .or_else(|| self.intentions.get(&agent))
    }

    /// External stimuli in arrival order.
    pub fn external(&self) -> &[ExternalStimulus] {
        &self.external
    }

    /// Take the external stimuli, leaving none behind.
    pub fn take_external(&mut self) -> Vec<ExternalStimulus> {
        std::mem::take(&mut self.external)
    }

    /// Consume the buffer as (intentions, commands, external stimuli).
    pub fn into_parts(self) -> (Vec<Intention>, Vec<Intention>, Vec<ExternalStimulus>) {
        (
            self.intentions.into_values().collect(),
            self.commands.into_values().collect(),
            self.external,
        )
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.intentions.is_empty() && self.commands.is_empty() && self.external.is_empty()
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.intentions
            .len()
            .saturating_add(self.commands.len())
            .saturating_add(self.external.len())
    }
}

#[cfg(test)]
mod tests {
    use cellsim_types::{EntityRef, Vec3};

    use super::*;

    #[test]
    fn commands_override_intentions() {
        let agent = AgentId::new();
        let mut buffer = StimulusBuffer::new();
        buffer.push_intention(Intention::moving(agent, Vec3::new(1.0, 0.0, 0.0)));
        buffer.push_command(Intention::halt(agent));
        assert_eq!(buffer.intention_for(agent), Some(&Intention::halt(agent)));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn external_stimuli_keep_arrival_order() {
        let mut buffer = StimulusBuffer::new();
        let first = EntityRef::Agent(AgentId::new());
        let second = EntityRef::Agent(AgentId::new());
        buffer.push_stimulus(ExternalStimulus::Destroy(second));
        buffer.push_stimulus(ExternalStimulus::Destroy(first));
        let targets: Vec<EntityRef> = buffer.take_external().iter().map(ExternalStimulus::target).collect();
        assert_eq!(targets, vec![second, first]);
        assert!(buffer.is_empty());
    }
}
