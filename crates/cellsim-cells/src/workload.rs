//! Workload estimates for cells.

use cellsim_types::RegionId;
use serde::{Deserialize, Serialize};

/// Weights applied to entity counts when computing load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkloadWeights {
    /// Load contributed by each agent.
    #[serde(default = "default_weight")]
    pub agent: f64,
    /// Load contributed by each object.
    #[serde(default = "default_weight")]
    pub object: f64,
}

const fn default_weight() -> f64 {
    1.0
}

impl Default for WorkloadWeights {
    fn default() -> Self {
        Self {
            agent: default_weight(),
            object: default_weight(),
        }
    }
}

impl WorkloadWeights {
    /// Weighted load for the given counts.
    pub fn load(&self, agents: usize, objects: usize) -> f64 {
        self.agent.mul_add(count_f64(agents), self.object * count_f64(objects))
    }
}

/// Convert an entity count to `f64` without a lossy cast.
pub fn count_f64(n: usize) -> f64 {
    f64::from(u32::try_from(n).unwrap_or(u32::MAX))
}

/// One cell's workload at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSample {
    /// The sampled leaf.
    pub region: RegionId,
    /// Weighted load.
    pub load: f64,
    /// Agents in the cell.
    pub agents: usize,
    /// Objects in the cell.
    pub objects: usize,
    /// Tick the sample was taken at.
    pub tick: u64,
}
