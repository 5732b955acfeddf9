//! Initial population for a fresh simulation.
//!
//! At startup the spawner fills the root cell with the configured number of
//! objects and agents at random ground positions. Objects go in first, so
//! agents can be kept clear of them. Anything that would overlap a
//! collidable object is re-drawn a few times and skipped if no free spot
//! turns up. Placement is seeded by the world seed.

use cellsim_cells::{CellError, CellState};
use cellsim_core::SimulationConfig;
use cellsim_types::{
    AgentId, AgentRecord, Bounds, Capabilities, Entity, ObjectId, ObjectRecord, RegionId, Vec3,
    VisionRange,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::error::EngineError;

/// Placement attempts per entity before giving up on it.
const MAX_ATTEMPTS: u32 = 16;

/// Counts from one spawn run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnSummary {
    /// Agents placed.
    pub agents: u32,
    /// Objects placed.
    pub objects: u32,
    /// Agents and objects that found no free spot.
    pub skipped: u32,
}

/// Insert the first entity `draw` produces that fits, re-drawing on
/// collision. Returns whether one was placed.
fn place(
    root: &mut CellState,
    what: &str,
    n: u32,
    mut draw: impl FnMut() -> Entity,
) -> Result<bool, EngineError> {
    for _ in 0..MAX_ATTEMPTS {
        match root.insert(draw()) {
            Ok(()) => return Ok(true),
            Err(CellError::Collides { .. }) => {}
            Err(e) => {
                return Err(EngineError::Spawner {
                    message: format!("failed to place {what} {n}: {e}"),
                });
            }
        }
    }
    warn!(kind = what, index = n, attempts = MAX_ATTEMPTS, "No free spot, skipping");
    Ok(false)
}

/// Uniform sample in `[low, high)`, or `low` when the range is empty.
fn sample(rng: &mut SmallRng, low: f64, high: f64) -> f64 {
    if high > low {
        rng.random_range(low..high)
    } else {
        low
    }
}

/// A random ground-level point keeping `margin` from the side walls.
fn ground_point(rng: &mut SmallRng, world: &Bounds, margin: f64, height: f64) -> Vec3 {
    let (min, max) = (world.min(), world.max());
    Vec3::new(
        sample(rng, min.x + margin, max.x - margin),
        sample(rng, min.y + margin, max.y - margin),
        min.z + height,
    )
}

/// Build the root cell holding the initial population.
///
/// # Errors
///
/// Returns [`EngineError::Config`] if the world bounds are invalid, or
/// [`EngineError::Spawner`] if an entity is rejected for a reason other
/// than a collision.
pub fn spawn_population(config: &SimulationConfig) -> Result<(CellState, SpawnSummary), EngineError> {
    let world = config.world.bounds().map_err(cellsim_core::ConfigError::from)?;
    let population = &config.population;
    let mut rng = SmallRng::seed_from_u64(config.world.seed);
    let mut root = CellState::new(RegionId::ROOT, world);
    let mut summary = SpawnSummary {
        agents: 0,
        objects: 0,
        skipped: 0,
    };

    let half_object = population.object_size / 2.0;
    for n in 0..population.initial_objects {
        let placed = place(&mut root, "object", n, || {
            let center = ground_point(&mut rng, &world, half_object, half_object);
            Entity::Object(ObjectRecord::new(
                ObjectId::new(),
                format!("crate-{n}"),
                Bounds::around(center, half_object),
            ))
        })?;
        if placed {
            summary.objects = summary.objects.saturating_add(1);
        } else {
            summary.skipped = summary.skipped.saturating_add(1);
        }
    }

    let half_agent = population.agent_scale / 2.0;
    let vision = VisionRange {
        field_of_view: population.vision_fov_degrees.to_radians(),
        distance: population.vision_distance,
    };
    for n in 0..population.initial_agents {
        let placed = place(&mut root, "agent", n, || {
            let mut agent = AgentRecord::new(
                AgentId::new(),
                ground_point(&mut rng, &world, half_agent, half_agent),
            )
            .with_capabilities(Capabilities::VISION | Capabilities::HEARING);
            agent.kinematics.scale = population.agent_scale;
            agent.kinematics.heading = sample(&mut rng, 0.0, core::f64::consts::TAU);
            agent.vision = vision;
            Entity::Agent(agent)
        })?;
        if placed {
            summary.agents = summary.agents.saturating_add(1);
        } else {
            summary.skipped = summary.skipped.saturating_add(1);
        }
    }

    info!(
        agents = summary.agents,
        objects = summary.objects,
        skipped = summary.skipped,
        "Initial population spawned"
    );
    Ok((root, summary))
}
