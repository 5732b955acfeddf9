//! Configuration loading and typed config structures for the cellsim engine.
//!
//! The canonical configuration lives in `cellsim-config.yaml` at the project
//! root. This module defines strongly-typed structs that mirror the YAML
//! structure, and provides a loader that reads the file and applies
//! environment overrides. Every field has a default, so an empty file is a
//! valid configuration.

use std::path::Path;

use cellsim_cells::{StepSettings, WorkloadWeights};
use cellsim_types::{Bounds, GeometryError, PolicyKind, SplitStrategy, Vec3};
use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// The configured world bounds are not a valid volume.
    #[error("invalid world bounds: {source}")]
    WorldBounds {
        /// The underlying geometry error.
        #[from]
        source: GeometryError,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level simulation configuration.
///
/// Mirrors the structure of `cellsim-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SimulationConfig {
    /// World extent and timing.
    #[serde(default)]
    pub world: WorldConfig,

    /// Worker pool sizing.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Workload weighting.
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Reorganization policy and thresholds.
    #[serde(default)]
    pub reorganization: ReorganizationConfig,

    /// Per-cell behavior.
    #[serde(default)]
    pub cells: CellsConfig,

    /// Initial population.
    #[serde(default)]
    pub population: PopulationConfig,

    /// Message bus connection.
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Simulation boundary parameters.
    #[serde(default)]
    pub simulation: SimulationBoundsConfig,
}

impl SimulationConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// `NATS_URL` overrides `messaging.nats_url` when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.messaging.apply_env_overrides();
        Ok(config)
    }

    /// Per-tick settings handed to every cell.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::WorldBounds`] if the world extent is invalid.
    pub fn step_settings(&self) -> Result<StepSettings, ConfigError> {
        Ok(StepSettings {
            tick_seconds: self.world.tick_seconds,
            world: self.world.bounds()?,
        })
    }
}

/// World extent and timing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorldConfig {
    /// Human-readable simulation name.
    #[serde(default = "default_world_name")]
    pub name: String,

    /// Random seed for reproducibility.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Minimum corner of the world, `[x, y, z]`.
    #[serde(default = "default_world_min")]
    pub min: [f64; 3],

    /// Maximum corner of the world, `[x, y, z]`.
    #[serde(default = "default_world_max")]
    pub max: [f64; 3],

    /// Real-time milliseconds between ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Simulated seconds per tick, used to integrate velocity.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: f64,
}

impl WorldConfig {
    /// The world as a [`Bounds`].
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError`] if the corners are non-finite or inverted.
    pub fn bounds(&self) -> Result<Bounds, GeometryError> {
        let [x0, y0, z0] = self.min;
        let [x1, y1, z1] = self.max;
        Bounds::new(Vec3::new(x0, y0, z0), Vec3::new(x1, y1, z1))
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            name: default_world_name(),
            seed: default_seed(),
            min: default_world_min(),
            max: default_world_max(),
            tick_interval_ms: default_tick_interval_ms(),
            tick_seconds: default_tick_seconds(),
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkersConfig {
    /// Fixed number of worker threads (0 = one per available core).
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
        }
    }
}

/// Workload weighting.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkloadConfig {
    /// Load per agent.
    #[serde(default = "default_one")]
    pub agent_weight: f64,

    /// Load per object.
    #[serde(default = "default_one")]
    pub object_weight: f64,

    /// Weight of face-adjacent neighbors' load in urgency.
    #[serde(default = "default_neighbor_weight")]
    pub neighbor_weight: f64,
}

impl WorkloadConfig {
    /// Weights for [`cellsim_cells::CellState::workload`].
    pub const fn weights(&self) -> WorkloadWeights {
        WorkloadWeights {
            agent: self.agent_weight,
            object: self.object_weight,
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            agent_weight: default_one(),
            object_weight: default_one(),
            neighbor_weight: default_neighbor_weight(),
        }
    }
}

/// Reorganization policy and thresholds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReorganizationConfig {
    /// Real-time milliseconds between coordinator cycles.
    #[serde(default = "default_reorg_period_ms")]
    pub period_ms: u64,

    /// Policy active at startup.
    #[serde(default)]
    pub policy: PolicyKind,

    /// A cell splits when its load exceeds this value.
    #[serde(default = "default_split_threshold")]
    pub split_threshold: f64,

    /// Siblings merge when their combined load is at most this value.
    /// Defaults to the split threshold.
    #[serde(default)]
    pub merge_threshold: Option<f64>,

    /// Cell budget for the fair policies.
    #[serde(default = "default_max_cells")]
    pub max_cells: usize,

    /// Number of cycles in the hysteresis rolling average.
    #[serde(default = "default_hysteresis_window")]
    pub hysteresis_window: usize,

    /// Fraction of the split threshold the rolling average must fall to
    /// before merges are allowed.
    #[serde(default = "default_merge_ratio")]
    pub merge_ratio: f64,

    /// Where splits place their plane.
    #[serde(default)]
    pub split_strategy: SplitStrategy,

    /// Load above which a cell raises an assistance alert.
    #[serde(default = "default_split_threshold")]
    pub alert_threshold: f64,
}

impl ReorganizationConfig {
    /// The effective merge threshold.
    pub fn merge_threshold(&self) -> f64 {
        self.merge_threshold.unwrap_or(self.split_threshold)
    }
}

impl Default for ReorganizationConfig {
    fn default() -> Self {
        Self {
            period_ms: default_reorg_period_ms(),
            policy: PolicyKind::default(),
            split_threshold: default_split_threshold(),
            merge_threshold: None,
            max_cells: default_max_cells(),
            hysteresis_window: default_hysteresis_window(),
            merge_ratio: default_merge_ratio(),
            split_strategy: SplitStrategy::default(),
            alert_threshold: default_split_threshold(),
        }
    }
}

/// Per-cell behavior.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CellsConfig {
    /// Load below which a cell offers to merge with its sibling.
    #[serde(default = "default_one")]
    pub sibling_offer_threshold: f64,

    /// Minimum ticks between two offers from the same cell.
    #[serde(default = "default_offer_cooldown_ticks")]
    pub offer_cooldown_ticks: u64,

    /// TTL given to triggered events that carry none (0 = never expire).
    #[serde(default)]
    pub event_ttl_ticks: u64,
}

impl Default for CellsConfig {
    fn default() -> Self {
        Self {
            sibling_offer_threshold: default_one(),
            offer_cooldown_ticks: default_offer_cooldown_ticks(),
            event_ttl_ticks: 0,
        }
    }
}

/// Initial population.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PopulationConfig {
    /// Agents spawned at startup.
    #[serde(default = "default_initial_agents")]
    pub initial_agents: u32,

    /// Objects spawned at startup.
    #[serde(default = "default_initial_objects")]
    pub initial_objects: u32,

    /// Edge length of each agent's bounding cube.
    #[serde(default = "default_one")]
    pub agent_scale: f64,

    /// Edge length of each spawned object.
    #[serde(default = "default_object_size")]
    pub object_size: f64,

    /// Vision field of view in degrees.
    #[serde(default = "default_vision_fov_degrees")]
    pub vision_fov_degrees: f64,

    /// Vision distance in world units.
    #[serde(default = "default_vision_distance")]
    pub vision_distance: f64,

    /// Speed of the random-walk behavior, world units per second.
    #[serde(default = "default_one")]
    pub walk_speed: f64,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            initial_agents: default_initial_agents(),
            initial_objects: default_initial_objects(),
            agent_scale: default_one(),
            object_size: default_object_size(),
            vision_fov_degrees: default_vision_fov_degrees(),
            vision_distance: default_vision_distance(),
            walk_speed: default_one(),
        }
    }
}

/// Message bus connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessagingConfig {
    /// Whether to connect to NATS (otherwise an in-process bus is used).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// NATS messaging URL.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Prefix prepended to every subject.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl MessagingConfig {
    /// Override the NATS URL with the `NATS_URL` environment variable.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("NATS_URL") {
            self.nats_url = val;
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nats_url: default_nats_url(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Simulation boundary configuration.
///
/// A value of 0 for either field means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulationBoundsConfig {
    /// Maximum number of ticks before the simulation ends.
    #[serde(default)]
    pub max_ticks: u64,

    /// Maximum wall-clock seconds before the simulation ends.
    #[serde(default = "default_max_real_time_seconds")]
    pub max_real_time_seconds: u64,
}

impl Default for SimulationBoundsConfig {
    fn default() -> Self {
        Self {
            max_ticks: 0,
            max_real_time_seconds: default_max_real_time_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_world_name() -> String {
    "Cellsim".to_owned()
}

const fn default_seed() -> u64 {
    42
}

const fn default_world_min() -> [f64; 3] {
    [0.0, 0.0, 0.0]
}

const fn default_world_max() -> [f64; 3] {
    [1000.0, 1000.0, 100.0]
}

const fn default_tick_interval_ms() -> u64 {
    100
}

const fn default_tick_seconds() -> f64 {
    0.1
}

const fn default_threads() -> usize {
    4
}

const fn default_one() -> f64 {
    1.0
}

const fn default_neighbor_weight() -> f64 {
    0.5
}

const fn default_reorg_period_ms() -> u64 {
    1000
}

const fn default_split_threshold() -> f64 {
    10.0
}

const fn default_max_cells() -> usize {
    64
}

const fn default_hysteresis_window() -> usize {
    5
}

const fn default_merge_ratio() -> f64 {
    0.5
}

const fn default_offer_cooldown_ticks() -> u64 {
    50
}

const fn default_initial_agents() -> u32 {
    40
}

const fn default_initial_objects() -> u32 {
    10
}

const fn default_object_size() -> f64 {
    4.0
}

const fn default_vision_fov_degrees() -> f64 {
    90.0
}

const fn default_vision_distance() -> f64 {
    50.0
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_owned()
}

fn default_subject_prefix() -> String {
    "cellsim".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_max_real_time_seconds() -> u64 {
    86_400
}

const fn default_true() -> bool {
    true
}
