//! Error types for the engine binary.
//!
//! [`EngineError`] wraps every failure mode of startup and the run, so
//! `main` can propagate with `?`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: cellsim_core::ConfigError,
    },

    /// The environment could not be built.
    #[error("environment error: {source}")]
    Environment {
        /// The underlying environment error.
        #[from]
        source: cellsim_core::EnvironmentError,
    },

    /// Simulation runner failed.
    #[error("runner error: {source}")]
    Runner {
        /// The underlying runner error.
        #[from]
        source: cellsim_core::RunnerError,
    },

    /// Message bus setup failed.
    #[error("bus error: {source}")]
    Bus {
        /// The underlying bus error.
        #[from]
        source: cellsim_core::BusError,
    },

    /// NATS connection failed.
    #[error("NATS error: {message}")]
    Nats {
        /// Description of the NATS failure.
        message: String,
    },

    /// Initial population could not be placed.
    #[error("spawner error: {message}")]
    Spawner {
        /// Description of the spawner failure.
        message: String,
    },
}
