//! Error types for the rlinit supervisor.

use crate::service::ServiceState;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the supervisor.
///
/// None of these abort the supervisor itself: each one degrades a single
/// service, service file or boot stage while the rest of the system keeps
/// running.
#[derive(Error, Debug)]
pub enum Error {
    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Service already exists
    #[error("Service already exists: {0}")]
    ServiceAlreadyExists(String),

    /// State change outside the lifecycle graph
    #[error("Invalid state transition for {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: ServiceState,
        to: ServiceState,
    },

    /// Process spawn error
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// Dependency list longer than allowed under the reject policy
    #[error("Service {name} declares {count} dependencies (limit {limit})")]
    TooManyDependencies {
        name: String,
        count: usize,
        limit: usize,
    },

    /// Invalid service file
    #[error("Invalid service file: {path}: {reason}")]
    InvalidServiceFile { path: PathBuf, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Boot stage failed
    #[error("Boot stage {stage} failed: {reason}")]
    BootStage { stage: String, reason: String },

    /// Not running as PID 1
    #[error("Not running as PID 1 (current PID: {0})")]
    NotPid1(u32),

    /// Control socket error
    #[error("Control error: {0}")]
    Control(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}
