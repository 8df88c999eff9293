//! rlinit - runlevel init system and service supervisor.
//!
//! This crate boots a machine through ordered runlevels and supervises the
//! services declared for each level. It is designed to run as PID 1 and
//! handles:
//!
//! - Base runlevel boot stages (filesystems, devices, message bus, terminals)
//! - Dependency-gated service startup by fixed-point bring-up
//! - Liveness monitoring and policy-driven restart with a respawn budget
//! - Signal-requested shutdown and power-off
//!
//! # Architecture
//!
//! - **ServiceRegistry**: owns every declared service
//! - **resolver**: dependency queries over the registry
//! - **Supervisor**: per-service start/restart state machine
//! - **LivenessMonitor**: one watcher task per started service
//! - **Orchestrator**: boot stages and runlevel bring-up
//! - **ShutdownCoordinator**: stops services and powers off
//!
//! # Example
//!
//! ```no_run
//! use rlinit::{Init, InitConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let init = Init::new(InitConfig::default())?;
//!     init.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod init;
pub mod loader;
pub mod monitor;
pub mod orchestrator;
pub mod platform;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod run_state;
pub mod service;
pub mod shutdown;
pub mod status;
pub mod supervisor;

// Re-export main types
pub use config::InitConfig;
pub use control::{ControlClient, ControlCommand, ControlResponse, ControlServer};
pub use error::{Error, Result};
pub use init::{create_test_init, Init};
pub use loader::{DependencyOverflow, KeyValueLoader, ServiceLoader};
pub use orchestrator::{BringUpReport, Orchestrator};
pub use platform::{BootStage, Platform, SystemPlatform};
pub use process::{ExitStatus, ProcessLauncher};
pub use registry::ServiceRegistry;
pub use resolver::StuckService;
pub use run_state::RunState;
pub use service::{RestartPolicy, Service, ServiceDefinition, ServiceInfo, ServiceState};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use status::{Status, StatusLog};
pub use supervisor::{ExitOutcome, StartOutcome, Supervisor};
