//! Supervisor configuration and the runlevel selector.

use crate::error::{Error, Result};
use crate::loader::{DependencyOverflow, ParseOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Runlevel used when the selector is missing or out of range.
pub const DEFAULT_RUNLEVEL: u8 = 1;

/// Highest runlevel the supervisor knows how to enter.
pub const MAX_RUNLEVEL: u8 = 3;

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Directory holding the runlevel selector and `rcN/` service sources
    pub config_dir: PathBuf,
    /// Append-only status log
    pub log_file: PathBuf,
    /// Control socket path
    pub control_socket: PathBuf,
    /// Command interpreter for service command lines
    pub shell: PathBuf,
    /// Liveness polling interval
    #[serde(with = "millis_serde")]
    pub poll_interval: Duration,
    /// Delay between fixed-point bring-up passes
    #[serde(with = "millis_serde")]
    pub bringup_delay: Duration,
    /// Restart budget assigned to every loaded service
    pub max_respawn: u32,
    /// Maximum number of dependencies per service
    pub dependency_limit: usize,
    /// What to do with a `DEPENDS=` list longer than the limit
    pub dependency_overflow: DependencyOverflow,
    /// Warn about dependencies naming unknown services after load
    pub validate_dependencies: bool,
    /// Escalate to SIGKILL when a service ignores SIGTERM this long
    #[serde(with = "option_millis_serde")]
    pub stop_timeout: Option<Duration>,
    /// Run the base runlevel boot stages
    pub run_boot_stages: bool,
    /// Whether to enforce PID 1 and really power off
    pub require_pid1: bool,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/rlinit"),
            log_file: PathBuf::from("/var/log/rlinit.log"),
            control_socket: PathBuf::from(crate::control::DEFAULT_CONTROL_SOCKET),
            shell: PathBuf::from("/bin/sh"),
            poll_interval: Duration::from_secs(2),
            bringup_delay: Duration::from_secs(1),
            max_respawn: crate::service::DEFAULT_MAX_RESPAWN,
            dependency_limit: crate::loader::DEFAULT_DEPENDENCY_LIMIT,
            dependency_overflow: DependencyOverflow::default(),
            validate_dependencies: false,
            stop_timeout: None,
            run_boot_stages: true,
            require_pid1: true,
        }
    }
}

impl InitConfig {
    /// Load a configuration from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: InitConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Path of the runlevel selector file.
    pub fn runlevel_file(&self) -> PathBuf {
        self.config_dir.join("initlevel")
    }

    /// Service source directory for a runlevel.
    pub fn service_dir(&self, runlevel: u8) -> PathBuf {
        self.config_dir.join(format!("rc{}", runlevel))
    }

    /// Device initialisation script.
    pub fn devices_script(&self) -> PathBuf {
        self.config_dir.join("rc.devices")
    }

    /// Parser options derived from this configuration.
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            dependency_limit: self.dependency_limit,
            overflow: self.dependency_overflow,
        }
    }
}

/// Parse the contents of a runlevel selector.
///
/// Only the first character counts; anything but a digit in `1..=3` selects
/// the default runlevel.
pub fn parse_runlevel(content: &str) -> u8 {
    content
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .map(|d| d as u8)
        .filter(|level| (DEFAULT_RUNLEVEL..=MAX_RUNLEVEL).contains(level))
        .unwrap_or(DEFAULT_RUNLEVEL)
}

/// Read the runlevel selector, falling back to the default when absent.
pub fn read_runlevel(path: &Path) -> u8 {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_runlevel(&content),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "No runlevel selector, using default");
            DEFAULT_RUNLEVEL
        }
    }
}

/// Module for millisecond duration serialization.
mod millis_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Module for optional millisecond duration serialization.
mod option_millis_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<u64> = Option::deserialize(deserializer)?;
        Ok(opt.map(Duration::from_millis))
    }
}
