//! Service definition types and states for the supervisor.

use crate::error::{Error, Result};
use crate::process::ExitStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default restart budget for a service.
pub const DEFAULT_MAX_RESPAWN: u32 = 5;

/// Service restart policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    #[default]
    Never,
    /// Restart after every exit
    Always,
    /// Restart on failure (non-zero exit)
    OnFailure,
}

impl RestartPolicy {
    /// Parse the value of a `RESTART=` line. Anything unrecognised is `Never`.
    pub fn from_config_value(value: &str) -> Self {
        match value {
            "always" => RestartPolicy::Always,
            "on-failure" => RestartPolicy::OnFailure,
            _ => RestartPolicy::Never,
        }
    }

    /// Decide whether an observed exit should be followed by a restart.
    ///
    /// A process killed by a signal has no exit code and counts as a failure.
    pub fn should_restart(&self, exit: &ExitStatus) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => !exit.success(),
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// Current state of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Not running; eligible for a start
    #[default]
    Stopped,
    /// Process is being created
    Starting,
    /// Process is running
    Running,
    /// Termination has been requested
    Stopping,
    /// Process creation failed; terminal
    Failed,
}

impl ServiceState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Running` is only reachable from `Starting`, and `Failed` has no exits.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Check if the service has a live process.
    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Running)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

/// Service definition - describes how to run a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Unique name of the service
    pub name: String,
    /// Shell command line to execute
    pub command: String,
    /// Services that must be running before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Restart policy
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Runlevel at which the service becomes eligible to start
    pub runlevel: u8,
}

impl ServiceDefinition {
    /// Create a new service definition with no dependencies and no restarts.
    pub fn new(name: impl Into<String>, command: impl Into<String>, runlevel: u8) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            dependencies: Vec::new(),
            restart: RestartPolicy::default(),
            runlevel,
        }
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }
}

/// Runtime information about a supervised service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Current state
    pub state: ServiceState,
    /// PID of the current process; only set while starting or running
    pub pid: Option<u32>,
    /// Automatic restarts performed so far
    pub respawn_count: u32,
    /// Restart budget
    pub max_respawn: u32,
    /// Whether a start has ever been attempted
    pub launched: bool,
    /// Whether a liveness monitor is attached
    pub monitored: bool,
    /// Time when the current process was started
    pub started_at: Option<DateTime<Utc>>,
    /// Last observed exit
    pub last_exit: Option<ExitStatus>,
    /// Last failure reason
    pub failure_reason: Option<String>,
}

impl ServiceInstance {
    /// Create a new, stopped service instance.
    pub fn new(max_respawn: u32) -> Self {
        Self {
            state: ServiceState::Stopped,
            pid: None,
            respawn_count: 0,
            max_respawn,
            launched: false,
            monitored: false,
            started_at: None,
            last_exit: None,
            failure_reason: None,
        }
    }

    /// Check whether the restart budget still allows a respawn.
    pub fn can_respawn(&self) -> bool {
        self.respawn_count < self.max_respawn
    }

    /// Get the uptime of the current process.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let duration = Utc::now().signed_duration_since(start);
            Duration::from_secs(duration.num_seconds().max(0) as u64)
        })
    }
}

/// A registered service: its definition plus runtime state.
#[derive(Debug, Clone)]
pub struct Service {
    pub definition: ServiceDefinition,
    pub instance: ServiceInstance,
}

impl Service {
    pub fn new(definition: ServiceDefinition, max_respawn: u32) -> Self {
        Self {
            definition,
            instance: ServiceInstance::new(max_respawn),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn state(&self) -> ServiceState {
        self.instance.state
    }

    /// Move to `next`, rejecting moves outside the lifecycle graph.
    pub fn transition(&mut self, next: ServiceState) -> Result<()> {
        let current = self.instance.state;
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                name: self.definition.name.clone(),
                from: current,
                to: next,
            });
        }

        self.instance.state = next;
        if !next.is_active() {
            self.instance.pid = None;
            self.instance.started_at = None;
        }
        Ok(())
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.definition.name.clone(),
            state: self.instance.state,
            pid: self.instance.pid,
            runlevel: self.definition.runlevel,
            restart: self.definition.restart,
            respawn_count: self.instance.respawn_count,
            max_respawn: self.instance.max_respawn,
            uptime_secs: self.instance.uptime().map(|d| d.as_secs()),
        }
    }
}

/// Service information for listing and the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub runlevel: u8,
    pub restart: RestartPolicy,
    pub respawn_count: u32,
    pub max_respawn: u32,
    pub uptime_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus {
            pid: 42,
            code: Some(code),
            signal: None,
        }
    }

    #[test]
    fn test_restart_policy_table() {
        let ok = exited(0);
        let bad = exited(3);
        let killed = ExitStatus {
            pid: 42,
            code: None,
            signal: Some(9),
        };

        assert!(!RestartPolicy::Never.should_restart(&ok));
        assert!(!RestartPolicy::Never.should_restart(&bad));
        assert!(RestartPolicy::Always.should_restart(&ok));
        assert!(RestartPolicy::Always.should_restart(&bad));
        assert!(!RestartPolicy::OnFailure.should_restart(&ok));
        assert!(RestartPolicy::OnFailure.should_restart(&bad));
        assert!(RestartPolicy::OnFailure.should_restart(&killed));
    }

    #[test]
    fn test_restart_policy_from_config_value() {
        assert_eq!(RestartPolicy::from_config_value("always"), RestartPolicy::Always);
        assert_eq!(
            RestartPolicy::from_config_value("on-failure"),
            RestartPolicy::OnFailure
        );
        assert_eq!(RestartPolicy::from_config_value("Always"), RestartPolicy::Never);
        assert_eq!(RestartPolicy::from_config_value(""), RestartPolicy::Never);
    }

    #[test]
    fn test_no_direct_stopped_to_running() {
        assert!(!ServiceState::Stopped.can_transition_to(ServiceState::Running));
        assert!(ServiceState::Stopped.can_transition_to(ServiceState::Starting));
        assert!(ServiceState::Starting.can_transition_to(ServiceState::Running));
    }

    #[test]
    fn test_failed_is_terminal() {
        for next in [
            ServiceState::Stopped,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Stopping,
        ] {
            assert!(!ServiceState::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_transition_clears_pid_when_inactive() {
        let mut service = Service::new(ServiceDefinition::new("web", "true", 2), 5);
        service.transition(ServiceState::Starting).unwrap();
        service.instance.pid = Some(100);
        service.transition(ServiceState::Running).unwrap();
        assert_eq!(service.instance.pid, Some(100));

        service.transition(ServiceState::Stopped).unwrap();
        assert_eq!(service.instance.pid, None);
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut service = Service::new(ServiceDefinition::new("web", "true", 2), 5);
        let err = service.transition(ServiceState::Running).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[test]
    fn test_service_info_serialization() {
        let service = Service::new(
            ServiceDefinition::new("sshd", "/usr/sbin/sshd -D", 2)
                .with_restart(RestartPolicy::OnFailure),
            5,
        );
        let json = serde_json::to_string(&service.info()).unwrap();
        assert!(json.contains("\"state\":\"stopped\""));
        assert!(json.contains("\"restart\":\"on-failure\""));

        let parsed: ServiceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, service.info());
    }
}
