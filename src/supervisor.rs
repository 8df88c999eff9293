//! Per-service start/restart state machine.
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!               |          |
//!               v          +-- (process exit) -> Stopped
//!             Failed
//! ```
//!
//! A spawn failure is terminal. Only an observed process exit is evaluated
//! against the restart policy and the respawn budget. A process created
//! after shutdown was requested never becomes `Running`: it is stopped at
//! once and the service goes back to `Stopped`.

use crate::error::Result;
use crate::monitor::LivenessMonitor;
use crate::process::{ExitStatus, ProcessLauncher};
use crate::registry::ServiceRegistry;
use crate::run_state::RunState;
use crate::service::ServiceState;
use crate::status::{Status, StatusLog};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Grace period for a process created after shutdown was requested.
const ABORTED_START_GRACE: Duration = Duration::from_secs(5);

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A precondition did not hold; nothing changed
    Skipped,
    /// The process was created
    Started(u32),
    /// Process creation failed; the service is now `Failed`
    Failed,
    /// Shutdown was requested while starting; the new process was stopped
    Aborted,
}

impl StartOutcome {
    /// Whether the service changed state.
    pub fn changed(&self) -> bool {
        !matches!(self, StartOutcome::Skipped)
    }
}

/// Result of handling an observed exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The exit did not belong to the current running process
    Ignored,
    /// Policy (or shutdown) says no restart; the service is `Stopped`
    Stopped,
    /// The respawn budget is used up; the service stays `Stopped`
    Exhausted,
    /// A new process replaced the old one
    Restarted(u32),
    /// The replacement process could not be created
    Failed,
}

enum ExitDecision {
    Stay,
    Exhausted,
    Respawn {
        command: String,
        attempt: u32,
        max: u32,
    },
}

/// Drives service state transitions.
#[derive(Debug, Clone)]
pub struct Supervisor {
    registry: Arc<ServiceRegistry>,
    launcher: Arc<ProcessLauncher>,
    run_state: Arc<RunState>,
    status: Arc<StatusLog>,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        launcher: Arc<ProcessLauncher>,
        run_state: Arc<RunState>,
        status: Arc<StatusLog>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            launcher,
            run_state,
            status,
            poll_interval,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn launcher(&self) -> &Arc<ProcessLauncher> {
        &self.launcher
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    pub fn status(&self) -> &Arc<StatusLog> {
        &self.status
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Start a service.
    ///
    /// Silently does nothing unless the service is `Stopped`, its
    /// dependencies are running and its runlevel is reachable.
    pub async fn start(&self, name: &str) -> StartOutcome {
        let runlevel = self.run_state.current_runlevel();
        let Some(command) = self.registry.begin_start(name, runlevel).await else {
            debug!(service = %name, "Start preconditions not met");
            return StartOutcome::Skipped;
        };

        self.status.status(Status::Progress, name);
        let outcome = self.launch(name, &command).await;

        if let StartOutcome::Started(_) = outcome {
            self.watch(name).await;
        }
        outcome
    }

    /// Create the process for a service already in `Starting`.
    async fn launch(&self, name: &str, command: &str) -> StartOutcome {
        match self.launcher.spawn(command) {
            Ok(pid) => {
                let marked = self
                    .registry
                    .update(name, |svc| -> Result<bool> {
                        svc.instance.pid = Some(pid);
                        svc.instance.started_at = Some(Utc::now());
                        svc.transition(ServiceState::Running)?;
                        if self.run_state.is_running() {
                            return Ok(true);
                        }
                        svc.transition(ServiceState::Stopping)?;
                        Ok(false)
                    })
                    .await;

                match marked {
                    Some(Ok(false)) => return self.abort_start(name, pid).await,
                    Some(Err(e)) => {
                        error!(service = %name, error = %e, "Failed to record running process")
                    }
                    _ => {}
                }

                info!(service = %name, pid = pid, "Service started");
                self.status.status(Status::Ok, name);
                StartOutcome::Started(pid)
            }
            Err(e) => {
                let reason = e.to_string();
                self.registry
                    .update(name, |svc| {
                        svc.instance.failure_reason = Some(reason);
                        svc.transition(ServiceState::Failed)
                    })
                    .await;

                error!(service = %name, error = %e, "Failed to start service");
                self.status.status(Status::Failure, name);
                StartOutcome::Failed
            }
        }
    }

    /// Stop a process whose service was claimed for shutdown right after spawn.
    async fn abort_start(&self, name: &str, pid: u32) -> StartOutcome {
        info!(service = %name, pid = pid, "Shutdown requested, stopping new process");
        let result = self.launcher.stop(pid, Some(ABORTED_START_GRACE)).await;

        self.registry
            .update(name, |svc| {
                if let Ok(exit) = &result {
                    svc.instance.last_exit = Some(exit.clone());
                }
                svc.transition(ServiceState::Stopped)
            })
            .await;

        if let Err(e) = result {
            warn!(service = %name, pid = pid, error = %e, "Failed to stop new process");
        }
        self.status.status(Status::Stopped, name);
        StartOutcome::Aborted
    }

    /// Attach a liveness monitor unless one is already watching.
    async fn watch(&self, name: &str) {
        if self.registry.attach_monitor(name).await {
            LivenessMonitor::new(self.clone(), name).spawn();
        }
    }

    /// Apply the restart policy to an observed exit of `pid`.
    pub async fn handle_exit(&self, name: &str, pid: u32, exit: ExitStatus) -> ExitOutcome {
        let decision = self
            .registry
            .update(name, |svc| {
                if svc.state() != ServiceState::Running || svc.instance.pid != Some(pid) {
                    return None;
                }

                svc.instance.last_exit = Some(exit.clone());
                svc.transition(ServiceState::Stopped).ok()?;

                if !self.run_state.is_running() || !svc.definition.restart.should_restart(&exit) {
                    return Some(ExitDecision::Stay);
                }
                if !svc.instance.can_respawn() {
                    return Some(ExitDecision::Exhausted);
                }

                svc.transition(ServiceState::Starting).ok()?;
                svc.instance.respawn_count += 1;
                Some(ExitDecision::Respawn {
                    command: svc.definition.command.clone(),
                    attempt: svc.instance.respawn_count,
                    max: svc.instance.max_respawn,
                })
            })
            .await
            .flatten();

        let Some(decision) = decision else {
            debug!(service = %name, pid = pid, "Ignoring exit of untracked process");
            return ExitOutcome::Ignored;
        };

        info!(service = %name, pid = pid, code = ?exit.code, signal = ?exit.signal, "Service process exited");
        self.status
            .message(format!("Service {} exited with {}", name, exit));

        match decision {
            ExitDecision::Stay => ExitOutcome::Stopped,
            ExitDecision::Exhausted => {
                warn!(service = %name, "Service exceeded max respawn count");
                self.status.status(
                    Status::Warning,
                    format!("{}: respawn limit reached, leaving stopped", name),
                );
                ExitOutcome::Exhausted
            }
            ExitDecision::Respawn {
                command,
                attempt,
                max,
            } => {
                self.status
                    .message(format!("Restarting {} (attempt {}/{})", name, attempt, max));
                match self.launch(name, &command).await {
                    StartOutcome::Started(pid) => ExitOutcome::Restarted(pid),
                    StartOutcome::Aborted => ExitOutcome::Stopped,
                    _ => ExitOutcome::Failed,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{RestartPolicy, ServiceDefinition};

    fn supervisor(shell: &str) -> Supervisor {
        Supervisor::new(
            Arc::new(ServiceRegistry::new()),
            Arc::new(ProcessLauncher::new(shell)),
            Arc::new(RunState::new(2)),
            Arc::new(StatusLog::console_only().quiet()),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_spawn_failure_is_terminal() {
        let sup = supervisor("/nonexistent/shell");
        sup.registry()
            .register(
                ServiceDefinition::new("broken", "true", 2).with_restart(RestartPolicy::Always),
                5,
            )
            .await
            .unwrap();

        assert_eq!(sup.start("broken").await, StartOutcome::Failed);
        let svc = sup.registry().get("broken").await.unwrap();
        assert_eq!(svc.state(), ServiceState::Failed);
        assert_eq!(svc.instance.pid, None);
        assert!(svc.instance.failure_reason.is_some());
        assert!(!svc.instance.monitored);

        // Failed never restarts
        assert_eq!(sup.start("broken").await, StartOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_exit_of_stale_pid_is_ignored() {
        let sup = supervisor("/bin/sh");
        sup.registry()
            .register(ServiceDefinition::new("svc", "exec sleep 30", 2), 5)
            .await
            .unwrap();

        let StartOutcome::Started(pid) = sup.start("svc").await else {
            panic!("service did not start");
        };

        let stale = ExitStatus {
            pid: pid + 1,
            code: Some(0),
            signal: None,
        };
        assert_eq!(sup.handle_exit("svc", pid + 1, stale).await, ExitOutcome::Ignored);
        assert_eq!(sup.registry().state("svc").await, Some(ServiceState::Running));

        sup.run_state().request_shutdown();
        sup.launcher().stop(pid, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_while_shutting_down_never_restarts() {
        let sup = supervisor("/bin/sh");
        sup.registry()
            .register(
                ServiceDefinition::new("svc", "exec sleep 30", 2).with_restart(RestartPolicy::Always),
                5,
            )
            .await
            .unwrap();
        // Keep a background monitor from reaping the exit first
        assert!(sup.registry().attach_monitor("svc").await);

        let StartOutcome::Started(pid) = sup.start("svc").await else {
            panic!("service did not start");
        };
        sup.run_state().request_shutdown();
        let exit = sup.launcher().stop(pid, None).await.unwrap();

        assert_eq!(sup.handle_exit("svc", pid, exit).await, ExitOutcome::Stopped);
        let svc = sup.registry().get("svc").await.unwrap();
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert_eq!(svc.instance.respawn_count, 0);
    }
}
