//! Shutdown coordination.
//!
//! Stops every running service, releases what boot acquired and powers the
//! machine off. Runs on the main control path, never from signal context.

use crate::error::Result;
use crate::platform::Platform;
use crate::process::{ExitStatus, ProcessLauncher};
use crate::registry::ServiceRegistry;
use crate::run_state::RunState;
use crate::service::ServiceState;
use crate::status::{Status, StatusLog};
use crate::supervisor::Supervisor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Pause between scans while a service is still starting or stopping.
const SETTLE_INTERVAL: Duration = Duration::from_millis(20);

/// What a shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Services terminated by this call, in stop order
    pub stopped: Vec<String>,
    /// Whether this call invoked the power-off primitive
    pub powered_off: bool,
}

/// Terminates services and powers off.
pub struct ShutdownCoordinator {
    registry: Arc<ServiceRegistry>,
    launcher: Arc<ProcessLauncher>,
    run_state: Arc<RunState>,
    status: Arc<StatusLog>,
    platform: Arc<dyn Platform>,
    /// `None` waits forever for a service to exit
    stop_timeout: Option<Duration>,
    powered_off: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(
        supervisor: &Supervisor,
        platform: Arc<dyn Platform>,
        stop_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry: Arc::clone(supervisor.registry()),
            launcher: Arc::clone(supervisor.launcher()),
            run_state: Arc::clone(supervisor.run_state()),
            status: Arc::clone(supervisor.status()),
            platform,
            stop_timeout,
            powered_off: AtomicBool::new(false),
        }
    }

    /// Stop all services, release boot resources and power off.
    ///
    /// Power-off is invoked at most once however often this is called.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.status.status(Status::Stage, "Shutting down system");
        self.run_state.request_shutdown();

        let stopped = self.stop_all().await;

        if let Err(e) = self.platform.release().await {
            error!(error = %e, "Failed to release boot resources");
        }

        let mut powered_off = false;
        if !self.powered_off.swap(true, Ordering::SeqCst) {
            self.status.status(Status::Ok, "Powering off");
            if let Err(e) = self.platform.power_off() {
                error!(error = %e, "Power-off failed");
                self.status.status(Status::Failure, "Power-off failed");
            }
            powered_off = true;
        }

        ShutdownReport {
            stopped,
            powered_off,
        }
    }

    /// Terminate every `Running` service and wait for each to exit.
    ///
    /// Scans until no service is `Running`, `Starting` or `Stopping`, so a
    /// start or respawn racing with shutdown is stopped too.
    pub async fn stop_all(&self) -> Vec<String> {
        self.status.status(Status::Info, "Stopping all services");

        let mut stopped = Vec::new();
        loop {
            let mut settled = true;
            for svc in self.registry.snapshot().await {
                match svc.state() {
                    ServiceState::Running => {
                        settled = false;
                        if self.stop_service(svc.name()).await {
                            stopped.push(svc.name().to_string());
                        }
                    }
                    ServiceState::Starting | ServiceState::Stopping => settled = false,
                    ServiceState::Stopped | ServiceState::Failed => {}
                }
            }
            if settled {
                break;
            }
            tokio::time::sleep(SETTLE_INTERVAL).await;
        }
        stopped
    }

    /// Stop one service. Returns `false` if it was not running or could not be stopped.
    async fn stop_service(&self, name: &str) -> bool {
        // Claim the service: only a Running -> Stopping transition gets to signal it
        let pid = self
            .registry
            .update(name, |svc| {
                if svc.state() != ServiceState::Running {
                    return None;
                }
                let pid = svc.instance.pid?;
                svc.transition(ServiceState::Stopping).ok()?;
                Some(pid)
            })
            .await
            .flatten();

        let Some(pid) = pid else {
            return false;
        };

        self.status.status(Status::Progress, name);
        let result = self.launcher.stop(pid, self.stop_timeout).await;
        self.finish_stop(name, pid, result).await
    }

    /// Move a claimed service from `Stopping` to `Stopped`, whatever the stop returned.
    async fn finish_stop(&self, name: &str, pid: u32, result: Result<ExitStatus>) -> bool {
        match result {
            Ok(exit) => {
                self.registry
                    .update(name, |svc| {
                        svc.instance.last_exit = Some(exit);
                        svc.transition(ServiceState::Stopped)
                    })
                    .await;
                info!(service = %name, pid = pid, "Service stopped");
                self.status.status(Status::Stopped, name);
                true
            }
            Err(e) => {
                error!(service = %name, pid = pid, error = %e, "Failed to stop service");
                let reason = e.to_string();
                self.registry
                    .update(name, |svc| {
                        svc.instance.failure_reason = Some(reason);
                        svc.transition(ServiceState::Stopped)
                    })
                    .await;
                self.status.status(Status::Failure, name);
                false
            }
        }
    }
}
