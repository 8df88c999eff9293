//! Liveness monitoring.
//!
//! Each started service gets one monitor task. While the supervisor is
//! running and the service's runlevel is reachable, the monitor polls the
//! tracked process without blocking and hands every exit to the
//! supervisor's restart decision exactly once.

use crate::service::ServiceState;
use crate::supervisor::{ExitOutcome, Supervisor};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Watches one service's process.
pub struct LivenessMonitor {
    supervisor: Supervisor,
    name: String,
}

impl LivenessMonitor {
    pub fn new(supervisor: Supervisor, name: impl Into<String>) -> Self {
        Self {
            supervisor,
            name: name.into(),
        }
    }

    /// Run the monitor on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Poll until the supervisor stops or the service's runlevel is left.
    pub async fn run(self) {
        debug!(service = %self.name, "Liveness monitor started");

        while self.should_watch().await {
            self.check().await;
            tokio::time::sleep(self.supervisor.poll_interval()).await;
        }

        self.supervisor.registry().detach_monitor(&self.name).await;
        debug!(service = %self.name, "Liveness monitor finished");
    }

    async fn should_watch(&self) -> bool {
        let run_state = self.supervisor.run_state();
        if !run_state.is_running() {
            return false;
        }

        match self.supervisor.registry().get(&self.name).await {
            Some(svc) => svc.definition.runlevel <= run_state.current_runlevel(),
            None => false,
        }
    }

    /// Check the tracked process once. Does nothing unless the service is `Running`.
    pub async fn check(&self) -> Option<ExitOutcome> {
        let svc = self.supervisor.registry().get(&self.name).await?;
        if svc.state() != ServiceState::Running {
            return None;
        }
        let pid = svc.instance.pid?;

        match self.supervisor.launcher().try_wait(pid) {
            Ok(Some(exit)) => Some(self.supervisor.handle_exit(&self.name, pid, exit).await),
            Ok(None) => None,
            Err(e) => {
                warn!(service = %self.name, pid = pid, error = %e, "Failed to poll process");
                None
            }
        }
    }
}
