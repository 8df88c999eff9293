//! Process-wide supervisor state shared by every task.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::Notify;

/// Running flag and current runlevel.
///
/// Clearing the running flag is the only cancellation primitive: monitors
/// and the bring-up loop observe it cooperatively.
#[derive(Debug)]
pub struct RunState {
    running: AtomicBool,
    runlevel: AtomicU8,
    shutdown: Notify,
}

impl RunState {
    pub fn new(runlevel: u8) -> Self {
        Self {
            running: AtomicBool::new(true),
            runlevel: AtomicU8::new(runlevel),
            shutdown: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_runlevel(&self) -> u8 {
        self.runlevel.load(Ordering::SeqCst)
    }

    pub fn set_runlevel(&self, runlevel: u8) {
        self.runlevel.store(runlevel, Ordering::SeqCst);
    }

    /// Clear the running flag and wake every waiter.
    ///
    /// Safe to call from any task; does no blocking work. Returns `true` for
    /// the first request only.
    pub fn request_shutdown(&self) -> bool {
        let first = self.running.swap(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        first
    }

    /// Wait until shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        loop {
            // Register before checking the flag so a concurrent request is not missed
            let notified = self.shutdown.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RUNLEVEL)
    }
}
