//! Process management for the supervisor.
//!
//! This module handles spawning detached service processes, polling them
//! for exit without blocking, reaping children nobody waits for, and
//! terminating them.

use crate::error::{Error, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll interval used while waiting for a process to exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Exit status of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Process ID
    pub pid: u32,
    /// Exit code (if exited normally)
    pub code: Option<i32>,
    /// Signal (if killed by signal)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Status for a process that was reaped elsewhere.
    fn unknown(pid: u32) -> Self {
        Self {
            pid,
            code: None,
            signal: None,
        }
    }

    fn from_wait_status(pid: u32, status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self {
                pid,
                code: Some(code),
                signal: None,
            }),
            WaitStatus::Signaled(_, sig, _) => Some(Self {
                pid,
                code: None,
                signal: Some(sig as i32),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "status {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Children whose exit an owner will collect.
#[derive(Debug, Default)]
struct ChildTable {
    /// Pids spawned with [`ProcessLauncher::spawn`] and not yet collected
    tracked: HashSet<u32>,
    /// Exits of tracked pids collected by [`ProcessLauncher::reap`], not yet claimed
    reaped: HashMap<u32, ExitStatus>,
}

/// Spawns and reaps service processes.
///
/// Every `waitpid` call goes through the child table lock, so an exit
/// collected by the reaper is always found by the owner's next `try_wait`.
#[derive(Debug)]
pub struct ProcessLauncher {
    /// Command interpreter used to run service command lines
    shell: PathBuf,
    children: Mutex<ChildTable>,
}

impl ProcessLauncher {
    /// Create a launcher that runs commands through `shell -c`.
    pub fn new(shell: impl AsRef<Path>) -> Self {
        Self {
            shell: shell.as_ref().to_path_buf(),
            children: Mutex::new(ChildTable::default()),
        }
    }

    fn children(&self) -> MutexGuard<'_, ChildTable> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a detached process running `command`.
    ///
    /// The caller collects the exit with [`try_wait`](Self::try_wait) or
    /// [`wait`](Self::wait). The child gets its own session and has its
    /// standard streams redirected to `/dev/null`.
    pub fn spawn(&self, command: &str) -> Result<u32> {
        // Held across the spawn so the reaper cannot collect an untracked pid
        let mut children = self.children();
        let pid = self.launch(command)?;
        children.tracked.insert(pid);
        Ok(pid)
    }

    /// Spawn a process nobody waits for. Its exit is collected by [`reap`](Self::reap).
    pub fn spawn_detached(&self, command: &str) -> Result<u32> {
        self.launch(command)
    }

    fn launch(&self, command: &str) -> Result<u32> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        // Create new session for the process
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {}", command, e)))?;

        let pid = child.id();
        debug!(pid = pid, command = command, "Spawned process");
        Ok(pid)
    }

    /// Try to collect a specific process without blocking.
    pub fn try_wait(&self, pid: u32) -> Result<Option<ExitStatus>> {
        let mut children = self.children();
        if let Some(exit) = children.reaped.remove(&pid) {
            children.tracked.remove(&pid);
            return Ok(Some(exit));
        }

        let exit = match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => match ExitStatus::from_wait_status(pid, status) {
                Some(exit) => exit,
                None => return Ok(None),
            },
            // Not our child, or collected outside this launcher
            Err(nix::Error::ECHILD) => ExitStatus::unknown(pid),
            Err(e) => return Err(e.into()),
        };

        children.tracked.remove(&pid);
        Ok(Some(exit))
    }

    /// Wait until the process exits.
    pub async fn wait(&self, pid: u32) -> Result<ExitStatus> {
        loop {
            if let Some(exit) = self.try_wait(pid)? {
                return Ok(exit);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Collect every exited child without blocking.
    ///
    /// Exits of tracked pids are kept for their owner. Everything else
    /// (detached helpers, orphans reparented to PID 1) is returned.
    pub fn reap(&self) -> Vec<ExitStatus> {
        let mut children = self.children();
        let mut untracked = Vec::new();

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else {
                        break;
                    };
                    let pid = pid.as_raw() as u32;
                    let Some(exit) = ExitStatus::from_wait_status(pid, status) else {
                        continue;
                    };

                    if children.tracked.contains(&pid) {
                        children.reaped.insert(pid, exit);
                    } else {
                        untracked.push(exit);
                    }
                }
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "waitpid failed while reaping");
                    break;
                }
            }
        }

        untracked
    }

    /// Send a signal to a process.
    pub fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        signal::kill(Pid::from_raw(pid as i32), sig)?;
        debug!(pid = pid, signal = ?sig, "Sent signal to process");
        Ok(())
    }

    /// Terminate a process and wait for it to exit.
    ///
    /// Without a timeout this waits until the process exits. With one,
    /// a process still alive at the deadline is sent SIGKILL.
    pub async fn stop(&self, pid: u32, timeout: Option<Duration>) -> Result<ExitStatus> {
        match self.signal(pid, Signal::SIGTERM) {
            Ok(()) | Err(Error::Nix(nix::Error::ESRCH)) => {}
            Err(e) => return Err(e),
        }

        let Some(timeout) = timeout else {
            return self.wait(pid).await;
        };

        match tokio::time::timeout(timeout, self.wait(pid)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(pid = pid, "Process didn't exit in time, sending SIGKILL");
                match self.signal(pid, Signal::SIGKILL) {
                    Ok(()) | Err(Error::Nix(nix::Error::ESRCH)) => {}
                    Err(e) => return Err(e),
                }
                let status = self.wait(pid).await?;
                info!(pid = pid, "Process killed");
                Ok(status)
            }
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_wait_exit_code() {
        let launcher = ProcessLauncher::default();
        let pid = launcher.spawn("exit 3").unwrap();
        let status = launcher.wait(pid).await.unwrap();
        assert_eq!(status.code, Some(3));
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_try_wait_running_process() {
        let launcher = ProcessLauncher::default();
        let pid = launcher.spawn("exec sleep 30").unwrap();
        assert_eq!(launcher.try_wait(pid).unwrap(), None);

        let status = launcher.stop(pid, None).await.unwrap();
        assert_eq!(status.signal, Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_stop_escalates_after_timeout() {
        let launcher = ProcessLauncher::default();
        let pid = launcher.spawn("trap '' TERM; while true; do sleep 1; done").unwrap();
        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = launcher
            .stop(pid, Some(Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(status.signal, Some(Signal::SIGKILL as i32));
    }

    #[test]
    fn test_spawn_with_missing_shell_fails() {
        let launcher = ProcessLauncher::new("/nonexistent/shell");
        let err = launcher.spawn("true").unwrap_err();
        assert!(matches!(err, Error::ProcessSpawnFailed(_)));
    }

    #[test]
    fn test_exit_status_display() {
        let status = ExitStatus {
            pid: 1,
            code: Some(0),
            signal: None,
        };
        assert_eq!(status.to_string(), "status 0");
        assert_eq!(ExitStatus::unknown(1).to_string(), "unknown status");
    }
}
