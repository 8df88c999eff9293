//! Supervisor core - wiring, signal handling, reaping and the idle loop.

use crate::config::{read_runlevel, InitConfig};
use crate::control::ControlServer;
use crate::error::{Error, Result};
use crate::orchestrator::{BringUpReport, Orchestrator};
use crate::platform::{Platform, SystemPlatform};
use crate::process::ProcessLauncher;
use crate::registry::ServiceRegistry;
use crate::run_state::RunState;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::status::{Status, StatusLog};
use crate::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The supervisor process.
pub struct Init {
    config: Arc<InitConfig>,
    status: Arc<StatusLog>,
    supervisor: Supervisor,
    orchestrator: Orchestrator,
    shutdown: ShutdownCoordinator,
}

impl Init {
    /// Create the supervisor for this machine.
    ///
    /// Fails with [`Error::NotPid1`] when PID 1 is required and this process is not PID 1.
    pub fn new(config: InitConfig) -> Result<Self> {
        let pid = std::process::id();
        if config.require_pid1 && pid != 1 {
            return Err(Error::NotPid1(pid));
        }
        Ok(Self::unchecked(config))
    }

    /// Create the supervisor without the PID 1 check, for one-shot commands.
    pub fn unchecked(config: InitConfig) -> Self {
        let status = Arc::new(StatusLog::open(&config.log_file));
        let launcher = Arc::new(ProcessLauncher::new(&config.shell));
        let platform = Arc::new(SystemPlatform::new(
            config.devices_script(),
            config.require_pid1,
            Arc::clone(&launcher),
            Arc::clone(&status),
        ));
        Self::assemble(config, launcher, platform, status)
    }

    /// Create the supervisor around a given boot-stage collaborator.
    pub fn with_platform(
        config: InitConfig,
        platform: Arc<dyn Platform>,
        status: Arc<StatusLog>,
    ) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(&config.shell));
        Self::assemble(config, launcher, platform, status)
    }

    fn assemble(
        config: InitConfig,
        launcher: Arc<ProcessLauncher>,
        platform: Arc<dyn Platform>,
        status: Arc<StatusLog>,
    ) -> Self {
        let config = Arc::new(config);
        let supervisor = Supervisor::new(
            Arc::new(ServiceRegistry::new()),
            launcher,
            Arc::new(RunState::default()),
            Arc::clone(&status),
            config.poll_interval,
        );
        let orchestrator = Orchestrator::new(
            supervisor.clone(),
            Arc::clone(&platform),
            Arc::clone(&config),
        );
        let shutdown = ShutdownCoordinator::new(&supervisor, platform, config.stop_timeout);

        Self {
            config,
            status,
            supervisor,
            orchestrator,
            shutdown,
        }
    }

    /// Boot, idle until shutdown is requested, then shut down.
    pub async fn run(&self) -> Result<()> {
        info!("rlinit starting");
        self.status.status(Status::Stage, "rlinit starting");

        let signals = self.spawn_signal_listener()?;
        let reaper = self.spawn_reaper()?;
        let control = self.spawn_control_server().await;

        self.boot().await;
        if self.supervisor.run_state().is_running() {
            self.status.status(Status::Ok, "System initialization complete");
        }

        self.supervisor.run_state().wait_for_shutdown().await;
        info!("Shutdown requested");
        self.shutdown().await;

        signals.abort();
        reaper.abort();
        if let Some(control) = control {
            if let Err(e) = control.await {
                warn!(error = %e, "Control server task failed");
            }
        }
        Ok(())
    }

    /// Read the runlevel selector and boot to it.
    pub async fn boot(&self) -> Vec<BringUpReport> {
        let target = read_runlevel(&self.config.runlevel_file());
        self.status
            .status(Status::Info, format!("Target runlevel {}", target));
        self.orchestrator.boot(target).await
    }

    /// Run the shutdown sequence.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown.shutdown().await
    }

    /// Request shutdown. Does no blocking work.
    pub fn request_shutdown(&self) -> bool {
        self.supervisor.run_state().request_shutdown()
    }

    /// Listen for SIGTERM and SIGINT. A signal only requests shutdown.
    fn spawn_signal_listener(&self) -> Result<JoinHandle<()>> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let run_state = Arc::clone(self.supervisor.run_state());

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, requesting shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, requesting shutdown"),
            }
            run_state.request_shutdown();
        }))
    }

    /// Collect exited children nobody waits for, on every SIGCHLD.
    ///
    /// As PID 1 this includes every orphan reparented to us. Exits of
    /// supervised processes stay with the launcher for their monitor.
    fn spawn_reaper(&self) -> Result<JoinHandle<()>> {
        let mut sigchld = signal(SignalKind::child())?;
        let launcher = Arc::clone(self.supervisor.launcher());

        Ok(tokio::spawn(async move {
            loop {
                for exit in launcher.reap() {
                    debug!(pid = exit.pid, status = %exit, "Reaped untracked process");
                }
                if sigchld.recv().await.is_none() {
                    break;
                }
            }
        }))
    }

    /// Start the control socket. Boot continues without it on failure.
    async fn spawn_control_server(&self) -> Option<JoinHandle<()>> {
        let mut server = ControlServer::new(&self.config.control_socket);
        if let Err(e) = server.start().await {
            warn!(path = %self.config.control_socket.display(), error = %e, "Control socket unavailable");
            self.status.status(Status::Warning, "Control socket unavailable");
            return None;
        }

        Some(tokio::spawn(server.serve(
            Arc::clone(self.supervisor.registry()),
            Arc::clone(self.supervisor.run_state()),
        )))
    }

    pub fn config(&self) -> &InitConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

/// Create a supervisor for testing or non-PID1 operation.
pub fn create_test_init(config_dir: PathBuf) -> Init {
    let config = InitConfig {
        log_file: config_dir.join("rlinit.log"),
        control_socket: config_dir.join("control.sock"),
        config_dir,
        run_boot_stages: false,
        require_pid1: false,
        ..Default::default()
    };
    Init::unchecked(config)
}
