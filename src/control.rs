//! Control socket for talking to a running supervisor.
//!
//! The `list` and `poweroff` commands reach the supervisor over a Unix
//! domain socket carrying one JSON document per line.

use crate::error::{Error, Result};
use crate::registry::ServiceRegistry;
use crate::resolver::StuckService;
use crate::run_state::RunState;
use crate::service::ServiceInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/rlinit/control.sock";

/// How long a connection may take to send its command
const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands that can be sent to the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Check that the supervisor is responding
    Ping,
    /// List running services
    ListRunning,
    /// Get status of a specific service
    GetServiceStatus { name: String },
    /// Report stopped services blocked on dependencies
    StuckServices,
    /// Request shutdown and power-off
    Poweroff,
}

/// Response from the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command succeeded
    Success { message: String },
    /// Command failed
    Error { message: String },
    /// Service listing
    Services { services: Vec<ServiceInfo> },
    /// Blocked services
    Stuck { services: Vec<StuckService> },
    /// Pong response
    Pong,
}

/// Answer one command against the live supervisor state.
///
/// `Poweroff` only requests shutdown; the stop sequence runs on the main path.
pub async fn handle_command(
    command: ControlCommand,
    registry: &ServiceRegistry,
    run_state: &RunState,
) -> ControlResponse {
    match command {
        ControlCommand::Ping => ControlResponse::Pong,
        ControlCommand::ListRunning => ControlResponse::Services {
            services: registry.running().await,
        },
        ControlCommand::GetServiceStatus { name } => match registry.get(&name).await {
            Some(svc) => ControlResponse::Services {
                services: vec![svc.info()],
            },
            None => ControlResponse::Error {
                message: Error::ServiceNotFound(name).to_string(),
            },
        },
        ControlCommand::StuckServices => {
            let mut services = Vec::new();
            for level in 1..=run_state.current_runlevel() {
                services.extend(registry.stuck_services(level).await);
            }
            ControlResponse::Stuck { services }
        }
        ControlCommand::Poweroff => {
            if run_state.request_shutdown() {
                info!("Shutdown requested over control socket");
                ControlResponse::Success {
                    message: "Shutdown requested".to_string(),
                }
            } else {
                ControlResponse::Success {
                    message: "Shutdown already in progress".to_string(),
                }
            }
        }
    }
}

/// Control socket server (runs in the supervisor)
pub struct ControlServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl ControlServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Start listening for connections
    pub async fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Remove a stale socket left by a previous run
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "Control socket listening");

        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o660);
            std::fs::set_permissions(&self.socket_path, permissions)?;
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Accept a single connection
    pub async fn accept(&self) -> Result<UnixStream> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Control("Control server not started".to_string()))?;

        let (stream, _addr) = listener.accept().await?;
        debug!("Accepted control connection");
        Ok(stream)
    }

    /// Read a command from a stream
    pub async fn read_command(stream: &mut UnixStream) -> Result<ControlCommand> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let command: ControlCommand = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("Failed to parse command: {}", e)))?;

        debug!(command = ?command, "Received control command");
        Ok(command)
    }

    /// Write a response to a stream
    pub async fn write_response(stream: &mut UnixStream, response: &ControlResponse) -> Result<()> {
        let json = serde_json::to_string(response)?;

        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        debug!(response = ?response, "Sent control response");
        Ok(())
    }

    /// Serve connections until the supervisor stops running.
    ///
    /// Each connection is handled on its own task, so a silent client
    /// never holds up the next one.
    pub async fn serve(self, registry: Arc<ServiceRegistry>, run_state: Arc<RunState>) {
        while run_state.is_running() {
            let stream = tokio::select! {
                accepted = self.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept control connection");
                        continue;
                    }
                },
                _ = run_state.wait_for_shutdown() => break,
            };

            tokio::spawn(Self::handle_connection(
                stream,
                Arc::clone(&registry),
                Arc::clone(&run_state),
            ));
        }
        debug!("Control server stopped");
    }

    async fn handle_connection(
        mut stream: UnixStream,
        registry: Arc<ServiceRegistry>,
        run_state: Arc<RunState>,
    ) {
        let response =
            match tokio::time::timeout(CONTROL_READ_TIMEOUT, Self::read_command(&mut stream)).await {
                Ok(Ok(command)) => handle_command(command, &registry, &run_state).await,
                Ok(Err(e)) => ControlResponse::Error {
                    message: e.to_string(),
                },
                Err(_) => {
                    debug!("Control client sent nothing, closing connection");
                    return;
                }
            };

        if let Err(e) = Self::write_response(&mut stream, &response).await {
            warn!(error = %e, "Failed to write control response");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.listener.is_some() && self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "Failed to remove control socket");
            }
        }
    }
}

/// Control socket client (used by `list` and `poweroff`)
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Check if the control socket exists
    pub fn is_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Connect to the running supervisor
    pub async fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(Error::Control(format!(
                "Control socket not found at {}. Is the supervisor running?",
                self.socket_path.display()
            )));
        }

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "Failed to connect to control socket: {}. Is the supervisor running?",
                e
            ))
        })?;

        debug!("Connected to control socket");
        Ok(stream)
    }

    /// Send a command and receive a response
    pub async fn send_command(&self, command: ControlCommand) -> Result<ControlResponse> {
        let mut stream = self.connect().await?;

        let json = serde_json::to_string(&command)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: ControlResponse = serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("Failed to parse response: {}", e)))?;

        Ok(response)
    }

    pub async fn list_running(&self) -> Result<Vec<ServiceInfo>> {
        match self.send_command(ControlCommand::ListRunning).await? {
            ControlResponse::Services { services } => Ok(services),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            other => Err(Error::Control(format!("Unexpected response: {:?}", other))),
        }
    }

    pub async fn poweroff(&self) -> Result<ControlResponse> {
        self.send_command(ControlCommand::Poweroff).await
    }

    pub async fn ping(&self) -> bool {
        matches!(
            self.send_command(ControlCommand::Ping).await,
            Ok(ControlResponse::Pong)
        )
    }
}
