//! rlinit binary.
//!
//! Runs as the PID 1 supervisor, or talks to a running one.

use clap::{Parser, Subcommand};
use rlinit::control::ControlClient;
use rlinit::status::{GREEN, RESET, YELLOW};
use rlinit::{Init, InitConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rlinit",
    about = "Runlevel init system - PID 1 service supervisor",
    version,
    author
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the runlevel selector and rcN/ service directories
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Control socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Don't require running as PID 1 (also disables power-off)
    #[arg(long)]
    no_pid1: bool,

    /// Skip the base runlevel boot stages
    #[arg(long)]
    no_boot_stages: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as init system (PID 1)
    Init,

    /// List running services
    List,

    /// Stop all services and power off
    Poweroff,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Some(Commands::Init) | None => {
            let init = Init::new(config)?;
            init.run().await?;
        }

        Some(Commands::List) => {
            let client = ControlClient::new(&config.control_socket);
            let services = match client.list_running().await {
                Ok(services) => services,
                Err(e) => {
                    warn!(error = %e, "Could not query running supervisor");
                    Vec::new()
                }
            };

            println!("=== Running Services ===");
            if services.is_empty() {
                println!("{}[!]{} No services running", YELLOW, RESET);
            } else {
                for svc in services {
                    if let Some(pid) = svc.pid {
                        println!("{}[+]{} {} (PID: {})", GREEN, RESET, svc.name, pid);
                    }
                }
            }
        }

        Some(Commands::Poweroff) => {
            let client = ControlClient::new(&config.control_socket);
            match client.poweroff().await {
                Ok(response) => info!(response = ?response, "Shutdown requested"),
                Err(e) => {
                    warn!(error = %e, "No running supervisor, shutting down locally");
                    Init::unchecked(config).shutdown().await;
                }
            }
        }
    }

    Ok(())
}

/// Build the configuration from the optional file and command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<InitConfig> {
    let mut config = match &cli.config {
        Some(path) => InitConfig::from_file(path)?,
        None => InitConfig::default(),
    };

    if let Some(dir) = &cli.config_dir {
        config.config_dir = dir.clone();
    }
    if let Some(socket) = &cli.socket {
        config.control_socket = socket.clone();
    }
    if cli.no_pid1 {
        config.require_pid1 = false;
    }
    if cli.no_boot_stages {
        config.run_boot_stages = false;
    }

    Ok(config)
}
