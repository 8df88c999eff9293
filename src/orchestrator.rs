//! Runlevel orchestration.
//!
//! Runlevel 1 runs the fixed list of boot stages. Every higher runlevel loads
//! its service source and then brings services up by fixed-point scanning:
//! each pass tries to start every never-launched `Stopped` service of the
//! level, and scanning ends after the first pass that changes nothing.

use crate::config::{InitConfig, DEFAULT_RUNLEVEL};
use crate::loader::{KeyValueLoader, ServiceLoader};
use crate::platform::{BootStage, Platform};
use crate::registry::LoadReport;
use crate::resolver::StuckService;
use crate::status::{Status, StatusLog};
use crate::supervisor::{StartOutcome, Supervisor};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one boot stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: BootStage,
    /// `None` on success
    pub error: Option<String>,
}

/// What a fixed-point bring-up did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BringUpReport {
    pub runlevel: u8,
    /// Scan passes executed, including the final pass without changes
    pub passes: usize,
    /// Services whose process was created
    pub started: Vec<String>,
    /// Services whose process creation failed
    pub failed: Vec<String>,
    /// Services left `Stopped` on unmet dependencies
    pub stuck: Vec<StuckService>,
}

/// Human name of a runlevel.
pub fn runlevel_name(runlevel: u8) -> &'static str {
    match runlevel {
        1 => "Single User",
        2 => "Multi User",
        3 => "Graphical",
        _ => "Custom",
    }
}

/// Sequences boot stages and runlevel bring-up.
pub struct Orchestrator {
    supervisor: Supervisor,
    platform: Arc<dyn Platform>,
    loader: Box<dyn ServiceLoader>,
    config: Arc<InitConfig>,
}

impl Orchestrator {
    pub fn new(supervisor: Supervisor, platform: Arc<dyn Platform>, config: Arc<InitConfig>) -> Self {
        let loader = Box::new(KeyValueLoader::new(config.parse_options()));
        Self {
            supervisor,
            platform,
            loader,
            config,
        }
    }

    fn status(&self) -> &StatusLog {
        self.supervisor.status()
    }

    /// Boot to `target`: base stages, then every runlevel from 2 up.
    ///
    /// The current runlevel advances as each level is entered.
    pub async fn boot(&self, target: u8) -> Vec<BringUpReport> {
        self.supervisor.run_state().set_runlevel(DEFAULT_RUNLEVEL);

        if self.config.run_boot_stages {
            self.run_base_stages().await;
        } else {
            self.status()
                .status(Status::Stage, format!("Entering runlevel 1 ({})", runlevel_name(1)));
            self.status().status(Status::Info, "Boot stages disabled");
        }

        let mut reports = Vec::new();
        for level in 2..=target {
            if !self.supervisor.run_state().is_running() {
                warn!(runlevel = level, "Shutdown requested, aborting boot");
                break;
            }
            self.supervisor.run_state().set_runlevel(level);
            reports.push(self.enter_runlevel(level).await);
        }
        reports
    }

    /// Run every base boot stage in order. A failed stage never stops the sequence.
    pub async fn run_base_stages(&self) -> Vec<StageOutcome> {
        self.status()
            .status(Status::Stage, format!("Entering runlevel 1 ({})", runlevel_name(1)));

        let mut outcomes = Vec::with_capacity(BootStage::BASE_SEQUENCE.len());
        for stage in BootStage::BASE_SEQUENCE {
            self.status().status(Status::Info, stage.description());

            let error = match self.platform.run_stage(stage).await {
                Ok(()) => {
                    self.status().status(Status::Ok, stage.description());
                    None
                }
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Boot stage failed");
                    self.status()
                        .status(Status::Failure, format!("{}: {}", stage.description(), e));
                    Some(e.to_string())
                }
            };
            outcomes.push(StageOutcome { stage, error });
        }
        outcomes
    }

    /// Load and bring up one runlevel.
    pub async fn enter_runlevel(&self, runlevel: u8) -> BringUpReport {
        self.status().status(
            Status::Stage,
            format!("Entering runlevel {} ({})", runlevel, runlevel_name(runlevel)),
        );
        self.load(runlevel).await;
        self.bring_up(runlevel).await
    }

    /// Register the services of a runlevel from its service directory.
    pub async fn load(&self, runlevel: u8) -> LoadReport {
        let dir = self.config.service_dir(runlevel);
        self.status()
            .status(Status::Info, format!("Loading services from {}", dir.display()));

        let report = self
            .supervisor
            .registry()
            .load(&dir, runlevel, self.loader.as_ref(), self.config.max_respawn)
            .await;

        if report.source_missing {
            self.status().status(
                Status::Warning,
                format!("No services directory for runlevel {}", runlevel),
            );
        }
        for name in &report.loaded {
            self.status().status(Status::Loaded, name);
        }
        for (path, reason) in &report.skipped {
            self.status()
                .status(Status::Warning, format!("{}: {}", path.display(), reason));
        }

        if self.config.validate_dependencies {
            for (name, missing) in self.supervisor.registry().unresolvable_dependencies().await {
                self.status().status(
                    Status::Warning,
                    format!("{}: unresolvable dependencies: {}", name, missing.join(", ")),
                );
            }
        }

        report
    }

    /// Start services of `runlevel` until a full pass changes nothing.
    ///
    /// Every pass with a change launches at least one service for the first
    /// time, so the loop ends after at most N+1 passes for N services.
    pub async fn bring_up(&self, runlevel: u8) -> BringUpReport {
        let registry = self.supervisor.registry();
        let run_state = self.supervisor.run_state();
        let mut report = BringUpReport {
            runlevel,
            ..Default::default()
        };

        self.status()
            .status(Status::Info, format!("Starting services for runlevel {}", runlevel));

        while run_state.is_running() {
            report.passes += 1;
            let mut changed = 0;

            for name in registry.never_started(runlevel).await {
                if !run_state.is_running() {
                    break;
                }
                match self.supervisor.start(&name).await {
                    StartOutcome::Skipped => continue,
                    StartOutcome::Started(_) => report.started.push(name),
                    StartOutcome::Failed => report.failed.push(name),
                    StartOutcome::Aborted => break,
                }
                changed += 1;
            }

            debug!(runlevel = runlevel, pass = report.passes, changed = changed, "Bring-up pass finished");
            if changed == 0 {
                break;
            }
            tokio::time::sleep(self.config.bringup_delay).await;
        }

        report.stuck = registry.stuck_services(runlevel).await;
        for stuck in &report.stuck {
            self.status().status(Status::Warning, describe_stuck(stuck));
        }

        info!(
            runlevel = runlevel,
            passes = report.passes,
            started = report.started.len(),
            failed = report.failed.len(),
            stuck = report.stuck.len(),
            "Runlevel bring-up finished"
        );
        report
    }
}

fn describe_stuck(stuck: &StuckService) -> String {
    let mut blockers = Vec::new();
    if !stuck.waiting_on.is_empty() {
        blockers.push(format!("waiting on {}", stuck.waiting_on.join(", ")));
    }
    if !stuck.unresolvable.is_empty() {
        blockers.push(format!("unknown dependencies {}", stuck.unresolvable.join(", ")));
    }
    format!("{} blocked: {}", stuck.name, blockers.join("; "))
}
