//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rlinit::{BootStage, Error, Init, InitConfig, Platform, Result, ServiceState, StatusLog};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Boot-stage collaborator that records every call.
#[derive(Default)]
pub struct RecordingPlatform {
    failing: HashSet<BootStage>,
    stages: Mutex<Vec<BootStage>>,
    releases: AtomicUsize,
    power_offs: AtomicUsize,
}

impl RecordingPlatform {
    pub fn failing(stages: &[BootStage]) -> Self {
        Self {
            failing: stages.iter().copied().collect(),
            ..Default::default()
        }
    }

    pub fn stages(&self) -> Vec<BootStage> {
        self.stages.lock().unwrap().clone()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn power_offs(&self) -> usize {
        self.power_offs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for RecordingPlatform {
    async fn run_stage(&self, stage: BootStage) -> Result<()> {
        self.stages.lock().unwrap().push(stage);
        if self.failing.contains(&stage) {
            return Err(Error::BootStage {
                stage: stage.to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn power_off(&self) -> Result<()> {
        self.power_offs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A configuration directory with short timings.
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> InitConfig {
        InitConfig {
            config_dir: self.path().to_path_buf(),
            log_file: self.path().join("rlinit.log"),
            control_socket: self.path().join("control.sock"),
            poll_interval: Duration::from_millis(50),
            bringup_delay: Duration::from_millis(20),
            stop_timeout: Some(Duration::from_secs(5)),
            require_pid1: false,
            ..Default::default()
        }
    }

    pub fn set_runlevel(&self, content: &str) {
        std::fs::write(self.path().join("initlevel"), content).unwrap();
    }

    /// Write a service file into the source directory of `runlevel`.
    pub fn service(&self, runlevel: u8, file: &str, content: &str) {
        let dir = self.path().join(format!("rc{}", runlevel));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), content).unwrap();
    }

    pub fn init(&self, platform: Arc<RecordingPlatform>) -> Init {
        self.init_with(self.config(), platform)
    }

    pub fn init_with(&self, config: InitConfig, platform: Arc<RecordingPlatform>) -> Init {
        let status = Arc::new(StatusLog::open(&config.log_file).quiet());
        Init::with_platform(config, platform, status)
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `name` reaches `state`.
pub async fn wait_for_state(init: &Init, name: &str, state: ServiceState) -> bool {
    let registry = init.supervisor().registry();
    wait_for(Duration::from_secs(5), || async move {
        registry.state(name).await == Some(state)
    })
    .await
}
