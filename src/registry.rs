//! Service registry.
//!
//! The registry exclusively owns every service record. All access goes
//! through one registry-wide `RwLock`: a dependency check holds the read (or
//! write) guard for the whole check, and every check-and-transition runs
//! under a single write guard, so no caller observes a half-applied update.

use crate::error::{Error, Result};
use crate::loader::ServiceLoader;
use crate::resolver::{self, StuckService};
use crate::service::{Service, ServiceDefinition, ServiceInfo, ServiceState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Outcome of loading a service source.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Names registered from this source, in load order
    pub loaded: Vec<String>,
    /// Files that could not be registered, with the reason
    pub skipped: Vec<(PathBuf, String)>,
    /// The source directory could not be read
    pub source_missing: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    services: HashMap<String, Service>,
    /// Registration order, used for scans
    order: Vec<String>,
}

impl RegistryInner {
    fn ordered(&self) -> impl Iterator<Item = &Service> {
        self.order.iter().filter_map(|name| self.services.get(name))
    }
}

/// Owner of all declared services, keyed by name.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    inner: RwLock<RegistryInner>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service definition.
    pub async fn register(&self, def: ServiceDefinition, max_respawn: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let name = def.name.clone();

        if inner.services.contains_key(&name) {
            return Err(Error::ServiceAlreadyExists(name));
        }

        inner.services.insert(name.clone(), Service::new(def, max_respawn));
        inner.order.push(name);
        Ok(())
    }

    /// Load every service file in `source` as services of `runlevel`.
    ///
    /// A missing source registers nothing. Files that fail to parse, and
    /// duplicates of already registered names, are skipped.
    pub async fn load(
        &self,
        source: &Path,
        runlevel: u8,
        loader: &dyn ServiceLoader,
        max_respawn: u32,
    ) -> LoadReport {
        let mut report = LoadReport::default();

        let mut paths: Vec<PathBuf> = match std::fs::read_dir(source) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|entry| entry.path())
                .collect(),
            Err(e) => {
                warn!(dir = %source.display(), runlevel = runlevel, error = %e, "Service source unavailable");
                report.source_missing = true;
                return report;
            }
        };
        paths.sort();

        for path in paths {
            let def = match loader.load(&path, runlevel) {
                Ok(def) => def,
                Err(e) => {
                    error!(path = ?path, loader = loader.name(), error = %e, "Failed to load service definition");
                    report.skipped.push((path, e.to_string()));
                    continue;
                }
            };

            let name = def.name.clone();
            match self.register(def, max_respawn).await {
                Ok(()) => {
                    info!(service = %name, runlevel = runlevel, "Loaded service definition");
                    report.loaded.push(name);
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping service definition");
                    report.skipped.push((path, e.to_string()));
                }
            }
        }

        report
    }

    /// Get a copy of a service record.
    pub async fn get(&self, name: &str) -> Option<Service> {
        self.inner.read().await.services.get(name).cloned()
    }

    /// Get the current state of a service.
    pub async fn state(&self, name: &str) -> Option<ServiceState> {
        self.inner.read().await.services.get(name).map(Service::state)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copies of all services in registration order.
    pub async fn snapshot(&self) -> Vec<Service> {
        self.inner.read().await.ordered().cloned().collect()
    }

    /// Services currently `Running`.
    pub async fn running(&self) -> Vec<ServiceInfo> {
        self.inner
            .read()
            .await
            .ordered()
            .filter(|svc| svc.state() == ServiceState::Running)
            .map(Service::info)
            .collect()
    }

    /// Whether every dependency of `name` is registered and `Running`.
    ///
    /// An unknown service has nothing to satisfy and reports `false`.
    pub async fn dependencies_met(&self, name: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .services
            .get(name)
            .map(|svc| resolver::dependencies_met(&svc.definition, &inner.services))
            .unwrap_or(false)
    }

    /// Stopped services of `runlevel` whose dependencies are not met.
    pub async fn stuck_services(&self, runlevel: u8) -> Vec<StuckService> {
        let inner = self.inner.read().await;
        inner
            .ordered()
            .filter(|svc| svc.definition.runlevel == runlevel)
            .filter(|svc| svc.state() == ServiceState::Stopped)
            .filter_map(|svc| resolver::blockers(&svc.definition, &inner.services))
            .collect()
    }

    /// Services with dependencies naming no registered service.
    pub async fn unresolvable_dependencies(&self) -> Vec<(String, Vec<String>)> {
        let inner = self.inner.read().await;
        inner
            .ordered()
            .filter_map(|svc| {
                let missing = resolver::unresolvable(&svc.definition, &inner.services);
                (!missing.is_empty()).then(|| (svc.name().to_string(), missing))
            })
            .collect()
    }

    /// Stopped services of `runlevel` that have never been launched.
    pub async fn never_started(&self, runlevel: u8) -> Vec<String> {
        self.inner
            .read()
            .await
            .ordered()
            .filter(|svc| svc.definition.runlevel == runlevel)
            .filter(|svc| svc.state() == ServiceState::Stopped && !svc.instance.launched)
            .map(|svc| svc.name().to_string())
            .collect()
    }

    /// Atomically check start eligibility and move the service to `Starting`.
    ///
    /// Returns the command to run, or `None` when the service is unknown, not
    /// `Stopped`, above `current_runlevel`, or has unmet dependencies.
    pub async fn begin_start(&self, name: &str, current_runlevel: u8) -> Option<String> {
        let mut inner = self.inner.write().await;

        let eligible = inner.services.get(name).is_some_and(|svc| {
            svc.state() == ServiceState::Stopped
                && svc.definition.runlevel <= current_runlevel
                && resolver::dependencies_met(&svc.definition, &inner.services)
        });
        if !eligible {
            return None;
        }

        let svc = inner.services.get_mut(name)?;
        svc.transition(ServiceState::Starting).ok()?;
        svc.instance.launched = true;
        Some(svc.definition.command.clone())
    }

    /// Apply `f` to a service record under the write lock.
    pub async fn update<R>(&self, name: &str, f: impl FnOnce(&mut Service) -> R) -> Option<R> {
        self.inner.write().await.services.get_mut(name).map(f)
    }

    /// Mark a service as watched. Returns `false` if it already has a monitor.
    pub async fn attach_monitor(&self, name: &str) -> bool {
        self.update(name, |svc| !std::mem::replace(&mut svc.instance.monitored, true))
            .await
            .unwrap_or(false)
    }

    pub async fn detach_monitor(&self, name: &str) {
        self.update(name, |svc| svc.instance.monitored = false).await;
    }
}
