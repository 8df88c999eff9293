//! Dependency resolution.
//!
//! A dependency is satisfied only when it names a registered service that is
//! currently `Running`. An unknown name is treated exactly like a service
//! that has not started yet, so unresolvable and cyclic dependencies block
//! forever rather than erroring.

use crate::service::{Service, ServiceDefinition, ServiceState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Read access to service states by name.
pub trait StateLookup {
    fn state_of(&self, name: &str) -> Option<ServiceState>;
}

impl StateLookup for HashMap<String, Service> {
    fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.get(name).map(Service::state)
    }
}

/// True iff every dependency exists and is `Running`.
pub fn dependencies_met<L: StateLookup + ?Sized>(def: &ServiceDefinition, lookup: &L) -> bool {
    def.dependencies
        .iter()
        .all(|dep| lookup.state_of(dep) == Some(ServiceState::Running))
}

/// Dependencies naming services that are not registered.
pub fn unresolvable<L: StateLookup + ?Sized>(def: &ServiceDefinition, lookup: &L) -> Vec<String> {
    def.dependencies
        .iter()
        .filter(|dep| lookup.state_of(dep).is_none())
        .cloned()
        .collect()
}

/// Why a stopped service is not being started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckService {
    pub name: String,
    /// Registered dependencies that are not running
    pub waiting_on: Vec<String>,
    /// Dependencies naming no registered service
    pub unresolvable: Vec<String>,
}

/// Describe what blocks `def`, or `None` if its dependencies are met.
pub fn blockers<L: StateLookup + ?Sized>(def: &ServiceDefinition, lookup: &L) -> Option<StuckService> {
    let mut waiting_on = Vec::new();
    let mut missing = Vec::new();

    for dep in &def.dependencies {
        match lookup.state_of(dep) {
            Some(ServiceState::Running) => {}
            Some(_) => waiting_on.push(dep.clone()),
            None => missing.push(dep.clone()),
        }
    }

    if waiting_on.is_empty() && missing.is_empty() {
        return None;
    }

    Some(StuckService {
        name: def.name.clone(),
        waiting_on,
        unresolvable: missing,
    })
}
