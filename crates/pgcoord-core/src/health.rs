//! Composite health: catalog reachability, extension facts and transport state
//! folded into one report.
//!
//! Component verdicts:
//! - `postgresql` unreachable → the check fails with the catalog error
//! - `extension` missing → unhealthy
//! - `shared_memory` unavailable → unhealthy
//! - `background_worker` stopped → degraded
//! - `rpc` / `ipc` not listening → degraded
//!
//! The overall status is the worst component status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::warn;

use crate::catalog::DynCatalog;
use crate::error::Result;
use crate::models::{
    ComponentHealth, DatabaseRegistration, HealthFacts, HealthReport, HealthStatus,
};

pub const COMPONENT_POSTGRESQL: &str = "postgresql";
pub const COMPONENT_EXTENSION: &str = "extension";
pub const COMPONENT_BACKGROUND_WORKER: &str = "background_worker";
pub const COMPONENT_SHARED_MEMORY: &str = "shared_memory";

#[derive(Clone)]
pub struct HealthAggregator {
    catalog: DynCatalog,
    transports: Vec<(String, Arc<AtomicBool>)>,
    last_report: Arc<RwLock<Option<HealthReport>>>,
}

impl HealthAggregator {
    pub fn new(catalog: DynCatalog) -> Self {
        Self {
            catalog,
            transports: Vec::new(),
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    /// Adds a transport component whose listening flag is owned by the daemon.
    pub fn with_transport(mut self, name: &str, listening: Arc<AtomicBool>) -> Self {
        self.transports.push((name.to_string(), listening));
        self
    }

    /// Databases the background worker is asked to service.
    pub async fn database_registrations(&self) -> Result<Vec<DatabaseRegistration>> {
        self.catalog.database_registrations().await
    }

    /// Probes the catalog and builds a fresh report.
    ///
    /// A reachable database with failed components is an `Ok` report. Only an
    /// unreachable catalog is an error.
    pub async fn check(&self) -> Result<HealthReport> {
        match self.catalog.probe_health().await {
            Ok(facts) => {
                let report = self.build_report(&facts);
                self.remember(report.clone());
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "health probe failed");
                self.remember(unreachable_report(&e.to_string()));
                Err(e)
            }
        }
    }

    /// Report from the most recent check, if any.
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remember(&self, report: HealthReport) {
        *self
            .last_report
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report);
    }

    fn build_report(&self, facts: &HealthFacts) -> HealthReport {
        let mut components = BTreeMap::new();
        components.insert(COMPONENT_POSTGRESQL.to_string(), ComponentHealth::ok());

        components.insert(
            COMPONENT_EXTENSION.to_string(),
            match facts.extension_version {
                Some(_) => ComponentHealth::ok(),
                None => ComponentHealth::failed(HealthStatus::Unhealthy, "extension not installed"),
            },
        );
        components.insert(
            COMPONENT_SHARED_MEMORY.to_string(),
            if facts.shared_memory_available {
                ComponentHealth::ok()
            } else {
                ComponentHealth::failed(HealthStatus::Unhealthy, "shared memory not available")
            },
        );
        components.insert(
            COMPONENT_BACKGROUND_WORKER.to_string(),
            if facts.background_worker_running {
                ComponentHealth::ok()
            } else {
                ComponentHealth::failed(HealthStatus::Degraded, "background worker not running")
            },
        );
        for (name, listening) in &self.transports {
            components.insert(
                name.clone(),
                if listening.load(Ordering::SeqCst) {
                    ComponentHealth::ok()
                } else {
                    ComponentHealth::failed(HealthStatus::Degraded, "not listening")
                },
            );
        }

        let status = components
            .values()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        HealthReport {
            status,
            components,
            extension_version: facts.extension_version.clone().unwrap_or_default(),
            pg_version: facts.pg_version.clone(),
            background_worker_running: facts.background_worker_running,
            shared_memory_available: facts.shared_memory_available,
            checked_at: Utc::now(),
        }
    }
}

fn unreachable_report(message: &str) -> HealthReport {
    let mut components = BTreeMap::new();
    components.insert(
        COMPONENT_POSTGRESQL.to_string(),
        ComponentHealth::failed(HealthStatus::Unhealthy, message),
    );
    HealthReport {
        status: HealthStatus::Unhealthy,
        components,
        extension_version: String::new(),
        pg_version: String::new(),
        background_worker_running: false,
        shared_memory_available: false,
        checked_at: Utc::now(),
    }
}
