//! Catalog client: the durable external store for nodes and database
//! registrations.
//!
//! - `Catalog`: async capability consumed by the registry, health aggregator
//!   and heartbeat loop. Implemented by `PgCatalog` (pooled PostgreSQL) and
//!   `MemoryCatalog` (tests, local runs).
//! - `DatabaseCatalog`: blocking capability for the database-registration
//!   procedures, used by direct mode.
//!
//! Errors surface verbatim; there is no retry at this layer.

pub mod memory;
pub mod pool;
pub mod pg;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DatabaseRegistration, HealthFacts, NodeRecord, NodeRegistration, NodeStatus};

pub use memory::MemoryCatalog;
pub use pg::PgCatalog;

/// Node and health operations against the catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Upserts the node row; every mutable field is overwritten.
    async fn register_node(&self, node: &NodeRegistration) -> Result<NodeRecord>;

    /// Refreshes `last_heartbeat` and `status` of an existing node.
    /// Fails with `CoordError::NotFound` for an unknown id.
    async fn heartbeat(&self, node_id: &str, status: NodeStatus) -> Result<()>;

    /// All nodes ordered by priority descending when `node_id` is `None`,
    /// otherwise zero or one row.
    async fn list_nodes(&self, node_id: Option<&str>) -> Result<Vec<NodeRecord>>;

    /// Probes connectivity and extension facts. A reachable database always
    /// yields `Ok`, even when the extension is missing.
    async fn probe_health(&self) -> Result<HealthFacts>;

    /// Rows of the central database-registration catalog, ordered by name.
    async fn database_registrations(&self) -> Result<Vec<DatabaseRegistration>>;

    /// Releases connections. Idempotent.
    async fn close(&self);

    /// Short description of the backing store for status output.
    fn describe(&self) -> String;
}

pub type DynCatalog = Arc<dyn Catalog>;

/// Database-registration procedures.
///
/// Mutating operations return the human-readable outcome message; idempotent
/// no-ops (unregistering an unknown database and the like) succeed with an
/// informative message instead of failing.
pub trait DatabaseCatalog {
    /// Must run in the coordination database; rejects unknown database names.
    fn register_db(&mut self, datname: &str) -> Result<String>;
    fn unregister_db(&mut self, datname: &str) -> Result<String>;
    fn enable_db(&mut self, datname: &str) -> Result<String>;
    fn disable_db(&mut self, datname: &str) -> Result<String>;
    fn list_databases(&mut self) -> Result<Vec<DatabaseRegistration>>;
    /// Comma-joined enabled database names, `None` when none are enabled.
    fn enabled_databases(&mut self) -> Result<Option<String>>;
    /// Registers the current database into the central catalog from any
    /// database other than the coordination database.
    fn register_current_db(&mut self) -> Result<String>;
}
