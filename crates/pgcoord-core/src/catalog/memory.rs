//! In-memory catalog.
//!
//! Implements both catalog capabilities with the same observable semantics as
//! the PostgreSQL extension, plus fault injection for tests: an unreachable
//! database, a stopped background worker, missing shared memory, rejected
//! writes, and the "current database" the caller is connected to.
//!
//! Clones share state, so a test can hand one clone to the daemon and keep
//! another to flip faults or inspect rows.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{Catalog, DatabaseCatalog};
use crate::error::{CoordError, Result};
use crate::models::{DatabaseRegistration, HealthFacts, NodeRecord, NodeRegistration, NodeStatus};

#[derive(Clone)]
pub struct MemoryCatalog {
    state: Arc<Mutex<State>>,
}

struct StoredNode {
    record: NodeRecord,
    /// Insertion sequence, breaks priority ties in registration order.
    seq: u64,
}

struct State {
    nodes: HashMap<String, StoredNode>,
    next_seq: u64,
    reachable: bool,
    closed: bool,
    write_error: Option<String>,
    pg_version: String,
    extension_version: Option<String>,
    worker_running: bool,
    shmem_available: bool,
    probe_delay: Duration,
    coordination_database: String,
    current_database: String,
    existing_databases: BTreeSet<String>,
    registrations: BTreeMap<String, DatabaseRegistration>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new("postgres")
    }
}

impl MemoryCatalog {
    /// Healthy catalog connected to `coordination_database`.
    pub fn new(coordination_database: &str) -> Self {
        let mut existing_databases = BTreeSet::new();
        existing_databases.insert(coordination_database.to_string());
        Self {
            state: Arc::new(Mutex::new(State {
                nodes: HashMap::new(),
                next_seq: 0,
                reachable: true,
                closed: false,
                write_error: None,
                pg_version: "18.0".to_string(),
                extension_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                worker_running: true,
                shmem_available: true,
                probe_delay: Duration::ZERO,
                coordination_database: coordination_database.to_string(),
                current_database: coordination_database.to_string(),
                existing_databases,
                registrations: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Locks state, failing the way a dead connection would.
    fn connected(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.lock();
        if state.closed {
            return Err(CoordError::Connection("catalog is closed".to_string()));
        }
        if !state.reachable {
            return Err(CoordError::Connection("connection refused".to_string()));
        }
        Ok(state)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_worker_running(&self, running: bool) {
        self.lock().worker_running = running;
    }

    pub fn set_shmem_available(&self, available: bool) {
        self.lock().shmem_available = available;
    }

    /// Makes every health probe take at least `delay`, like a stalled server.
    pub fn set_probe_delay(&self, delay: Duration) {
        self.lock().probe_delay = delay;
    }

    /// `None` simulates a database without the extension installed.
    pub fn set_extension_version(&self, version: Option<&str>) {
        self.lock().extension_version = version.map(str::to_string);
    }

    /// Makes every node write fail with a catalog error carrying `message`.
    pub fn set_write_error(&self, message: Option<&str>) {
        self.lock().write_error = message.map(str::to_string);
    }

    /// Changes the database this handle is "connected" to.
    pub fn set_current_database(&self, datname: &str) {
        let mut state = self.lock();
        state.current_database = datname.to_string();
        state.existing_databases.insert(datname.to_string());
    }

    /// Makes `datname` exist on the server.
    pub fn create_database(&self, datname: &str) {
        self.lock().existing_databases.insert(datname.to_string());
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Guards the procedures that only run in the coordination database.
    fn require_coordination_db(&self, state: &State, procedure: &str) -> Result<()> {
        if state.current_database != state.coordination_database {
            return Err(CoordError::Privilege(format!(
                "{}() must be called from {} database (current: {})",
                procedure, state.coordination_database, state.current_database
            )));
        }
        Ok(())
    }
}

fn sorted_nodes(state: &State) -> Vec<NodeRecord> {
    let mut nodes: Vec<&StoredNode> = state.nodes.values().collect();
    nodes.sort_by(|a, b| {
        b.record
            .priority
            .cmp(&a.record.priority)
            .then(a.seq.cmp(&b.seq))
    });
    nodes.into_iter().map(|n| n.record.clone()).collect()
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn register_node(&self, node: &NodeRegistration) -> Result<NodeRecord> {
        let mut state = self.connected()?;
        if let Some(message) = &state.write_error {
            return Err(CoordError::Catalog(message.clone()));
        }
        let seq = state.next_seq;
        let state = &mut *state;
        let stored = state
            .nodes
            .entry(node.node_id.clone())
            .or_insert_with(|| StoredNode {
                record: NodeRecord {
                    node_id: node.node_id.clone(),
                    node_name: String::new(),
                    host: String::new(),
                    port: 0,
                    priority: 0,
                    status: NodeStatus::Unknown,
                    last_heartbeat: None,
                },
                seq,
            });
        if stored.seq == seq {
            state.next_seq += 1;
        }
        stored.record.node_name = node.node_name.clone();
        stored.record.host = node.host.clone();
        stored.record.port = node.port;
        stored.record.priority = node.priority;
        stored.record.status = NodeStatus::Healthy;
        Ok(stored.record.clone())
    }

    async fn heartbeat(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        let mut state = self.connected()?;
        if let Some(message) = &state.write_error {
            return Err(CoordError::Catalog(message.clone()));
        }
        let stored = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| CoordError::node_not_found(node_id))?;
        stored.record.last_heartbeat = Some(Utc::now());
        stored.record.status = status;
        Ok(())
    }

    async fn list_nodes(&self, node_id: Option<&str>) -> Result<Vec<NodeRecord>> {
        let state = self.connected()?;
        Ok(match node_id {
            Some(id) => state
                .nodes
                .get(id)
                .map(|n| vec![n.record.clone()])
                .unwrap_or_default(),
            None => sorted_nodes(&state),
        })
    }

    async fn probe_health(&self) -> Result<HealthFacts> {
        let delay = self.lock().probe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.connected()?;
        Ok(match &state.extension_version {
            Some(version) => HealthFacts {
                pg_version: state.pg_version.clone(),
                extension_version: Some(version.clone()),
                background_worker_running: state.worker_running,
                shared_memory_available: state.shmem_available,
            },
            None => HealthFacts {
                pg_version: state.pg_version.clone(),
                extension_version: None,
                background_worker_running: false,
                shared_memory_available: false,
            },
        })
    }

    async fn database_registrations(&self) -> Result<Vec<DatabaseRegistration>> {
        let state = self.connected()?;
        Ok(state.registrations.values().cloned().collect())
    }

    async fn close(&self) {
        self.lock().closed = true;
    }

    fn describe(&self) -> String {
        "in-memory catalog".to_string()
    }
}

impl DatabaseCatalog for MemoryCatalog {
    fn register_db(&mut self, datname: &str) -> Result<String> {
        let mut state = self.connected()?;
        if state.current_database != state.coordination_database {
            return Err(CoordError::Privilege(format!(
                "register_db() must be called from {} database (current: {}). \
                 Use register_current_db() to register from within '{}'.",
                state.coordination_database, state.current_database, datname
            )));
        }
        if !state.existing_databases.contains(datname) {
            return Err(CoordError::Validation(format!(
                "Database '{}' does not exist",
                datname
            )));
        }
        upsert_registration(&mut state, datname);
        Ok(format!("Database '{}' registered successfully", datname))
    }

    fn unregister_db(&mut self, datname: &str) -> Result<String> {
        let mut state = self.connected()?;
        self.require_coordination_db(&state, "unregister_db")?;
        Ok(match state.registrations.remove(datname) {
            Some(_) => format!("Database '{}' unregistered successfully", datname),
            None => format!("Database '{}' was not registered", datname),
        })
    }

    fn enable_db(&mut self, datname: &str) -> Result<String> {
        let mut state = self.connected()?;
        self.require_coordination_db(&state, "enable_db")?;
        Ok(match state.registrations.get_mut(datname) {
            Some(row) => {
                row.enabled = true;
                format!("Database '{}' enabled", datname)
            }
            None => format!("Database '{}' is not registered", datname),
        })
    }

    fn disable_db(&mut self, datname: &str) -> Result<String> {
        let mut state = self.connected()?;
        self.require_coordination_db(&state, "disable_db")?;
        Ok(match state.registrations.get_mut(datname) {
            Some(row) => {
                row.enabled = false;
                format!("Database '{}' disabled", datname)
            }
            None => format!("Database '{}' is not registered", datname),
        })
    }

    fn list_databases(&mut self) -> Result<Vec<DatabaseRegistration>> {
        let state = self.connected()?;
        Ok(state.registrations.values().cloned().collect())
    }

    fn enabled_databases(&mut self) -> Result<Option<String>> {
        let state = self.connected()?;
        let enabled: Vec<&str> = state
            .registrations
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.datname.as_str())
            .collect();
        Ok((!enabled.is_empty()).then(|| enabled.join(",")))
    }

    fn register_current_db(&mut self) -> Result<String> {
        let mut state = self.connected()?;
        if state.current_database == state.coordination_database {
            return Err(CoordError::Privilege(format!(
                "Already in {db} database. Use register_db('dbname') to register other databases.",
                db = state.coordination_database
            )));
        }
        let current = state.current_database.clone();
        upsert_registration(&mut state, &current);
        Ok(format!(
            "Database '{}' registered successfully in central catalog",
            current
        ))
    }
}

/// Re-registering re-enables and refreshes `registered_at`.
fn upsert_registration(state: &mut State, datname: &str) {
    let now = Utc::now();
    state
        .registrations
        .entry(datname.to_string())
        .and_modify(|row| {
            row.enabled = true;
            row.registered_at = now;
        })
        .or_insert_with(|| DatabaseRegistration {
            datname: datname.to_string(),
            registered_at: now,
            enabled: true,
            options: serde_json::json!({}),
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(node_id: &str, priority: i32) -> NodeRegistration {
        NodeRegistration {
            node_id: node_id.to_string(),
            node_name: format!("{node_id}-name"),
            host: "127.0.0.1".to_string(),
            port: 5432,
            priority,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_with_latest_values() {
        let catalog = MemoryCatalog::default();
        catalog.register_node(&reg("n1", 10)).await.unwrap();
        let mut second = reg("n1", 90);
        second.host = "10.1.1.1".to_string();
        catalog.register_node(&second).await.unwrap();

        let nodes = catalog.list_nodes(None).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].priority, 90);
        assert_eq!(nodes[0].host, "10.1.1.1");
    }

    #[tokio::test]
    async fn ties_keep_registration_order() {
        let catalog = MemoryCatalog::default();
        for id in ["a", "b", "c"] {
            catalog.register_node(&reg(id, 50)).await.unwrap();
        }
        catalog.register_node(&reg("z", 60)).await.unwrap();
        // Re-registering must not move a node to the back.
        catalog.register_node(&reg("a", 50)).await.unwrap();

        let ids: Vec<String> = catalog
            .list_nodes(None)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(ids, vec!["z", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn heartbeat_unknown_node_is_not_found() {
        let catalog = MemoryCatalog::default();
        let err = catalog
            .heartbeat("ghost", NodeStatus::Healthy)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("not found"));
        assert_eq!(catalog.node_count(), 0);
    }

    #[tokio::test]
    async fn only_heartbeat_sets_last_heartbeat() {
        let catalog = MemoryCatalog::default();
        let record = catalog.register_node(&reg("n1", 50)).await.unwrap();
        assert!(record.last_heartbeat.is_none());
        catalog.heartbeat("n1", NodeStatus::Healthy).await.unwrap();
        let nodes = catalog.list_nodes(Some("n1")).await.unwrap();
        assert!(nodes[0].last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn faults_surface_as_errors() {
        let catalog = MemoryCatalog::default();
        catalog.set_write_error(Some("check constraint violated"));
        let err = catalog.register_node(&reg("n1", 50)).await.unwrap_err();
        assert!(matches!(err, CoordError::Catalog(_)));

        catalog.set_write_error(None);
        catalog.set_reachable(false);
        let err = catalog.list_nodes(None).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(catalog.probe_health().await.is_err());
    }

    #[tokio::test]
    async fn missing_extension_reports_nothing_running() {
        let catalog = MemoryCatalog::default();
        catalog.set_extension_version(None);
        let facts = catalog.probe_health().await.unwrap();
        assert!(facts.extension_version.is_none());
        assert!(!facts.background_worker_running);
        assert!(!facts.shared_memory_available);
    }

    #[tokio::test]
    async fn close_twice_is_a_no_op() {
        let catalog = MemoryCatalog::default();
        catalog.close().await;
        catalog.close().await;
        assert!(catalog.is_closed());
        assert!(catalog.list_nodes(None).await.is_err());
    }

    #[test]
    fn register_db_is_idempotent() {
        let mut catalog = MemoryCatalog::default();
        catalog.create_database("testdb");
        let first = catalog.register_db("testdb").unwrap();
        let second = catalog.register_db("testdb").unwrap();
        assert!(first.contains("registered successfully"));
        assert!(second.contains("registered successfully"));
        assert_eq!(catalog.list_databases().unwrap().len(), 1);
    }

    #[test]
    fn register_db_rejects_unknown_database() {
        let mut catalog = MemoryCatalog::default();
        let err = catalog.register_db("nope").unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn unregister_disable_enable_of_unknown_database_succeed() {
        let mut catalog = MemoryCatalog::default();
        assert!(catalog.unregister_db("x").unwrap().contains("was not registered"));
        assert!(catalog.disable_db("x").unwrap().contains("is not registered"));
        assert!(catalog.enable_db("x").unwrap().contains("is not registered"));
        assert!(catalog.list_databases().unwrap().is_empty());
    }

    #[test]
    fn registration_requires_coordination_database() {
        let mut catalog = MemoryCatalog::default();
        catalog.create_database("appdb");
        catalog.set_current_database("appdb");

        for err in [
            catalog.register_db("appdb").unwrap_err(),
            catalog.unregister_db("appdb").unwrap_err(),
            catalog.disable_db("appdb").unwrap_err(),
            catalog.enable_db("appdb").unwrap_err(),
        ] {
            assert!(matches!(err, CoordError::Privilege(_)));
            assert!(err.to_string().contains("must be called from postgres"));
        }
    }

    #[test]
    fn register_current_db_from_other_database() {
        let mut catalog = MemoryCatalog::default();
        let err = catalog.register_current_db().unwrap_err();
        assert!(err.to_string().contains("Already in postgres"));

        catalog.set_current_database("appdb");
        let msg = catalog.register_current_db().unwrap();
        assert!(msg.contains("registered successfully in central catalog"));
        assert!(catalog.register_current_db().is_ok());
        assert_eq!(catalog.list_databases().unwrap().len(), 1);
        assert_eq!(catalog.enabled_databases().unwrap().as_deref(), Some("appdb"));
    }

    #[test]
    fn enabled_set_is_comma_joined_and_absent_when_empty() {
        let mut catalog = MemoryCatalog::default();
        assert_eq!(catalog.enabled_databases().unwrap(), None);
        for db in ["beta", "alpha"] {
            catalog.create_database(db);
            catalog.register_db(db).unwrap();
        }
        assert_eq!(
            catalog.enabled_databases().unwrap().as_deref(),
            Some("alpha,beta")
        );
        catalog.disable_db("alpha").unwrap();
        catalog.disable_db("beta").unwrap();
        assert_eq!(catalog.enabled_databases().unwrap(), None);
    }
}
