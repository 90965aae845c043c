//! Node registry: registration, heartbeat and listing rules on top of the catalog.
//!
//! Stateless apart from the injected catalog handle; no in-process locking.
//! Concurrent writes to the same node resolve in the store, last write wins.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::catalog::DynCatalog;
use crate::error::{CoordError, Result};
use crate::models::{Node, NodeRegistration, NodeStatus};

#[derive(Clone)]
pub struct NodeRegistry {
    catalog: DynCatalog,
    stale_after: Duration,
}

impl NodeRegistry {
    pub fn new(catalog: DynCatalog, stale_after: Duration) -> Self {
        Self {
            catalog,
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Upserts a node. Registering a known id overwrites every mutable field.
    pub async fn register(&self, registration: &NodeRegistration) -> Result<Node> {
        validate(registration)?;
        let record = self.catalog.register_node(registration).await?;
        debug!(
            node_id = %record.node_id,
            host = %record.host,
            port = record.port,
            priority = record.priority,
            "node registered"
        );
        Ok(Node::from_record(record, Utc::now(), self.stale_after))
    }

    /// Refreshes liveness of an already registered node; never auto-registers.
    pub async fn heartbeat(&self, node_id: &str) -> Result<()> {
        if node_id.trim().is_empty() {
            return Err(CoordError::Validation("node_id is required".to_string()));
        }
        self.catalog.heartbeat(node_id, NodeStatus::Healthy).await
    }

    /// All nodes by priority descending, or exactly the named node (possibly none).
    pub async fn list(&self, node_id: Option<&str>) -> Result<Vec<Node>> {
        let filter = node_id.filter(|id| !id.is_empty());
        let now = Utc::now();
        let records = self.catalog.list_nodes(filter).await?;
        Ok(records
            .into_iter()
            .map(|record| Node::from_record(record, now, self.stale_after))
            .collect())
    }

    /// Single node lookup, `NotFound` when absent.
    pub async fn get(&self, node_id: &str) -> Result<Node> {
        if node_id.is_empty() {
            return Err(CoordError::Validation("node_id is required".to_string()));
        }
        self.list(Some(node_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoordError::node_not_found(node_id))
    }
}

/// Rejects malformed registrations before they reach the catalog.
pub fn validate(registration: &NodeRegistration) -> Result<()> {
    if registration.node_id.trim().is_empty() {
        return Err(CoordError::Validation("node_id is required".to_string()));
    }
    if registration.node_name.trim().is_empty() {
        return Err(CoordError::Validation("node_name is required".to_string()));
    }
    if registration.host.trim().is_empty() {
        return Err(CoordError::Validation("host is required".to_string()));
    }
    if !(1..=65535).contains(&registration.port) {
        return Err(CoordError::Validation(format!(
            "port must be between 1 and 65535, got {}",
            registration.port
        )));
    }
    if !(1..=100).contains(&registration.priority) {
        return Err(CoordError::Validation(format!(
            "priority must be between 1 and 100, got {}",
            registration.priority
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::MemoryCatalog;

    fn registry() -> (NodeRegistry, MemoryCatalog) {
        let catalog = MemoryCatalog::default();
        let registry = NodeRegistry::new(Arc::new(catalog.clone()), Duration::from_secs(30));
        (registry, catalog)
    }

    fn reg(node_id: &str, priority: i32) -> NodeRegistration {
        NodeRegistration {
            node_id: node_id.to_string(),
            node_name: format!("node {node_id}"),
            host: "10.0.0.1".to_string(),
            port: 5432,
            priority,
        }
    }

    #[tokio::test]
    async fn second_registration_overwrites_first() {
        let (registry, _) = registry();
        registry.register(&reg("n1", 10)).await.unwrap();

        let mut update = reg("n1", 20);
        update.node_name = "renamed".to_string();
        update.port = 6432;
        registry.register(&update).await.unwrap();

        let nodes = registry.list(None).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_name, "renamed");
        assert_eq!(nodes[0].port, 6432);
        assert_eq!(nodes[0].priority, 20);
    }

    #[tokio::test]
    async fn heartbeat_requires_prior_registration() {
        let (registry, catalog) = registry();
        let err = registry.heartbeat("n1").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(catalog.node_count(), 0);

        registry.register(&reg("n1", 50)).await.unwrap();
        registry.heartbeat("n1").await.unwrap();
        let node = registry.get("n1").await.unwrap();
        assert!(node.is_healthy);
        assert!(node.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn list_is_priority_descending() {
        let (registry, _) = registry();
        for (id, priority) in [("a", 30), ("b", 90), ("c", 60), ("d", 1)] {
            registry.register(&reg(id, priority)).await.unwrap();
        }
        let nodes = registry.list(None).await.unwrap();
        assert!(nodes.windows(2).all(|w| w[0].priority >= w[1].priority));
        assert_eq!(nodes[0].node_id, "b");
        assert_eq!(nodes[1].node_id, "c");
    }

    #[tokio::test]
    async fn filtered_list_returns_zero_or_one() {
        let (registry, _) = registry();
        registry.register(&reg("a", 30)).await.unwrap();
        registry.register(&reg("b", 40)).await.unwrap();

        assert_eq!(registry.list(Some("a")).await.unwrap().len(), 1);
        assert!(registry.list(Some("zzz")).await.unwrap().is_empty());
        // Empty filter means all nodes.
        assert_eq!(registry.list(Some("")).await.unwrap().len(), 2);
        assert!(registry.get("zzz").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn registered_but_silent_node_is_not_healthy() {
        let (registry, _) = registry();
        let node = registry.register(&reg("n1", 50)).await.unwrap();
        assert!(!node.is_healthy);
        assert_eq!(node.status, NodeStatus::Healthy);
    }

    #[tokio::test]
    async fn validation_happens_before_catalog() {
        let (registry, catalog) = registry();
        for bad in [
            NodeRegistration { node_id: "".into(), ..reg("x", 50) },
            NodeRegistration { node_name: " ".into(), ..reg("x", 50) },
            NodeRegistration { host: "".into(), ..reg("x", 50) },
            NodeRegistration { port: 0, ..reg("x", 50) },
            NodeRegistration { port: 70000, ..reg("x", 50) },
            reg("x", 0),
            reg("x", 101),
        ] {
            let err = registry.register(&bad).await.unwrap_err();
            assert!(matches!(err, CoordError::Validation(_)), "{bad:?}");
        }
        assert_eq!(catalog.node_count(), 0);
    }

    #[tokio::test]
    async fn catalog_errors_propagate_unchanged() {
        let (registry, catalog) = registry();
        catalog.set_write_error(Some("duplicate key value violates unique constraint"));
        let err = registry.register(&reg("n1", 50)).await.unwrap_err();
        assert!(matches!(err, CoordError::Catalog(ref m) if m.contains("duplicate key")));

        catalog.set_write_error(None);
        catalog.set_reachable(false);
        let err = registry.list(None).await.unwrap_err();
        assert!(matches!(err, CoordError::Connection(_)));
    }

    #[tokio::test]
    async fn concurrent_registrations_of_distinct_nodes() {
        let (registry, _) = registry();
        let mut handles = Vec::new();
        for i in 1..=20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.register(&reg(&format!("n{i}"), i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let nodes = registry.list(None).await.unwrap();
        assert_eq!(nodes.len(), 20);
        assert_eq!(nodes[0].priority, 20);
        assert_eq!(nodes[19].priority, 1);
    }
}
