//! Self-registration and periodic heartbeat for the daemon's own node.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoordError, Result};
use crate::health::HealthAggregator;
use crate::models::{Node, NodeRegistration};
use crate::registry::NodeRegistry;

/// Counters observable while the loop runs.
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
}

impl HeartbeatStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct HeartbeatLoop {
    registry: NodeRegistry,
    health: Option<HealthAggregator>,
    node_id: String,
    interval: Duration,
    stats: Arc<HeartbeatStats>,
}

/// Registers the daemon's own node. Any failure here must abort startup.
pub async fn register_self(registry: &NodeRegistry, registration: &NodeRegistration) -> Result<Node> {
    let node = registry.register(registration).await?;
    info!(
        node_id = %node.node_id,
        node_name = %node.node_name,
        priority = node.priority,
        "self-registration complete"
    );
    Ok(node)
}

impl HeartbeatLoop {
    pub fn new(registry: NodeRegistry, node_id: &str, interval: Duration) -> Self {
        Self {
            registry,
            health: None,
            node_id: node_id.to_string(),
            interval,
            stats: Arc::new(HeartbeatStats::default()),
        }
    }

    /// Refreshes the last-known health report after every heartbeat.
    pub fn with_health(mut self, health: HealthAggregator) -> Self {
        self.health = Some(health);
        self
    }

    pub fn stats(&self) -> Arc<HeartbeatStats> {
        self.stats.clone()
    }

    /// Runs until `cancel` fires. The first heartbeat goes out immediately.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut consecutive_failures: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let t0 = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(self.interval, self.registry.heartbeat(&self.node_id)) => {
                    r.unwrap_or(Err(CoordError::DeadlineExceeded(self.interval)))
                }
            };

            match result {
                Ok(()) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                    if consecutive_failures > 0 {
                        info!(
                            node_id = %self.node_id,
                            failures = consecutive_failures,
                            "heartbeat recovered"
                        );
                    }
                    consecutive_failures = 0;
                    debug!(
                        node_id = %self.node_id,
                        duration_ms = t0.elapsed().as_millis() as u64,
                        "heartbeat sent"
                    );
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    consecutive_failures += 1;
                    warn!(
                        node_id = %self.node_id,
                        error = %e,
                        consecutive_failures,
                        "heartbeat failed, retrying on next tick"
                    );
                }
            }

            if let Some(health) = &self.health {
                // Failures are logged by the aggregator and kept as last report.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = health.check() => {}
                }
            }
        }

        debug!(node_id = %self.node_id, "heartbeat loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, MemoryCatalog};

    const TICK: Duration = Duration::from_millis(20);

    fn registration() -> NodeRegistration {
        NodeRegistration {
            node_id: "self".to_string(),
            node_name: "self node".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            priority: 50,
        }
    }

    fn setup() -> (NodeRegistry, MemoryCatalog) {
        let catalog = MemoryCatalog::default();
        let registry = NodeRegistry::new(Arc::new(catalog.clone()), Duration::from_secs(30));
        (registry, catalog)
    }

    #[tokio::test]
    async fn self_registration_failure_is_returned() {
        let (registry, catalog) = setup();
        catalog.set_reachable(false);
        assert!(register_self(&registry, &registration()).await.is_err());
    }

    #[tokio::test]
    async fn heartbeats_until_cancelled() {
        let (registry, catalog) = setup();
        register_self(&registry, &registration()).await.unwrap();

        let heartbeat = HeartbeatLoop::new(registry, "self", TICK);
        let stats = heartbeat.stats();
        let cancel = CancellationToken::new();
        let handle = heartbeat.spawn(cancel.clone());

        tokio::time::sleep(TICK * 5).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(stats.sent() >= 2, "sent {}", stats.sent());
        assert_eq!(stats.failed(), 0);
        let node = &catalog.list_nodes(Some("self")).await.unwrap()[0];
        assert!(node.last_heartbeat.is_some());

        let sent = stats.sent();
        tokio::time::sleep(TICK * 3).await;
        assert_eq!(stats.sent(), sent);
    }

    #[tokio::test]
    async fn failures_are_not_fatal_and_not_retried_immediately() {
        let (registry, catalog) = setup();
        register_self(&registry, &registration()).await.unwrap();
        catalog.set_reachable(false);

        let heartbeat = HeartbeatLoop::new(registry, "self", TICK);
        let stats = heartbeat.stats();
        let cancel = CancellationToken::new();
        let handle = heartbeat.spawn(cancel.clone());

        tokio::time::sleep(TICK * 4).await;
        let failed = stats.failed();
        assert!(failed >= 1);
        // One attempt per tick at most.
        assert!(failed <= 6, "failed {failed}");

        catalog.set_reachable(true);
        tokio::time::sleep(TICK * 4).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(stats.sent() >= 1);
    }

    #[tokio::test]
    async fn refreshes_last_health_report() {
        let (registry, catalog) = setup();
        register_self(&registry, &registration()).await.unwrap();
        let health = HealthAggregator::new(Arc::new(catalog.clone()));

        let cancel = CancellationToken::new();
        let handle = HeartbeatLoop::new(registry, "self", TICK)
            .with_health(health.clone())
            .spawn(cancel.clone());
        tokio::time::sleep(TICK * 3).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(health.last_report().is_some());
    }

    #[tokio::test]
    async fn cancel_interrupts_a_stalled_health_check() {
        let (registry, catalog) = setup();
        register_self(&registry, &registration()).await.unwrap();
        catalog.set_probe_delay(Duration::from_secs(30));
        let health = HealthAggregator::new(Arc::new(catalog.clone()));

        let cancel = CancellationToken::new();
        let handle = HeartbeatLoop::new(registry, "self", TICK)
            .with_health(health)
            .spawn(cancel.clone());
        tokio::time::sleep(TICK * 3).await;
        cancel.cancel();

        let stopped = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(stopped.is_ok(), "heartbeat loop did not stop");
    }
}
