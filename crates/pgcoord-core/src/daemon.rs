//! Daemon lifecycle: wires catalog, registry, health, heartbeat and both
//! transports together.
//!
//! States: `Created -> Starting -> Running -> Stopping -> Stopped`, with
//! `Starting -> Failed` on any startup error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::catalog::DynCatalog;
use crate::config::Config;
use crate::error::{CoordError, Result};
use crate::health::HealthAggregator;
use crate::heartbeat::{self, HeartbeatLoop};
use crate::ipc::IpcServer;
use crate::models::{HealthReport, NodeRegistration};
use crate::registry::NodeRegistry;
use crate::rpc::RpcServer;
use crate::service::{Coordinator, StatusSource};
use crate::VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStatus {
    pub listening: bool,
    /// Bound `host:port` for RPC, socket path for IPC.
    pub address: Option<String>,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub node_id: String,
    pub node_name: String,
    pub version: String,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub rpc: TransportStatus,
    pub ipc: TransportStatus,
    pub catalog: String,
    pub health: Option<HealthReport>,
}

/// State readable from transports while the daemon owns the listeners.
struct Shared {
    state: Mutex<DaemonState>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    node_id: String,
    node_name: String,
    rpc_listening: Arc<AtomicBool>,
    rpc_addr: Mutex<Option<SocketAddr>>,
    rpc_tls: AtomicBool,
    ipc_listening: Arc<AtomicBool>,
    ipc_path: PathBuf,
    catalog: String,
    health: HealthAggregator,
}

impl Shared {
    fn state(&self) -> DaemonState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: DaemonState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }
}

impl StatusSource for Shared {
    fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn status(&self) -> DaemonStatus {
        let started_at = StatusSource::started_at(self);
        let rpc_addr = *self.rpc_addr.lock().unwrap_or_else(|p| p.into_inner());
        let uptime_secs = started_at
            .map(|t| Utc::now().signed_duration_since(t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        DaemonStatus {
            state: self.state(),
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            version: VERSION.to_string(),
            started_at,
            uptime_secs,
            rpc: TransportStatus {
                listening: self.rpc_listening.load(Ordering::SeqCst),
                address: rpc_addr.map(|a| a.to_string()),
                tls: self.rpc_tls.load(Ordering::SeqCst),
            },
            ipc: TransportStatus {
                listening: self.ipc_listening.load(Ordering::SeqCst),
                address: Some(self.ipc_path.display().to_string()),
                tls: false,
            },
            catalog: self.catalog.clone(),
            health: self.health.last_report(),
        }
    }
}

pub struct Daemon {
    config: Config,
    shared: Arc<Shared>,
    registry: NodeRegistry,
    coordinator: Coordinator,
    rpc: Option<RpcServer>,
    ipc: Option<IpcServer>,
    heartbeat_cancel: Option<CancellationToken>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Validates config and wires components. Nothing is started yet.
    pub fn new(config: Config, catalog: DynCatalog) -> Result<Self> {
        config.validate()?;

        let rpc_listening = Arc::new(AtomicBool::new(false));
        let ipc_listening = Arc::new(AtomicBool::new(false));
        let health = HealthAggregator::new(catalog.clone())
            .with_transport("rpc", rpc_listening.clone())
            .with_transport("ipc", ipc_listening.clone());
        let registry = NodeRegistry::new(catalog.clone(), config.heartbeat.stale_after());

        let shared = Arc::new(Shared {
            state: Mutex::new(DaemonState::Created),
            started_at: Mutex::new(None),
            node_id: config.node.node_id.clone(),
            node_name: config.node.node_name.clone(),
            rpc_listening,
            rpc_addr: Mutex::new(None),
            rpc_tls: AtomicBool::new(false),
            ipc_listening,
            ipc_path: config.ipc.path.clone(),
            catalog: catalog.describe(),
            health: health.clone(),
        });

        let coordinator = Coordinator::new(
            registry.clone(),
            health,
            &config.node.node_id,
            &config.node.node_name,
        )
        .with_status(shared.clone());

        Ok(Self {
            config,
            shared,
            registry,
            coordinator,
            rpc: None,
            ipc: None,
            heartbeat_cancel: None,
            heartbeat_task: None,
        })
    }

    pub fn state(&self) -> DaemonState {
        self.shared.state()
    }

    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc.as_ref().map(|s| s.local_addr())
    }

    pub fn ipc_path(&self) -> &std::path::Path {
        &self.config.ipc.path
    }

    pub fn status(&self) -> DaemonStatus {
        self.shared.status()
    }

    /// Registers this node, binds both transports and starts the heartbeat
    /// loop. Returns only once both listeners accept connections.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != DaemonState::Created {
            return Err(CoordError::Internal(format!(
                "daemon cannot start from state {}",
                state
            )));
        }
        self.shared.set_state(DaemonState::Starting);
        info!(
            node_id = %self.config.node.node_id,
            version = VERSION,
            catalog = %self.shared.catalog,
            "daemon starting"
        );

        match self.start_components().await {
            Ok(()) => {
                *self.shared.started_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
                self.shared.set_state(DaemonState::Running);
                info!(node_id = %self.config.node.node_id, "daemon running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "daemon startup failed");
                self.shutdown_components().await;
                self.shared.set_state(DaemonState::Failed);
                Err(e)
            }
        }
    }

    async fn start_components(&mut self) -> Result<()> {
        let node = &self.config.node;
        let registration = NodeRegistration {
            node_id: node.node_id.clone(),
            node_name: node.node_name.clone(),
            host: node.host.clone(),
            port: i32::from(node.port),
            priority: node.priority,
        };
        heartbeat::register_self(&self.registry, &registration).await?;

        let rpc = RpcServer::start(
            &self.config.rpc,
            self.coordinator.clone(),
            self.shared.rpc_listening.clone(),
        )
        .await?;
        *self.shared.rpc_addr.lock().unwrap_or_else(|p| p.into_inner()) = Some(rpc.local_addr());
        self.shared.rpc_tls.store(rpc.tls(), Ordering::SeqCst);
        self.rpc = Some(rpc);

        let ipc = IpcServer::start(
            &self.config.ipc.path,
            self.coordinator.clone(),
            self.config.rpc.request_timeout(),
            self.shared.ipc_listening.clone(),
        )
        .await?;
        self.ipc = Some(ipc);

        let cancel = CancellationToken::new();
        let task = HeartbeatLoop::new(
            self.registry.clone(),
            &self.config.node.node_id,
            self.config.heartbeat.interval(),
        )
        .with_health(self.shared.health.clone())
        .spawn(cancel.clone());
        self.heartbeat_cancel = Some(cancel);
        self.heartbeat_task = Some(task);
        Ok(())
    }

    async fn shutdown_components(&mut self) {
        if let Some(cancel) = self.heartbeat_cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.heartbeat_task.take() {
            let _ = task.await;
        }
        if let Some(mut rpc) = self.rpc.take() {
            rpc.stop().await;
        }
        if let Some(mut ipc) = self.ipc.take() {
            ipc.stop().await;
        }
    }

    /// Stops the heartbeat loop and both listeners. Idempotent: stopping a
    /// stopped, failed or never-started daemon is a no-op.
    pub async fn stop(&mut self) {
        match self.state() {
            DaemonState::Stopped | DaemonState::Failed | DaemonState::Stopping => return,
            DaemonState::Created => {
                self.shared.set_state(DaemonState::Stopped);
                return;
            }
            DaemonState::Starting | DaemonState::Running => {}
        }
        self.shared.set_state(DaemonState::Stopping);
        info!(node_id = %self.config.node.node_id, "daemon stopping");
        self.shutdown_components().await;
        self.shared.set_state(DaemonState::Stopped);
        info!(node_id = %self.config.node.node_id, "daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, MemoryCatalog};

    fn config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.node.node_id = "n1".to_string();
        config.node.node_name = "node one".to_string();
        config.rpc.listen = "127.0.0.1:0".to_string();
        config.ipc.path = dir.path().join("pgcoord.sock");
        config
    }

    #[tokio::test]
    async fn start_registers_self_and_listens() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::default();
        let mut daemon = Daemon::new(config(&dir), Arc::new(catalog.clone())).unwrap();
        assert_eq!(daemon.state(), DaemonState::Created);

        daemon.start().await.unwrap();
        assert_eq!(daemon.state(), DaemonState::Running);
        assert_eq!(catalog.list_nodes(Some("n1")).await.unwrap().len(), 1);

        let status = daemon.status();
        assert!(status.rpc.listening);
        assert!(status.ipc.listening);
        assert!(status.rpc.address.is_some());
        assert!(!status.rpc.tls);
        assert!(dir.path().join("pgcoord.sock").exists());

        daemon.stop().await;
        assert_eq!(daemon.state(), DaemonState::Stopped);
        let status = daemon.status();
        assert!(!status.rpc.listening);
        assert!(!status.ipc.listening);
        assert!(!dir.path().join("pgcoord.sock").exists());
    }

    #[tokio::test]
    async fn stop_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = Daemon::new(config(&dir), Arc::new(MemoryCatalog::default())).unwrap();
        daemon.start().await.unwrap();
        daemon.stop().await;
        daemon.stop().await;
        assert_eq!(daemon.state(), DaemonState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = Daemon::new(config(&dir), Arc::new(MemoryCatalog::default())).unwrap();
        daemon.stop().await;
        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert!(daemon.start().await.is_err());
    }

    #[tokio::test]
    async fn failed_self_registration_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = MemoryCatalog::default();
        catalog.set_reachable(false);
        let mut daemon = Daemon::new(config(&dir), Arc::new(catalog)).unwrap();

        assert!(daemon.start().await.is_err());
        assert_eq!(daemon.state(), DaemonState::Failed);
        let status = daemon.status();
        assert!(!status.rpc.listening);
        assert!(!status.ipc.listening);
        daemon.stop().await;
        assert_eq!(daemon.state(), DaemonState::Failed);
    }

    #[tokio::test]
    async fn bind_failure_fails_startup_and_releases_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = Daemon::new(config(&dir), Arc::new(MemoryCatalog::default())).unwrap();
        first.start().await.unwrap();

        // Same socket path, live owner.
        let mut second = Daemon::new(config(&dir), Arc::new(MemoryCatalog::default())).unwrap();
        assert!(second.start().await.is_err());
        assert_eq!(second.state(), DaemonState::Failed);
        assert!(!second.status().rpc.listening);

        first.stop().await;
    }

    #[tokio::test]
    async fn uptime_counts_from_running_not_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = Daemon::new(config(&dir), Arc::new(MemoryCatalog::default())).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let before_start = Utc::now();
        daemon.start().await.unwrap();

        let started_at = daemon.status().started_at.unwrap();
        assert!(started_at >= before_start);
        let response = daemon
            .coordinator
            .health_check(std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.uptime_since, started_at);

        daemon.stop().await;
    }

    #[test]
    fn invalid_config_is_rejected() {
        let catalog: DynCatalog = Arc::new(MemoryCatalog::default());
        assert!(Daemon::new(Config::default(), catalog).is_err());
    }
}
