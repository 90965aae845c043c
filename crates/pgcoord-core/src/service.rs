//! Transport-independent coordination API.
//!
//! Both the RPC and the IPC adapters call into one `Coordinator`, so results
//! have the same shape regardless of transport. Registry and health calls
//! return hard errors; this layer folds logical failures into the soft
//! response envelopes (`success=false`, `acknowledged=false`) and leaves
//! only "service cannot function" errors as transport failures.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoordError, Result};
use crate::health::HealthAggregator;
use crate::models::{DatabaseRegistration, HealthReport, Node, NodeRegistration};
use crate::registry::NodeRegistry;
use crate::VERSION;

// ============================================================
// Wire types
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub node_id: String,
    pub node_name: String,
    pub version: String,
    pub uptime_since: DateTime<Utc>,
    #[serde(flatten)]
    pub report: HealthReport,
}

pub type RegisterNodeRequest = NodeRegistration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodesResponse {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseListResponse {
    pub databases: Vec<DatabaseRegistration>,
}

/// Optional node filter used by `nodes.list` and `nodes.get` over IPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeQuery {
    #[serde(default)]
    pub node_id: Option<String>,
}

// ============================================================
// Coordinator
// ============================================================

/// Supplies the daemon status snapshot served by `status.get`.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> crate::daemon::DaemonStatus;

    /// When the daemon reached `Running`; `None` before that.
    fn started_at(&self) -> Option<DateTime<Utc>>;
}

#[derive(Clone)]
pub struct Coordinator {
    registry: NodeRegistry,
    health: HealthAggregator,
    node_id: String,
    node_name: String,
    created_at: DateTime<Utc>,
    status: Option<Arc<dyn StatusSource>>,
}

/// Logical failures are reported in-band; everything else fails the call.
fn is_soft(e: &CoordError) -> bool {
    matches!(
        e,
        CoordError::Validation(_)
            | CoordError::NotFound(_)
            | CoordError::Catalog(_)
            | CoordError::Privilege(_)
    )
}

async fn with_deadline<T>(deadline: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| CoordError::DeadlineExceeded(deadline))?
}

impl Coordinator {
    pub fn new(
        registry: NodeRegistry,
        health: HealthAggregator,
        node_id: &str,
        node_name: &str,
    ) -> Self {
        Self {
            registry,
            health,
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            created_at: Utc::now(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: Arc<dyn StatusSource>) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn health(&self) -> &HealthAggregator {
        &self.health
    }

    /// Start of the serving period. Behind a daemon this is the moment it
    /// reached `Running`; a standalone coordinator counts from construction.
    fn uptime_since(&self) -> DateTime<Utc> {
        match &self.status {
            Some(source) => source.started_at().unwrap_or_else(Utc::now),
            None => self.created_at,
        }
    }

    pub async fn health_check(&self, deadline: Duration) -> Result<HealthCheckResponse> {
        debug!(method = "HealthCheck", "request");
        let report = with_deadline(deadline, self.health.check()).await?;
        Ok(HealthCheckResponse {
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            version: VERSION.to_string(),
            uptime_since: self.uptime_since(),
            report,
        })
    }

    pub async fn register_node(
        &self,
        request: &RegisterNodeRequest,
        deadline: Duration,
    ) -> Result<RegisterNodeResponse> {
        debug!(method = "RegisterNode", node_id = %request.node_id, "request");
        match with_deadline(deadline, self.registry.register(request)).await {
            Ok(node) => Ok(RegisterNodeResponse {
                success: true,
                error: None,
                node: Some(node),
            }),
            Err(e) if is_soft(&e) => {
                warn!(node_id = %request.node_id, error = %e, "register rejected");
                Ok(RegisterNodeResponse {
                    success: false,
                    error: Some(e.to_string()),
                    node: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn heartbeat(&self, node_id: &str, deadline: Duration) -> Result<HeartbeatResponse> {
        debug!(method = "Heartbeat", node_id = %node_id, "request");
        match with_deadline(deadline, self.registry.heartbeat(node_id)).await {
            Ok(()) => Ok(HeartbeatResponse {
                acknowledged: true,
                error: None,
            }),
            Err(e) if is_soft(&e) => Ok(HeartbeatResponse {
                acknowledged: false,
                error: Some(e.to_string()),
            }),
            Err(e) => Err(e),
        }
    }

    /// All nodes, priority descending.
    pub async fn get_nodes(&self, deadline: Duration) -> Result<GetNodesResponse> {
        debug!(method = "GetNodes", "request");
        let nodes = with_deadline(deadline, self.registry.list(None)).await?;
        Ok(GetNodesResponse { nodes })
    }

    pub async fn list_nodes(&self, query: &NodeQuery, deadline: Duration) -> Result<GetNodesResponse> {
        let nodes = with_deadline(deadline, self.registry.list(query.node_id.as_deref())).await?;
        Ok(GetNodesResponse { nodes })
    }

    pub async fn get_node(&self, node_id: &str, deadline: Duration) -> Result<Node> {
        with_deadline(deadline, self.registry.get(node_id)).await
    }

    /// Rows of the central database-registration catalog.
    pub async fn list_databases(&self, deadline: Duration) -> Result<DatabaseListResponse> {
        debug!(method = "ListDatabases", "request");
        let databases = with_deadline(deadline, self.health.database_registrations()).await?;
        Ok(DatabaseListResponse { databases })
    }

    pub fn status(&self) -> Result<crate::daemon::DaemonStatus> {
        self.status
            .as_ref()
            .map(|s| s.status())
            .ok_or_else(|| CoordError::Internal("status not available".to_string()))
    }
}
