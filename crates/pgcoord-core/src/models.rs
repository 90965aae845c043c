//! Shared data models: nodes, health reports, database registrations.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================
// Nodes
// ============================================================

/// Liveness tag stored with a node row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
            Self::Offline => "offline",
        }
    }

    /// Parses a stored status. Values written by newer versions map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => Self::Healthy,
            "degraded" => Self::Degraded,
            "unreachable" => Self::Unreachable,
            "offline" => Self::Offline,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-supplied attributes for Register. Every field overwrites the stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub node_name: String,
    pub host: String,
    pub port: i32,
    pub priority: i32,
}

/// A node row as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub node_name: String,
    pub host: String,
    pub port: i32,
    pub priority: i32,
    pub status: NodeStatus,
    /// Set only by Heartbeat; `None` until the first one arrives.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// A node as returned to callers, with liveness derived from heartbeat recency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_name: String,
    pub host: String,
    pub port: i32,
    pub priority: i32,
    pub status: NodeStatus,
    pub is_healthy: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Node {
    /// Derives `is_healthy`: last heartbeat within `stale_after` of `now`.
    pub fn from_record(record: NodeRecord, now: DateTime<Utc>, stale_after: Duration) -> Self {
        let is_healthy = match record.last_heartbeat {
            Some(seen) => {
                let age = now.signed_duration_since(seen);
                age.to_std().map(|age| age <= stale_after).unwrap_or(true)
            }
            None => false,
        };
        Self {
            node_id: record.node_id,
            node_name: record.node_name,
            host: record.host,
            port: record.port,
            priority: record.priority,
            status: record.status,
            is_healthy,
            last_heartbeat: record.last_heartbeat,
        }
    }
}

// ============================================================
// Health
// ============================================================

/// Overall and per-component health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Reachable and serving, but a non-critical component is down.
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// The worse of two statuses.
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }
}

impl PartialOrd for HealthStatus {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HealthStatus {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn failed(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status,
            message: Some(message.into()),
        }
    }
}

/// Raw facts probed from the catalog database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthFacts {
    pub pg_version: String,
    /// `None` when the extension is not installed in the coordination database.
    pub extension_version: Option<String>,
    pub background_worker_running: bool,
    pub shared_memory_available: bool,
}

/// Point-in-time composite health. Recomputed on every check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub extension_version: String,
    pub pg_version: String,
    pub background_worker_running: bool,
    pub shared_memory_available: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.get(name)
    }
}

// ============================================================
// Database registrations
// ============================================================

/// One row of the central database-registration catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRegistration {
    pub datname: String,
    pub registered_at: DateTime<Utc>,
    pub enabled: bool,
    pub options: serde_json::Value,
}
