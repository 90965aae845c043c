//! Local control channel: newline-delimited JSON over a Unix domain socket.
//!
//! Request:  `{"id": 1, "method": "nodes.list", "params": {...}}`
//! Response: `{"id": 1, "result": ...}` or `{"id": 1, "error": {"code", "message"}}`
//!
//! Methods: `health.check`, `nodes.register`, `nodes.heartbeat`, `nodes.list`,
//! `nodes.get`, `status.get`, `databases.list`.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use client::IpcClient;
pub use server::IpcServer;

pub const METHOD_HEALTH_CHECK: &str = "health.check";
pub const METHOD_NODES_REGISTER: &str = "nodes.register";
pub const METHOD_NODES_HEARTBEAT: &str = "nodes.heartbeat";
pub const METHOD_NODES_LIST: &str = "nodes.list";
pub const METHOD_NODES_GET: &str = "nodes.get";
pub const METHOD_STATUS_GET: &str = "status.get";
pub const METHOD_DATABASES_LIST: &str = "databases.list";

pub const CODE_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const CODE_METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Caller deadline; the server default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl IpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(IpcError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}
