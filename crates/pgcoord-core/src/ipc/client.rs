//! IPC client for same-host tools.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use super::{
    CODE_METHOD_NOT_FOUND, IpcRequest, IpcResponse, METHOD_DATABASES_LIST, METHOD_HEALTH_CHECK,
    METHOD_NODES_GET, METHOD_NODES_HEARTBEAT, METHOD_NODES_LIST, METHOD_NODES_REGISTER,
    METHOD_STATUS_GET,
};
use crate::daemon::DaemonStatus;
use crate::error::{CoordError, Result};
use crate::models::{DatabaseRegistration, Node};
use crate::service::{
    DatabaseListResponse, GetNodesResponse, HealthCheckResponse, HeartbeatResponse, RegisterNodeRequest,
    RegisterNodeResponse,
};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct IpcClient {
    conn: Option<Connection>,
    next_id: u64,
    timeout: Duration,
}

impl IpcClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            CoordError::Connection(format!(
                "cannot connect to {} (is the daemon running?): {}",
                path.display(),
                e
            ))
        })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            conn: Some(Connection {
                reader: BufReader::new(reader),
                writer,
            }),
            next_id: 1,
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends one request and waits for its response.
    pub async fn call<T: DeserializeOwned>(&mut self, method: &str, params: Value) -> Result<T> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(CoordError::Connection("client is closed".to_string()));
        };
        let id = self.next_id;
        self.next_id += 1;

        let request = IpcRequest {
            id: json!(id),
            method: method.to_string(),
            params,
            timeout_ms: Some(self.timeout.as_millis() as u64),
        };
        let mut payload = serde_json::to_vec(&request)
            .map_err(|e| CoordError::Internal(format!("cannot encode request: {}", e)))?;
        payload.push(b'\n');

        let exchange = async {
            conn.writer.write_all(&payload).await?;
            let mut line = String::new();
            let read = conn.reader.read_line(&mut line).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "daemon closed the connection",
                ));
            }
            Ok(line)
        };
        // Allow the server its full deadline plus transit. A reply that
        // misses the deadline would be read by the next call, so the
        // connection is dropped on any failed exchange.
        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout + Duration::from_secs(1), exchange).await;
        let line = match outcome {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                self.conn = None;
                return Err(CoordError::Connection(format!("IPC exchange failed: {}", e)));
            }
            Err(_) => {
                self.conn = None;
                return Err(CoordError::DeadlineExceeded(timeout));
            }
        };

        let response: IpcResponse = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(e) => {
                self.conn = None;
                return Err(CoordError::Internal(format!("invalid response: {}", e)));
            }
        };
        if response.id != json!(id) {
            self.conn = None;
            return Err(CoordError::Connection(format!(
                "IPC response id mismatch: sent {}, got {}",
                id, response.id
            )));
        }
        if let Some(error) = response.error {
            return Err(match error.code.as_str() {
                CODE_METHOD_NOT_FOUND => CoordError::Internal(error.message),
                code => CoordError::from_code(code, error.message),
            });
        }
        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| CoordError::Internal(format!("unexpected result shape: {}", e)))
    }

    pub async fn health_check(&mut self) -> Result<HealthCheckResponse> {
        self.call(METHOD_HEALTH_CHECK, Value::Null).await
    }

    pub async fn register_node(&mut self, request: &RegisterNodeRequest) -> Result<RegisterNodeResponse> {
        let params = serde_json::to_value(request)
            .map_err(|e| CoordError::Internal(e.to_string()))?;
        self.call(METHOD_NODES_REGISTER, params).await
    }

    pub async fn heartbeat(&mut self, node_id: &str) -> Result<HeartbeatResponse> {
        self.call(METHOD_NODES_HEARTBEAT, json!({ "node_id": node_id })).await
    }

    pub async fn list_nodes(&mut self, node_id: Option<&str>) -> Result<Vec<Node>> {
        let response: GetNodesResponse = self
            .call(METHOD_NODES_LIST, json!({ "node_id": node_id }))
            .await?;
        Ok(response.nodes)
    }

    pub async fn get_node(&mut self, node_id: &str) -> Result<Node> {
        self.call(METHOD_NODES_GET, json!({ "node_id": node_id })).await
    }

    pub async fn status(&mut self) -> Result<DaemonStatus> {
        self.call(METHOD_STATUS_GET, Value::Null).await
    }

    pub async fn list_databases(&mut self) -> Result<Vec<DatabaseRegistration>> {
        let response: DatabaseListResponse = self.call(METHOD_DATABASES_LIST, Value::Null).await?;
        Ok(response.databases)
    }

    /// Closes the connection. Idempotent.
    pub fn close(&mut self) {
        self.conn = None;
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}
