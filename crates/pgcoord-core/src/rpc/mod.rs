//! Network RPC surface: JSON over HTTP (axum), optionally TLS/mTLS.
//!
//! Routes:
//! - `POST /rpc/v1/health-check`
//! - `POST /rpc/v1/register-node`
//! - `POST /rpc/v1/heartbeat`
//! - `POST /rpc/v1/get-nodes`
//! - `GET  /health`: unauthenticated probe, 200 healthy / 503 otherwise
//!
//! Callers send their deadline in `x-request-timeout-ms`. Transport-level
//! failures are non-2xx statuses with an `ErrorBody`.

mod auth;
pub mod client;
pub mod server;
pub mod tls;

use serde::{Deserialize, Serialize};

pub use client::{RpcClient, RpcClientConfig};
pub use server::RpcServer;

pub const DEADLINE_HEADER: &str = "x-request-timeout-ms";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
