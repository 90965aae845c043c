//! RPC listener: JSON over HTTP, optionally TLS/mTLS.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::auth::{AccessLogLayer, auth_middleware};
use super::tls;
use super::{DEADLINE_HEADER, ErrorBody};
use crate::config::{RpcAuth, RpcConfig};
use crate::error::{CoordError, Result};
use crate::service::{
    Coordinator, GetNodesResponse, HealthCheckResponse, HeartbeatRequest, HeartbeatResponse,
    RegisterNodeRequest, RegisterNodeResponse,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================
// Handlers
// ============================================================

#[derive(Clone)]
struct RpcState {
    coordinator: Coordinator,
    default_deadline: Duration,
}

/// Error rendered as a non-2xx status with a `{code, message}` body.
pub(crate) struct RpcError(CoordError);

impl From<CoordError> for RpcError {
    fn from(e: CoordError) -> Self {
        Self(e)
    }
}

pub(crate) fn status_for(e: &CoordError) -> StatusCode {
    match e {
        CoordError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        CoordError::Validation(_) | CoordError::Config(_) => StatusCode::BAD_REQUEST,
        CoordError::NotFound(_) => StatusCode::NOT_FOUND,
        CoordError::Privilege(_) => StatusCode::FORBIDDEN,
        CoordError::Catalog(_) | CoordError::Io(_) | CoordError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

impl RpcState {
    /// Caller deadline from `x-request-timeout-ms`, else the configured default.
    fn deadline(&self, headers: &HeaderMap) -> Duration {
        headers
            .get(DEADLINE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.default_deadline)
    }
}

async fn health_check(
    State(state): State<RpcState>,
    headers: HeaderMap,
) -> std::result::Result<Json<HealthCheckResponse>, RpcError> {
    let deadline = state.deadline(&headers);
    Ok(Json(state.coordinator.health_check(deadline).await?))
}

async fn register_node(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(request): Json<RegisterNodeRequest>,
) -> std::result::Result<Json<RegisterNodeResponse>, RpcError> {
    let deadline = state.deadline(&headers);
    Ok(Json(state.coordinator.register_node(&request, deadline).await?))
}

async fn heartbeat(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> std::result::Result<Json<HeartbeatResponse>, RpcError> {
    let deadline = state.deadline(&headers);
    Ok(Json(state.coordinator.heartbeat(&request.node_id, deadline).await?))
}

async fn get_nodes(
    State(state): State<RpcState>,
    headers: HeaderMap,
) -> std::result::Result<Json<GetNodesResponse>, RpcError> {
    let deadline = state.deadline(&headers);
    Ok(Json(state.coordinator.get_nodes(deadline).await?))
}

/// Load-balancer probe: 200 when healthy, 503 otherwise.
async fn health_probe(State(state): State<RpcState>) -> Response {
    match state.coordinator.health().check().await {
        Ok(report) if report.status.is_healthy() => (StatusCode::OK, Json(report)).into_response(),
        Ok(report) => (StatusCode::SERVICE_UNAVAILABLE, Json(report)).into_response(),
        Err(e) => {
            let body = ErrorBody {
                code: e.code().to_string(),
                message: e.to_string(),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

pub(crate) fn router(coordinator: Coordinator, config: &RpcConfig) -> Router {
    let state = RpcState {
        coordinator,
        default_deadline: config.request_timeout(),
    };

    let mut app = Router::new()
        .route("/rpc/v1/health-check", post(health_check))
        .route("/rpc/v1/register-node", post(register_node))
        .route("/rpc/v1/heartbeat", post(heartbeat))
        .route("/rpc/v1/get-nodes", post(get_nodes))
        .route("/health", get(health_probe))
        .with_state(state);

    if config.auth != RpcAuth::None {
        app = app.layer(axum::middleware::from_fn_with_state(
            Arc::new(config.auth.clone()),
            auth_middleware,
        ));
    }
    app.layer(AccessLogLayer)
}

// ============================================================
// Server lifecycle
// ============================================================

pub struct RpcServer {
    local_addr: SocketAddr,
    tls: bool,
    handle: Handle,
    listening: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Binds the listener and starts serving. Returns once the socket is bound.
    pub async fn start(
        config: &RpcConfig,
        coordinator: Coordinator,
        listening: Arc<AtomicBool>,
    ) -> Result<Self> {
        let tls_config = if config.tls.enabled() {
            Some(RustlsConfig::from_config(tls::server_config(&config.tls)?))
        } else {
            None
        };

        let listener = tokio::net::TcpListener::bind(&config.listen)
            .await
            .map_err(|e| CoordError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot bind RPC listener on {}: {}", config.listen, e),
            )))?;
        let local_addr = listener.local_addr()?;
        let listener = listener.into_std()?;

        let app = router(coordinator, config);
        let handle = Handle::new();
        let tls = tls_config.is_some();

        let server_handle = handle.clone();
        let flag = listening.clone();
        let task = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            let result = match tls_config {
                Some(tls_config) => {
                    axum_server::from_tcp_rustls(listener, tls_config)
                        .handle(server_handle)
                        .serve(service)
                        .await
                }
                None => {
                    axum_server::from_tcp(listener)
                        .handle(server_handle)
                        .serve(service)
                        .await
                }
            };
            flag.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                error!(error = %e, "RPC server terminated");
            }
        });

        listening.store(true, Ordering::SeqCst);
        info!(addr = %local_addr, tls, auth = ?config.auth, "RPC listening");

        Ok(Self {
            local_addr,
            tls,
            handle,
            listening,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Stops accepting, drains in-flight requests for a short grace period.
    /// Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        if tokio::time::timeout(SHUTDOWN_GRACE * 2, task).await.is_err() {
            error!("RPC server did not stop in time");
        }
        self.listening.store(false, Ordering::SeqCst);
        info!(addr = %self.local_addr, "RPC stopped");
    }
}
