//! RPC authentication and access logging middleware.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use tracing::{debug, info, warn};

use crate::config::RpcAuth;

/// Paths served without credentials (load-balancer probes).
const PUBLIC_PATHS: &[&str] = &["/health"];

/// Authenticated principal, inserted into request extensions.
#[derive(Clone)]
pub(crate) struct AuthUser(pub(crate) String);

// ============================================================
// Access log layer (tower Layer + Service)
// ============================================================

#[derive(Clone)]
pub(crate) struct AccessLogLayer;

impl<S> tower::Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

#[derive(Clone)]
pub(crate) struct AccessLogService<S> {
    inner: S,
}

impl<S> tower::Service<Request> for AccessLogService<S>
where
    S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let client = req
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "-".to_owned());
        let t0 = Instant::now();

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let latency_ms = t0.elapsed().as_millis() as u64;
            let status = response.status().as_u16();
            let user = response
                .extensions()
                .get::<AuthUser>()
                .map(|u| u.0.clone())
                .unwrap_or_else(|| "-".to_owned());
            if path == "/health" {
                debug!(client, status, latency_ms, "{method} {path}");
            } else {
                info!(client, user, status, latency_ms, "{method} {path}");
            }
            Ok(response)
        })
    }
}

// ============================================================
// Auth middleware (Basic / Bearer)
// ============================================================

fn unauthorized(auth: &RpcAuth) -> Response {
    let body = Json(serde_json::json!({
        "code": "UNAUTHENTICATED",
        "message": "unauthorized",
    }));
    let mut response = (StatusCode::UNAUTHORIZED, body).into_response();
    let challenge = match auth {
        RpcAuth::Basic { .. } => "Basic realm=\"pgcoord\"",
        _ => "Bearer realm=\"pgcoord\"",
    };
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(challenge));
    response
}

/// Checks an `Authorization` header value against the configured mode.
/// Returns the principal name on success.
pub(crate) fn authenticate(auth: &RpcAuth, header_value: Option<&str>) -> Option<String> {
    match auth {
        RpcAuth::None => Some("-".to_owned()),
        RpcAuth::Basic { username, password } => {
            let encoded = header_value?.strip_prefix("Basic ")?;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (user, pass) = decoded.split_once(':')?;
            (user == username && pass == password).then(|| user.to_owned())
        }
        RpcAuth::Bearer { token } => {
            let presented = header_value?.strip_prefix("Bearer ")?;
            (presented.trim() == token).then(|| "bearer".to_owned())
        }
    }
}

pub(crate) async fn auth_middleware(
    State(auth): State<Arc<RpcAuth>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if PUBLIC_PATHS.contains(&path.as_str()) {
        return next.run(req).await;
    }

    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match authenticate(&auth, header_value) {
        Some(user) => {
            debug!(user = %user, path = %path, "authenticated");
            req.extensions_mut().insert(AuthUser(user.clone()));
            let mut response = next.run(req).await;
            response.extensions_mut().insert(AuthUser(user));
            response
        }
        None => {
            warn!(path = %path, present = header_value.is_some(), "auth failed");
            unauthorized(&auth)
        }
    }
}
