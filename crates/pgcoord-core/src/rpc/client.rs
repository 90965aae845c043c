//! RPC client used by the CLI and by peers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{DEADLINE_HEADER, ErrorBody};
use crate::config::RpcAuth;
use crate::error::{CoordError, Result};
use crate::models::Node;
use crate::service::{
    HealthCheckResponse, HeartbeatRequest, HeartbeatResponse, GetNodesResponse,
    RegisterNodeRequest, RegisterNodeResponse,
};

/// Connection parameters. No TLS material means plain HTTP.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// `host:port`, or a full `http(s)://` base URL.
    pub addr: String,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub auth: RpcAuth,
    pub timeout: Duration,
}

impl RpcClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ca_file: None,
            cert_file: None,
            key_file: None,
            auth: RpcAuth::None,
            timeout: Duration::from_secs(30),
        }
    }

    fn uses_tls(&self) -> bool {
        self.ca_file.is_some() || self.cert_file.is_some()
    }
}

pub struct RpcClient {
    http: Option<reqwest::Client>,
    base_url: String,
    auth: RpcAuth,
    timeout: Duration,
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| CoordError::Config(format!("cannot read {}: {}", path.display(), e)))
}

impl RpcClient {
    /// Builds the client; no network I/O happens until the first call.
    pub fn connect(config: &RpcClientConfig) -> Result<Self> {
        if config.cert_file.is_some() != config.key_file.is_some() {
            return Err(CoordError::Config(
                "client certificate and key must be given together".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(config.timeout.min(Duration::from_secs(10)));

        if let Some(ca_file) = &config.ca_file {
            let ca = reqwest::Certificate::from_pem(&read_file(ca_file)?)
                .map_err(|e| CoordError::Config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }
        if let (Some(cert_file), Some(key_file)) = (&config.cert_file, &config.key_file) {
            let mut pem = read_file(cert_file)?;
            pem.push(b'\n');
            pem.extend(read_file(key_file)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| CoordError::Config(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| CoordError::Config(format!("cannot build RPC client: {}", e)))?;

        let base_url = if config.addr.starts_with("http://") || config.addr.starts_with("https://") {
            config.addr.trim_end_matches('/').to_string()
        } else if config.uses_tls() {
            format!("https://{}", config.addr)
        } else {
            format!("http://{}", config.addr)
        };

        Ok(Self {
            http: Some(http),
            base_url,
            auth: config.auth.clone(),
            timeout: config.timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let Some(http) = &self.http else {
            return Err(CoordError::Connection("client is closed".to_string()));
        };
        let url = format!("{}{}", self.base_url, path);
        let mut request = http
            .post(&url)
            .timeout(self.timeout)
            .header(DEADLINE_HEADER, self.timeout.as_millis().to_string())
            .json(body);
        request = match &self.auth {
            RpcAuth::None => request,
            RpcAuth::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                request.header(reqwest::header::AUTHORIZATION, format!("Basic {}", encoded))
            }
            RpcAuth::Bearer { token } => request.bearer_auth(token),
        };

        debug!(url = %url, "rpc call");
        let response = request.send().await.map_err(|e| map_transport_error(&url, e, self.timeout))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Resp>()
                .await
                .map_err(|e| CoordError::Internal(format!("invalid response from {}: {}", url, e)));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(CoordError::Connection(format!(
                "authentication failed for {}",
                self.base_url
            )));
        }
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(CoordError::from_code(&body.code, body.message)),
            Err(_) => Err(CoordError::Internal(format!("{} returned {}: {}", url, status, text))),
        }
    }

    pub async fn health_check(&self) -> Result<HealthCheckResponse> {
        self.call("/rpc/v1/health-check", &serde_json::json!({})).await
    }

    pub async fn register_node(&self, request: &RegisterNodeRequest) -> Result<RegisterNodeResponse> {
        self.call("/rpc/v1/register-node", request).await
    }

    pub async fn heartbeat(&self, node_id: &str) -> Result<HeartbeatResponse> {
        let request = HeartbeatRequest {
            node_id: node_id.to_string(),
        };
        self.call("/rpc/v1/heartbeat", &request).await
    }

    pub async fn get_nodes(&self) -> Result<Vec<Node>> {
        let response: GetNodesResponse = self.call("/rpc/v1/get-nodes", &serde_json::json!({})).await?;
        Ok(response.nodes)
    }

    /// Drops the connection pool. Idempotent.
    pub fn close(&mut self) {
        self.http = None;
    }

    pub fn is_closed(&self) -> bool {
        self.http.is_none()
    }
}

fn map_transport_error(url: &str, e: reqwest::Error, timeout: Duration) -> CoordError {
    if e.is_timeout() {
        CoordError::DeadlineExceeded(timeout)
    } else if e.is_connect() || e.is_request() {
        CoordError::Connection(format!("cannot reach {}: {}", url, e))
    } else {
        CoordError::Internal(format!("request to {} failed: {}", url, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_follows_tls_material() {
        let client = RpcClient::connect(&RpcClientConfig::new("db1:5433")).unwrap();
        assert_eq!(client.base_url(), "http://db1:5433");

        let client = RpcClient::connect(&RpcClientConfig::new("https://db1:5433/")).unwrap();
        assert_eq!(client.base_url(), "https://db1:5433");
    }

    #[test]
    fn half_identity_is_rejected() {
        let mut config = RpcClientConfig::new("db1:5433");
        config.cert_file = Some(PathBuf::from("/etc/pgcoord/client.crt"));
        assert!(matches!(RpcClient::connect(&config), Err(CoordError::Config(_))));
    }

    #[tokio::test]
    async fn closed_client_refuses_calls() {
        let mut client = RpcClient::connect(&RpcClientConfig::new("127.0.0.1:1")).unwrap();
        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.get_nodes().await,
            Err(CoordError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_connection_error() {
        let mut config = RpcClientConfig::new("127.0.0.1:1");
        config.timeout = Duration::from_secs(2);
        let client = RpcClient::connect(&config).unwrap();
        let err = client.health_check().await.unwrap_err();
        assert!(err.is_unavailable(), "{err:?}");
    }
}
