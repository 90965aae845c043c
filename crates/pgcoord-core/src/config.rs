//! Daemon configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! file (or no file) yields a usable config once `node.node_id` is set.
//! Binaries override individual fields from CLI flags and `PGCOORD_*` env vars.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};

/// Upper bound for `password_command` execution.
const PASSWORD_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub postgresql: PostgresConfig,
    pub rpc: RpcConfig,
    pub ipc: IpcConfig,
    pub heartbeat: HeartbeatConfig,
    pub catalog: CatalogConfig,
}

/// Identity the daemon registers for itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub node_name: String,
    /// Address of this node's PostgreSQL as advertised to peers.
    pub host: String,
    pub port: u16,
    pub priority: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            node_name: String::new(),
            host: "localhost".to_string(),
            port: 5432,
            priority: 50,
        }
    }
}

/// libpq `sslmode` values understood by the catalog pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    /// Whether the server certificate chain must be verified.
    pub fn verifies_certificate(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

impl FromStr for SslMode {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "allow" | "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(CoordError::Config(format!("unknown sslmode '{}'", other))),
        }
    }
}

/// Connection to the PostgreSQL instance holding the catalog.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    /// Shell command whose trimmed stdout is the password. Takes priority
    /// over `password` and `PGPASSWORD`.
    pub password_command: Option<String>,
    pub sslmode: SslMode,
    pub connect_timeout_secs: u64,
    pub pool_size: usize,
    pub acquire_timeout_secs: u64,
}

impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("password_command", &self.password_command)
            .field("sslmode", &self.sslmode)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("pool_size", &self.pool_size)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: default_user(),
            password: None,
            password_command: None,
            sslmode: SslMode::Prefer,
            connect_timeout_secs: 5,
            pool_size: 10,
            acquire_timeout_secs: 10,
        }
    }
}

fn default_user() -> String {
    std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "postgres".to_string())
}

impl PostgresConfig {
    /// Builds a config from the standard libpq environment variables:
    /// PGHOST, PGPORT, PGDATABASE, PGUSER, PGPASSWORD, PGSSLMODE.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("PGHOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("PGPORT") {
            config.port = port
                .parse()
                .map_err(|_| CoordError::Config(format!("invalid PGPORT '{}'", port)))?;
        }
        if let Ok(database) = std::env::var("PGDATABASE") {
            config.database = database;
        }
        if let Ok(sslmode) = std::env::var("PGSSLMODE") {
            config.sslmode = sslmode.parse()?;
        }
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Resolves the password: `password_command` first, then the configured
    /// value, then `PGPASSWORD`.
    pub fn resolve_password(&self) -> Result<Option<String>> {
        if let Some(command) = self.password_command.as_deref().filter(|c| !c.is_empty()) {
            return run_password_command(command).map(Some);
        }
        if let Some(password) = self.password.clone().filter(|p| !p.is_empty()) {
            return Ok(Some(password));
        }
        Ok(std::env::var("PGPASSWORD").ok().filter(|p| !p.is_empty()))
    }

    /// Driver configuration for this connection.
    pub fn to_pg_config(&self, application_name: &str) -> Result<postgres::Config> {
        let mut pg = postgres::Config::new();
        pg.host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .application_name(application_name)
            .connect_timeout(self.connect_timeout())
            .ssl_mode(match self.sslmode {
                SslMode::Disable => postgres::config::SslMode::Disable,
                SslMode::Prefer => postgres::config::SslMode::Prefer,
                _ => postgres::config::SslMode::Require,
            });
        if let Some(password) = self.resolve_password()? {
            pg.password(password);
        }
        Ok(pg)
    }

    /// Short human-readable target, used in status output and logs.
    pub fn summary(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

fn run_password_command(command: &str) -> Result<String> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CoordError::Config(format!("password_command failed to start: {}", e)))?;

    let started = Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            break;
        }
        if started.elapsed() >= PASSWORD_COMMAND_TIMEOUT {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CoordError::Config(format!(
                "password_command timed out after {}s",
                PASSWORD_COMMAND_TIMEOUT.as_secs()
            )));
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoordError::Config(format!(
            "password_command exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    let password = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if password.is_empty() {
        return Err(CoordError::Config(
            "password_command produced no output".to_string(),
        ));
    }
    Ok(password)
}

/// Server-side TLS material for the RPC listener.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// CA bundle used to verify client certificates (enables mTLS).
    pub ca_file: Option<PathBuf>,
}

impl TlsConfig {
    pub fn enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }
}

/// RPC authentication mode.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RpcAuth {
    #[default]
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl std::fmt::Debug for RpcAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcAuth::None => write!(f, "None"),
            RpcAuth::Basic { username, .. } => write!(f, "Basic({})", username),
            RpcAuth::Bearer { .. } => write!(f, "Bearer(***)"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    pub listen: String,
    pub tls: TlsConfig,
    pub auth: RpcAuth,
    /// Deadline applied when the caller does not send one.
    pub request_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5433".to_string(),
            tls: TlsConfig::default(),
            auth: RpcAuth::None,
            request_timeout_secs: 30,
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IpcConfig {
    pub path: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/pgcoord.sock"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// A node whose last heartbeat is older than this is reported unhealthy.
    pub stale_after_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            stale_after_secs: 30,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Schema holding the extension's tables and procedures.
    pub schema: String,
    /// The single database where the central database-registration catalog lives.
    pub coordination_database: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            schema: "pgcoord".to_string(),
            coordination_database: "postgres".to_string(),
        }
    }
}

impl Config {
    /// Loads config from a TOML file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    CoordError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| CoordError::Config(e.to_string()))
    }

    /// Checks the whole config; the daemon refuses to start on the first error.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(CoordError::Config("node.node_id is required".to_string()));
        }
        if self.node.node_name.trim().is_empty() {
            return Err(CoordError::Config("node.node_name is required".to_string()));
        }
        if self.node.host.trim().is_empty() {
            return Err(CoordError::Config("node.host is required".to_string()));
        }
        if self.node.port == 0 {
            return Err(CoordError::Config(
                "node.port must be between 1 and 65535".to_string(),
            ));
        }
        if !(1..=100).contains(&self.node.priority) {
            return Err(CoordError::Config(format!(
                "node.priority must be between 1 and 100, got {}",
                self.node.priority
            )));
        }
        if self.postgresql.host.trim().is_empty() {
            return Err(CoordError::Config("postgresql.host is required".to_string()));
        }
        if self.postgresql.port == 0 {
            return Err(CoordError::Config(
                "postgresql.port must be between 1 and 65535".to_string(),
            ));
        }
        if self.postgresql.pool_size == 0 {
            return Err(CoordError::Config(
                "postgresql.pool_size must be positive".to_string(),
            ));
        }
        if self.postgresql.connect_timeout_secs == 0 || self.postgresql.acquire_timeout_secs == 0
        {
            return Err(CoordError::Config(
                "postgresql timeouts must be positive".to_string(),
            ));
        }
        if self.heartbeat.interval_secs == 0 || self.heartbeat.stale_after_secs == 0 {
            return Err(CoordError::Config(
                "heartbeat intervals must be positive".to_string(),
            ));
        }
        if self.rpc.request_timeout_secs == 0 {
            return Err(CoordError::Config(
                "rpc.request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.rpc.tls.cert_file.is_some() != self.rpc.tls.key_file.is_some() {
            return Err(CoordError::Config(
                "rpc.tls.cert_file and rpc.tls.key_file must be set together".to_string(),
            ));
        }
        if self.rpc.tls.ca_file.is_some() && !self.rpc.tls.enabled() {
            return Err(CoordError::Config(
                "rpc.tls.ca_file requires cert_file and key_file".to_string(),
            ));
        }
        if self.ipc.path.as_os_str().is_empty() {
            return Err(CoordError::Config("ipc.path is required".to_string()));
        }
        if !is_sql_identifier(&self.catalog.schema) {
            return Err(CoordError::Config(format!(
                "catalog.schema '{}' is not a valid identifier",
                self.catalog.schema
            )));
        }
        if self.catalog.coordination_database.is_empty() {
            return Err(CoordError::Config(
                "catalog.coordination_database is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Unquoted lowercase SQL identifier, safe to splice into statements.
pub fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.node.node_id = "n1".to_string();
        config.node.node_name = "node one".to_string();
        config
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.postgresql.host, "localhost");
        assert_eq!(config.postgresql.port, 5432);
        assert_eq!(config.postgresql.database, "postgres");
        assert_eq!(config.postgresql.sslmode, SslMode::Prefer);
        assert_eq!(config.postgresql.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.rpc.listen, "0.0.0.0:5433");
        assert_eq!(config.ipc.path, PathBuf::from("/tmp/pgcoord.sock"));
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(10));
        assert_eq!(config.heartbeat.stale_after(), Duration::from_secs(30));
        assert_eq!(config.node.priority, 50);
        assert_eq!(config.catalog.schema, "pgcoord");
        assert_eq!(config.rpc.auth, RpcAuth::None);
    }

    #[test]
    fn sslmode_parsing_and_verification() {
        assert_eq!("allow".parse::<SslMode>().unwrap(), SslMode::Prefer);
        assert_eq!("verify-ca".parse::<SslMode>().unwrap().as_str(), "verify-ca");
        assert!("sometimes".parse::<SslMode>().is_err());

        assert!(SslMode::VerifyCa.verifies_certificate());
        assert!(SslMode::VerifyFull.verifies_certificate());
        assert!(!SslMode::Require.verifies_certificate());
        assert!(!SslMode::Prefer.verifies_certificate());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [node]
            node_id = "n1"
            node_name = "primary"
            priority = 80

            [postgresql]
            host = "db.internal"
            sslmode = "verify-full"

            [rpc.auth]
            mode = "bearer"
            token = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.priority, 80);
        assert_eq!(config.node.port, 5432);
        assert_eq!(config.postgresql.host, "db.internal");
        assert_eq!(config.postgresql.sslmode, SslMode::VerifyFull);
        assert_eq!(config.postgresql.pool_size, 10);
        assert_eq!(
            config.rpc.auth,
            RpcAuth::Bearer {
                token: "s3cret".to_string()
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_sslmode_is_rejected() {
        assert!(Config::from_toml("[postgresql]\nsslmode = \"sometimes\"").is_err());
        assert!("sometimes".parse::<SslMode>().is_err());
        assert_eq!("allow".parse::<SslMode>().unwrap(), SslMode::Prefer);
    }

    #[test]
    fn validate_rejects_bad_node_identity() {
        assert!(Config::default().validate().is_err());

        let mut config = valid();
        config.node.priority = 0;
        assert!(config.validate().is_err());
        config.node.priority = 101;
        assert!(config.validate().is_err());
        config.node.priority = 100;
        assert!(config.validate().is_ok());

        let mut config = valid();
        config.node.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_tls_pair() {
        let mut config = valid();
        config.rpc.tls.cert_file = Some(PathBuf::from("/etc/pgcoord/server.crt"));
        assert!(config.validate().is_err());
        config.rpc.tls.key_file = Some(PathBuf::from("/etc/pgcoord/server.key"));
        assert!(config.validate().is_ok());
        assert!(config.rpc.tls.enabled());

        let mut config = valid();
        config.rpc.tls.ca_file = Some(PathBuf::from("/etc/pgcoord/ca.crt"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn schema_must_be_plain_identifier() {
        assert!(is_sql_identifier("pgcoord"));
        assert!(is_sql_identifier("_repl2"));
        assert!(!is_sql_identifier(""));
        assert!(!is_sql_identifier("2fast"));
        assert!(!is_sql_identifier("bad; drop table x"));
        assert!(!is_sql_identifier("Mixed"));

        let mut config = valid();
        config.catalog.schema = "x\"y".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn password_command_wins_over_password() {
        let config = PostgresConfig {
            password: Some("from-config".to_string()),
            password_command: Some("echo '  from-command  '".to_string()),
            ..PostgresConfig::default()
        };
        assert_eq!(
            config.resolve_password().unwrap().as_deref(),
            Some("from-command")
        );

        let config = PostgresConfig {
            password: Some("from-config".to_string()),
            ..PostgresConfig::default()
        };
        assert_eq!(
            config.resolve_password().unwrap().as_deref(),
            Some("from-config")
        );
    }

    #[test]
    fn failing_password_command_is_an_error() {
        let config = PostgresConfig {
            password_command: Some("exit 3".to_string()),
            ..PostgresConfig::default()
        };
        assert!(matches!(
            config.resolve_password(),
            Err(CoordError::Config(_))
        ));
    }

    #[test]
    fn debug_hides_secrets() {
        let config = PostgresConfig {
            password: Some("hunter2".to_string()),
            ..PostgresConfig::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
        let auth = RpcAuth::Basic {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }
}
