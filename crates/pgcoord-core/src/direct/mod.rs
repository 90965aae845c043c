//! Direct mode: talks to the catalog's database-side procedures without a
//! running daemon.
//!
//! Uses a single blocking `postgres::Client`. Callers inside a tokio runtime
//! must run it on a blocking thread.

mod databases;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use postgres::{Client, Row};
use serde::Serialize;
use tracing::debug;

use crate::catalog::pg::node_from_row;
use crate::catalog::pool::make_tls_connector;
use crate::config::{is_sql_identifier, PostgresConfig, SslMode};
use crate::error::{classify_postgres_error, CoordError, Result};
use crate::models::{NodeRecord, NodeRegistration, NodeStatus};

const APPLICATION_NAME: &str = "pgcoord";

/// One row of `{schema}.node_status()`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusRow {
    pub node_id: String,
    pub node_name: String,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub is_healthy: bool,
}

/// Result of `{schema}.health()` as the extension computes it.
#[derive(Debug, Clone, Serialize)]
pub struct DirectHealth {
    pub status: String,
    pub extension_version: String,
    pub pg_version: String,
    pub background_worker_running: bool,
    pub shared_memory_available: bool,
    pub active_operations: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct DirectClient {
    client: Option<Client>,
    schema: String,
    target: String,
    server_version: String,
    extension_version: String,
    background_worker_active: bool,
}

impl DirectClient {
    /// Connects using a resolved `PostgresConfig` and checks that the
    /// extension is installed.
    pub fn connect(pg: &PostgresConfig, schema: &str) -> Result<Self> {
        let config = pg.to_pg_config(APPLICATION_NAME)?;
        Self::open(config, pg.sslmode, pg.summary(), schema)
    }

    /// Connects using the libpq environment (PGHOST, PGPORT, PGDATABASE, ...).
    pub fn from_env(schema: &str) -> Result<Self> {
        Self::connect(&PostgresConfig::from_env()?, schema)
    }

    /// Connects using a libpq key/value string or `postgresql://` URL.
    pub fn from_conn_string(conn: &str, schema: &str) -> Result<Self> {
        let mut config = postgres::Config::from_str(conn)
            .map_err(|e| CoordError::Config(format!("invalid connection string: {}", e)))?;
        if config.get_application_name().is_none() {
            config.application_name(APPLICATION_NAME);
        }
        let sslmode = match config.get_ssl_mode() {
            postgres::config::SslMode::Disable => SslMode::Disable,
            postgres::config::SslMode::Require => SslMode::Require,
            _ => SslMode::Prefer,
        };
        let target = describe_config(&config);
        Self::open(config, sslmode, target, schema)
    }

    fn open(
        config: postgres::Config,
        sslmode: SslMode,
        target: String,
        schema: &str,
    ) -> Result<Self> {
        if !is_sql_identifier(schema) {
            return Err(CoordError::Config(format!("invalid catalog schema '{}'", schema)));
        }
        let tls = make_tls_connector(sslmode)?;
        let mut client = config.connect(tls).map_err(|e| {
            CoordError::Connection(format!(
                "cannot connect to {}: {}",
                target,
                crate::error::format_postgres_error(&e)
            ))
        })?;

        let server_version: String = client
            .query_one("SHOW server_version", &[])
            .map_err(|e| classify_postgres_error(&e))?
            .try_get(0)
            .map_err(decode_error)?;

        let extension_version: String = client
            .query_opt(
                "SELECT extversion FROM pg_extension WHERE extname = $1",
                &[&schema],
            )
            .map_err(|e| classify_postgres_error(&e))?
            .map(|row| row.try_get(0))
            .transpose()
            .map_err(decode_error)?
            .ok_or_else(|| {
                CoordError::Catalog(format!(
                    "{0} extension is not installed; run 'CREATE EXTENSION {0}' as a superuser",
                    schema
                ))
            })?;

        let background_worker_active = query_worker_active(&mut client, schema);
        debug!(
            target_db = %target,
            server_version = %server_version,
            extension_version = %extension_version,
            background_worker_active,
            "direct client connected"
        );

        Ok(Self {
            client: Some(client),
            schema: schema.to_string(),
            target,
            server_version,
            extension_version,
            background_worker_active,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn extension_version(&self) -> &str {
        &self.extension_version
    }

    /// Worker state observed at connect time.
    pub fn background_worker_active(&self) -> bool {
        self.background_worker_active
    }

    /// Re-queries `pg_stat_activity` for the worker and refreshes the cached flag.
    pub fn refresh_background_worker(&mut self) -> Result<bool> {
        let schema = self.schema.clone();
        let active = query_worker_active(self.client()?, &schema);
        self.background_worker_active = active;
        Ok(active)
    }

    fn client(&mut self) -> Result<&mut Client> {
        self.client
            .as_mut()
            .ok_or_else(|| CoordError::Connection("client not connected".to_string()))
    }

    /// Creates or fully overwrites a node through `{schema}.register_node()`.
    pub fn register_node(&mut self, node: &NodeRegistration) -> Result<NodeRecord> {
        crate::registry::validate(node)?;
        let sql = format!(
            "SELECT node_id, node_name, host, port, priority, status, last_seen \
             FROM {}.register_node($1, $2, $3, $4, $5)",
            self.schema
        );
        let row = self
            .client()?
            .query_one(
                &sql,
                &[
                    &node.node_id,
                    &node.node_name,
                    &node.host,
                    &node.port,
                    &node.priority,
                ],
            )
            .map_err(|e| procedure_error(&e))?;
        node_from_row(&row).map_err(decode_error)
    }

    /// Refreshes a node's heartbeat. Unknown nodes are `NotFound`.
    pub fn heartbeat(&mut self, node_id: &str) -> Result<()> {
        let sql = format!("SELECT {}.heartbeat($1)", self.schema);
        let found: bool = self
            .client()?
            .query_one(&sql, &[&node_id])
            .map_err(|e| procedure_error(&e))?
            .try_get(0)
            .map_err(decode_error)?;
        if !found {
            return Err(CoordError::node_not_found(node_id));
        }
        Ok(())
    }

    /// Status of one node (empty when unknown) or of every node.
    pub fn node_status(&mut self, node_id: Option<&str>) -> Result<Vec<NodeStatusRow>> {
        let sql = format!(
            "SELECT node_id, node_name, status, last_seen, is_healthy \
             FROM {}.node_status($1)",
            self.schema
        );
        let rows = self
            .client()?
            .query(&sql, &[&node_id])
            .map_err(|e| procedure_error(&e))?;
        rows.iter()
            .map(|row| node_status_from_row(row).map_err(decode_error))
            .collect()
    }

    pub fn health(&mut self) -> Result<DirectHealth> {
        let sql = format!(
            "SELECT status, extension_version, pg_version, \
                    background_worker_running, shared_memory_available, \
                    active_operations, last_error \
             FROM {}.health()",
            self.schema
        );
        let row = self
            .client()?
            .query_one(&sql, &[])
            .map_err(|e| classify_postgres_error(&e))?;
        health_from_row(&row).map_err(decode_error)
    }

    /// Closes the connection. Idempotent.
    pub fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.close();
            debug!(target_db = %self.target, "direct client closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}

impl Drop for DirectClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn query_worker_active(client: &mut Client, schema: &str) -> bool {
    let pattern = format!("{}%", schema);
    let active = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_stat_activity WHERE backend_type LIKE $1)",
            &[&pattern],
        )
        .and_then(|row| row.try_get(0));
    match active {
        Ok(active) => active,
        Err(e) => {
            debug!(error = %e, "cannot query background worker state");
            false
        }
    }
}

/// A row that does not decode means the installed extension does not match
/// what this client expects.
pub(crate) fn decode_error(e: postgres::Error) -> CoordError {
    CoordError::Catalog(format!("unexpected catalog row: {}", e))
}

fn node_status_from_row(row: &Row) -> std::result::Result<NodeStatusRow, postgres::Error> {
    let status: Option<String> = row.try_get("status")?;
    let is_healthy: Option<bool> = row.try_get("is_healthy")?;
    Ok(NodeStatusRow {
        node_id: row.try_get::<_, Option<String>>("node_id")?.unwrap_or_default(),
        node_name: row.try_get::<_, Option<String>>("node_name")?.unwrap_or_default(),
        status: status.as_deref().map(NodeStatus::parse).unwrap_or_default(),
        last_heartbeat: row.try_get("last_seen")?,
        is_healthy: is_healthy.unwrap_or(false),
    })
}

fn health_from_row(row: &Row) -> std::result::Result<DirectHealth, postgres::Error> {
    Ok(DirectHealth {
        status: row.try_get::<_, Option<String>>(0)?.unwrap_or_default(),
        extension_version: row.try_get::<_, Option<String>>(1)?.unwrap_or_default(),
        pg_version: row.try_get::<_, Option<String>>(2)?.unwrap_or_default(),
        background_worker_running: row.try_get::<_, Option<bool>>(3)?.unwrap_or(false),
        shared_memory_available: row.try_get::<_, Option<bool>>(4)?.unwrap_or(false),
        active_operations: row.try_get::<_, Option<i32>>(5)?.unwrap_or(0),
        last_error: row.try_get(6)?,
    })
}

fn describe_config(config: &postgres::Config) -> String {
    let host = config
        .get_hosts()
        .first()
        .map(|h| match h {
            postgres::config::Host::Tcp(name) => name.clone(),
            postgres::config::Host::Unix(path) => path.display().to_string(),
        })
        .unwrap_or_else(|| "localhost".to_string());
    let port = config.get_ports().first().copied().unwrap_or(5432);
    format!(
        "{}@{}:{}/{}",
        config.get_user().unwrap_or(""),
        host,
        port,
        config.get_dbname().unwrap_or("")
    )
}

/// Maps an error raised by a catalog procedure. Procedures report wrong
/// database context and unknown names as plain messages.
fn procedure_error(e: &postgres::Error) -> CoordError {
    match e.as_db_error() {
        Some(db_error) => classify_procedure_message(db_error.message())
            .unwrap_or_else(|| classify_postgres_error(e)),
        None => classify_postgres_error(e),
    }
}

pub(crate) fn classify_procedure_message(message: &str) -> Option<CoordError> {
    if message.contains("must be called from") || message.starts_with("Already in") {
        Some(CoordError::Privilege(message.to_string()))
    } else if message.contains("does not exist") {
        Some(CoordError::Validation(message.to_string()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_host_is_connection_error() {
        let pg = PostgresConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "pgcoord".to_string(),
            sslmode: SslMode::Disable,
            connect_timeout_secs: 1,
            ..PostgresConfig::default()
        };
        let err = DirectClient::connect(&pg, "pgcoord").err().unwrap();
        assert!(matches!(err, CoordError::Connection(ref m) if m.contains("127.0.0.1:1")));
    }

    #[test]
    fn bad_conn_string_is_config_error() {
        let err = DirectClient::from_conn_string("port=notanumber", "pgcoord")
            .err()
            .unwrap();
        assert!(matches!(err, CoordError::Config(_)));
    }

    #[test]
    fn bad_schema_is_rejected_before_connecting() {
        let err = DirectClient::from_conn_string("host=127.0.0.1 port=1", "bad;schema")
            .err()
            .unwrap();
        assert!(matches!(err, CoordError::Config(_)));
    }

    #[test]
    fn procedure_messages_are_classified() {
        assert!(matches!(
            classify_procedure_message(
                "register_db() must be called from postgres database (current: appdb)"
            ),
            Some(CoordError::Privilege(_))
        ));
        assert!(matches!(
            classify_procedure_message("Already in postgres database."),
            Some(CoordError::Privilege(_))
        ));
        assert!(matches!(
            classify_procedure_message("Database 'nope' does not exist"),
            Some(CoordError::Validation(_))
        ));
        assert!(classify_procedure_message("disk full").is_none());
    }

    #[test]
    fn conn_string_target_summary() {
        let config =
            postgres::Config::from_str("host=db1 port=6432 user=repl dbname=postgres").unwrap();
        assert_eq!(describe_config(&config), "repl@db1:6432/postgres");
    }
}
