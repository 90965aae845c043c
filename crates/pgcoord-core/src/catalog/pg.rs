//! PostgreSQL-backed catalog.
//!
//! Reads and writes the extension's tables in the configured schema:
//! - `{schema}.nodes`: one row per node, keyed by `node_id`
//! - `{schema}.databases`: central database-registration catalog
//! - `{schema}.health()`: extension facts (worker, shared memory)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postgres::Row;
use tracing::debug;

use super::pool::PgPool;
use super::Catalog;
use crate::config::{CatalogConfig, PostgresConfig};
use crate::error::{CoordError, Result};
use crate::models::{DatabaseRegistration, HealthFacts, NodeRecord, NodeRegistration, NodeStatus};

const APPLICATION_NAME: &str = "pgcoordd";

pub struct PgCatalog {
    pool: PgPool,
    schema: String,
    target: String,
}

impl PgCatalog {
    /// Opens the pool and verifies connectivity within the connect timeout.
    pub async fn connect(pg: &PostgresConfig, catalog: &CatalogConfig) -> Result<Self> {
        if !crate::config::is_sql_identifier(&catalog.schema) {
            return Err(CoordError::Config(format!(
                "invalid catalog schema '{}'",
                catalog.schema
            )));
        }
        let pool = PgPool::connect(pg, APPLICATION_NAME).await?;
        debug!(target_db = %pg.summary(), schema = %catalog.schema, "catalog connected");
        Ok(Self {
            pool,
            schema: catalog.schema.clone(),
            target: pg.summary(),
        })
    }

}

pub(crate) fn node_from_row(row: &Row) -> std::result::Result<NodeRecord, postgres::Error> {
    let status: Option<String> = row.try_get("status")?;
    Ok(NodeRecord {
        node_id: row.try_get("node_id")?,
        node_name: row.try_get("node_name")?,
        host: row.try_get("host")?,
        port: row.try_get("port")?,
        priority: row.try_get("priority")?,
        status: status.as_deref().map(NodeStatus::parse).unwrap_or_default(),
        last_heartbeat: row.try_get::<_, Option<DateTime<Utc>>>("last_seen")?,
    })
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn register_node(&self, node: &NodeRegistration) -> Result<NodeRecord> {
        // last_seen is left alone: only Heartbeat refreshes it.
        let sql = format!(
            "INSERT INTO {schema}.nodes (node_id, node_name, host, port, priority, status) \
             VALUES ($1, $2, $3, $4, $5, 'healthy') \
             ON CONFLICT (node_id) DO UPDATE SET \
                 node_name = EXCLUDED.node_name, \
                 host = EXCLUDED.host, \
                 port = EXCLUDED.port, \
                 priority = EXCLUDED.priority, \
                 status = EXCLUDED.status \
             RETURNING node_id, node_name, host, port, priority, status, last_seen",
            schema = self.schema
        );
        let node = node.clone();
        self.pool
            .run(move |client| {
                let row = client.query_one(
                    &sql,
                    &[
                        &node.node_id,
                        &node.node_name,
                        &node.host,
                        &node.port,
                        &node.priority,
                    ],
                )?;
                node_from_row(&row)
            })
            .await
    }

    async fn heartbeat(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        let sql = format!(
            "UPDATE {}.nodes SET last_seen = now(), status = $2 WHERE node_id = $1",
            self.schema
        );
        let id = node_id.to_string();
        let updated = self
            .pool
            .run(move |client| client.execute(&sql, &[&id, &status.as_str()]))
            .await?;
        if updated == 0 {
            return Err(CoordError::node_not_found(node_id));
        }
        Ok(())
    }

    async fn list_nodes(&self, node_id: Option<&str>) -> Result<Vec<NodeRecord>> {
        let sql = format!(
            "SELECT node_id, node_name, host, port, priority, status, last_seen \
             FROM {}.nodes \
             WHERE $1::text IS NULL OR node_id = $1 \
             ORDER BY priority DESC, node_id",
            self.schema
        );
        let id = node_id.map(str::to_string);
        self.pool
            .run(move |client| {
                client
                    .query(&sql, &[&id])?
                    .iter()
                    .map(node_from_row)
                    .collect()
            })
            .await
    }

    async fn probe_health(&self) -> Result<HealthFacts> {
        let schema = self.schema.clone();
        self.pool
            .run(move |client| {
                let pg_version: String = client.query_one("SHOW server_version", &[])?.try_get(0)?;

                let extension_version: Option<String> = client
                    .query_opt(
                        "SELECT extversion FROM pg_extension WHERE extname = $1",
                        &[&schema],
                    )?
                    .map(|row| row.try_get(0))
                    .transpose()?;

                let Some(extension_version) = extension_version else {
                    return Ok(HealthFacts {
                        pg_version,
                        extension_version: None,
                        background_worker_running: false,
                        shared_memory_available: false,
                    });
                };

                let row = client.query_one(
                    &format!(
                        "SELECT background_worker_running, shared_memory_available \
                         FROM {}.health()",
                        schema
                    ),
                    &[],
                )?;
                Ok(HealthFacts {
                    pg_version,
                    extension_version: Some(extension_version),
                    background_worker_running: row.try_get(0)?,
                    shared_memory_available: row.try_get(1)?,
                })
            })
            .await
    }

    async fn database_registrations(&self) -> Result<Vec<DatabaseRegistration>> {
        let sql = format!(
            "SELECT datname, registered_at, enabled, options \
             FROM {}.databases ORDER BY datname",
            self.schema
        );
        self.pool
            .run(move |client| {
                client
                    .query(&sql, &[])?
                    .iter()
                    .map(database_from_row)
                    .collect()
            })
            .await
    }

    async fn close(&self) {
        self.pool.close();
    }

    fn describe(&self) -> String {
        format!("postgresql {} (schema {})", self.target, self.schema)
    }
}

pub(crate) fn database_from_row(
    row: &Row,
) -> std::result::Result<DatabaseRegistration, postgres::Error> {
    let options: Option<serde_json::Value> = row.try_get("options")?;
    Ok(DatabaseRegistration {
        datname: row.try_get("datname")?,
        registered_at: row.try_get("registered_at")?,
        enabled: row.try_get("enabled")?,
        options: options.unwrap_or_else(|| serde_json::json!({})),
    })
}
