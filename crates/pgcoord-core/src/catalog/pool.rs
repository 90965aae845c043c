//! Bounded pool of blocking PostgreSQL connections.
//!
//! Each checkout runs on the blocking thread pool while holding a semaphore
//! permit, so at most `pool_size` catalog calls are in flight and callers
//! beyond that wait (up to the acquire timeout) instead of failing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use native_tls::TlsConnector;
use postgres::Client;
use postgres_native_tls::MakeTlsConnector;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::{PostgresConfig, SslMode};
use crate::error::{classify_postgres_error, CoordError, Result};

#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: postgres::Config,
    tls: MakeTlsConnector,
    idle: Mutex<Vec<Client>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    closed: AtomicBool,
}

impl PgPool {
    /// Builds the pool without opening any connection.
    pub fn new(pg: &PostgresConfig, application_name: &str) -> Result<Self> {
        let config = pg.to_pg_config(application_name)?;
        let tls = make_tls_connector(pg.sslmode)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                tls,
                idle: Mutex::new(Vec::with_capacity(pg.pool_size)),
                permits: Arc::new(Semaphore::new(pg.pool_size)),
                acquire_timeout: pg.acquire_timeout(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Builds the pool and opens one connection so misconfiguration fails fast.
    pub async fn connect(pg: &PostgresConfig, application_name: &str) -> Result<Self> {
        let pool = Self::new(pg, application_name)?;
        pool.run(|client| client.simple_query("SELECT 1").map(|_| ()))
            .await?;
        Ok(pool)
    }

    /// Runs `f` with a pooled connection on the blocking thread pool.
    ///
    /// Dropping the returned future abandons the result; the statement itself
    /// keeps running to completion on the server.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Client) -> std::result::Result<T, postgres::Error> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(CoordError::Connection("catalog pool is closed".to_string()));
        }

        let permit = match tokio::time::timeout(
            self.inner.acquire_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(CoordError::Connection("catalog pool is closed".to_string()));
            }
            Err(_) => {
                return Err(CoordError::Connection(format!(
                    "timed out after {}s waiting for a catalog connection",
                    self.inner.acquire_timeout.as_secs()
                )));
            }
        };

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut client = inner.checkout()?;
            let result = f(&mut client);
            match &result {
                // Server-side errors leave the session usable.
                Err(e) if e.as_db_error().is_none() => {}
                _ => inner.checkin(client),
            }
            result.map_err(|e| classify_postgres_error(&e))
        })
        .await
        .map_err(|e| CoordError::Internal(format!("catalog task failed: {}", e)))?
    }

    /// Drops idle connections and rejects further calls. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let dropped = {
            let mut idle = self.inner.lock_idle();
            std::mem::take(&mut *idle)
        };
        debug!(connections = dropped.len(), "catalog pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.lock_idle().len()
    }
}

impl PoolInner {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Client>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checkout(&self) -> Result<Client> {
        loop {
            let candidate = self.lock_idle().pop();
            match candidate {
                Some(client) if !client.is_closed() => return Ok(client),
                Some(_) => continue,
                None => break,
            }
        }
        let client = self
            .config
            .connect(self.tls.clone())
            .map_err(|e| classify_postgres_error(&e))?;
        debug!("catalog connection established");
        Ok(client)
    }

    fn checkin(&self, client: Client) {
        if self.closed.load(Ordering::SeqCst) || client.is_closed() {
            return;
        }
        self.lock_idle().push(client);
    }
}

/// TLS connector honouring libpq `sslmode` semantics: only `verify-ca` and
/// `verify-full` check the server certificate.
pub(crate) fn make_tls_connector(sslmode: SslMode) -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();
    if !sslmode.verifies_certificate() {
        builder.danger_accept_invalid_certs(true);
    }
    if sslmode != SslMode::VerifyFull {
        builder.danger_accept_invalid_hostnames(true);
    }
    let connector = builder
        .build()
        .map_err(|e| CoordError::Config(format!("TLS setup failed: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}
