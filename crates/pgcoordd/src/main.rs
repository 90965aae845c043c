//! pgcoordd - PostgreSQL cluster coordination daemon.
//!
//! Registers this node in the catalog, heartbeats it for the daemon's
//! lifetime and serves the coordination API over RPC and a local socket.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use pgcoord_core::catalog::{Catalog, DynCatalog, PgCatalog};
use pgcoord_core::config::{PostgresConfig, SslMode};
use pgcoord_core::{Config, Daemon, VERSION};

/// PostgreSQL cluster coordination daemon.
#[derive(Parser)]
#[command(name = "pgcoordd", about = "PostgreSQL cluster coordination daemon", version = VERSION)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, env = "PGCOORD_CONFIG")]
    config: Option<PathBuf>,

    /// Node id to register for this daemon.
    #[arg(long, env = "PGCOORD_NODE_ID")]
    node_id: Option<String>,

    /// Human-readable node name.
    #[arg(long, env = "PGCOORD_NODE_NAME")]
    node_name: Option<String>,

    /// Address of this node's PostgreSQL as advertised to peers.
    #[arg(long, env = "PGCOORD_NODE_HOST")]
    node_host: Option<String>,

    /// Port of this node's PostgreSQL as advertised to peers.
    #[arg(long, env = "PGCOORD_NODE_PORT")]
    node_port: Option<u16>,

    /// Failover priority, 1-100 (higher is preferred).
    #[arg(long, env = "PGCOORD_PRIORITY")]
    priority: Option<i32>,

    /// RPC listen address (host:port).
    #[arg(long, env = "PGCOORD_RPC_LISTEN")]
    listen: Option<String>,

    /// IPC socket path.
    #[arg(long, env = "PGCOORD_IPC_PATH")]
    socket: Option<PathBuf>,

    /// Take catalog connection settings from PGHOST, PGPORT, PGDATABASE,
    /// PGUSER, PGPASSWORD and PGSSLMODE instead of the config file.
    #[arg(long)]
    pg_env: bool,

    /// Catalog PostgreSQL host.
    #[arg(long)]
    pg_host: Option<String>,

    /// Catalog PostgreSQL port.
    #[arg(long)]
    pg_port: Option<u16>,

    /// Catalog PostgreSQL user.
    #[arg(long)]
    pg_user: Option<String>,

    /// Catalog PostgreSQL sslmode (disable, prefer, require, verify-ca, verify-full).
    #[arg(long)]
    pg_sslmode: Option<SslMode>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// `RUST_LOG` overrides the computed filter when set.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("pgcoordd={level},pgcoord_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Config file first, then command-line and environment overrides.
fn build_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;

    if args.pg_env {
        let pool_size = config.postgresql.pool_size;
        config.postgresql = PostgresConfig::from_env()?;
        config.postgresql.pool_size = pool_size;
    }
    if let Some(host) = &args.pg_host {
        config.postgresql.host = host.clone();
    }
    if let Some(port) = args.pg_port {
        config.postgresql.port = port;
    }
    if let Some(user) = &args.pg_user {
        config.postgresql.user = user.clone();
    }
    if let Some(sslmode) = args.pg_sslmode {
        config.postgresql.sslmode = sslmode;
    }

    if let Some(node_id) = &args.node_id {
        config.node.node_id = node_id.clone();
    }
    if let Some(node_name) = &args.node_name {
        config.node.node_name = node_name.clone();
    }
    if config.node.node_name.is_empty() {
        config.node.node_name = config.node.node_id.clone();
    }
    if let Some(host) = &args.node_host {
        config.node.host = host.clone();
    }
    if let Some(port) = args.node_port {
        config.node.port = port;
    }
    if let Some(priority) = args.priority {
        config.node.priority = priority;
    }
    if let Some(listen) = &args.listen {
        config.rpc.listen = listen.clone();
    }
    if let Some(socket) = &args.socket {
        config.ipc.path = socket.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => error!(error = %e, "cannot install SIGTERM handler"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot wait for Ctrl+C");
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        version = VERSION,
        node_id = %config.node.node_id,
        catalog = %config.postgresql.summary(),
        "starting pgcoordd"
    );

    let catalog: DynCatalog = Arc::new(
        PgCatalog::connect(&config.postgresql, &config.catalog)
            .await
            .with_context(|| format!("cannot connect to catalog {}", config.postgresql.summary()))?,
    );

    let mut daemon = Daemon::new(config, catalog.clone())?;
    if let Err(e) = daemon.start().await {
        catalog.close().await;
        return Err(e).context("daemon failed to start");
    }

    let status = daemon.status();
    info!(
        rpc = status.rpc.address.as_deref().unwrap_or("-"),
        tls = status.rpc.tls,
        ipc = status.ipc.address.as_deref().unwrap_or("-"),
        "ready"
    );

    wait_for_shutdown().await;

    daemon.stop().await;
    catalog.close().await;
    info!("pgcoordd stopped");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = build_config(&args)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let args = Args::parse_from([
            "pgcoordd",
            "--node-id",
            "n7",
            "--priority",
            "80",
            "--listen",
            "127.0.0.1:6000",
            "--pg-sslmode",
            "require",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.node.node_id, "n7");
        assert_eq!(config.node.node_name, "n7");
        assert_eq!(config.node.priority, 80);
        assert_eq!(config.rpc.listen, "127.0.0.1:6000");
        assert_eq!(config.postgresql.sslmode, SslMode::Require);
    }

    #[test]
    fn missing_node_id_is_rejected() {
        let args = Args::parse_from(["pgcoordd"]);
        assert!(build_config(&args).is_err());
    }
}
