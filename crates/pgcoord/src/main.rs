//! pgcoord - operator CLI for the coordination daemon.
//!
//! Talks to the local daemon over its socket by default, to a remote daemon
//! with `--rpc`, or straight to the catalog with `--direct`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use pgcoord_core::catalog::DatabaseCatalog;
use pgcoord_core::config::RpcAuth;
use pgcoord_core::direct::DirectClient;
use pgcoord_core::ipc::IpcClient;
use pgcoord_core::models::{DatabaseRegistration, Node, NodeRegistration};
use pgcoord_core::rpc::{RpcClient, RpcClientConfig};
use pgcoord_core::service::HealthCheckResponse;
use pgcoord_core::{DaemonStatus, VERSION};

/// PostgreSQL cluster coordination CLI.
#[derive(Parser)]
#[command(name = "pgcoord", about = "PostgreSQL cluster coordination CLI", version = VERSION)]
struct Args {
    /// Daemon IPC socket path.
    #[arg(long, env = "PGCOORD_IPC_PATH", default_value = "/tmp/pgcoord.sock", global = true)]
    socket: PathBuf,

    /// Use the network RPC endpoint (host:port or URL) instead of the socket.
    #[arg(long, env = "PGCOORD_RPC_ADDR", global = true, conflicts_with = "direct")]
    rpc: Option<String>,

    /// CA bundle to verify the RPC server certificate.
    #[arg(long, global = true)]
    ca_file: Option<PathBuf>,

    /// Client certificate for mTLS.
    #[arg(long, global = true, requires = "key_file")]
    cert_file: Option<PathBuf>,

    /// Client private key for mTLS.
    #[arg(long, global = true, requires = "cert_file")]
    key_file: Option<PathBuf>,

    /// Bearer token for RPC authentication.
    #[arg(long, env = "PGCOORD_RPC_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Bypass the daemon and call the catalog procedures directly.
    #[arg(long, global = true)]
    direct: bool,

    /// Connection string for direct mode. Defaults to the PG* environment.
    #[arg(long, env = "PGCOORD_CONN", global = true, hide_env_values = true)]
    conn: Option<String>,

    /// Catalog schema (and extension name) for direct mode.
    #[arg(long, default_value = "pgcoord", global = true)]
    schema: String,

    /// Request timeout in seconds.
    #[arg(long, default_value = "30", global = true)]
    timeout: u64,

    /// Print raw JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Daemon state, transports and last health report (socket only).
    Status,
    /// Composite health check.
    Health,
    /// List nodes, priority descending.
    Nodes {
        /// Show a single node.
        node_id: Option<String>,
    },
    /// Register or overwrite a node.
    Register {
        node_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long, default_value = "5432")]
        port: i32,
        #[arg(long, default_value = "50")]
        priority: i32,
    },
    /// Send a heartbeat for a node.
    Heartbeat { node_id: String },
    /// Database registration. Only `db list` works through the daemon.
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Subcommand)]
enum DbCommand {
    /// Register a database (run against the coordination database).
    Register { datname: String },
    /// Remove a database registration.
    Unregister { datname: String },
    Enable { datname: String },
    Disable { datname: String },
    /// List registered databases.
    List,
    /// Print the comma-separated enabled set.
    Enabled,
    /// Register the connected database from within itself.
    RegisterCurrent,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pgcoord={level},pgcoord_core={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================
// Output
// ============================================================

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_age(ts: Option<DateTime<Utc>>) -> String {
    let Some(ts) = ts else {
        return "never".to_string();
    };
    let secs = Utc::now().signed_duration_since(ts).num_seconds().max(0);
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}

fn print_nodes(nodes: &[Node]) {
    println!(
        "{:<16} {:<20} {:<24} {:>8} {:<12} {:<8} {}",
        "NODE_ID", "NAME", "ADDRESS", "PRIORITY", "STATUS", "HEALTHY", "LAST_HEARTBEAT"
    );
    for n in nodes {
        println!(
            "{:<16} {:<20} {:<24} {:>8} {:<12} {:<8} {}",
            n.node_id,
            n.node_name,
            format!("{}:{}", n.host, n.port),
            n.priority,
            n.status.as_str(),
            if n.is_healthy { "yes" } else { "no" },
            format_age(n.last_heartbeat)
        );
    }
}

fn print_health(response: &HealthCheckResponse) {
    let report = &response.report;
    println!("node:      {} ({})", response.node_id, response.node_name);
    println!("daemon:    {}", response.version);
    println!("status:    {}", report.status);
    println!("postgres:  {}", report.pg_version);
    println!("extension: {}", report.extension_version);
    for (name, component) in &report.components {
        match &component.message {
            Some(message) => println!("  {:<18} {} ({})", name, component.status, message),
            None => println!("  {:<18} {}", name, component.status),
        }
    }
}

fn print_status(status: &DaemonStatus) {
    println!("state:    {}", status.state);
    println!("node:     {} ({})", status.node_id, status.node_name);
    println!("version:  {}", status.version);
    println!("uptime:   {}s", status.uptime_secs);
    println!("catalog:  {}", status.catalog);
    println!(
        "rpc:      {} {}{}",
        if status.rpc.listening { "listening" } else { "down" },
        status.rpc.address.as_deref().unwrap_or("-"),
        if status.rpc.tls { " (tls)" } else { "" }
    );
    println!(
        "ipc:      {} {}",
        if status.ipc.listening { "listening" } else { "down" },
        status.ipc.address.as_deref().unwrap_or("-")
    );
    if let Some(health) = &status.health {
        println!("health:   {} at {}", health.status, health.checked_at);
    }
}

fn print_databases(args: &Args, rows: &[DatabaseRegistration]) -> anyhow::Result<()> {
    if args.json {
        return print_json(&rows);
    }
    println!("{:<24} {:<8} {}", "DATNAME", "ENABLED", "REGISTERED_AT");
    for r in rows {
        println!("{:<24} {:<8} {}", r.datname, r.enabled, r.registered_at);
    }
    Ok(())
}

fn registration(
    node_id: String,
    name: Option<String>,
    host: String,
    port: i32,
    priority: i32,
) -> NodeRegistration {
    NodeRegistration {
        node_name: name.unwrap_or_else(|| node_id.clone()),
        node_id,
        host,
        port,
        priority,
    }
}

// ============================================================
// Daemon transports
// ============================================================

enum DaemonClient {
    Ipc(IpcClient),
    Rpc(RpcClient),
}

impl DaemonClient {
    async fn open(args: &Args) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(args.timeout);
        match &args.rpc {
            Some(addr) => {
                let mut config = RpcClientConfig::new(addr.clone());
                config.ca_file = args.ca_file.clone();
                config.cert_file = args.cert_file.clone();
                config.key_file = args.key_file.clone();
                config.timeout = timeout;
                if let Some(token) = &args.token {
                    config.auth = RpcAuth::Bearer {
                        token: token.clone(),
                    };
                }
                Ok(Self::Rpc(RpcClient::connect(&config)?))
            }
            None => Ok(Self::Ipc(
                IpcClient::connect(&args.socket).await?.with_timeout(timeout),
            )),
        }
    }

    async fn health(&mut self) -> anyhow::Result<HealthCheckResponse> {
        Ok(match self {
            Self::Ipc(c) => c.health_check().await?,
            Self::Rpc(c) => c.health_check().await?,
        })
    }

    async fn nodes(&mut self, node_id: Option<&str>) -> anyhow::Result<Vec<Node>> {
        Ok(match self {
            Self::Ipc(c) => c.list_nodes(node_id).await?,
            Self::Rpc(c) => {
                let nodes = c.get_nodes().await?;
                match node_id {
                    Some(id) => nodes.into_iter().filter(|n| n.node_id == id).collect(),
                    None => nodes,
                }
            }
        })
    }

    fn close(&mut self) {
        match self {
            Self::Ipc(c) => c.close(),
            Self::Rpc(c) => c.close(),
        }
    }
}

async fn run_daemon_command(args: &Args) -> anyhow::Result<()> {
    let mut client = DaemonClient::open(args).await?;
    let result = daemon_command(args, &mut client).await;
    client.close();
    result
}

async fn daemon_command(args: &Args, client: &mut DaemonClient) -> anyhow::Result<()> {
    match &args.command {
        Command::Status => {
            let DaemonClient::Ipc(ipc) = client else {
                bail!("status is only available over the daemon socket");
            };
            let status = ipc.status().await?;
            if args.json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
        }
        Command::Health => {
            let response = client.health().await?;
            if args.json {
                print_json(&response)?;
            } else {
                print_health(&response);
            }
            if !response.report.status.is_healthy() {
                std::process::exit(2);
            }
        }
        Command::Nodes { node_id } => {
            let nodes = client.nodes(node_id.as_deref()).await?;
            if node_id.is_some() && nodes.is_empty() {
                bail!("node '{}' not found", node_id.as_deref().unwrap_or_default());
            }
            if args.json {
                print_json(&nodes)?;
            } else {
                print_nodes(&nodes);
            }
        }
        Command::Register {
            node_id,
            name,
            host,
            port,
            priority,
        } => {
            let request = registration(node_id.clone(), name.clone(), host.clone(), *port, *priority);
            let response = match client {
                DaemonClient::Ipc(c) => c.register_node(&request).await?,
                DaemonClient::Rpc(c) => c.register_node(&request).await?,
            };
            if args.json {
                print_json(&response)?;
            } else if response.success {
                println!("node '{}' registered", request.node_id);
            }
            if !response.success {
                bail!(response.error.unwrap_or_else(|| "registration failed".to_string()));
            }
        }
        Command::Heartbeat { node_id } => {
            let response = match client {
                DaemonClient::Ipc(c) => c.heartbeat(node_id).await?,
                DaemonClient::Rpc(c) => c.heartbeat(node_id).await?,
            };
            if args.json {
                print_json(&response)?;
            } else if response.acknowledged {
                println!("heartbeat acknowledged for '{}'", node_id);
            }
            if !response.acknowledged {
                bail!(response.error.unwrap_or_else(|| format!("node '{}' not found", node_id)));
            }
        }
        Command::Db(DbCommand::List) => {
            let DaemonClient::Ipc(ipc) = client else {
                bail!("db list is only available over the daemon socket or with --direct");
            };
            let rows = ipc.list_databases().await?;
            print_databases(args, &rows)?;
        }
        Command::Db(_) => bail!("database registration changes require --direct"),
    }
    Ok(())
}

// ============================================================
// Direct mode
// ============================================================

fn open_direct(args: &Args) -> anyhow::Result<DirectClient> {
    let client = match &args.conn {
        Some(conn) => DirectClient::from_conn_string(conn, &args.schema)?,
        None => DirectClient::from_env(&args.schema)?,
    };
    Ok(client)
}

fn run_direct_command(args: &Args) -> anyhow::Result<()> {
    let mut client = open_direct(args).context("direct connection failed")?;
    let result = direct_command(args, &mut client);
    client.close();
    result
}

fn direct_command(args: &Args, client: &mut DirectClient) -> anyhow::Result<()> {
    match &args.command {
        Command::Status => {
            let worker_active = client.refresh_background_worker()?;
            if args.json {
                print_json(&serde_json::json!({
                    "mode": "direct",
                    "target": client.target(),
                    "server_version": client.server_version(),
                    "extension_version": client.extension_version(),
                    "background_worker_active": worker_active,
                }))?;
            } else {
                println!("mode:      direct");
                println!("target:    {}", client.target());
                println!("postgres:  {}", client.server_version());
                println!("extension: {}", client.extension_version());
                println!(
                    "worker:    {}",
                    if client.background_worker_active() { "active" } else { "not running" }
                );
            }
        }
        Command::Health => {
            let health = client.health()?;
            if args.json {
                print_json(&health)?;
            } else {
                println!("status:    {}", health.status);
                println!("postgres:  {}", health.pg_version);
                println!("extension: {}", health.extension_version);
                println!("worker:    {}", health.background_worker_running);
                println!("shmem:     {}", health.shared_memory_available);
                println!("active:    {}", health.active_operations);
                if let Some(e) = &health.last_error {
                    println!("error:     {}", e);
                }
            }
        }
        Command::Nodes { node_id } => {
            let rows = client.node_status(node_id.as_deref())?;
            if node_id.is_some() && rows.is_empty() {
                bail!("node '{}' not found", node_id.as_deref().unwrap_or_default());
            }
            if args.json {
                print_json(&rows)?;
            } else {
                println!(
                    "{:<16} {:<20} {:<12} {:<8} {}",
                    "NODE_ID", "NAME", "STATUS", "HEALTHY", "LAST_HEARTBEAT"
                );
                for r in &rows {
                    println!(
                        "{:<16} {:<20} {:<12} {:<8} {}",
                        r.node_id,
                        r.node_name,
                        r.status.as_str(),
                        if r.is_healthy { "yes" } else { "no" },
                        format_age(r.last_heartbeat)
                    );
                }
            }
        }
        Command::Register {
            node_id,
            name,
            host,
            port,
            priority,
        } => {
            let request = registration(node_id.clone(), name.clone(), host.clone(), *port, *priority);
            let record = client.register_node(&request)?;
            if args.json {
                print_json(&record)?;
            } else {
                println!("node '{}' registered", record.node_id);
            }
        }
        Command::Heartbeat { node_id } => {
            client.heartbeat(node_id)?;
            println!("heartbeat recorded for '{}'", node_id);
        }
        Command::Db(db) => match db {
            DbCommand::Register { datname } => println!("{}", client.register_db(datname)?),
            DbCommand::Unregister { datname } => println!("{}", client.unregister_db(datname)?),
            DbCommand::Enable { datname } => println!("{}", client.enable_db(datname)?),
            DbCommand::Disable { datname } => println!("{}", client.disable_db(datname)?),
            DbCommand::RegisterCurrent => println!("{}", client.register_current_db()?),
            DbCommand::Enabled => match client.enabled_databases()? {
                Some(list) => println!("{}", list),
                None => println!("(none)"),
            },
            DbCommand::List => print_databases(args, &client.list_databases()?)?,
        },
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.direct {
        return run_direct_command(&args);
    }

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run_daemon_command(&args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_and_direct_conflict() {
        let result = Args::try_parse_from(["pgcoord", "--rpc", "h:5433", "--direct", "nodes"]);
        assert!(result.is_err());
    }

    #[test]
    fn register_defaults() {
        let args = Args::try_parse_from(["pgcoord", "register", "n2"]).unwrap();
        let Command::Register {
            node_id,
            name,
            host,
            port,
            priority,
        } = args.command
        else {
            panic!("expected register");
        };
        let request = registration(node_id, name, host, port, priority);
        assert_eq!(request.node_name, "n2");
        assert_eq!(request.host, "localhost");
        assert_eq!(request.port, 5432);
        assert_eq!(request.priority, 50);
    }

    #[test]
    fn db_subcommands_parse() {
        let args = Args::try_parse_from(["pgcoord", "--direct", "db", "register", "appdb"]).unwrap();
        assert!(matches!(args.command, Command::Db(DbCommand::Register { ref datname }) if datname == "appdb"));
        let args = Args::try_parse_from(["pgcoord", "db", "register-current"]).unwrap();
        assert!(matches!(args.command, Command::Db(DbCommand::RegisterCurrent)));
    }

    #[test]
    fn age_formatting() {
        assert_eq!(format_age(None), "never");
        let ts = Utc::now() - chrono::Duration::seconds(125);
        assert_eq!(format_age(Some(ts)), "2m ago");
    }
}
