//! pgcoord-core: cluster coordination for PostgreSQL nodes.
//!
//! Provides:
//! - `catalog` - catalog client (pooled PostgreSQL, in-memory)
//! - `registry` - node registration, heartbeat and listing rules
//! - `health` - composite health aggregator
//! - `heartbeat` - self-registration and periodic heartbeat loop
//! - `service` - coordination API shared by both transports
//! - `rpc` - network transport (axum, optional TLS/mTLS) and client
//! - `ipc` - Unix socket transport and client
//! - `daemon` - lifecycle owner wiring everything together
//! - `direct` - daemon-less access through the catalog's procedures

pub mod catalog;
pub mod config;
pub mod daemon;
pub mod direct;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod ipc;
pub mod models;
pub mod registry;
pub mod rpc;
pub mod service;

pub use config::Config;
pub use daemon::{Daemon, DaemonState, DaemonStatus};
pub use error::{CoordError, Result};

/// Crate version with the short git SHA of the build.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_SHA"), ")");
