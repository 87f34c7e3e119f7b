//! Mimoria cache daemon entry point (§6, §10.D, §10.F).
//!
//! Startup sequence: load config, bind the client listener, and — when a
//! `[cluster]` block is present — stand up the peer mesh, bully election,
//! and replicator before signaling cluster-ready. The client listener does
//! not start accepting connections until the node is ready (standalone:
//! immediately; clustered: after `node-ready`/`cluster-ready`, §4.H, §9).

mod cache;
mod cluster;
mod config;
mod dispatch;
mod error;
mod keylock;
mod net;
mod pubsub;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mimoria_common::BufferPool;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use cluster::{AsyncReplicator, ClusterRouter, Election, Mesh, ReplicatorHandle, SyncReplicator};
use config::{Config, ReplicationConfig};
use dispatch::Dispatcher;
use net::Listener;
use state::ServerState;

/// Default config path; used verbatim when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Mimoria cache daemon.
#[derive(Parser, Debug)]
#[command(name = "mimoria-server", about = "Networked key-value cache with active-active clustering")]
struct Cli {
    /// Path to a TOML configuration file. Missing at this path falls back
    /// to the built-in defaults (§6 "Configuration").
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Overrides `RUST_LOG`/the default `info` filter.
    #[arg(long)]
    log_level: Option<String>,
}

/// Pooled scratch buffer starting capacity for response encoding (§4.A).
const RESPONSE_BUFFER_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&cli.config)?;

    tracing::info!(
        ip = %config.ip,
        port = config.port,
        clustered = config.cluster.is_some(),
        "mimoria-server starting"
    );

    let state = ServerState::new(config.clone());
    let pool = BufferPool::new(RESPONSE_BUFFER_CAPACITY);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_handle = {
        let cache = state.cache.clone();
        let interval = Duration::from_millis(config.expire_check_interval_ms);
        tokio::spawn(async move { cache.run_sweeper(interval).await })
    };

    let replicator = match &config.cluster {
        None => None,
        Some(cluster_cfg) => Some(
            bootstrap_cluster(state.clone(), cluster_cfg.clone())
                .await
                .map_err(|e| anyhow::anyhow!("cluster bootstrap failed: {e}"))?,
        ),
    };

    let dispatcher = Dispatcher::new(state.clone(), pool, replicator);

    let bind_addr: SocketAddr = format!("{}:{}", config.ip, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address: {e}"))?;
    let listener = Listener::bind(bind_addr, config.backlog as i32)?;
    tracing::info!(addr = %listener.local_addr(), "client listener bound");

    let serve_handle = {
        let state = state.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { listener.serve(state, dispatcher, shutdown_rx).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
        result = serve_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "listener task panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    sweeper_handle.abort();
    tracing::info!("mimoria-server stopped");
    Ok(())
}

/// Loads `path` if present. A missing file at the default path
/// (`config.toml`) is not an error — a freshly installed daemon falls back
/// to built-in defaults (§6 "Configuration"). A missing file at a path the
/// caller named explicitly with `--config` is still an error.
fn load_config(path: &str) -> anyhow::Result<Config> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && path == DEFAULT_CONFIG_PATH => {
            tracing::info!(path, "no config file found, using defaults");
            String::new()
        }
        Err(e) => return Err(anyhow::anyhow!("failed to read config file {path:?}: {e}")),
    };
    Config::from_toml_str(&text).map_err(|e| anyhow::anyhow!(e))
}

/// Bring up the mesh, then hold off on election until node-ready fires (every
/// configured peer dialed out and accepted in, §4.G) — starting election
/// before then would give every node an empty peer list and let it declare
/// itself leader unopposed (§4.H rule 1). Once election is running, block
/// until this node knows its role: immediately if it becomes leader, or
/// after a completed resync from the leader if it's a follower (§4.H, §4.I).
async fn bootstrap_cluster(
    state: Arc<ServerState>,
    cluster_cfg: config::ClusterConfig,
) -> anyhow::Result<ReplicatorHandle> {
    let bind_addr: SocketAddr = format!("{}:{}", cluster_cfg.ip, cluster_cfg.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid cluster listen address: {e}"))?;

    let (mesh, node_ready_rx) = Mesh::new(cluster_cfg.id, cluster_cfg.password.clone(), bind_addr, cluster_cfg.nodes.clone());
    mesh.clone().spawn();

    let (election, ready_rx) = Election::new(mesh.clone(), state.clone(), cluster_cfg.election.clone());
    let router = ClusterRouter::new(state.clone(), election.clone());
    mesh.set_router(router);

    node_ready_rx
        .await
        .map_err(|_| anyhow::anyhow!("mesh task dropped before signaling node-ready"))?;
    tracing::info!(node = cluster_cfg.id, "mesh node-ready, starting election");
    election.clone().spawn();

    ready_rx
        .await
        .map_err(|_| anyhow::anyhow!("election task dropped before signaling cluster-ready"))?;
    tracing::info!(node = cluster_cfg.id, "cluster ready");

    Ok(match cluster_cfg.replication {
        ReplicationConfig::Sync => ReplicatorHandle::Sync(SyncReplicator::new(mesh)),
        ReplicationConfig::Async { interval_milliseconds } => {
            ReplicatorHandle::Async(AsyncReplicator::spawn(mesh, Duration::from_millis(interval_milliseconds)))
        }
    })
}
