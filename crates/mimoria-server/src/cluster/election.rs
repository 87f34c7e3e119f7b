//! Bully leader election (§4.H): the highest node id always wins, and any
//! node noticing the leader is unresponsive starts a new round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BufMut, BytesMut};
use mimoria_common::wire::frame::get_bytes_checked;
use mimoria_common::wire::varint::VarUint;
use mimoria_common::{ClusterOp, Status, ValueShape};
use tokio::sync::oneshot;

use crate::config::ElectionConfig;
use crate::state::ServerState;

use super::mesh::Mesh;

/// Drives heartbeats, leader-missing detection, and the bully protocol
/// itself. One instance per clustered node.
pub struct Election {
    mesh: Arc<Mesh>,
    state: Arc<ServerState>,
    config: ElectionConfig,
    in_progress: AtomicBool,
    last_leader_contact: Mutex<Instant>,
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Election {
    /// Returns the election handle and a one-shot fired the first time this
    /// node knows who the leader is (used by startup to gate "cluster
    /// ready" logging, §4.H).
    pub fn new(mesh: Arc<Mesh>, state: Arc<ServerState>, config: ElectionConfig) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let election = Arc::new(Self {
            mesh,
            state,
            config,
            in_progress: AtomicBool::new(false),
            last_leader_contact: Mutex::new(Instant::now()),
            ready_tx: Mutex::new(Some(tx)),
        });
        (election, rx)
    }

    pub fn spawn(self: Arc<Self>) {
        let heartbeat = self.clone();
        tokio::spawn(async move { heartbeat.run_heartbeat_sender().await });
        let watchdog = self.clone();
        tokio::spawn(async move { watchdog.run_leader_watchdog().await });
        tokio::spawn(async move { self.start_election().await });
    }

    async fn run_heartbeat_sender(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.leader_heartbeat_interval_ms));
        loop {
            ticker.tick().await;
            if self.state.is_leader() {
                self.mesh.broadcast(ClusterOp::Alive, Bytes::new()).await;
            }
        }
    }

    async fn run_leader_watchdog(self: Arc<Self>) {
        let poll = Duration::from_millis((self.config.leader_missing_timeout_ms / 2).max(50));
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            if self.state.is_leader() {
                continue;
            }
            let elapsed = self.last_leader_contact.lock().unwrap().elapsed();
            if elapsed > Duration::from_millis(self.config.leader_missing_timeout_ms) {
                tracing::warn!(node = self.state.self_node_id, "leader missing, starting election");
                self.clone().start_election().await;
            }
        }
    }

    /// A leader heartbeat (or a reply carrying one) arrived.
    pub async fn on_alive(&self) {
        *self.last_leader_contact.lock().unwrap() = Instant::now();
    }

    /// A lower-ranked peer challenged our right to lead (bully protocol): if
    /// it's lower than us, answer by starting our own election so it backs
    /// off once it sees we out-rank it.
    pub async fn on_election_message(self: &Arc<Self>, from_node_id: u32) {
        if (from_node_id as i64) < self.state.self_node_id && !self.in_progress.swap(true, Ordering::SeqCst) {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.start_election().await });
        }
    }

    /// A higher-ranked node declared victory; adopt it as leader. Cluster
    /// readiness is only immediate for the new leader itself — a follower
    /// first pulls a full snapshot from it (§4.I "Resync").
    pub async fn on_victory(self: &Arc<Self>, leader_node_id: u32) {
        self.state.leader_id.store(leader_node_id as i64, Ordering::SeqCst);
        self.in_progress.store(false, Ordering::SeqCst);
        *self.last_leader_contact.lock().unwrap() = Instant::now();
        tracing::info!(leader = leader_node_id, "cluster accepted new leader");

        if leader_node_id as i64 == self.state.self_node_id {
            self.signal_ready();
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.resync_from_leader(leader_node_id).await });
    }

    fn signal_ready(&self) {
        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Pull a full key-by-key snapshot from the elected leader and apply it
    /// in place of the current cache contents (§4.I "Resync"). Runs once
    /// per election outcome; failures are logged and readiness still
    /// signals, since a follower with a stale cache is still usable.
    async fn resync_from_leader(self: Arc<Self>, leader_node_id: u32) {
        match self.mesh.call(leader_node_id, ClusterOp::Sync, Bytes::new()).await {
            Ok((Status::Ok, mut body)) => {
                let count = match VarUint::decode(&mut body) {
                    Some(v) => v.value(),
                    None => {
                        tracing::warn!(leader = leader_node_id, "malformed sync snapshot");
                        self.signal_ready();
                        return;
                    }
                };
                self.state.cache.clear();
                for _ in 0..count {
                    let Ok(key) = get_bytes_checked(&mut body) else { break };
                    let Ok(value) = ValueShape::decode(&mut body) else { break };
                    let Some(ttl_ms) = VarUint::decode(&mut body) else { break };
                    self.state.cache.apply_raw(key, value, ttl_ms.value());
                }
                tracing::info!(leader = leader_node_id, "resync from leader complete");
            }
            Ok((Status::Error, _)) | Err(_) => {
                tracing::warn!(leader = leader_node_id, "sync request to leader failed");
            }
        }
        self.signal_ready();
    }

    async fn start_election(self: Arc<Self>) {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node = self.state.self_node_id, "starting leader election");

        let higher_ids: Vec<u32> = self
            .mesh
            .peer_ids()
            .into_iter()
            .filter(|id| i64::from(*id) > self.state.self_node_id)
            .collect();

        if higher_ids.is_empty() {
            self.declare_victory().await;
            return;
        }

        let mut payload = BytesMut::new();
        payload.put_u32(self.state.self_node_id as u32);
        let payload = payload.freeze();

        let mut anyone_responded = false;
        for id in &higher_ids {
            if self.mesh.call(*id, ClusterOp::Election, payload.clone()).await.is_ok() {
                anyone_responded = true;
            }
        }

        tokio::time::sleep(Duration::from_millis(self.config.election_timeout_ms)).await;

        if !anyone_responded {
            self.declare_victory().await;
        } else if self.state.leader_id.load(Ordering::SeqCst) < 0 {
            // A higher node acknowledged the challenge but never followed up
            // with Victory within the timeout; retry rather than wait forever.
            self.in_progress.store(false, Ordering::SeqCst);
            let this = self.clone();
            tokio::spawn(async move { this.start_election().await });
        } else {
            self.in_progress.store(false, Ordering::SeqCst);
        }
    }

    async fn declare_victory(&self) {
        self.state.leader_id.store(self.state.self_node_id, Ordering::SeqCst);
        self.in_progress.store(false, Ordering::SeqCst);
        tracing::info!(node = self.state.self_node_id, "elected self as cluster leader");

        let mut payload = BytesMut::new();
        payload.put_u32(self.state.self_node_id as u32);
        self.mesh.broadcast(ClusterOp::Victory, payload.freeze()).await;

        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}
