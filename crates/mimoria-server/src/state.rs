use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::Cache;
use crate::config::Config;
use crate::keylock::KeyLockTable;
use crate::pubsub::Hub;

/// Everything shared across connection tasks, the sweeper, and (when
/// clustering is enabled) the mesh/election/replication tasks.
pub struct ServerState {
    pub config: Config,
    pub cache: Arc<Cache>,
    pub pubsub: Arc<Hub>,
    pub locks: Arc<KeyLockTable>,
    pub started_at: Instant,
    pub next_connection_id: AtomicU64,
    pub connection_count: AtomicU64,
    /// 0 when running standalone; the cluster node id otherwise.
    pub cluster_id: i32,
    /// Set once this node becomes leader or follower; read by the Login
    /// handler for the `is_leader` response field (§6).
    pub leader_id: AtomicI64,
    pub self_node_id: i64,
}

impl ServerState {
    pub fn new(config: Config) -> Arc<Self> {
        let locks = Arc::new(KeyLockTable::new());
        let pubsub = Arc::new(Hub::new());
        let cache = Arc::new(Cache::new(locks.clone(), pubsub.clone()));
        let cluster_id = config.cluster.as_ref().map(|c| c.id as i32).unwrap_or(0);
        let self_node_id = config.cluster.as_ref().map(|c| c.id as i64).unwrap_or(0);
        Arc::new(Self {
            config,
            cache,
            pubsub,
            locks,
            started_at: Instant::now(),
            next_connection_id: AtomicU64::new(1),
            connection_count: AtomicU64::new(0),
            cluster_id,
            leader_id: AtomicI64::new(-1),
            self_node_id,
        })
    }

    pub fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Standalone nodes have no leadership concept at all (§6 treats their
    /// cluster id as 0, not a one-node cluster they happen to lead), so this
    /// only ever returns `true` when clustered and this node currently holds
    /// the leader role.
    pub fn is_leader(&self) -> bool {
        self.config.cluster.is_some() && self.leader_id.load(Ordering::SeqCst) == self.self_node_id
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
