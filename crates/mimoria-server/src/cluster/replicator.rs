//! Mutation replication to followers (§4.I): sync replication blocks the
//! originating request until every follower has acked; async replication
//! queues mutations and ships them in periodic batches.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use mimoria_common::ClusterOp;
use tokio::sync::mpsc;

use crate::error::ClusterError;

use super::mesh::Mesh;
use super::mutation::Mutation;

/// Broadcasts one mutation and waits for every linked peer to ack before
/// returning. A write on the leader only completes to the client once this
/// returns (§4.I "sync").
pub struct SyncReplicator {
    mesh: Arc<Mesh>,
}

impl SyncReplicator {
    pub fn new(mesh: Arc<Mesh>) -> Arc<Self> {
        Arc::new(Self { mesh })
    }

    /// A follower that drops mid-wait (or is simply not linked right now) is
    /// not a replication failure: it resyncs its whole cache from a `Sync`
    /// snapshot on reconnect, so its missed ack doesn't fail this write (§4.I,
    /// §7 `TransientPeerError`).
    pub async fn replicate(&self, mutation: Mutation) -> Result<(), ClusterError> {
        let mut payload = BytesMut::new();
        mutation.encode(&mut payload);
        let results = self.mesh.broadcast(ClusterOp::ReplicateOne, payload.freeze()).await;
        for (peer_id, result) in results {
            if let Err(e) = result {
                tracing::warn!(peer_id, error = %e, "follower missed replication ack, will resync on reconnect");
            }
        }
        Ok(())
    }
}

/// Queues mutations and a background task flushes them as a single batched
/// request on a fixed interval (§4.I "async").
pub struct AsyncReplicator {
    queue_tx: mpsc::Sender<Mutation>,
}

impl AsyncReplicator {
    pub fn spawn(mesh: Arc<Mesh>, interval: Duration) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::channel::<Mutation>(4096);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut batch = Vec::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if batch.is_empty() {
                            continue;
                        }
                        let mut payload = BytesMut::new();
                        mimoria_common::wire::varint::VarUint::new(batch.len() as u64).encode(&mut payload);
                        for mutation in &batch {
                            mutation.encode(&mut payload);
                        }
                        mesh.broadcast(ClusterOp::ReplicateBatch, payload.freeze()).await;
                        batch.clear();
                    }
                    received = queue_rx.recv() => {
                        match received {
                            Some(mutation) => batch.push(mutation),
                            None => break,
                        }
                    }
                }
            }
        });
        Arc::new(Self { queue_tx })
    }

    /// Best-effort enqueue: a full queue means the flush task has fallen far
    /// behind, in which case dropping here rather than blocking the client
    /// request is the only option short of unbounded memory growth.
    pub async fn replicate(&self, mutation: Mutation) -> Result<(), ClusterError> {
        self.queue_tx
            .send(mutation)
            .await
            .map_err(|_| ClusterError::TransientPeerError("async replication queue closed".into()))
    }
}

/// Unifies the two replication strategies behind one call site in the
/// dispatcher.
#[derive(Clone)]
pub enum ReplicatorHandle {
    Sync(Arc<SyncReplicator>),
    Async(Arc<AsyncReplicator>),
}

impl ReplicatorHandle {
    pub async fn replicate(&self, mutation: Mutation) -> Result<(), ClusterError> {
        match self {
            ReplicatorHandle::Sync(r) => r.replicate(mutation).await,
            ReplicatorHandle::Async(r) => r.replicate(mutation).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicator_handle_is_cloneable_and_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ReplicatorHandle>();
    }
}
