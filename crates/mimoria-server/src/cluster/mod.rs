pub mod election;
pub mod mesh;
pub mod mutation;
pub mod replicator;

pub use election::Election;
pub use mesh::{ClusterRouter, Mesh};
pub use mutation::Mutation;
pub use replicator::{AsyncReplicator, ReplicatorHandle, SyncReplicator};
