use thiserror::Error;

/// Cache-engine error behaviors (§7). Every variant maps to an `Error`
/// response on the originating request; none mutate state before failing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("key holds a {actual} value, expected {expected}")]
    ShapeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("value must not be null")]
    NullElement,
}

/// Connection/dispatch-level error behaviors (§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("operation attempted before successful login")]
    Unauthenticated,
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    ProtocolVersionMismatch { expected: u32, got: u32 },
    #[error("invalid password")]
    BadPassword,
    #[error("bulk sub-operation {0:?} is not supported inside a Bulk envelope")]
    UnsupportedBulkOp(mimoria_common::ClientOp),
}

/// Cluster control-plane error behaviors (§7).
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("peer handshake failed: {0}")]
    PeerHandshakeFailed(String),
    #[error("transient peer send error: {0}")]
    TransientPeerError(String),
    #[error("bind error: {0}")]
    Bind(#[source] std::io::Error),
}

/// Error surfaced for one cycle of the periodic sweep. Logged by the
/// sweeper and never propagated; the loop always continues.
#[derive(Debug, Error)]
#[error("sweeper cycle error: {0}")]
pub struct SweeperError(pub String);
