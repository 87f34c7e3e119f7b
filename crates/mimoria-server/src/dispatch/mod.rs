//! Operation dispatcher (§4.F): decodes one packet's opcode, authenticates
//! the connection, routes to the operation's handler, and writes the
//! response packet tagged with the same operation and request id.

mod ops;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use mimoria_common::wire::frame::{encode_frame, get_text_checked, PacketHeader};
use mimoria_common::wire::varint::VarUint;
use mimoria_common::{BufferPool, ClientOp, Status};

use crate::cluster::{Mutation, ReplicatorHandle};
use crate::error::ConnectionError;
use crate::net::ConnectionHandle;
use crate::state::ServerState;

/// Protocol version carried by `Login` requests; fixed per §4.F.
const PROTOCOL_VERSION: u64 = 1;

/// Routes decoded packets to their handlers (§4.F). One instance is shared
/// by every connection on a server.
pub struct Dispatcher {
    pub state: Arc<ServerState>,
    pool: BufferPool,
    replicator: Option<ReplicatorHandle>,
}

impl Dispatcher {
    pub fn new(
        state: Arc<ServerState>,
        pool: BufferPool,
        replicator: Option<ReplicatorHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            pool,
            replicator,
        })
    }

    /// Decode one packet, authenticate if needed, dispatch, and reply.
    pub async fn dispatch(&self, conn: Arc<ConnectionHandle>, payload: Bytes) {
        let mut buf = payload;
        let header = match PacketHeader::decode(&mut buf) {
            Ok(h) => h,
            Err(_) => return,
        };

        let op = match ClientOp::from_byte(header.op) {
            Ok(op) => op,
            Err(e) => {
                self.respond_error(&conn, header.op, header.request_id, e.to_string())
                    .await;
                return;
            }
        };

        if op == ClientOp::Login {
            self.handle_login(&conn, header.request_id, &mut buf).await;
            return;
        }

        if !conn.authenticated.load(Ordering::SeqCst) {
            self.respond_error(
                &conn,
                header.op,
                header.request_id,
                ConnectionError::Unauthenticated.to_string(),
            )
            .await;
            return;
        }

        match ops::route(self, &conn, op, &mut buf).await {
            Ok(body) => self.respond_ok(&conn, header.op, header.request_id, &body).await,
            Err(msg) => self.respond_error(&conn, header.op, header.request_id, msg).await,
        }
    }

    async fn handle_login(&self, conn: &Arc<ConnectionHandle>, request_id: u32, buf: &mut Bytes) {
        let version = match VarUint::decode(buf) {
            Some(v) => v.value(),
            None => {
                self.respond_error(
                    conn,
                    ClientOp::Login.as_byte(),
                    request_id,
                    "truncated login payload".to_string(),
                )
                .await;
                return;
            }
        };
        let password = match get_text_checked(buf) {
            Ok(p) => p,
            Err(e) => {
                self.respond_error(conn, ClientOp::Login.as_byte(), request_id, e.to_string())
                    .await;
                return;
            }
        };

        if version != PROTOCOL_VERSION {
            let msg = ConnectionError::ProtocolVersionMismatch {
                expected: PROTOCOL_VERSION as u32,
                got: version as u32,
            }
            .to_string();
            self.respond_error(conn, ClientOp::Login.as_byte(), request_id, msg).await;
            return;
        }
        if password != self.state.config.password {
            self.respond_error(
                conn,
                ClientOp::Login.as_byte(),
                request_id,
                ConnectionError::BadPassword.to_string(),
            )
            .await;
            return;
        }

        conn.authenticated.store(true, Ordering::SeqCst);
        tracing::info!(connection = conn.id, "connection authenticated");

        let mut body = BytesMut::new();
        body.extend_from_slice(&[1u8]); // authenticated = true
        body.extend_from_slice(&self.state.cluster_id.to_be_bytes());
        body.extend_from_slice(&[self.state.is_leader() as u8]);
        self.respond_ok(conn, ClientOp::Login.as_byte(), request_id, &body).await;
    }

    /// Fan a committed mutation out to followers if this node is currently
    /// the cluster leader (§4.I). Replication failures are logged, never
    /// surfaced to the client that originated the write (§7
    /// `TransientPeerError`).
    pub async fn maybe_replicate(&self, mutation: Mutation) {
        if !self.state.is_leader() {
            return;
        }
        if let Some(replicator) = &self.replicator {
            if let Err(e) = replicator.replicate(mutation).await {
                tracing::warn!(error = %e, "replication to followers failed");
            }
        }
    }

    async fn respond_ok(&self, conn: &Arc<ConnectionHandle>, op: u8, request_id: u32, body: &[u8]) {
        self.respond(conn, op, request_id, Status::Ok, body).await;
    }

    async fn respond_error(&self, conn: &Arc<ConnectionHandle>, op: u8, request_id: u32, message: String) {
        let mut body = BytesMut::new();
        mimoria_common::wire::frame::put_text(&mut body, &message);
        self.respond(conn, op, request_id, Status::Error, &body).await;
    }

    /// Build and send one response packet. The pooled scratch buffer is
    /// released back to the pool on every exit path, including after the
    /// frame has been handed to the connection's writer (§4.A).
    async fn respond(&self, conn: &Arc<ConnectionHandle>, op: u8, request_id: u32, status: Status, body: &[u8]) {
        let mut pooled = self.pool.checkout();
        PacketHeader { op, request_id }.encode(&mut *pooled);
        pooled.extend_from_slice(&[status as u8]);
        pooled.extend_from_slice(body);
        let framed = encode_frame(&pooled).freeze();
        conn.send_frame(framed).await;
    }
}
