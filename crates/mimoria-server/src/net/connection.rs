//! Per-connection receive loop and write serializer (§4.E).
//!
//! Each accepted socket gets one reader task (this module's `run`) which
//! frames incoming bytes and spawns one task per decoded packet so handlers
//! can run concurrently, and one writer task that owns the socket's write
//! half so responses from concurrent handlers never interleave mid-packet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use mimoria_common::wire::frame::{encode_frame, put_text, FrameReader, PacketHeader};
use mimoria_common::{ClientOp, Status};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::dispatch::Dispatcher;
use crate::pubsub::{Message, SubscriberId};
use crate::state::ServerState;

/// Shared per-connection handle passed to dispatch handlers: authentication
/// state and the serialized write side. Cheap to clone via `Arc`.
pub struct ConnectionHandle {
    pub id: u64,
    pub authenticated: AtomicBool,
    writer: mpsc::Sender<Bytes>,
    /// Lazily spawned on the first `Subscribe`; every channel this
    /// connection subscribes to shares the one forwarder task (§4.D).
    subscription: OnceLock<mpsc::Sender<Message>>,
}

impl ConnectionHandle {
    pub fn subscriber_id(&self) -> SubscriberId {
        self.id
    }

    /// Enqueue a fully-framed packet for the writer task. Best-effort: a
    /// full or closed channel (connection already torn down) is dropped
    /// silently, matching the pub/sub delivery contract (§4.D).
    pub async fn send_frame(&self, frame: Bytes) {
        if self.writer.send(frame).await.is_err() {
            tracing::debug!(connection = self.id, "write after connection closed");
        }
    }

    /// The channel pub/sub deliveries are queued on for this connection.
    /// Spawns the forwarding task on first use.
    pub fn subscription_sender(self: &Arc<Self>) -> mpsc::Sender<Message> {
        self.subscription
            .get_or_init(|| {
                let (tx, rx) = mpsc::channel(256);
                tokio::spawn(run_subscription_forwarder(self.clone(), rx));
                tx
            })
            .clone()
    }
}

/// Delivers pub/sub messages to a connection as unsolicited `Publish`
/// packets (`request_id = 0`, since the client didn't originate them).
async fn run_subscription_forwarder(conn: Arc<ConnectionHandle>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let mut body = BytesMut::new();
        put_text(&mut body, &msg.channel);
        msg.payload.encode(&mut body);

        let mut framed = BytesMut::new();
        PacketHeader {
            op: ClientOp::Publish.as_byte(),
            request_id: 0,
        }
        .encode(&mut framed);
        framed.extend_from_slice(&[Status::Ok as u8]);
        framed.extend_from_slice(&body);

        conn.send_frame(encode_frame(&framed).freeze()).await;
    }
}

/// Drive one accepted socket until disconnect or a framing error (§4.E).
pub async fn run(
    socket: TcpStream,
    id: u64,
    state: Arc<ServerState>,
    dispatcher: Arc<Dispatcher>,
) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(256);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let conn = Arc::new(ConnectionHandle {
        id,
        authenticated: AtomicBool::new(false),
        writer: writer_tx,
        subscription: OnceLock::new(),
    });

    let mut reader = FrameReader::new();
    let mut chunk = [0u8; 8192];
    let mut in_flight = Vec::new();

    'recv: loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => break 'recv,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(connection = id, error = %e, "connection read error");
                break 'recv;
            }
        };
        reader.feed(&chunk[..n]);
        loop {
            match reader.poll_frame() {
                Ok(Some(payload)) => {
                    let dispatcher = dispatcher.clone();
                    let conn = conn.clone();
                    in_flight.push(tokio::spawn(async move {
                        dispatcher.dispatch(conn, payload).await;
                    }));
                    in_flight.retain(|h| !h.is_finished());
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(connection = id, error = %e, "malformed frame, closing connection");
                    break 'recv;
                }
            }
        }
    }

    for h in in_flight {
        let _ = h.await;
    }
    drop(conn);
    writer_task.abort();
    state.pubsub.unsubscribe_all(id);
    tracing::info!(connection = id, "connection closed");
}
