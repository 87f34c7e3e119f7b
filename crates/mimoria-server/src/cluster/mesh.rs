//! Cluster mesh transport (§4.H, §4.I): peer dial/accept connections and
//! request/response correlation between nodes.
//!
//! An ordered pair of peers ends up with two TCP connections between them:
//! one dialed by node A (A sends requests on it, reads responses back) and
//! one dialed by node B (the mirror). Splitting outbound and inbound
//! traffic across distinct sockets means request ids never need to be
//! namespaced per direction, and a peer's accept-side handler never blocks
//! on that same peer's dial-side request queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use mimoria_common::wire::frame::{encode_frame, get_text_checked, put_text, FrameReader, PacketHeader};
use mimoria_common::wire::varint::VarUint;
use mimoria_common::{ClusterOp, Status};
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, OnceCell};

use crate::config::PeerConfig;
use crate::error::ClusterError;
use crate::state::ServerState;

use super::election::Election;
use super::mutation::Mutation;

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<(Status, Bytes)>>>>;

/// The connection this node dialed to a given peer: carries requests we
/// originate and demultiplexes their responses by request id.
struct PeerLink {
    writer: mpsc::Sender<Bytes>,
    next_request_id: AtomicU32,
    pending: Pending,
}

impl PeerLink {
    async fn call(
        &self,
        op: ClusterOp,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<(Status, Bytes), ClusterError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, tx);

        let mut frame = BytesMut::with_capacity(5 + payload.len());
        PacketHeader { op: op.as_byte(), request_id }.encode(&mut frame);
        frame.extend_from_slice(&payload);

        if self.writer.send(encode_frame(&frame).freeze()).await.is_err() {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(ClusterError::TransientPeerError("peer link closed".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(ClusterError::TransientPeerError(
                "peer link dropped before responding".into(),
            )),
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(ClusterError::TransientPeerError("peer call timed out".into()))
            }
        }
    }
}

/// Handles requests arriving on the accept side of the mesh: the inverse of
/// [`PeerLink`]. Owns no transport state, only cache/election logic.
pub struct ClusterRouter {
    state: Arc<ServerState>,
    election: Arc<Election>,
}

impl ClusterRouter {
    pub fn new(state: Arc<ServerState>, election: Arc<Election>) -> Arc<Self> {
        Arc::new(Self { state, election })
    }

    async fn handle(&self, op: ClusterOp, mut payload: Bytes) -> (Status, Bytes) {
        match op {
            ClusterOp::Handshake => (Status::Ok, Bytes::new()),
            ClusterOp::Alive => {
                self.election.on_alive().await;
                (Status::Ok, Bytes::new())
            }
            ClusterOp::Election => {
                if payload.remaining() < 4 {
                    return (Status::Error, Bytes::new());
                }
                self.election.on_election_message(payload.get_u32()).await;
                (Status::Ok, Bytes::new())
            }
            ClusterOp::Victory => {
                if payload.remaining() < 4 {
                    return (Status::Error, Bytes::new());
                }
                self.election.on_victory(payload.get_u32()).await;
                (Status::Ok, Bytes::new())
            }
            ClusterOp::Sync => {
                let snapshot = self.state.cache.snapshot();
                let mut out = BytesMut::new();
                VarUint::new(snapshot.len() as u64).encode(&mut out);
                for (key, value, ttl_ms) in snapshot {
                    mimoria_common::wire::frame::put_bytes(&mut out, &key);
                    value.encode(&mut out);
                    VarUint::new(ttl_ms).encode(&mut out);
                }
                (Status::Ok, out.freeze())
            }
            ClusterOp::ReplicateOne => match Mutation::decode(&mut payload) {
                Ok(mutation) => {
                    mutation.apply(&self.state.cache).await;
                    (Status::Ok, Bytes::new())
                }
                Err(_) => (Status::Error, Bytes::new()),
            },
            ClusterOp::ReplicateBatch => {
                let count = match VarUint::decode(&mut payload) {
                    Some(v) => v.value(),
                    None => return (Status::Error, Bytes::new()),
                };
                for _ in 0..count {
                    match Mutation::decode(&mut payload) {
                        Ok(mutation) => mutation.apply(&self.state.cache).await,
                        Err(_) => return (Status::Error, Bytes::new()),
                    }
                }
                (Status::Ok, Bytes::new())
            }
        }
    }
}

/// Dial/accept transport for the cluster mesh. One instance per node.
pub struct Mesh {
    pub node_id: u32,
    password: String,
    bind_addr: SocketAddr,
    peers_cfg: Vec<PeerConfig>,
    peers: DashMap<u32, Arc<PeerLink>>,
    router: OnceCell<Arc<ClusterRouter>>,
    call_timeout: Duration,
    /// Handshake-complete outbound links and accepted inbound links seen so
    /// far, counted separately since each configured peer contributes one of
    /// each (§4.G).
    outbound_ready: AtomicU32,
    inbound_ready: AtomicU32,
    node_ready_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Mesh {
    /// Returns the mesh handle and a one-shot fired once every configured
    /// peer has both an established outbound link and an accepted inbound
    /// connection (§4.G "node-ready"). Election must not start before this
    /// fires, or `peer_ids()` is still empty and every node declares itself
    /// leader on boot (§4.H rule 1).
    pub fn new(
        node_id: u32,
        password: String,
        bind_addr: SocketAddr,
        peers_cfg: Vec<PeerConfig>,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mesh = Arc::new(Self {
            node_id,
            password,
            bind_addr,
            peers_cfg,
            peers: DashMap::new(),
            router: OnceCell::new(),
            call_timeout: Duration::from_secs(5),
            outbound_ready: AtomicU32::new(0),
            inbound_ready: AtomicU32::new(0),
            node_ready_tx: Mutex::new(Some(tx)),
        });
        mesh.check_node_ready();
        (mesh, rx)
    }

    /// Fires the node-ready signal once, the first time both counters reach
    /// the number of configured peers. A no-op on every call after the
    /// first (`Mutex<Option<Sender>>::take` only ever succeeds once).
    fn check_node_ready(&self) {
        let expected = self.peers_cfg.len() as u32;
        if self.outbound_ready.load(Ordering::SeqCst) >= expected
            && self.inbound_ready.load(Ordering::SeqCst) >= expected
        {
            if let Some(tx) = self.node_ready_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
    }

    /// Wires the inbound handler in after both `Mesh` and `ClusterRouter`
    /// exist — `ClusterRouter` needs `Election`, which needs `Mesh`.
    pub fn set_router(&self, router: Arc<ClusterRouter>) {
        let _ = self.router.set(router);
    }

    pub fn peer_ids(&self) -> Vec<u32> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    pub async fn call(&self, peer_id: u32, op: ClusterOp, payload: Bytes) -> Result<(Status, Bytes), ClusterError> {
        let link = self
            .peers
            .get(&peer_id)
            .map(|e| e.clone())
            .ok_or_else(|| ClusterError::TransientPeerError(format!("no link to node {peer_id}")))?;
        link.call(op, payload, self.call_timeout).await
    }

    /// Fan the same request out to every currently-linked peer concurrently.
    pub async fn broadcast(self: &Arc<Self>, op: ClusterOp, payload: Bytes) -> Vec<(u32, Result<(Status, Bytes), ClusterError>)> {
        let ids = self.peer_ids();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let mesh = self.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move { (id, mesh.call(id, op, payload).await) }));
        }
        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            if let Ok(pair) = h.await {
                out.push(pair);
            }
        }
        out
    }

    /// Spawn the accept loop and one dial loop per configured peer.
    pub fn spawn(self: Arc<Self>) {
        let accept_mesh = self.clone();
        tokio::spawn(async move { accept_mesh.run_accept_loop().await });
        for peer in self.peers_cfg.clone() {
            let dial_mesh = self.clone();
            tokio::spawn(async move { dial_mesh.run_dial_loop(peer).await });
        }
    }

    async fn run_accept_loop(self: Arc<Self>) {
        let listener = match bind_cluster_listener(self.bind_addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "cluster mesh listener bind failed");
                return;
            }
        };
        tracing::info!(addr = %self.bind_addr, "cluster mesh listening");
        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "cluster mesh accept failed");
                    continue;
                }
            };
            let mesh = self.clone();
            tokio::spawn(async move { mesh.serve_inbound(socket, peer_addr).await });
        }
    }

    async fn serve_inbound(self: Arc<Self>, mut socket: TcpStream, peer_addr: SocketAddr) {
        let _ = socket.set_nodelay(true);
        let mut reader = FrameReader::new();
        let mut chunk = [0u8; 4096];

        loop {
            let n = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => {
                    tracing::debug!(%peer_addr, "inbound mesh connection closed before handshake");
                    return;
                }
                Ok(n) => n,
            };
            reader.feed(&chunk[..n]);
            match reader.poll_frame() {
                Ok(Some(payload)) => {
                    let mut buf = payload;
                    let Ok(header) = PacketHeader::decode(&mut buf) else { return };
                    if ClusterOp::from_byte(header.op) != Ok(ClusterOp::Handshake) {
                        tracing::warn!(%peer_addr, "expected handshake as first mesh message");
                        return;
                    }
                    let password_ok = get_text_checked(&mut buf).map(|pw| pw == self.password).unwrap_or(false);

                    let mut resp = BytesMut::new();
                    let status = if password_ok { Status::Ok } else { Status::Error };
                    PacketHeader { op: ClusterOp::Handshake.as_byte(), request_id: header.request_id }.encode(&mut resp);
                    resp.put_u8(status as u8);
                    let framed = encode_frame(&resp);
                    let write_ok = socket.write_all(&framed).await.is_ok();
                    if !password_ok || !write_ok {
                        return;
                    }
                    break;
                }
                Ok(None) => continue,
                Err(_) => return,
            }
        }

        tracing::info!(%peer_addr, "mesh peer handshake accepted");
        self.inbound_ready.fetch_add(1, Ordering::SeqCst);
        self.check_node_ready();
        let (mut read_half, mut write_half) = socket.into_split();
        loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            reader.feed(&chunk[..n]);
            loop {
                match reader.poll_frame() {
                    Ok(Some(payload)) => {
                        let mut buf = payload;
                        let Ok(header) = PacketHeader::decode(&mut buf) else { continue };
                        let Ok(op) = ClusterOp::from_byte(header.op) else { continue };
                        let Some(router) = self.router.get() else { continue };
                        let (status, body) = router.handle(op, buf).await;

                        let mut resp = BytesMut::with_capacity(5 + body.len());
                        PacketHeader { op: header.op, request_id: header.request_id }.encode(&mut resp);
                        resp.put_u8(status as u8);
                        resp.extend_from_slice(&body);
                        if write_half.write_all(&encode_frame(&resp)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
        }
    }

    async fn run_dial_loop(self: Arc<Self>, peer: PeerConfig) {
        loop {
            let addr = format!("{}:{}", peer.host, peer.port);
            match TcpStream::connect(&addr).await {
                Ok(socket) => {
                    if let Err(e) = self.clone().establish_outbound(socket, &peer).await {
                        tracing::warn!(peer_id = peer.id, error = %e, "mesh peer link dropped");
                    }
                }
                Err(e) => {
                    tracing::debug!(peer_id = peer.id, host = %peer.host, error = %e, "mesh dial failed, retrying");
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn establish_outbound(self: Arc<Self>, mut socket: TcpStream, peer: &PeerConfig) -> Result<(), ClusterError> {
        let _ = socket.set_nodelay(true);

        let mut payload = BytesMut::new();
        PacketHeader { op: ClusterOp::Handshake.as_byte(), request_id: 0 }.encode(&mut payload);
        put_text(&mut payload, &self.password);
        socket
            .write_all(&encode_frame(&payload))
            .await
            .map_err(|e| ClusterError::PeerHandshakeFailed(e.to_string()))?;

        let mut reader = FrameReader::new();
        let mut chunk = [0u8; 4096];
        let response = loop {
            let n = socket
                .read(&mut chunk)
                .await
                .map_err(|e| ClusterError::PeerHandshakeFailed(e.to_string()))?;
            if n == 0 {
                return Err(ClusterError::PeerHandshakeFailed("peer closed during handshake".into()));
            }
            reader.feed(&chunk[..n]);
            if let Some(p) = reader
                .poll_frame()
                .map_err(|e| ClusterError::PeerHandshakeFailed(e.to_string()))?
            {
                break p;
            }
        };

        let mut buf = response;
        let _header = PacketHeader::decode(&mut buf).map_err(|e| ClusterError::PeerHandshakeFailed(e.to_string()))?;
        if buf.remaining() < 1 {
            return Err(ClusterError::PeerHandshakeFailed("empty handshake response".into()));
        }
        let status = Status::from_byte(buf.get_u8()).map_err(|e| ClusterError::PeerHandshakeFailed(e.to_string()))?;
        if status != Status::Ok {
            return Err(ClusterError::PeerHandshakeFailed("peer rejected cluster password".into()));
        }

        let (mut read_half, write_half) = socket.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(256);
        tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(frame) = writer_rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let link = Arc::new(PeerLink {
            writer: writer_tx,
            next_request_id: AtomicU32::new(1),
            pending: pending.clone(),
        });
        self.peers.insert(peer.id, link);
        tracing::info!(peer_id = peer.id, host = %peer.host, "mesh peer link established");
        self.outbound_ready.fetch_add(1, Ordering::SeqCst);
        self.check_node_ready();

        let result = loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(ClusterError::TransientPeerError(e.to_string())),
            };
            reader.feed(&chunk[..n]);
            loop {
                match reader.poll_frame() {
                    Ok(Some(payload)) => {
                        let mut buf = payload;
                        let Ok(header) = PacketHeader::decode(&mut buf) else { continue };
                        if buf.remaining() < 1 {
                            continue;
                        }
                        let Ok(status) = Status::from_byte(buf.get_u8()) else { continue };
                        if let Some(tx) = pending.lock().unwrap().remove(&header.request_id) {
                            let _ = tx.send((status, buf));
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        };
        self.peers.remove(&peer.id);
        result
    }
}

fn bind_cluster_listener(addr: SocketAddr) -> Result<TcpListener, ClusterError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(ClusterError::Bind)?;
    socket.set_reuse_address(true).map_err(ClusterError::Bind)?;
    socket.set_nonblocking(true).map_err(ClusterError::Bind)?;
    socket.bind(&addr.into()).map_err(ClusterError::Bind)?;
    socket.listen(128).map_err(ClusterError::Bind)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(ClusterError::Bind)
}
