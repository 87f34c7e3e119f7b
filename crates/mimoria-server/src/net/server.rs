//! TCP accept loop for the client-facing listener (§4.E, §10.F).

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;

use super::connection;
use crate::dispatch::Dispatcher;
use crate::state::ServerState;

/// Owns the bound listening socket and the accept loop task.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind `addr` with an explicit backlog (the teacher's agents set this
    /// via `socket2` rather than relying on the platform default, which on
    /// some kernels is as low as 128).
    pub fn bind(addr: SocketAddr, backlog: i32) -> anyhow::Result<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        let std_listener: std::net::TcpListener = socket.into();
        let inner = TcpListener::from_std(std_listener)?;
        let local_addr = inner.local_addr()?;
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` fires, spawning one task per
    /// socket via [`connection::run`].
    pub async fn serve(
        self,
        state: Arc<ServerState>,
        dispatcher: Arc<Dispatcher>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = self.inner.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                    let id = state.allocate_connection_id();
                    state.connection_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tracing::info!(connection = id, %peer, "accepted client connection");
                    let state = state.clone();
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        connection::run(socket, id, state.clone(), dispatcher).await;
                        state.connection_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}
