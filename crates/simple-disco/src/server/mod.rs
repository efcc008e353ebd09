//! Registry server runtime.
//!
//! # Architecture
//!
//! ```text
//!   TcpListener ──accept──► connection task (handshake, framing)
//!                                 │   ▲
//!                 Inbound{frames, │   │ [ "", payload ]
//!                 user_id, addr}  ▼   │
//!                          ┌──────────────────┐
//!                          │  dispatch::run   │  owns Dispatcher
//!                          │  (one at a time) │  → TrustOracle
//!                          └────────┬─────────┘  → PeerRegistry
//!                                   │ [routing_id, "", payload]
//!                                   ▼
//!                                Router ─► connection task by routing_id
//! ```
//!
//! Handshakes run concurrently on their own tasks but never touch registry
//! state; only authenticated connections can feed the dispatch loop.

pub mod dispatch;

pub use dispatch::Dispatcher;

use crate::codec::Multipart;
use crate::error::{DiscoError, Result};
use crate::identity::KeyPair;
use crate::transport::{DEFAULT_HANDSHAKE_TIMEOUT, SecureChannel};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identifies one accepted connection for reply routing.
pub type RoutingId = u64;

/// Capacity of the queue between connection tasks and the dispatch loop.
const INBOUND_QUEUE: usize = 1024;
/// Capacity of each connection's outbound reply queue.
const REPLY_QUEUE: usize = 64;

/// Per-message metadata supplied by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    /// Authenticated identity (hex public key) of the sender
    pub user_id: String,
    /// Connection the message arrived on
    pub routing_id: RoutingId,
    /// Observed source address of the connection
    pub peer_address: SocketAddr,
}

/// A request as seen by the dispatch loop: `[routing_id, "", command, arg...]`.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub frames: Multipart,
    pub meta: MessageMeta,
}

/// Routing identity frame for a connection.
#[must_use]
pub fn encode_routing_id(id: RoutingId) -> Bytes {
    Bytes::copy_from_slice(&id.to_be_bytes())
}

#[must_use]
pub fn decode_routing_id(frame: &[u8]) -> Option<RoutingId> {
    <[u8; 8]>::try_from(frame).ok().map(RoutingId::from_be_bytes)
}

/// Maps routing ids to the outbound queues of live connections.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Arc<DashMap<RoutingId, mpsc::Sender<Multipart>>>,
}

impl Router {
    pub fn register(&self, id: RoutingId, replies: mpsc::Sender<Multipart>) {
        self.routes.insert(id, replies);
    }

    pub fn unregister(&self, id: RoutingId) {
        self.routes.remove(&id);
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.routes.len()
    }

    /// Deliver `[routing_id, rest...]` to its connection as `[rest...]`.
    ///
    /// Never waits: a connection whose reply queue is full (its client has
    /// stopped reading) loses the reply instead of stalling the dispatch
    /// loop for everyone else. Returns `false` when the reply was dropped.
    pub fn route(&self, mut reply: Multipart) -> bool {
        if reply.is_empty() {
            return false;
        }
        let Some(id) = decode_routing_id(&reply.remove(0)) else {
            warn!("Reply carries an invalid routing frame");
            return false;
        };
        let Some(sender) = self.routes.get(&id).map(|entry| entry.value().clone()) else {
            return false;
        };
        match sender.try_send(reply) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(routing_id = id, "Reply queue full, dropping reply");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// A bound registry server.
#[derive(Debug)]
pub struct RegistryServer {
    listener: TcpListener,
    keys: Arc<KeyPair>,
    dispatcher: Dispatcher,
    handshake_timeout: Duration,
}

impl RegistryServer {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr, keys: KeyPair, dispatcher: Dispatcher) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            server_key = %keys.public_hex(),
            "Registry server listening"
        );
        Ok(Self {
            listener,
            keys: Arc::new(keys),
            dispatcher,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(DiscoError::from)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let RegistryServer {
            listener,
            keys,
            dispatcher,
            handshake_timeout,
        } = self;

        let router = Router::default();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let dispatch = tokio::spawn(dispatch::run(
            dispatcher,
            inbound_rx,
            router.clone(),
            shutdown.clone(),
        ));

        let next_id = AtomicU64::new(1);
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, routing_id = id, "Accepted connection");
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        id,
                        keys.clone(),
                        handshake_timeout,
                        inbound_tx.clone(),
                        router.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    // Transient accept failures (e.g. EMFILE) must not stop the server.
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        drop(inbound_tx);
        if let Err(e) = dispatch.await {
            error!(error = %e, "Dispatch task failed");
        }
        info!("Registry server stopped");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: RoutingId,
    keys: Arc<KeyPair>,
    handshake_timeout: Duration,
    inbound: mpsc::Sender<Inbound>,
    router: Router,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let handshake = tokio::time::timeout(handshake_timeout, SecureChannel::accept(stream, &keys));
    let mut channel = match handshake.await {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "Handshake failed");
            return;
        }
        Err(_) => {
            warn!(%peer, "Handshake timed out");
            return;
        }
    };

    let user_id = channel.remote_identity();
    debug!(%peer, %user_id, routing_id = id, "Connection authenticated");

    let (reply_tx, mut reply_rx) = mpsc::channel(REPLY_QUEUE);
    router.register(id, reply_tx);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = channel.recv() => match incoming {
                Ok(Some(frames)) => {
                    let mut message = Vec::with_capacity(frames.len() + 1);
                    message.push(encode_routing_id(id));
                    message.extend(frames);
                    let request = Inbound {
                        frames: message,
                        meta: MessageMeta {
                            user_id: user_id.clone(),
                            routing_id: id,
                            peer_address: peer,
                        },
                    };
                    if inbound.send(request).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%peer, error = %e, "Connection read failed");
                    break;
                }
            },
            Some(reply) = reply_rx.recv() => {
                if let Err(e) = channel.send(reply).await {
                    debug!(%peer, error = %e, "Connection write failed");
                    break;
                }
            }
        }
    }

    router.unregister(id);
    debug!(%peer, routing_id = id, "Connection closed");
}
