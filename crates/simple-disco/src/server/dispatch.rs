//! Request dispatch: authorize, decode, mutate or query, reply.
//!
//! [`Dispatcher`] owns the registry and the trust oracle outright and
//! processes one request at a time, so registry state needs no locking.
//! [`run`] drives it from the inbound channel fed by connection tasks.

use super::{Inbound, Router};
use crate::codec::{MAX_MESSAGE_SIZE, Multipart};
use crate::protocol::{Command, Reply};
use crate::registry::PeerRegistry;
use crate::trust::TrustOracle;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Room left in a wire message for the envelope around a reply payload.
const REPLY_ENVELOPE: usize = 64;

/// Largest reply payload that still fits in one wire message.
pub const MAX_REPLY_SIZE: usize = MAX_MESSAGE_SIZE - REPLY_ENVELOPE;

/// Single-owner request handler.
#[derive(Debug)]
pub struct Dispatcher {
    registry: PeerRegistry,
    oracle: TrustOracle,
    max_reply_size: usize,
}

impl Dispatcher {
    pub fn new(registry: PeerRegistry, oracle: TrustOracle) -> Self {
        Self {
            registry,
            oracle,
            max_reply_size: MAX_REPLY_SIZE,
        }
    }

    /// Replace payloads larger than `limit` with an `ERROR` reply.
    #[must_use]
    pub fn with_max_reply_size(mut self, limit: usize) -> Self {
        self.max_reply_size = limit.min(MAX_REPLY_SIZE);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Handle one request.
    ///
    /// Returns the reply frames `[routing_id, "", payload]`, or `None` when
    /// the sender is not trusted. Untrusted senders get no reply at all, so
    /// they only ever observe a timeout.
    pub fn handle(&mut self, inbound: Inbound, now: Instant) -> Option<Multipart> {
        let Inbound { frames, meta } = inbound;

        if !self.oracle.is_trusted_at(&meta.user_id, now) {
            warn!(
                user_id = %meta.user_id,
                peer = %meta.peer_address,
                "Sender is not trusted, ignoring request"
            );
            return None;
        }

        let mut frames = frames.into_iter();
        let Some(routing_id) = frames.next() else {
            warn!(peer = %meta.peer_address, "Dropping request without routing frame");
            return None;
        };
        let body: Vec<Bytes> = frames.collect();

        let reply = match body.split_first() {
            Some((delimiter, command)) if delimiter.is_empty() => {
                self.execute(command, &meta, now)
            }
            _ => {
                warn!(peer = %meta.peer_address, "Request is missing the empty delimiter frame");
                Reply::Error("missing empty delimiter frame".to_string())
            }
        };

        let mut payload = reply.encode();
        if payload.len() > self.max_reply_size {
            warn!(
                size = payload.len(),
                limit = self.max_reply_size,
                "Reply too large for one message, answering with an error"
            );
            payload = Reply::Error(format!(
                "reply of {} bytes exceeds {} byte limit",
                payload.len(),
                self.max_reply_size
            ))
            .encode();
        }

        Some(vec![routing_id, Bytes::new(), payload])
    }

    fn execute(&mut self, frames: &[Bytes], meta: &super::MessageMeta, now: Instant) -> Reply {
        match Command::decode(frames) {
            Ok(Command::Publish { uuid, port }) => {
                let peer = self.registry.record(&uuid, meta.peer_address.ip(), port, now);
                debug!(
                    uuid = %peer.identity,
                    endpoint = %peer.endpoint,
                    user_id = %meta.user_id,
                    peers = self.registry.len(),
                    "Peer published"
                );
                Reply::Ok
            }
            Ok(Command::Peers) => {
                self.registry.prune(now);
                let peers = self.registry.snapshot();
                debug!(count = peers.len(), user_id = %meta.user_id, "Serving peer list");
                Reply::Peers(peers)
            }
            Err(e) => {
                warn!(user_id = %meta.user_id, error = %e, "Rejecting malformed request");
                Reply::Error(e.to_string())
            }
        }
    }
}

/// Process inbound requests one at a time until shutdown or until every
/// connection task has gone away.
///
/// Shutdown is only observed between requests, never mid-request.
pub async fn run(
    mut dispatcher: Dispatcher,
    mut inbound: mpsc::Receiver<Inbound>,
    router: Router,
    shutdown: CancellationToken,
) {
    info!("Dispatch loop started");
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = inbound.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        if let Some(reply) = dispatcher.handle(message, Instant::now()) {
            if !router.route(reply) {
                debug!("Reply not delivered");
            }
        }
    }
    info!(peers = dispatcher.registry().len(), "Dispatch loop stopped");
}
