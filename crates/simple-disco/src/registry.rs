//! In-memory peer registry with TTL-based eviction.
//!
//! The registry is owned by the dispatch loop and is only ever touched from
//! one task, so it carries no interior locking. Expiry is observed lazily:
//! every membership cycle prunes stale entries before answering.
//!
//! ```text
//!   PUBLISH ──► prune(now) ──► upsert(identity, endpoint, now)
//!   PEERS   ──► prune(now) ──► snapshot()
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

/// Maximum age of a peer entry before it is pruned.
pub const DEFAULT_PEER_TTL: Duration = Duration::from_secs(10);

/// Scheme prefixed to every advertised endpoint.
pub const DEFAULT_ENDPOINT_SCHEME: &str = "tcp";

/// A peer known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Opaque identity announced by the client
    pub identity: String,
    /// `<scheme>://<observed address>:<declared port>`
    pub endpoint: String,
    /// Time of the most recent PUBLISH
    pub last_seen: Instant,
}

/// Table of live peers keyed by identity.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
    ttl: Duration,
    scheme: String,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    /// Create an empty registry with the default TTL and scheme.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            ttl: DEFAULT_PEER_TTL,
            scheme: DEFAULT_ENDPOINT_SCHEME.to_string(),
        }
    }

    /// Override the eviction TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the endpoint scheme.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a PUBLISH: prune, then upsert the peer with `last_seen = now`.
    pub fn record(
        &mut self,
        identity: &str,
        observed_address: IpAddr,
        declared_port: u16,
        now: Instant,
    ) -> Peer {
        self.prune(now);

        let peer = Peer {
            identity: identity.to_string(),
            endpoint: format_endpoint(&self.scheme, observed_address, declared_port),
            last_seen: now,
        };
        self.peers.insert(peer.identity.clone(), peer.clone());
        peer
    }

    /// Drop every entry whose age has reached the TTL. Returns the number evicted.
    pub fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.peers.len();
        self.peers
            .retain(|_, peer| now.saturating_duration_since(peer.last_seen) < ttl);
        let evicted = before - self.peers.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.peers.len(), "Pruned stale peers");
        }
        evicted
    }

    /// `(identity, endpoint)` pairs sorted by identity.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .peers
            .values()
            .map(|p| (p.identity.clone(), p.endpoint.clone()))
            .collect();
        entries.sort();
        entries
    }

    #[must_use]
    pub fn get(&self, identity: &str) -> Option<&Peer> {
        self.peers.get(identity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Build an endpoint string; IPv6 addresses are bracketed and IPv4-mapped
/// IPv6 addresses are reported as plain IPv4.
#[must_use]
pub fn format_endpoint(scheme: &str, address: IpAddr, port: u16) -> String {
    format!("{}://{}", scheme, SocketAddr::new(address.to_canonical(), port))
}
