//! Discovery client: announce ourselves to every server, merge their views.
//!
//! ```text
//!   every interval:
//!     for server in servers (configured order):
//!        PUBLISH id port ──► wait ≤ reply_timeout ──► timeout? recreate, next server
//!        PEERS           ──► wait ≤ reply_timeout ──► timeout? recreate, next server
//!        merge peers into this cycle's view (later servers win)
//!     publish view on the watch channel
//! ```
//!
//! Liveness is inferred purely from reply timeouts; there are no heartbeats.

pub mod connection;

pub use connection::ConnectionHandle;

use crate::error::{DiscoError, Result};
use crate::protocol::{Command, Reply, strip_delimiter};
use crate::transport::{Connection, Connector};
use rand::Rng;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to wait for each reply before declaring a server dead.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between publish cycles.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Ports picked from when none is configured.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 2000..=2020;

/// Combined view of the network: identity to endpoint, ordered by identity.
pub type PeerView = BTreeMap<String, String>;

/// Outcome of one pass over every configured server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Peers merged from every server that answered
    pub view: PeerView,
    /// Servers whose connection was recreated during this cycle
    pub unreachable: Vec<String>,
}

/// A fresh random identity for this process.
#[must_use]
pub fn random_identity() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A random port from [`DEFAULT_PORT_RANGE`].
#[must_use]
pub fn random_port() -> u16 {
    rand::thread_rng().gen_range(DEFAULT_PORT_RANGE)
}

/// Multi-server discovery client.
pub struct DiscoClient<C: Connector> {
    connector: C,
    handles: Vec<ConnectionHandle<C::Connection>>,
    identity: String,
    port: u16,
    reply_timeout: Duration,
    interval: Duration,
    view: watch::Sender<PeerView>,
}

impl<C: Connector> DiscoClient<C> {
    /// Open a handle per server. Nothing is dialed until the first cycle.
    pub fn new<I, S>(connector: C, servers: I, identity: impl Into<String>, port: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let handles = servers
            .into_iter()
            .map(|server| ConnectionHandle::open(&connector, server.as_ref()))
            .collect();
        let (view, _) = watch::channel(PeerView::new());
        Self {
            connector,
            handles,
            identity: identity.into(),
            port,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            interval: DEFAULT_PUBLISH_INTERVAL,
            view,
        }
    }

    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn handles(&self) -> &[ConnectionHandle<C::Connection>] {
        &self.handles
    }

    /// The view published by the last completed cycle.
    #[must_use]
    pub fn view(&self) -> PeerView {
        self.view.borrow().clone()
    }

    /// Receive every view this client publishes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PeerView> {
        self.view.subscribe()
    }

    /// Announce to and query every server once, then publish the merged view.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let publish = Command::Publish {
            uuid: self.identity.clone(),
            port: self.port,
        };

        for handle in &mut self.handles {
            let alive = poll_server(
                handle,
                &publish,
                self.reply_timeout,
                &mut report.view,
            )
            .await;
            if !alive {
                handle.recreate(&self.connector);
                report.unreachable.push(handle.server().to_string());
            }
        }

        let changed = *self.view.borrow() != report.view;
        if changed {
            info!(peers = report.view.len(), "Peer view updated");
        }
        self.view.send_replace(report.view.clone());
        report
    }

    /// Run cycles until `shutdown` is cancelled.
    ///
    /// With exactly one server configured there is nothing to fail over
    /// to, so losing it ends the loop with [`DiscoError::ServerUnreachable`].
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            identity = %self.identity,
            port = self.port,
            servers = self.handles.len(),
            "Discovery client started"
        );
        loop {
            let report = self.run_cycle().await;
            if self.handles.len() == 1 {
                if let Some(server) = report.unreachable.into_iter().next() {
                    return Err(DiscoError::ServerUnreachable(server));
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Discovery client stopped");
        Ok(())
    }
}

/// One PUBLISH + PEERS exchange. Returns `false` when the server must be
/// considered dead: a reply timed out or the transport failed.
async fn poll_server<K>(
    handle: &mut ConnectionHandle<K>,
    publish: &Command,
    timeout: Duration,
    view: &mut PeerView,
) -> bool
where
    K: Connection,
{
    let server = handle.server().to_string();

    let Some(ack) = exchange(handle, publish, timeout).await else {
        return false;
    };
    let ack = match ack {
        Ok(payload) => Reply::decode_publish(&payload),
        Err(e) => Reply::Error(e.to_string()),
    };
    if let Reply::Error(reason) = ack {
        warn!(%server, %reason, "Publish rejected");
    }

    let Some(listing) = exchange(handle, &Command::Peers, timeout).await else {
        return false;
    };
    let reply = match listing {
        Ok(payload) => Reply::decode_peers(&payload),
        Err(e) => Reply::Error(e.to_string()),
    };
    match reply {
        Reply::Peers(peers) => {
            debug!(%server, count = peers.len(), "Received peer list");
            view.extend(peers);
        }
        Reply::Error(reason) => warn!(%server, %reason, "Peer query rejected"),
        Reply::Ok => warn!(%server, "Unexpected OK in answer to a peer query"),
    }
    true
}

/// Send one command and wait for its payload.
///
/// `None` means the server is dead (timeout or transport error); `Some(Err)`
/// is a reply that arrived but was not a well formed `["", payload]`.
async fn exchange<K>(
    handle: &mut ConnectionHandle<K>,
    command: &Command,
    timeout: Duration,
) -> Option<Result<bytes::Bytes>>
where
    K: Connection,
{
    match handle.request(command.to_frames(), timeout).await {
        Ok(Some(frames)) => Some(strip_delimiter(frames)),
        Ok(None) => {
            warn!(server = %handle.server(), ?timeout, "Server did not answer, reconnecting");
            None
        }
        Err(e) => {
            warn!(server = %handle.server(), error = %e, "Server connection failed, reconnecting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Multipart;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    enum Behavior {
        Serve(Vec<(String, String)>),
        Silent,
        Reject,
        Broken,
    }

    #[derive(Debug, Default)]
    struct Shared {
        behavior: HashMap<String, Behavior>,
        connects: HashMap<String, usize>,
        sent: Vec<(String, Multipart)>,
    }

    #[derive(Debug, Clone, Default)]
    struct MockConnector {
        shared: Arc<Mutex<Shared>>,
    }

    impl MockConnector {
        fn set(&self, server: &str, behavior: Behavior) {
            self.shared
                .lock()
                .unwrap()
                .behavior
                .insert(server.to_string(), behavior);
        }

        fn connects(&self, server: &str) -> usize {
            self.shared
                .lock()
                .unwrap()
                .connects
                .get(server)
                .copied()
                .unwrap_or(0)
        }
    }

    struct MockConnection {
        server: String,
        shared: Arc<Mutex<Shared>>,
        pending: Option<Multipart>,
    }

    impl Connector for MockConnector {
        type Connection = MockConnection;

        fn connect(&self, server: &str) -> MockConnection {
            *self
                .shared
                .lock()
                .unwrap()
                .connects
                .entry(server.to_string())
                .or_default() += 1;
            MockConnection {
                server: server.to_string(),
                shared: self.shared.clone(),
                pending: None,
            }
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn send(&mut self, message: Multipart) -> crate::error::Result<()> {
            let mut shared = self.shared.lock().unwrap();
            shared.sent.push((self.server.clone(), message.clone()));
            let behavior = shared
                .behavior
                .get(&self.server)
                .cloned()
                .unwrap_or(Behavior::Silent);
            let is_publish = message.get(1).map(|c| &c[..]) == Some(b"PUBLISH".as_slice());
            self.pending = match behavior {
                Behavior::Broken => return Err(DiscoError::ConnectionClosed),
                Behavior::Silent => None,
                Behavior::Reject => Some(Reply::Error("not today".to_string())),
                Behavior::Serve(_) if is_publish => Some(Reply::Ok),
                Behavior::Serve(peers) => Some(Reply::Peers(peers)),
            }
            .map(|reply| vec![Bytes::new(), reply.encode()]);
            Ok(())
        }

        async fn recv_timeout(
            &mut self,
            _timeout: Duration,
        ) -> crate::error::Result<Option<Multipart>> {
            Ok(self.pending.take())
        }
    }

    fn peers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(id, ep)| (id.to_string(), ep.to_string()))
            .collect()
    }

    fn client(connector: &MockConnector, servers: &[&str]) -> DiscoClient<MockConnector> {
        DiscoClient::new(connector.clone(), servers.iter().copied(), "me", 2005)
            .with_reply_timeout(Duration::from_millis(10))
            .with_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_later_server_wins_on_conflict() {
        let connector = MockConnector::default();
        connector.set(
            "s1",
            Behavior::Serve(peers(&[("a", "tcp://10.0.0.1:3000"), ("b", "tcp://10.0.0.2:3000")])),
        );
        connector.set("s2", Behavior::Serve(peers(&[("a", "tcp://10.0.0.9:3000")])));

        let mut client = client(&connector, &["s1", "s2"]);
        let report = client.run_cycle().await;

        assert!(report.unreachable.is_empty());
        assert_eq!(report.view.get("a").map(String::as_str), Some("tcp://10.0.0.9:3000"));
        assert_eq!(report.view.get("b").map(String::as_str), Some("tcp://10.0.0.2:3000"));
        assert_eq!(client.view(), report.view);
    }

    #[tokio::test]
    async fn test_publish_carries_identity_and_port() {
        let connector = MockConnector::default();
        connector.set("s1", Behavior::Serve(Vec::new()));
        let mut client = client(&connector, &["s1"]);
        client.run_cycle().await;

        let sent = connector.shared.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].1,
            Command::Publish {
                uuid: "me".to_string(),
                port: 2005
            }
            .to_frames()
        );
        assert_eq!(sent[1].1, Command::Peers.to_frames());
    }

    #[tokio::test]
    async fn test_silent_server_is_recreated_and_retried() {
        let connector = MockConnector::default();
        connector.set("s1", Behavior::Silent);
        connector.set("s2", Behavior::Serve(peers(&[("b", "tcp://10.0.0.2:1")])));

        let mut client = client(&connector, &["s1", "s2"]);
        let report = client.run_cycle().await;

        assert_eq!(report.unreachable, vec!["s1".to_string()]);
        assert_eq!(report.view.len(), 1, "s2 is still consulted after s1 fails");
        assert_eq!(client.handles()[0].generation(), 1);
        assert_eq!(client.handles()[1].generation(), 0);
        assert_eq!(connector.connects("s1"), 2);

        // Server comes back: the recreated connection is used next cycle.
        connector.set("s1", Behavior::Serve(peers(&[("a", "tcp://10.0.0.1:1")])));
        let report = client.run_cycle().await;
        assert!(report.unreachable.is_empty());
        assert_eq!(report.view.len(), 2);
        assert_eq!(client.handles()[0].generation(), 1);
    }

    #[tokio::test]
    async fn test_broken_transport_counts_as_dead() {
        let connector = MockConnector::default();
        connector.set("s1", Behavior::Broken);
        let mut client = client(&connector, &["s1"]);

        let report = client.run_cycle().await;
        assert_eq!(report.unreachable, vec!["s1".to_string()]);
        assert_eq!(client.handles()[0].generation(), 1);
    }

    #[tokio::test]
    async fn test_error_replies_do_not_kill_connection() {
        let connector = MockConnector::default();
        connector.set("s1", Behavior::Reject);
        let mut client = client(&connector, &["s1"]);

        let report = client.run_cycle().await;
        assert!(report.unreachable.is_empty());
        assert!(report.view.is_empty());
        assert_eq!(client.handles()[0].generation(), 0);
    }

    #[tokio::test]
    async fn test_view_is_rebuilt_each_cycle() {
        let connector = MockConnector::default();
        connector.set("s1", Behavior::Serve(peers(&[("a", "tcp://10.0.0.1:1")])));
        let mut client = client(&connector, &["s1"]);
        let mut updates = client.subscribe();

        client.run_cycle().await;
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().len(), 1);

        connector.set("s1", Behavior::Serve(Vec::new()));
        client.run_cycle().await;
        assert!(updates.borrow_and_update().is_empty(), "expired peers must disappear");
    }

    #[tokio::test]
    async fn test_single_server_loss_ends_run() {
        let connector = MockConnector::default();
        connector.set("only", Behavior::Silent);
        let mut client = client(&connector, &["only"]);

        let result = client.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(DiscoError::ServerUnreachable(s)) if s == "only"));
    }

    #[tokio::test]
    async fn test_run_survives_one_dead_server_until_cancelled() {
        let connector = MockConnector::default();
        connector.set("s1", Behavior::Silent);
        connector.set("s2", Behavior::Serve(Vec::new()));
        let mut client = client(&connector, &["s1", "s2"]);

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        assert!(client.run(shutdown).await.is_ok());
        assert!(client.handles()[0].generation() >= 1);
    }

    #[test]
    fn test_random_defaults() {
        for _ in 0..100 {
            assert!(DEFAULT_PORT_RANGE.contains(&random_port()));
        }
        assert_ne!(random_identity(), random_identity());
    }
}
