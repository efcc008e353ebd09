//! Secure transport: framed, handshaken byte streams.
//!
//! The registry core only relies on three things from this layer: a
//! per-message authenticated identity, the sender's network address, and
//! the multipart payload. [`SecureChannel`] provides those over any
//! `AsyncRead + AsyncWrite` stream; [`TcpConnector`] is the client-side
//! implementation of [`Connector`] used outside of tests.

use crate::codec::{Multipart, MultipartCodec};
use crate::error::{DiscoError, Result};
use crate::handshake;
use crate::identity::KeyPair;
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

/// Scheme accepted (and stripped) in front of addresses, e.g. `tcp://127.0.0.1:9001`.
pub const ADDRESS_SCHEME: &str = "tcp://";

/// Default bound on dialing plus handshaking.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// An authenticated, framed stream.
#[derive(Debug)]
pub struct SecureChannel<S> {
    framed: Framed<S, MultipartCodec>,
    remote_key: VerifyingKey,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the server half of the handshake over `stream`.
    pub async fn accept(stream: S, keys: &KeyPair) -> Result<Self> {
        let mut framed = Framed::new(stream, MultipartCodec::new());
        let remote_key = handshake::accept(&mut framed, keys).await?;
        Ok(Self { framed, remote_key })
    }

    /// Run the client half of the handshake over `stream`.
    pub async fn connect(
        stream: S,
        keys: &KeyPair,
        expected_server: Option<&VerifyingKey>,
    ) -> Result<Self> {
        let mut framed = Framed::new(stream, MultipartCodec::new());
        let remote_key = handshake::connect(&mut framed, keys, expected_server).await?;
        Ok(Self { framed, remote_key })
    }

    /// Hex identity token of the authenticated remote side.
    #[must_use]
    pub fn remote_identity(&self) -> String {
        hex::encode(self.remote_key.as_bytes())
    }

    pub async fn send(&mut self, message: Multipart) -> Result<()> {
        self.framed.send(message).await.map_err(DiscoError::from)
    }

    /// Next message, or `None` once the remote side closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Multipart>> {
        match self.framed.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(DiscoError::from(e)),
            None => Ok(None),
        }
    }
}

/// Client-side view of one registry server.
#[async_trait]
pub trait Connection: Send {
    /// Queue one request.
    async fn send(&mut self, message: Multipart) -> Result<()>;

    /// Wait up to `timeout` for the next reply; `Ok(None)` means timed out.
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Multipart>>;
}

/// Builds connections to registry servers.
///
/// `connect` is lazy and never fails; dialing errors surface on first use,
/// where the client treats them like any other liveness failure.
pub trait Connector: Send + Sync {
    type Connection: Connection;

    fn connect(&self, server: &str) -> Self::Connection;
}

/// Dials registry servers over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    keys: Arc<KeyPair>,
    server_key: Option<VerifyingKey>,
    handshake_timeout: Duration,
}

impl TcpConnector {
    pub fn new(keys: Arc<KeyPair>) -> Self {
        Self {
            keys,
            server_key: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Reject servers whose key differs from `key`.
    #[must_use]
    pub fn with_server_key(mut self, key: Option<VerifyingKey>) -> Self {
        self.server_key = key;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    type Connection = TcpConnection;

    fn connect(&self, server: &str) -> TcpConnection {
        TcpConnection {
            address: strip_scheme(server).to_string(),
            keys: self.keys.clone(),
            server_key: self.server_key,
            handshake_timeout: self.handshake_timeout,
            channel: None,
        }
    }
}

/// A lazily dialed TCP connection to one server.
#[derive(Debug)]
pub struct TcpConnection {
    address: String,
    keys: Arc<KeyPair>,
    server_key: Option<VerifyingKey>,
    handshake_timeout: Duration,
    channel: Option<SecureChannel<TcpStream>>,
}

impl TcpConnection {
    async fn channel(&mut self) -> Result<&mut SecureChannel<TcpStream>> {
        if self.channel.is_none() {
            let dial = async {
                let stream = TcpStream::connect(&self.address).await?;
                stream.set_nodelay(true)?;
                SecureChannel::connect(stream, &self.keys, self.server_key.as_ref()).await
            };
            let channel = tokio::time::timeout(self.handshake_timeout, dial)
                .await
                .map_err(|_| DiscoError::Timeout(self.handshake_timeout))??;
            debug!(server = %self.address, "Connected to registry server");
            self.channel = Some(channel);
        }
        self.channel.as_mut().ok_or(DiscoError::ConnectionClosed)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, message: Multipart) -> Result<()> {
        let result = self.channel().await?.send(message).await;
        if result.is_err() {
            self.channel = None;
        }
        result
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Multipart>> {
        let channel = self.channel.as_mut().ok_or(DiscoError::ConnectionClosed)?;
        match tokio::time::timeout(timeout, channel.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(Some(message))) => Ok(Some(message)),
            Ok(Ok(None)) => {
                self.channel = None;
                Err(DiscoError::ConnectionClosed)
            }
            Ok(Err(e)) => {
                self.channel = None;
                Err(e)
            }
        }
    }
}

/// Strip an optional `tcp://` prefix.
#[must_use]
pub fn strip_scheme(address: &str) -> &str {
    address.strip_prefix(ADDRESS_SCHEME).unwrap_or(address)
}

/// Parse a bind address such as `tcp://*:9001`, `*:9001` or `127.0.0.1:9001`.
pub fn parse_bind_address(address: &str) -> Result<SocketAddr> {
    let address = strip_scheme(address);
    let normalized = match address.strip_prefix("*:") {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_string(),
    };
    normalized
        .parse()
        .map_err(|e| DiscoError::Config(format!("invalid bind address {address:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_bind_address() {
        assert_eq!(
            parse_bind_address("tcp://*:9001").unwrap(),
            "0.0.0.0:9001".parse().unwrap()
        );
        assert_eq!(
            parse_bind_address("127.0.0.1:9100").unwrap(),
            "127.0.0.1:9100".parse().unwrap()
        );
        assert!(parse_bind_address("tcp://nowhere").is_err());
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("tcp://10.0.0.1:9001"), "10.0.0.1:9001");
        assert_eq!(strip_scheme("10.0.0.1:9001"), "10.0.0.1:9001");
    }

    #[tokio::test]
    async fn test_tcp_connection_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_keys = KeyPair::generate();
        let server_pk = server_keys.public_key();
        let client_keys = Arc::new(KeyPair::generate());
        let client_identity = client_keys.public_hex();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = SecureChannel::accept(stream, &server_keys).await.unwrap();
            let identity = channel.remote_identity();
            let message = channel.recv().await.unwrap().unwrap();
            channel.send(message).await.unwrap();
            identity
        });

        let connector = TcpConnector::new(client_keys).with_server_key(Some(server_pk));
        let mut conn = connector.connect(&format!("tcp://{addr}"));
        let message = vec![Bytes::new(), Bytes::from_static(b"PEERS")];
        conn.send(message.clone()).await.unwrap();
        let echoed = conn
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(echoed, Some(message));
        assert_eq!(server.await.unwrap(), client_identity);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_keys = KeyPair::generate();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = SecureChannel::accept(stream, &server_keys).await.unwrap();
            // Swallow the request without replying.
            let _ = channel.recv().await;
            channel
        });

        let mut conn = TcpConnector::new(Arc::new(KeyPair::generate())).connect(&addr.to_string());
        conn.send(vec![Bytes::new(), Bytes::from_static(b"PEERS")])
            .await
            .unwrap();
        let reply = conn
            .recv_timeout(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(reply.is_none());
        drop(server);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_on_send() {
        // Bind then drop to get a port that refuses connections.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let mut conn = TcpConnector::new(Arc::new(KeyPair::generate()))
            .with_handshake_timeout(Duration::from_millis(500))
            .connect(&addr.to_string());

        assert!(conn.send(vec![Bytes::from_static(b"x")]).await.is_err());
        assert!(conn.recv_timeout(Duration::from_millis(10)).await.is_err());
    }
}
