//! Per-server connection handle.

use crate::codec::Multipart;
use crate::error::Result;
use crate::transport::{Connection, Connector};
use std::time::Duration;
use tracing::debug;

/// The live connection to one configured server.
///
/// A handle is never removed; when its server stops answering the
/// connection is thrown away and a fresh one takes its place, bumping
/// `generation`. Replies still in flight on the old connection are lost
/// with it, so a late answer can never be mistaken for the next one.
#[derive(Debug)]
pub struct ConnectionHandle<C> {
    server: String,
    generation: u64,
    conn: C,
}

impl<C: Connection> ConnectionHandle<C> {
    pub fn open<K>(connector: &K, server: &str) -> Self
    where
        K: Connector<Connection = C>,
    {
        Self {
            server: server.to_string(),
            generation: 0,
            conn: connector.connect(server),
        }
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// How many times this handle's connection has been recreated.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send one request and wait up to `timeout` for its reply.
    ///
    /// `Ok(None)` means the server stayed silent.
    pub async fn request(
        &mut self,
        frames: Multipart,
        timeout: Duration,
    ) -> Result<Option<Multipart>> {
        self.conn.send(frames).await?;
        self.conn.recv_timeout(timeout).await
    }

    /// Drop the current connection and open a new one to the same server.
    pub fn recreate<K>(&mut self, connector: &K)
    where
        K: Connector<Connection = C>,
    {
        self.conn = connector.connect(&self.server);
        self.generation += 1;
        debug!(server = %self.server, generation = self.generation, "Recreated connection");
    }
}
