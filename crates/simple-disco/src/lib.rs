//! simple-disco: authenticated peer discovery
//!
//! Clients periodically announce an identity and a reachable port to one or
//! more registry servers and ask each server for the peers it currently
//! knows. Servers keep a short-lived membership list and only talk to
//! clients whose public key is in their trust store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐                 ┌────────────────────────────────┐
//! │        DiscoClient       │   handshake +   │         RegistryServer         │
//! │                          │  framed frames  │                                │
//! │  for each server:        │ ──────────────► │  connection tasks              │
//! │    PUBLISH id port       │                 │        │ Inbound               │
//! │    PEERS                 │ ◄────────────── │        ▼                       │
//! │  merge (later server     │   OK / JSON /   │  Dispatcher ──► TrustOracle    │
//! │  wins), publish view     │   ERROR reason  │        │       (fail closed)   │
//! │                          │                 │        ▼                       │
//! │  timeout → recreate      │                 │  PeerRegistry (TTL eviction)   │
//! └──────────────────────────┘                 └────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! simple-disco keygen --private-key client.key_secret
//! cp client.key public_keys/
//! simple-disco server tcp://*:9999
//! simple-disco client tcp://127.0.0.1:9999 tcp://127.0.0.1:9998
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
pub mod trust;

pub use client::{CycleReport, DiscoClient, PeerView};
pub use config::{ClientConfig, DiscoConfig, ServerConfig};
pub use error::{DiscoError, Result};
pub use identity::KeyPair;
pub use protocol::{Command, Reply};
pub use registry::{Peer, PeerRegistry};
pub use server::{Dispatcher, RegistryServer};
pub use transport::{Connection, Connector, TcpConnector};
pub use trust::{DirectoryTrustStore, StaticTrustStore, TrustOracle, TrustStore};
