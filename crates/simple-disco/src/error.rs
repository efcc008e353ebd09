//! Error types shared by the registry server and client.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the discovery registry.
#[derive(Error, Debug)]
pub enum DiscoError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Request was authorized but could not be decoded into a known command.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The trust store could not be read; callers fail closed.
    #[error("trust store unavailable: {0}")]
    TrustStoreUnavailable(String),

    /// A single-server client could not reach its only server.
    #[error("server {0} is unreachable")]
    ServerUnreachable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DiscoError>;
