//! Configuration file support.
//!
//! A YAML file may provide any subset of the settings below; command line
//! flags and environment variables override whatever it sets.
//!
//! ```yaml
//! server:
//!   bind: "tcp://*:9999"
//!   public_key_dir: ./public_keys
//!   peer_ttl: 10s
//!   trust_cache: 0s
//! client:
//!   servers: ["tcp://127.0.0.1:9999"]
//!   reply_timeout: 2s
//!   interval: 1s
//! ```

use crate::client::{DEFAULT_PUBLISH_INTERVAL, DEFAULT_REPLY_TIMEOUT};
use crate::error::{DiscoError, Result};
use crate::registry::DEFAULT_PEER_TTL;
use crate::transport::DEFAULT_HANDSHAKE_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory of trusted client public keys.
pub const DEFAULT_PUBLIC_KEY_DIR: &str = "public_keys";

/// Default secret key file.
pub const DEFAULT_PRIVATE_KEY_PATH: &str = "client.key_secret";

/// Default server bind address.
pub const DEFAULT_BIND: &str = "tcp://*:9999";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl DiscoConfig {
    /// Load from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DiscoError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&content)
            .map_err(|e| DiscoError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }
}

/// Registry server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address, e.g. `tcp://*:9999`
    pub bind: String,
    /// Directory holding one public key file per trusted client
    pub public_key_dir: PathBuf,
    /// The server's own secret key
    pub private_key: PathBuf,
    /// How long a PUBLISH keeps a peer listed
    #[serde(with = "humantime_serde")]
    pub peer_ttl: Duration,
    /// How long a loaded trusted set may be reused (0 = reload every request)
    #[serde(with = "humantime_serde")]
    pub trust_cache: Duration,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            public_key_dir: PathBuf::from(DEFAULT_PUBLIC_KEY_DIR),
            private_key: PathBuf::from(DEFAULT_PRIVATE_KEY_PATH),
            peer_ttl: DEFAULT_PEER_TTL,
            trust_cache: Duration::ZERO,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Discovery client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Registry servers, consulted in this order every cycle
    pub servers: Vec<String>,
    /// The client's secret key; its public half is the client's identity
    pub private_key: PathBuf,
    /// Public key the server must present, if pinned
    pub server_key: Option<PathBuf>,
    /// Identity announced in PUBLISH (random UUID when unset)
    pub id: Option<String>,
    /// Port announced in PUBLISH (random in 2000-2020 when unset)
    pub port: Option<u16>,
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Upper bound on dialing plus handshaking; never above `reply_timeout`
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            private_key: PathBuf::from(DEFAULT_PRIVATE_KEY_PATH),
            server_key: None,
            id: None,
            port: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            interval: DEFAULT_PUBLISH_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Bound on connecting to one server.
    ///
    /// Capped at `reply_timeout` so a dead server costs a cycle at most two
    /// reply timeouts, whether it fails at dial time or at request time.
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        self.handshake_timeout.min(self.reply_timeout)
    }

    /// Reject settings the client loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(DiscoError::Config("at least one server is required".to_string()));
        }
        if self.reply_timeout.is_zero() {
            return Err(DiscoError::Config("reply_timeout must be positive".to_string()));
        }
        if self.id.as_deref().is_some_and(str::is_empty) {
            return Err(DiscoError::Config("id must not be empty".to_string()));
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.peer_ttl.is_zero() {
            return Err(DiscoError::Config("peer_ttl must be positive".to_string()));
        }
        Ok(())
    }
}
