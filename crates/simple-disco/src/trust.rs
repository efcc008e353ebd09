//! Trust oracle: decides whether an authenticated identity may use the registry.
//!
//! The trusted set is re-read from its [`TrustStore`] on every request, so
//! deleting a public key file revokes access on the very next request. An
//! unreadable store fails closed.

use crate::error::{DiscoError, Result};
use crate::identity::{SECRET_SUFFIX, parse_public_key};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Source of the currently trusted identity tokens.
pub trait TrustStore: Send + Sync {
    /// Load the full trusted set. Must reflect revocations immediately.
    fn load_trusted_identities(&self) -> Result<HashSet<String>>;
}

/// Trusted identities read from a directory of public key files.
///
/// Every regular, non-hidden file that does not end in `_secret` is expected
/// to hold one hex-encoded Ed25519 public key.
#[derive(Debug, Clone)]
pub struct DirectoryTrustStore {
    dir: PathBuf,
}

impl DirectoryTrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl TrustStore for DirectoryTrustStore {
    fn load_trusted_identities(&self) -> Result<HashSet<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            DiscoError::TrustStoreUnavailable(format!("{}: {}", self.dir.display(), e))
        })?;

        let mut trusted = HashSet::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| DiscoError::TrustStoreUnavailable(e.to_string()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.ends_with(SECRET_SUFFIX) {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            match fs::read_to_string(&path)
                .map_err(DiscoError::from)
                .and_then(|content| parse_public_key(&content))
            {
                Ok(key) => {
                    trusted.insert(hex::encode(key.as_bytes()));
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unreadable public key");
                }
            }
        }
        Ok(trusted)
    }
}

/// In-memory trust store; clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct StaticTrustStore {
    identities: Arc<RwLock<HashSet<String>>>,
    unavailable: Arc<RwLock<bool>>,
}

impl StaticTrustStore {
    pub fn new<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identities: Arc::new(RwLock::new(
                identities.into_iter().map(Into::into).collect(),
            )),
            unavailable: Arc::default(),
        }
    }

    pub fn trust(&self, identity: impl Into<String>) {
        if let Ok(mut set) = self.identities.write() {
            set.insert(identity.into());
        }
    }

    pub fn revoke(&self, identity: &str) {
        if let Ok(mut set) = self.identities.write() {
            set.remove(identity);
        }
    }

    /// Make subsequent loads fail, simulating an unreadable backing store.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut flag) = self.unavailable.write() {
            *flag = unavailable;
        }
    }
}

impl TrustStore for StaticTrustStore {
    fn load_trusted_identities(&self) -> Result<HashSet<String>> {
        let unavailable = self.unavailable.read().map(|f| *f).unwrap_or(true);
        if unavailable {
            return Err(DiscoError::TrustStoreUnavailable(
                "static store marked unavailable".to_string(),
            ));
        }
        self.identities
            .read()
            .map(|set| set.clone())
            .map_err(|_| DiscoError::TrustStoreUnavailable("lock poisoned".to_string()))
    }
}

/// Read-through gate over a [`TrustStore`].
///
/// `cache_window` of zero (the default) reloads on every call. A non-zero
/// window reuses the last successful load for that long.
pub struct TrustOracle {
    store: Box<dyn TrustStore>,
    cache_window: Duration,
    cached: Option<(Instant, HashSet<String>)>,
}

impl std::fmt::Debug for TrustOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustOracle")
            .field("cache_window", &self.cache_window)
            .finish_non_exhaustive()
    }
}

impl TrustOracle {
    pub fn new(store: impl TrustStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            cache_window: Duration::ZERO,
            cached: None,
        }
    }

    #[must_use]
    pub fn with_cache_window(mut self, window: Duration) -> Self {
        self.cache_window = window;
        self
    }

    /// Whether `identity` is in the trusted set right now.
    pub fn is_trusted(&mut self, identity: &str) -> bool {
        self.is_trusted_at(identity, Instant::now())
    }

    pub fn is_trusted_at(&mut self, identity: &str, now: Instant) -> bool {
        if let Some((loaded_at, set)) = &self.cached {
            if now.saturating_duration_since(*loaded_at) < self.cache_window {
                return set.contains(identity);
            }
        }

        match self.store.load_trusted_identities() {
            Ok(set) => {
                debug!(trusted = set.len(), "Reloaded trusted identities");
                let trusted = set.contains(identity);
                if !self.cache_window.is_zero() {
                    self.cached = Some((now, set));
                }
                trusted
            }
            Err(e) => {
                warn!(error = %e, "Trust check failed, treating sender as untrusted");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[test]
    fn test_static_store_revocation_is_immediate() {
        let store = StaticTrustStore::new(["alice"]);
        let mut oracle = TrustOracle::new(store.clone());

        assert!(oracle.is_trusted("alice"));
        assert!(!oracle.is_trusted("bob"));

        store.revoke("alice");
        store.trust("bob");
        assert!(!oracle.is_trusted("alice"));
        assert!(oracle.is_trusted("bob"));
    }

    #[test]
    fn test_unavailable_store_fails_closed() {
        let store = StaticTrustStore::new(["alice"]);
        let mut oracle = TrustOracle::new(store.clone());

        store.set_unavailable(true);
        assert!(!oracle.is_trusted("alice"));

        store.set_unavailable(false);
        assert!(oracle.is_trusted("alice"));
    }

    #[test]
    fn test_cache_window_delays_revocation() {
        let store = StaticTrustStore::new(["alice"]);
        let mut oracle =
            TrustOracle::new(store.clone()).with_cache_window(Duration::from_secs(5));
        let t = Instant::now();

        assert!(oracle.is_trusted_at("alice", t));
        store.revoke("alice");
        assert!(oracle.is_trusted_at("alice", t + Duration::from_secs(1)));
        assert!(!oracle.is_trusted_at("alice", t + Duration::from_secs(5)));
    }

    #[test]
    fn test_directory_store_reads_public_keys() {
        let dir = tempfile::tempdir().unwrap();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        alice.save(dir.path().join("alice.key")).unwrap();
        fs::write(dir.path().join("bob.key"), bob.public_hex()).unwrap();
        fs::write(dir.path().join("garbage.key"), "not hex").unwrap();
        fs::write(dir.path().join(".hidden"), bob.public_hex()).unwrap();

        let store = DirectoryTrustStore::new(dir.path());
        let trusted = store.load_trusted_identities().unwrap();

        assert_eq!(trusted.len(), 2);
        assert!(trusted.contains(&alice.public_hex()));
        assert!(trusted.contains(&bob.public_hex()));
    }

    #[test]
    fn test_directory_store_revocation_by_delete() {
        let dir = tempfile::tempdir().unwrap();
        let alice = KeyPair::generate();
        let key_path = dir.path().join("alice.key");
        fs::write(&key_path, alice.public_hex()).unwrap();

        let mut oracle = TrustOracle::new(DirectoryTrustStore::new(dir.path()));
        assert!(oracle.is_trusted(&alice.public_hex()));

        fs::remove_file(&key_path).unwrap();
        assert!(!oracle.is_trusted(&alice.public_hex()));
    }

    #[test]
    fn test_missing_directory_is_unavailable() {
        let store = DirectoryTrustStore::new("/nonexistent/simple-disco/keys");
        assert!(matches!(
            store.load_trusted_identities(),
            Err(DiscoError::TrustStoreUnavailable(_))
        ));
        let mut oracle = TrustOracle::new(store);
        assert!(!oracle.is_trusted("anyone"));
    }
}
