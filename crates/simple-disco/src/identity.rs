//! Ed25519 key material and key files.
//!
//! A key pair lives on disk as two hex-encoded files: `<name>` holds the
//! public key and `<name>_secret` the secret key. The hex public key is also
//! the identity token the server authorizes against its trust directory.

use crate::error::{DiscoError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Suffix distinguishing the secret half of a key pair on disk.
pub const SECRET_SUFFIX: &str = "_secret";

/// An Ed25519 signing key with its public half.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh random key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Build a key pair from raw secret bytes.
    #[must_use]
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// The public verifying key.
    #[must_use]
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Lowercase hex of the public key; the identity token on the wire.
    #[must_use]
    pub fn public_hex(&self) -> String {
        hex::encode(self.public_key().as_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Load a key pair from a secret key file (`*_secret` or the bare name).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let (_, secret_path) = key_file_paths(path.as_ref());
        let content = fs::read_to_string(&secret_path)?;
        let bytes = decode_key_hex(&content)?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    /// Load the key pair at `path`, generating and saving one first if absent.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let (_, secret_path) = key_file_paths(path.as_ref());
        if !secret_path.exists() {
            keygen(path.as_ref())?;
        }
        Self::load(path)
    }

    /// Write both halves of the key pair. Refuses to overwrite existing files.
    ///
    /// The secret file is created with owner-only permissions; it is never
    /// readable by others, not even briefly.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let (public_path, secret_path) = key_file_paths(path.as_ref());
        if public_path.exists() {
            return Err(already_exists(&public_path));
        }

        if let Some(parent) = secret_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let secret = format!("{}\n", hex::encode(self.signing_key.to_bytes()));
        create_new(&secret_path, 0o600, &secret)?;
        create_new(&public_path, 0o644, &format!("{}\n", self.public_hex()))?;
        Ok(())
    }
}

/// Create a key pair at `path` unless one already exists.
///
/// Returns `true` when new files were written.
pub fn keygen(path: impl AsRef<Path>) -> Result<bool> {
    let (public_path, secret_path) = key_file_paths(path.as_ref());
    if public_path.exists() || secret_path.exists() {
        info!(path = %public_path.display(), "Key already exists, not creating keys");
        return Ok(false);
    }

    KeyPair::generate().save(&secret_path)?;
    info!(
        public = %public_path.display(),
        secret = %secret_path.display(),
        "Keys written"
    );
    Ok(true)
}

/// Resolve `(public, secret)` file paths for a key pair.
///
/// `client.key_secret` and `client.key` both resolve to
/// `("client.key", "client.key_secret")`.
#[must_use]
pub fn key_file_paths(path: &Path) -> (PathBuf, PathBuf) {
    let raw = path.to_string_lossy();
    match raw.strip_suffix(SECRET_SUFFIX) {
        Some(public) => (PathBuf::from(public), path.to_path_buf()),
        None => (path.to_path_buf(), PathBuf::from(format!("{raw}{SECRET_SUFFIX}"))),
    }
}

/// Parse a public key file's content into a verifying key.
pub fn parse_public_key(content: &str) -> Result<VerifyingKey> {
    let bytes = decode_key_hex(content)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| DiscoError::InvalidKey(e.to_string()))
}

/// Load a public key file (used to pin the server key on the client).
pub fn load_public_key(path: impl AsRef<Path>) -> Result<VerifyingKey> {
    parse_public_key(&fs::read_to_string(path)?)
}

/// Verify an Ed25519 signature over `message`.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> Result<()> {
    let signature = Signature::from_slice(signature)
        .map_err(|e| DiscoError::Handshake(format!("bad signature encoding: {e}")))?;
    key.verify(message, &signature)
        .map_err(|_| DiscoError::Handshake("signature verification failed".to_string()))
}

/// Decode the first non-comment line of a key file as 32 hex bytes.
fn decode_key_hex(content: &str) -> Result<[u8; 32]> {
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| DiscoError::InvalidKey("empty key file".to_string()))?;

    let bytes = hex::decode(line).map_err(|e| DiscoError::InvalidKey(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        DiscoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
    })
}

/// Create `path` exclusively, failing if it already exists.
fn create_new(path: &Path, mode: u32, content: &str) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => already_exists(path),
        _ => DiscoError::Io(e),
    })?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn already_exists(path: &Path) -> DiscoError {
    DiscoError::InvalidKey(format!("{} already exists", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_file_paths() {
        let (public, secret) = key_file_paths(Path::new("keys/client.key_secret"));
        assert_eq!(public, PathBuf::from("keys/client.key"));
        assert_eq!(secret, PathBuf::from("keys/client.key_secret"));

        let (public, secret) = key_file_paths(Path::new("server.key"));
        assert_eq!(public, PathBuf::from("server.key"));
        assert_eq!(secret, PathBuf::from("server.key_secret"));
    }

    #[test]
    fn test_keygen_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.key_secret");

        assert!(keygen(&path).unwrap());
        assert!(!keygen(&path).unwrap(), "second keygen must not overwrite");

        let pair = KeyPair::load(&path).unwrap();
        let public = load_public_key(dir.path().join("client.key")).unwrap();
        assert_eq!(public, pair.public_key());
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("node.key_secret");

        let first = KeyPair::load_or_generate(&path).unwrap();
        let second = KeyPair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_hex(), second.public_hex());
    }

    #[test]
    fn test_sign_and_verify() {
        let pair = KeyPair::generate();
        let sig = pair.sign(b"challenge");
        assert!(verify(&pair.public_key(), b"challenge", &sig.to_bytes()).is_ok());
        assert!(verify(&pair.public_key(), b"other", &sig.to_bytes()).is_err());
        assert!(verify(&pair.public_key(), b"challenge", &[0u8; 10]).is_err());
    }

    #[test]
    fn test_parse_public_key_skips_comments() {
        let pair = KeyPair::generate();
        let content = format!("# public key\n\n{}\n", pair.public_hex());
        assert_eq!(parse_public_key(&content).unwrap(), pair.public_key());

        assert!(matches!(
            parse_public_key("abcd"),
            Err(DiscoError::InvalidKey(_))
        ));
        assert!(parse_public_key("").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.key_secret");
        KeyPair::generate().save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_save_never_overwrites_secret() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("k.key_secret");
        fs::write(&secret, "existing\n").unwrap();

        let result = KeyPair::generate().save(&secret);
        assert!(matches!(result, Err(DiscoError::InvalidKey(_))));
        assert_eq!(fs::read_to_string(&secret).unwrap(), "existing\n");
        assert!(
            !dir.path().join("k.key").exists(),
            "public half must not be written when the secret half is refused"
        );
    }
}
