//! Mutual Ed25519 challenge/response handshake.
//!
//! ```text
//!   server                                   client
//!     │ ── [DISCO/1, server_pk, server_nonce] ──► │
//!     │ ◄── [DISCO/1, client_pk, client_nonce, sig_c] ── │
//!     │ ── [WELCOME, sig_s] ─────────────────────► │
//! ```
//!
//! `sig_c` signs `"client" ‖ server_nonce ‖ client_nonce ‖ server_pk` and
//! `sig_s` signs `"server" ‖ client_nonce ‖ server_nonce ‖ client_pk`, so each
//! side proves possession of its secret key for this connection only. The
//! server learns the client's public key, which becomes the per-message
//! authenticated identity.
//!
//! # Threat model
//!
//! Authentication happens once per connection. Frames after the handshake
//! carry no MAC and no encryption: the identity attached to a request is the
//! one proven at connect time, not a property of the request bytes. An
//! attacker who can inject into or hijack the TCP stream can therefore send
//! PUBLISH/PEERS under the authenticated identity and read every reply.
//! Run the registry on a trusted network, or underneath TLS or a VPN such as
//! WireGuard, when on-path attackers are in scope.

use crate::codec::{Multipart, MultipartCodec};
use crate::error::{DiscoError, Result};
use crate::identity::{KeyPair, verify};
use bytes::Bytes;
use ed25519_dalek::VerifyingKey;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

pub const GREETING: &[u8] = b"DISCO/1";
pub const WELCOME: &[u8] = b"WELCOME";
const NONCE_LEN: usize = 32;

/// Server side: greet, verify the client's proof, answer with our own.
///
/// Returns the client's public key on success.
pub async fn accept<S>(
    framed: &mut Framed<S, MultipartCodec>,
    keys: &KeyPair,
) -> Result<VerifyingKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_nonce = nonce();
    let server_pk = keys.public_key();
    send(
        framed,
        vec![
            Bytes::from_static(GREETING),
            Bytes::copy_from_slice(server_pk.as_bytes()),
            Bytes::copy_from_slice(&server_nonce),
        ],
    )
    .await?;

    let reply = recv(framed).await?;
    let [tag, client_pk, client_nonce, sig_c] = reply.as_slice() else {
        return Err(DiscoError::Handshake(format!(
            "expected 4 hello frames, got {}",
            reply.len()
        )));
    };
    if &tag[..] != GREETING {
        return Err(DiscoError::Handshake("unexpected protocol tag".to_string()));
    }
    let client_pk = public_key(client_pk)?;
    check_nonce(client_nonce)?;

    let client_proof = transcript(b"client", &server_nonce, client_nonce, server_pk.as_bytes());
    verify(&client_pk, &client_proof, sig_c)?;

    let sig_s = keys.sign(&transcript(
        b"server",
        client_nonce,
        &server_nonce,
        client_pk.as_bytes(),
    ));
    send(
        framed,
        vec![
            Bytes::from_static(WELCOME),
            Bytes::copy_from_slice(&sig_s.to_bytes()),
        ],
    )
    .await?;

    Ok(client_pk)
}

/// Client side: answer the greeting and check the server's proof.
///
/// When `expected_server` is set, a server presenting any other key is
/// rejected before we sign anything.
pub async fn connect<S>(
    framed: &mut Framed<S, MultipartCodec>,
    keys: &KeyPair,
    expected_server: Option<&VerifyingKey>,
) -> Result<VerifyingKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = recv(framed).await?;
    let [tag, server_pk, server_nonce] = greeting.as_slice() else {
        return Err(DiscoError::Handshake(format!(
            "expected 3 greeting frames, got {}",
            greeting.len()
        )));
    };
    if &tag[..] != GREETING {
        return Err(DiscoError::Handshake("unexpected protocol tag".to_string()));
    }
    let server_pk = public_key(server_pk)?;
    check_nonce(server_nonce)?;
    if let Some(expected) = expected_server {
        if expected != &server_pk {
            return Err(DiscoError::Handshake(format!(
                "server key {} does not match pinned key",
                hex::encode(server_pk.as_bytes())
            )));
        }
    }

    let client_nonce = nonce();
    let client_pk = keys.public_key();
    let sig_c = keys.sign(&transcript(
        b"client",
        server_nonce,
        &client_nonce,
        server_pk.as_bytes(),
    ));
    send(
        framed,
        vec![
            Bytes::from_static(GREETING),
            Bytes::copy_from_slice(client_pk.as_bytes()),
            Bytes::copy_from_slice(&client_nonce),
            Bytes::copy_from_slice(&sig_c.to_bytes()),
        ],
    )
    .await?;

    let welcome = recv(framed).await?;
    let [tag, sig_s] = welcome.as_slice() else {
        return Err(DiscoError::Handshake("malformed welcome".to_string()));
    };
    if &tag[..] != WELCOME {
        return Err(DiscoError::Handshake("server refused handshake".to_string()));
    }
    let server_proof = transcript(b"server", &client_nonce, server_nonce, client_pk.as_bytes());
    verify(&server_pk, &server_proof, sig_s)?;

    Ok(server_pk)
}

fn transcript(role: &[u8], first: &[u8], second: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(role.len() + first.len() + second.len() + key.len());
    out.extend_from_slice(role);
    out.extend_from_slice(first);
    out.extend_from_slice(second);
    out.extend_from_slice(key);
    out
}

fn nonce() -> [u8; NONCE_LEN] {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn check_nonce(nonce: &Bytes) -> Result<()> {
    if nonce.len() != NONCE_LEN {
        return Err(DiscoError::Handshake(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    Ok(())
}

fn public_key(bytes: &Bytes) -> Result<VerifyingKey> {
    let raw = <[u8; 32]>::try_from(&bytes[..])
        .map_err(|_| DiscoError::Handshake(format!("public key of {} bytes", bytes.len())))?;
    VerifyingKey::from_bytes(&raw).map_err(|e| DiscoError::Handshake(e.to_string()))
}

async fn send<S>(framed: &mut Framed<S, MultipartCodec>, message: Multipart) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(message).await.map_err(DiscoError::from)
}

async fn recv<S>(framed: &mut Framed<S, MultipartCodec>) -> Result<Multipart>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(message)) => Ok(message),
        Some(Err(e)) => Err(DiscoError::from(e)),
        None => Err(DiscoError::ConnectionClosed),
    }
}
