//! Registry wire protocol.
//!
//! Requests arrive at the dispatch loop as
//! `[routing_id, "", COMMAND, arg...]` and replies leave as
//! `[routing_id, "", payload]`. Commands are decoded once into [`Command`];
//! anything that does not match a variant is a malformed request.

use crate::error::{DiscoError, Result};
use bytes::Bytes;

pub const CMD_PUBLISH: &str = "PUBLISH";
pub const CMD_PEERS: &str = "PEERS";
/// Older clients ask for the peer list with `VALUES`.
pub const CMD_VALUES: &str = "VALUES";

/// Payload acknowledging a PUBLISH.
pub const REPLY_OK: &str = "OK";
/// Prefix of every error payload.
pub const REPLY_ERROR_PREFIX: &str = "ERROR ";

/// Longest identity a PUBLISH may announce, in bytes.
pub const MAX_IDENTITY_LEN: usize = 256;

/// A decoded registry command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Announce `uuid` reachable on `port` at the sender's observed address.
    Publish { uuid: String, port: u16 },
    /// Ask for the current peer list.
    Peers,
}

impl Command {
    /// Decode `[COMMAND, arg...]` (envelope already stripped).
    pub fn decode(frames: &[Bytes]) -> Result<Self> {
        let (name, args) = frames
            .split_first()
            .ok_or_else(|| DiscoError::MalformedRequest("missing command".to_string()))?;

        match (&name[..], args) {
            (b"PUBLISH", [uuid, port]) => {
                let uuid = utf8(uuid, "uuid")?;
                if uuid.is_empty() {
                    return Err(DiscoError::MalformedRequest("empty uuid".to_string()));
                }
                if uuid.len() > MAX_IDENTITY_LEN {
                    return Err(DiscoError::MalformedRequest(format!(
                        "uuid of {} bytes exceeds {MAX_IDENTITY_LEN}",
                        uuid.len()
                    )));
                }
                let port = utf8(port, "port")?;
                let port = port.trim().parse::<u16>().map_err(|_| {
                    DiscoError::MalformedRequest(format!("invalid port {port:?}"))
                })?;
                Ok(Command::Publish {
                    uuid: uuid.to_string(),
                    port,
                })
            }
            (b"PUBLISH", _) => Err(DiscoError::MalformedRequest(format!(
                "PUBLISH expects 2 arguments, got {}",
                args.len()
            ))),
            (b"PEERS" | b"VALUES", []) => Ok(Command::Peers),
            (b"PEERS" | b"VALUES", _) => Err(DiscoError::MalformedRequest(format!(
                "PEERS expects no arguments, got {}",
                args.len()
            ))),
            (other, _) => Err(DiscoError::MalformedRequest(format!(
                "unknown command {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Client-side frames for this command, delimiter included.
    #[must_use]
    pub fn to_frames(&self) -> Vec<Bytes> {
        match self {
            Command::Publish { uuid, port } => vec![
                Bytes::new(),
                Bytes::from_static(CMD_PUBLISH.as_bytes()),
                Bytes::from(uuid.clone()),
                Bytes::from(port.to_string()),
            ],
            Command::Peers => vec![Bytes::new(), Bytes::from_static(CMD_PEERS.as_bytes())],
        }
    }
}

/// A reply payload from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Peers(Vec<(String, String)>),
    Error(String),
}

impl Reply {
    /// Encode the payload frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Reply::Ok => Bytes::from_static(REPLY_OK.as_bytes()),
            // Serializing a Vec of string pairs cannot fail.
            Reply::Peers(peers) => Bytes::from(serde_json::to_vec(peers).unwrap_or_default()),
            Reply::Error(reason) => Bytes::from(format!("{REPLY_ERROR_PREFIX}{reason}")),
        }
    }

    /// Interpret a payload received in answer to a PUBLISH.
    pub fn decode_publish(payload: &[u8]) -> Reply {
        match payload {
            b"OK" => Reply::Ok,
            other => Reply::Error(error_reason(other)),
        }
    }

    /// Interpret a payload received in answer to a PEERS request.
    pub fn decode_peers(payload: &[u8]) -> Reply {
        if payload.starts_with(REPLY_ERROR_PREFIX.as_bytes()) {
            return Reply::Error(error_reason(payload));
        }
        match serde_json::from_slice::<Vec<(String, String)>>(payload) {
            Ok(peers) => Reply::Peers(peers),
            Err(e) => Reply::Error(format!("undecodable peer list: {e}")),
        }
    }
}

/// Strip the `""` delimiter from a client-side reply, returning the payload.
pub fn strip_delimiter(mut frames: Vec<Bytes>) -> Result<Bytes> {
    if frames.len() != 2 || !frames[0].is_empty() {
        return Err(DiscoError::MalformedRequest(format!(
            "expected [\"\", payload], got {} frames",
            frames.len()
        )));
    }
    Ok(frames.swap_remove(1))
}

fn utf8<'a>(frame: &'a Bytes, field: &str) -> Result<&'a str> {
    std::str::from_utf8(frame)
        .map_err(|_| DiscoError::MalformedRequest(format!("{field} is not UTF-8")))
}

fn error_reason(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    text.strip_prefix(REPLY_ERROR_PREFIX)
        .unwrap_or(text.as_ref())
        .to_string()
}
