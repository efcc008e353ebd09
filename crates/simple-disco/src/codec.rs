//! Multipart message framing on top of `LengthDelimitedCodec`.
//!
//! Each message is one length-delimited frame whose body is a sequence of
//! parts, every part prefixed with its own u32 big-endian length:
//!
//! ```text
//! ┌──────────┬──────────┬─────────┬──────────┬─────────┬─────┐
//! │ body len │ part len │ part 0  │ part len │ part 1  │ ... │
//! └──────────┴──────────┴─────────┴──────────┴─────────┴─────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest message accepted from the wire.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A message is an ordered list of frames.
pub type Multipart = Vec<Bytes>;

/// Codec turning a byte stream into [`Multipart`] messages.
#[derive(Debug)]
pub struct MultipartCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MultipartCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_MESSAGE_SIZE)
                .new_codec(),
        }
    }
}

impl Decoder for MultipartCodec {
    type Item = Multipart;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(body) => split_parts(body.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Multipart> for MultipartCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Multipart, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size: usize = item.iter().map(|p| 4 + p.len()).sum();
        let mut body = BytesMut::with_capacity(size);
        for part in &item {
            let len = u32::try_from(part.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "frame part too large")
            })?;
            body.put_u32(len);
            body.put_slice(part);
        }
        self.inner.encode(body.freeze(), dst)
    }
}

fn split_parts(mut body: Bytes) -> io::Result<Multipart> {
    let mut parts = Vec::new();
    while body.has_remaining() {
        if body.remaining() < 4 {
            return Err(truncated());
        }
        let len = body.get_u32() as usize;
        if body.remaining() < len {
            return Err(truncated());
        }
        parts.push(body.split_to(len));
    }
    Ok(parts)
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "truncated multipart frame")
}
