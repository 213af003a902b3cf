//! Streaming frame decoding
//!
//! Handshake messages are decoded from a growing byte buffer. A decoder that
//! has not seen enough input reports exactly how many more bytes it needs, so
//! [`read_frame`] never pulls bytes past the end of the current message off
//! the socket. Whatever follows (auth sub-negotiation, the request, early
//! relay payload) stays in the transport for the next stage.

use super::consts::*;
use crate::error::Socks5Error;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Outcome of a decode attempt over the bytes buffered so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// At least this many more bytes are required
    Incomplete(usize),
    /// A full message was decoded from the whole buffer
    Complete(T),
}

/// A handshake message that can be decoded incrementally
pub trait Frame: Sized {
    /// Decode from the bytes received so far.
    ///
    /// Implementations must return `Incomplete(n)` with `n` no larger than the
    /// number of bytes remaining in the message, and must only return
    /// `Complete` once `buf` holds exactly one message.
    fn decode(buf: &[u8]) -> Result<Decoded<Self>, Socks5Error>;
}

/// Read one frame from the stream, however the bytes are fragmented.
pub async fn read_frame<F, S>(stream: &mut S) -> Result<F, Socks5Error>
where
    F: Frame,
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(32);
    loop {
        match F::decode(&buf)? {
            Decoded::Complete(frame) => return Ok(frame),
            Decoded::Incomplete(needed) => {
                let start = buf.len();
                buf.resize(start + needed, 0);
                stream.read_exact(&mut buf[start..]).await?;
            }
        }
    }
}

/// Client greeting: `VER NMETHODS METHODS...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Method identifiers offered by the client, in the order sent
    pub methods: Vec<u8>,
}

impl Frame for Greeting {
    fn decode(buf: &[u8]) -> Result<Decoded<Self>, Socks5Error> {
        if let Some(&version) = buf.first() {
            if version != SOCKS5_VERSION {
                return Err(Socks5Error::UnsupportedVersion(version));
            }
        }
        if buf.len() < 2 {
            return Ok(Decoded::Incomplete(2 - buf.len()));
        }

        let total = 2 + buf[1] as usize;
        if buf.len() < total {
            return Ok(Decoded::Incomplete(total - buf.len()));
        }

        Ok(Decoded::Complete(Greeting {
            methods: buf[2..total].to_vec(),
        }))
    }
}
