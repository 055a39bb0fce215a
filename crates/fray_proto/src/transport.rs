//! Length-prefixed JSON framing over a TCP stream.
//!
//! Every frame is a big-endian `u32` byte count followed by one JSON-encoded
//! [`Message`]. Frames above [`MAX_FRAME_BYTES`] are refused outright rather
//! than letting a corrupt length prefix drive an allocation.

use crate::message::Message;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use thiserror::Error;

/// Upper bound on a single frame. Scene syncs for heavy scenes are large,
/// but anything past this is a corrupt prefix, not data.
pub const MAX_FRAME_BYTES: u32 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("protocol version mismatch (ours {ours}, theirs {theirs})")]
    Version { ours: u32, theirs: u32 },
    #[error("peer closed the connection")]
    Closed,
    #[error("refusing oversized frame of {len} bytes")]
    Oversized { len: u32 },
    #[error("unexpected message, wanted {expected}")]
    Unexpected { expected: &'static str },
    #[error("{0}")]
    Session(String),
}

/// A message-framed wrapper around one TCP connection.
pub struct FramedStream {
    stream: TcpStream,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> Self {
        // Tile results are latency-sensitive; don't let Nagle batch them.
        stream.set_nodelay(true).ok();
        FramedStream { stream }
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }

    pub fn send(&mut self, msg: &Message) -> Result<(), ProtoError> {
        let payload = serde_json::to_vec(msg)?;
        let len = payload.len() as u32;
        if len > MAX_FRAME_BYTES {
            return Err(ProtoError::Oversized { len });
        }
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn recv(&mut self) -> Result<Message, ProtoError> {
        let mut prefix = [0u8; 4];
        read_exact_or_closed(&mut self.stream, &mut prefix)?;
        let len = u32::from_be_bytes(prefix);
        if len > MAX_FRAME_BYTES {
            return Err(ProtoError::Oversized { len });
        }
        let mut payload = vec![0u8; len as usize];
        read_exact_or_closed(&mut self.stream, &mut payload)?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

fn read_exact_or_closed(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), ProtoError> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ProtoError::Closed),
        Err(e) => Err(ProtoError::Io(e)),
    }
}
