//! Stream framing and payload decoding

use bytes::{Buf, BytesMut};

use crate::connection::Payload;
use crate::error::{LinkError, Result};
use crate::params::Terminator;

/// Cuts a byte stream into frames according to a [`Terminator`].
///
/// Incomplete trailing data stays buffered until more bytes arrive.
#[derive(Debug)]
pub struct FrameSplitter {
    terminator: Terminator,
    buffer: BytesMut,
}

impl FrameSplitter {
    pub fn new(terminator: Terminator) -> Self {
        Self {
            terminator,
            buffer: BytesMut::new(),
        }
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append `chunk` and return every frame completed by it.
    ///
    /// Without a terminator the chunk is returned unchanged as one frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        if chunk.is_empty() {
            return Vec::new();
        }

        match &self.terminator {
            Terminator::None | Terminator::Length(0) => vec![chunk.to_vec()],
            Terminator::Length(len) => {
                let len = *len;
                self.buffer.extend_from_slice(chunk);
                let mut frames = Vec::new();
                while self.buffer.len() >= len {
                    frames.push(self.buffer.split_to(len).to_vec());
                }
                frames
            },
            Terminator::Bytes(term) => {
                self.buffer.extend_from_slice(chunk);
                let mut frames = Vec::new();
                while let Some(pos) = find_subsequence(&self.buffer, term) {
                    frames.push(self.buffer.split_to(pos + term.len()).to_vec());
                }
                frames
            },
        }
    }

    /// Hand out buffered bytes, leaving the buffer empty
    pub fn take_pending(&mut self) -> Vec<u8> {
        let pending = self.buffer.to_vec();
        self.buffer.advance(pending.len());
        pending
    }
}

/// Position of the first occurrence of `needle` in `haystack`
pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Strict decoding of one received frame
pub fn decode_frame(bytes: Vec<u8>, binary_mode: bool) -> Result<Payload> {
    if binary_mode {
        return Ok(Payload::Binary(bytes));
    }
    let text = String::from_utf8(bytes).map_err(|e| LinkError::decode(e.to_string()))?;
    Ok(Payload::Text(text.trim().to_string()))
}

/// Lossy decoding of a reply, invalid sequences become U+FFFD
pub fn decode_reply(bytes: Vec<u8>, binary_mode: bool) -> Payload {
    if binary_mode {
        return Payload::Binary(bytes);
    }
    Payload::Text(String::from_utf8_lossy(&bytes).trim().to_string())
}
