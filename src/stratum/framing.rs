//! Newline framing for inbound pool data

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::warn;

/// Longest accepted inbound line in bytes
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Per-connection partial-line buffer
///
/// Carriage returns are dropped wherever they appear. A partial line stays
/// buffered across reads until its newline arrives.
pub struct LineBuffer {
    codec: LinesCodec,
    buf: BytesMut,
    max_len: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max_len(MAX_LINE_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            codec: LinesCodec::new_with_max_length(max_len),
            buf: BytesMut::with_capacity(1024),
            max_len,
        }
    }

    /// Append raw bytes and return every complete, non-empty line
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.reserve(data.len());
        for chunk in data.split(|b| *b == b'\r') {
            self.buf.extend_from_slice(chunk);
        }

        let mut lines = Vec::new();
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(line)) if line.is_empty() => continue,
                Ok(Some(line)) => lines.push(line),
                Ok(None) => break,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(max_len = self.max_len, "Discarding oversized line");
                }
                Err(LinesCodecError::Io(e)) => {
                    warn!(error = %e, "Discarding undecodable line");
                }
            }
        }
        lines
    }

    /// Bytes of an incomplete line currently buffered
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial line
    pub fn reset(&mut self) {
        self.codec = LinesCodec::new_with_max_length(self.max_len);
        self.buf.clear();
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}
