//! Stream scanners that reassemble Modbus frames from byte chunks
//!
//! Both scanners accumulate chunks into a buffer and extract every complete,
//! checksum-valid frame per push. Invalid data is skipped by
//! resynchronisation: RTU drops one byte at a time until a plausible frame
//! start validates, ASCII skips to the next `:` lead-in.

use tracing::trace;

use super::frame::{self, MIN_RTU_FRAME_LEN};

/// Stateful scanner for Modbus RTU byte streams
#[derive(Debug, Default)]
pub struct RtuScanner {
    buffer: Vec<u8>,
}

impl RtuScanner {
    /// Create an empty scanner
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk and return the complete CRC-valid frames it unlocked
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.buffer.len() >= MIN_RTU_FRAME_LEN {
            let Some(expected) = frame::expected_rtu_length(&self.buffer) else {
                self.drop_first_byte();
                continue;
            };
            if self.buffer.len() < expected {
                break;
            }
            if frame::parse_rtu(&self.buffer[..expected]).is_ok() {
                frames.push(self.buffer.drain(..expected).collect());
            } else {
                self.drop_first_byte();
            }
        }

        frames
    }

    /// Number of bytes waiting for more data
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any accumulated partial data
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn drop_first_byte(&mut self) {
        trace!("resync: dropping byte {:02X}", self.buffer[0]);
        self.buffer.drain(..1);
    }
}

/// Stateful scanner for Modbus ASCII character streams
///
/// Yields the decoded frame bytes (LRC already stripped) for every valid
/// `:`..CRLF sequence.
#[derive(Debug, Default)]
pub struct AsciiScanner {
    buffer: String,
}

impl AsciiScanner {
    /// Create an empty scanner
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk and return the decoded frames it unlocked
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();

        loop {
            let Some(start) = self.buffer.find(':') else {
                // No frame can start in colon-free data
                self.buffer.clear();
                break;
            };
            let Some(offset) = self.buffer[start..].find("\r\n") else {
                self.buffer.drain(..start);
                break;
            };
            let end = start + offset + 2;
            match frame::decode_ascii_frame(&self.buffer[start..end]) {
                Ok(decoded) => frames.push(decoded),
                Err(error) => trace!(%error, "resync: skipping ASCII candidate"),
            }
            self.buffer.drain(..end);
        }

        frames
    }

    /// Number of characters waiting for more data
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any accumulated partial data
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
