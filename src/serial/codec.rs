//! Newline framing for the ASCII shell.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Default cap on an unterminated frame before it gets trimmed.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// Splits the byte stream on `\n` into trimmed, non-empty text lines.
///
/// Bytes after the last terminator stay buffered until the next read. Invalid
/// UTF-8 is replaced rather than rejected, so a glitch on the wire costs one
/// line, not the connection.
#[derive(Debug)]
pub struct LineCodec {
    next_index: usize,
    max_length: usize,
    trimmed: u64,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self { next_index: 0, max_length: max_length.max(2), trimmed: 0 }
    }

    /// Number of times an overlong partial frame was cut back.
    pub fn trimmed_frames(&self) -> u64 {
        self.trimmed
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            match buf[self.next_index..].iter().position(|b| *b == b'\n') {
                Some(offset) => {
                    let end = self.next_index + offset;
                    let frame = buf.split_to(end + 1);
                    self.next_index = 0;
                    let line = String::from_utf8_lossy(&frame[..end]).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(line));
                }
                None => {
                    if buf.len() > self.max_length {
                        // keep the newest half; the head of an endless frame is garbage anyway
                        let keep = self.max_length / 2;
                        let drop_len = buf.len() - keep;
                        let _ = buf.split_to(drop_len);
                        self.trimmed += 1;
                        log::debug!("Trimmed {} bytes of unterminated input", drop_len);
                    }
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None => {
                // a frame cut off by EOF is never delivered
                buf.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}
