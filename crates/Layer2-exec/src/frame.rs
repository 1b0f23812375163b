//! NDJSON frame parser for the tool's response channel
//!
//! The tool writes one JSON document per line. Reads from the pipe arrive in
//! arbitrary chunks, so a message (or a multi-byte UTF-8 character inside it)
//! may be split across any number of reads. Lines are cut on the `\n` byte
//! before any text decoding happens; since `\n` never occurs inside a
//! multi-byte UTF-8 sequence, split characters are reassembled untouched.
//!
//! Two independent limits protect the process:
//! - a per-message limit on each complete line
//! - a buffer limit on the retained, not yet terminated fragment
//!
//! Exceeding either clears all buffered state and returns a protocol error,
//! after which the parser accepts new input normally. Lines that are not
//! valid JSON are logged and skipped.

use conduit_foundation::{Error, ParserConfig, Result};
use futures::Stream;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{trace, warn};

const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// Bytes of a malformed line included in the warning
const PREVIEW_BYTES: usize = 80;

/// Parser counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub messages: u64,
    pub malformed: u64,
    pub protocol_errors: u64,
    pub bytes_consumed: u64,
}

/// Incremental NDJSON decoder
#[derive(Debug)]
pub struct FrameParser {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to contain no newline
    scanned: usize,
    max_message_bytes: usize,
    max_buffer_bytes: usize,
    stats: FrameStats,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_BUFFER_BYTES)
    }

    pub fn with_limits(max_message_bytes: usize, max_buffer_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_message_bytes,
            max_buffer_bytes,
            stats: FrameStats::default(),
        }
    }

    pub fn from_config(config: &ParserConfig) -> Self {
        Self::with_limits(config.max_message_bytes, config.max_buffer_bytes)
    }

    /// Feed a chunk and return every message completed by it, in order.
    pub fn consume(&mut self, chunk: &[u8]) -> Result<Vec<Value>> {
        self.stats.bytes_consumed += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;

        while let Some(offset) = self.buffer[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + offset;
            let line = strip_cr(&self.buffer[start..end]);

            if line.len() > self.max_message_bytes {
                let size = line.len();
                return Err(self.violation(Error::MessageTooLarge {
                    size,
                    limit: self.max_message_bytes,
                }));
            }

            match decode_line(line) {
                Decoded::Message(value) => {
                    self.stats.messages += 1;
                    messages.push(value);
                }
                Decoded::Blank => {}
                Decoded::Malformed => self.stats.malformed += 1,
            }

            start = end + 1;
            search_from = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_buffer_bytes {
            let size = self.buffer.len();
            return Err(self.violation(Error::BufferOverflow {
                size,
                limit: self.max_buffer_bytes,
            }));
        }

        trace!(
            messages = messages.len(),
            retained = self.buffer.len(),
            "Consumed frame chunk"
        );
        Ok(messages)
    }

    /// Decode whatever is left once the stream has ended.
    ///
    /// A final message without a trailing newline is still delivered. The
    /// parser is reset afterwards.
    pub fn finish(&mut self) -> Result<Option<Value>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let line = strip_cr(&self.buffer);
        if line.len() > self.max_message_bytes {
            let size = line.len();
            return Err(self.violation(Error::MessageTooLarge {
                size,
                limit: self.max_message_bytes,
            }));
        }

        let decoded = decode_line(line);
        self.clear_buffer();
        match decoded {
            Decoded::Message(value) => {
                self.stats.messages += 1;
                Ok(Some(value))
            }
            Decoded::Blank => Ok(None),
            Decoded::Malformed => {
                self.stats.malformed += 1;
                Ok(None)
            }
        }
    }

    /// Discard buffered state and return to the initial condition.
    pub fn close(&mut self) {
        self.clear_buffer();
        self.stats = FrameStats::default();
    }

    /// Bytes retained from an unterminated message
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.buffer.shrink_to(self.max_buffer_bytes.min(64 * 1024));
        self.scanned = 0;
    }

    fn violation(&mut self, error: Error) -> Error {
        warn!(error = %error, "Frame protocol violation, discarding buffered input");
        self.stats.protocol_errors += 1;
        self.clear_buffer();
        error
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

enum Decoded {
    Message(Value),
    Blank,
    Malformed,
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn decode_line(line: &[u8]) -> Decoded {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Decoded::Blank;
    }
    match serde_json::from_slice(line) {
        Ok(value) => Decoded::Message(value),
        Err(e) => {
            let preview = String::from_utf8_lossy(&line[..line.len().min(PREVIEW_BYTES)]);
            warn!(error = %e, preview = %preview, "Skipping malformed frame");
            Decoded::Malformed
        }
    }
}

// ============================================================================
// Stream adapter
// ============================================================================

/// Turn an async byte source into a stream of decoded messages.
///
/// Protocol violations are yielded as `Err` items and reading continues; an
/// I/O error is yielded once and ends the stream.
pub fn read_frames<R>(
    mut reader: R,
    mut parser: FrameParser,
    chunk_size: usize,
) -> impl Stream<Item = Result<Value>>
where
    R: AsyncRead + Unpin,
{
    async_stream::stream! {
        let mut chunk = vec![0u8; chunk_size.max(1)];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    yield Err(Error::Io(e));
                    break;
                }
            };
            match parser.consume(&chunk[..n]) {
                Ok(messages) => {
                    for message in messages {
                        yield Ok(message);
                    }
                }
                Err(e) => yield Err(e),
            }
        }
        match parser.finish() {
            Ok(Some(message)) => yield Ok(message),
            Ok(None) => {}
            Err(e) => yield Err(e),
        }
    }
}
