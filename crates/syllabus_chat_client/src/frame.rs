//! Line framing for the answer stream.
//!
//! The transport delivers arbitrary fragments: a `data: ` line, or even a UTF-8
//! code point, may be split across two reads. [`FrameParser`] buffers the
//! trailing partial line and emits one [`Frame`] per complete `data: ` line.
//! Lines that fail to decode become [`Frame::Diagnostic`] and parsing goes on.

use crate::messages::StreamEvent;

/// Literal prefix of an event line.
pub const DATA_PREFIX: &str = "data: ";

/// A `data: ` line that could not be turned into a [`StreamEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDiagnostic {
    /// The offending line, prefix included.
    pub line: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamEvent),
    Diagnostic(ParseDiagnostic),
}

/// Decode one complete line (without its newline).
///
/// Returns `None` for empty lines and lines without the `data: ` prefix.
pub fn parse_line(line: &str) -> Option<Frame> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() {
        return None;
    }
    let data = line.strip_prefix(DATA_PREFIX)?;
    match StreamEvent::from_data(data) {
        Ok(event) => {
            tracing::debug!(kind = event.kind(), "stream event");
            Some(Frame::Event(event))
        }
        Err(reason) => {
            tracing::warn!(%reason, line, "skipping malformed stream line");
            Some(Frame::Diagnostic(ParseDiagnostic {
                line: line.to_string(),
                reason,
            }))
        }
    }
}

/// Stateful splitter that carries partial lines (and partial UTF-8 sequences)
/// between fragments.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: String,
    utf8_tail: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed decoded text.
    pub fn push_str(&mut self, text: &str) -> Vec<Frame> {
        self.buffer.push_str(text);
        self.drain_lines()
    }

    /// Feed raw transport bytes. An incomplete UTF-8 sequence at the end is held
    /// back until the next call; invalid bytes are replaced with U+FFFD.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.utf8_tail.extend_from_slice(bytes);
        let pending = std::mem::take(&mut self.utf8_tail);
        let mut rest: &[u8] = &pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    self.buffer
                        .push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.utf8_tail = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        self.drain_lines()
    }

    /// End of stream: decode whatever is left as a final line.
    pub fn finish(&mut self) -> Vec<Frame> {
        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest).into_iter().collect()
    }

    /// Bytes of an unterminated line currently buffered.
    pub fn pending_len(&self) -> usize {
        self.buffer.len() + self.utf8_tail.len()
    }

    fn drain_lines(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].find('\n') {
            let end = start + pos;
            if let Some(frame) = parse_line(&self.buffer[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        frames
    }
}
