//! Line framing for the device byte stream.
//!
//! The scale answers each poll with a line of ASCII text, but the stream is
//! noisy: responses may be split across reads, terminated by `\r`, `\n` or
//! both, and padded or peppered with control bytes. The [`Framer`] turns that
//! stream into clean [`Message`]s.

use std::fmt;

/// One complete reading framed from the device.
///
/// Never empty, never contains anything outside printable ASCII (32..=126),
/// and never has leading or trailing whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message(String);

impl Message {
    /// Validate `text` as a message.
    ///
    /// Returns `None` if the text is empty after trimming or contains a
    /// character outside printable ASCII.
    pub fn new(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(is_printable) {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    /// The message text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the message, returning its text.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Message {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_printable(b: u8) -> bool {
    (32..=126).contains(&b)
}

fn is_terminator(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

/// Stateful byte-stream to [`Message`] converter.
///
/// A partial line is kept between calls to [`Framer::feed`], so a response
/// split across two reads still produces a single message.
#[derive(Debug, Default)]
pub struct Framer {
    pending: String,
}

impl Framer {
    /// Create a framer with an empty buffer.
    pub fn new() -> Self {
        Self {
            pending: String::with_capacity(64),
        }
    }

    /// Feed raw bytes, returning every message they complete.
    ///
    /// `\r` and `\n` terminate the pending line; a terminator with nothing
    /// pending is ignored, so CRLF never yields an empty message. Printable
    /// ASCII is buffered and every other byte is dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Message> {
        let mut messages = Vec::new();

        for &b in bytes {
            if is_terminator(b) {
                if !self.pending.is_empty() {
                    let trimmed = self.pending.trim();
                    if !trimmed.is_empty() {
                        messages.push(Message(trimmed.to_string()));
                    }
                    self.pending.clear();
                }
            } else if is_printable(b) {
                self.pending.push(b as char);
            }
        }

        messages
    }

    /// Number of buffered bytes belonging to an unterminated line.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
