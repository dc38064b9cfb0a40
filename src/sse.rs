//! SSE wire protocol primitives.
//!
//! One stream carries a lazy, finite, non-restartable sequence of events,
//! each framed as a `data: ` line. The payload is JSON, one of:
//!
//! - `{"content": "..."}` — a chunk to append, in arrival order
//! - `{"done": true}`     — terminal success marker
//! - `{"error": "..."}`   — terminal failure marker
//!
//! The upstream model API uses the same framing with a literal `[DONE]`
//! sentinel, which must be recognised without being parsed as JSON.
//! [`SseFrameDecoder`] handles frame reassembly across arbitrary chunk
//! boundaries; malformed frames are skipped without aborting the stream.

use serde_json::{json, Value};

/// Literal end-of-stream sentinel used by the upstream model API.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Frame prefix for SSE data lines.
const DATA_PREFIX: &str = "data: ";

/// A discrete unit of the delivery wire protocol.
///
/// Ephemeral; exists only on the wire, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk of generated text to append to the accumulated result.
    Content(String),
    /// Terminal success marker. No further events follow.
    Done,
    /// Terminal failure marker carrying a user-facing message.
    Error(String),
}

impl StreamEvent {
    /// Returns true if this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }

    /// Serialize this event to its JSON wire payload.
    pub fn to_json(&self) -> String {
        match self {
            Self::Content(chunk) => json!({ "content": chunk }).to_string(),
            Self::Done => json!({ "done": true }).to_string(),
            Self::Error(message) => json!({ "error": message }).to_string(),
        }
    }

    /// Parse a frame payload back into an event.
    ///
    /// Returns `None` for malformed or unrecognised payloads; callers skip
    /// those frames rather than aborting the stream (partial-chunk
    /// tolerance).
    pub fn parse(payload: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(payload).ok()?;
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Some(Self::Error(message.to_string()));
        }
        if value.get("done").and_then(Value::as_bool) == Some(true) {
            return Some(Self::Done);
        }
        if let Some(chunk) = value.get("content").and_then(Value::as_str) {
            return Some(Self::Content(chunk.to_string()));
        }
        None
    }
}

/// Incremental decoder for `data: `-framed event streams.
///
/// Network reads deliver arbitrary byte chunks; a frame may be split across
/// two reads or several frames may arrive in one. The decoder buffers bytes
/// until a full line is available, then yields the payload of every
/// complete `data: ` line. Non-data lines (blank separators, comments) are
/// discarded.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
}

impl SseFrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and collect the payloads of all frames
    /// completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
                if !payload.is_empty() {
                    payloads.push(payload.to_string());
                }
            }
        }
        payloads
    }
}
