use serde::{Deserialize, Serialize};
use tracing::debug;

/// Byte-accumulating line framer for subprocess output.
///
/// Subprocess stdout arrives in arbitrary read-sized chunks that can split
/// a JSON line anywhere, including mid-codepoint. Bytes are buffered until
/// a `\n` shows up; a trailing `\r` is tolerated. The unterminated
/// remainder stays buffered for the next read.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every complete line it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Drains whatever is left after the stream ended without a final
    /// newline. Returns `None` when the remainder is empty.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}

/// Newline-delimited JSON protocol spoken by agent subprocesses on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentStreamMessage {
    /// Incremental assistant text.
    Chunk { data: ChunkData },

    /// Authoritative final text, replacing whatever was accumulated.
    Complete { data: ChunkData },

    /// Explicit failure from the agent; the stream keeps draining after.
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkData {
    #[serde(default)]
    pub text: String,
}

/// Outcome of decoding one line of subprocess output.
pub enum DecodedLine {
    Message(AgentStreamMessage),
    /// Not valid protocol JSON; the raw line is still surfaced as literal
    /// text rather than dropped (agents sometimes print stray log lines).
    Literal(String),
}

pub fn decode_line(line: &str) -> Option<DecodedLine> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<AgentStreamMessage>(line) {
        Ok(message) => Some(DecodedLine::Message(message)),
        Err(e) => {
            debug!("treating non-protocol line as literal output: {}", e);
            Some(DecodedLine::Literal(line.to_string()))
        }
    }
}
