use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Record marker prefixing every frame on the wire.
pub const DATA_PREFIX: &str = "data: ";
/// Sentinel terminator some upstreams append after the last record.
pub const STREAM_DONE: &str = "[DONE]";

/// One logical record of the stream protocol, one per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Progress { message: String, percent: u8 },
    PartialContent { text: String },
    Complete { id: String },
    Error { message: String },
}

/// Encodes one frame as `"data: " + JSON + "\n"`.
pub fn encode_frame(event: &StreamEvent) -> Result<String> {
    Ok(format!("{}{}\n", DATA_PREFIX, serde_json::to_string(event)?))
}

/// Expected protocol noise between records: blank keep-alive lines, the end
/// sentinel and literal nulls. Anything else that fails to parse is logged
/// instead, so this predicate is the explicit tolerate-vs-report boundary.
pub fn is_protocol_noise(line: &str) -> bool {
    line.is_empty() || line == STREAM_DONE || line == "null"
}

/// Decodes raw byte chunks into [`StreamEvent`]s even though chunk boundaries
/// are arbitrary relative to lines and UTF-8 characters. A partial multi-byte
/// character at the end of a chunk is carried over to the next call; a partial
/// line stays in the text buffer until its newline arrives.
#[derive(Default)]
pub struct FrameParser {
    pending: Vec<u8>,
    buffer: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let text = self.decode(chunk);
        self.buffer.push_str(&text);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_frame_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Signals end-of-input. If the upstream closed without a trailing
    /// newline, the leftover fragment may still hold one final frame, so we
    /// try to parse it before letting it go.
    pub fn finish(mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return None;
        }
        let parsed = parse_frame_line(&rest);
        if parsed.is_none() {
            debug!("discarding unterminated trailing fragment ({} bytes)", rest.len());
        }
        parsed
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(chunk);

        let mut out = String::new();
        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        // Truly invalid sequence: replace and move on.
                        Some(n) => {
                            out.push('\u{FFFD}');
                            rest = &after[n..];
                        }
                        // Incomplete multi-byte character split across chunks.
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

fn parse_frame_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if is_protocol_noise(line) {
        return None;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        debug!("ignoring non-record stream line: {}", line);
        return None;
    };
    let payload = payload.trim();
    if is_protocol_noise(payload) {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            // Transient partial records are expected; skip, never abort.
            warn!("skipping unparseable stream record ({}): {}", e, payload);
            None
        }
    }
}
