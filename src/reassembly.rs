use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::frame::DATA_PREFIX;
use crate::tale::{parse_tale_draft, TaleDraft, TaleParseError};

/// One response frame of the upstream text model's streaming dump.
#[derive(Debug, Deserialize)]
struct UpstreamFrame {
    #[serde(default)]
    candidates: Vec<UpstreamCandidate>,
}

#[derive(Debug, Deserialize)]
struct UpstreamCandidate {
    content: Option<UpstreamContent>,
}

#[derive(Debug, Deserialize)]
struct UpstreamContent {
    #[serde(default)]
    parts: Vec<UpstreamPart>,
}

#[derive(Debug, Deserialize)]
struct UpstreamPart {
    #[serde(default)]
    text: String,
}

impl UpstreamFrame {
    fn text(&self) -> String {
        let mut out = String::new();
        if let Some(candidate) = self.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    out.push_str(&part.text);
                }
            }
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum ReassemblyError {
    /// Both strategies exhausted and nothing came back. An empty tale is
    /// never silently returned.
    #[error("no content produced by the upstream model")]
    NoContent,
    #[error(transparent)]
    Tale(#[from] TaleParseError),
}

/// Recovers the full generated text from the raw accumulated stream buffer.
///
/// Strategies run in order, first non-empty result wins:
/// 1. the whole buffer as a single JSON array of upstream frames;
/// 2. line-oriented: each line treated as a record-marker-prefixed frame or a
///    bare JSON object, unparseable lines skipped as expected noise.
///
/// An array parse that technically succeeds but recovers no text does not
/// count as success; the line fallback still gets its chance.
pub fn recover_generated_text(raw: &str) -> Result<String, ReassemblyError> {
    if let Some(text) = recover_from_array(raw) {
        return Ok(text);
    }
    let text = recover_from_lines(raw);
    if text.is_empty() {
        return Err(ReassemblyError::NoContent);
    }
    Ok(text)
}

/// Convenience wrapper: recover the text, then parse it as a tale document.
pub fn reassemble_tale(raw: &str) -> Result<TaleDraft, ReassemblyError> {
    let text = recover_generated_text(raw)?;
    Ok(parse_tale_draft(&text)?)
}

fn recover_from_array(raw: &str) -> Option<String> {
    let frames: Vec<UpstreamFrame> = serde_json::from_str(raw.trim()).ok()?;
    let text: String = frames.iter().map(|f| f.text()).collect();
    if text.is_empty() {
        debug!("array strategy parsed {} frames but recovered no text", frames.len());
        return None;
    }
    Some(text)
}

/// Line-oriented recovery, also used by the relay for best-effort per-chunk
/// partial extraction.
pub(crate) fn recover_from_lines(raw: &str) -> String {
    let mut text = String::new();
    for line in raw.lines() {
        let line = line.trim();
        let payload = line.strip_prefix(DATA_PREFIX).unwrap_or(line);
        // Frames inside a streamed array arrive with trailing separators.
        let payload = payload.trim().trim_end_matches(',');
        if !payload.starts_with('{') {
            continue;
        }
        match serde_json::from_str::<UpstreamFrame>(payload) {
            Ok(frame) => text.push_str(&frame.text()),
            // Expected noise: partial records, array brackets, keep-alives.
            Err(e) => debug!("line strategy skipping unparseable line ({})", e),
        }
    }
    text
}
