use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The structured multi-page story document produced by the text phase.
/// Created once at stream completion, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaleDraft {
    pub title: String,
    #[serde(default)]
    pub characters: HashMap<String, CharacterProfile>,
    pub pages: Vec<PageDraft>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterProfile {
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub clothing: String,
    #[serde(default)]
    pub personality: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDraft {
    pub index: usize,
    pub text: String,
    #[serde(default)]
    pub image_prompt: String,
    #[serde(default)]
    pub scene_type: SceneType,
    #[serde(default)]
    pub scene_characters: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneType {
    #[default]
    None,
    Lead,
    Supporting,
    Ensemble,
}

#[derive(Debug, Error)]
pub enum TaleParseError {
    /// The model answered, but the document has no `pages` field at all.
    /// Kept distinct from a generic parse failure so callers can report it.
    #[error("generated document is missing the 'pages' field")]
    MissingPages,
    #[error("generated document is not valid tale JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parses recovered model output into a [`TaleDraft`], then normalizes page
/// order so the index invariant holds regardless of array order in the JSON.
pub fn parse_tale_draft(text: &str) -> Result<TaleDraft, TaleParseError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("pages").is_none() {
        return Err(TaleParseError::MissingPages);
    }
    let mut draft: TaleDraft = serde_json::from_value(value)?;
    draft.pages.sort_by_key(|p| p.index);
    Ok(draft)
}
