use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Typed failure from the upstream image service. Carried inside anyhow
/// chains so the classifier can recover structure from a raw error.
#[derive(Debug, Error)]
#[error("image generation failed: {message}")]
pub struct ImageApiError {
    pub status: Option<u16>,
    pub message: String,
    /// Structured safety-filter reason, when the upstream attached one.
    pub rai_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyCategory {
    Copyright,
    Hate,
    Violence,
    Sexual,
    Dangerous,
    GenericSafety,
    PersonalInfo,
    Medical,
    Political,
    UnknownSafety,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ContentSafety(SafetyCategory),
    Auth,
    Permission,
    Timeout,
    Server,
    Unknown,
}

/// Classifier output. The original error rides along untouched for logs.
#[derive(Debug)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: String,
    pub source: anyhow::Error,
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Substring → category, matched case-insensitively, in this order.
const SAFETY_CATEGORIES: &[(&str, SafetyCategory)] = &[
    ("copyright", SafetyCategory::Copyright),
    ("hate", SafetyCategory::Hate),
    ("violen", SafetyCategory::Violence),
    ("sexual", SafetyCategory::Sexual),
    ("danger", SafetyCategory::Dangerous),
    ("safety", SafetyCategory::GenericSafety),
    ("personal", SafetyCategory::PersonalInfo),
    ("medical", SafetyCategory::Medical),
    ("politic", SafetyCategory::Political),
];

fn reason_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)reason:\s*"?([a-z0-9_\- ]+)"?"#).expect("valid regex"))
}

fn support_code_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s*\(?support codes?\b:?[0-9,\s]*\)?").expect("valid regex"))
}

/// Internal support-code tokens mean nothing to the reader; drop them from
/// anything we surface.
pub fn strip_support_codes(detail: &str) -> String {
    support_code_pattern().replace_all(detail, "").trim().to_string()
}

/// Classifies a raw image-generation failure for one page.
///
/// Safety-filter extraction runs three independent strategies, first non-null
/// wins; only then do we fall back to transport/auth classification. No
/// automatic retry happens anywhere downstream of this.
pub fn classify_image_error(err: anyhow::Error, model: &str, page_index: usize) -> ClassifiedError {
    if let Some(reason) = extract_rai_reason(&err) {
        return classify_safety(&reason, err, page_index);
    }
    classify_transport(err, model, page_index)
}

fn extract_rai_reason(err: &anyhow::Error) -> Option<String> {
    // (a) explicit structured reason on the error itself.
    if let Some(api) = err.downcast_ref::<ImageApiError>() {
        if let Some(reason) = &api.rai_reason {
            return Some(reason.clone());
        }
    }

    // (b) "reason:" pattern anywhere in the rendered message.
    let rendered = format!("{:#}", err);
    if let Some(caps) = reason_pattern().captures(&rendered) {
        return Some(caps[1].trim().to_string());
    }

    // (c) a generic "no image data" message paired with a structured reason
    // somewhere deeper in the chain.
    if rendered.to_lowercase().contains("no image data") {
        for cause in err.chain() {
            if let Some(api) = cause.downcast_ref::<ImageApiError>() {
                if let Some(reason) = &api.rai_reason {
                    return Some(reason.clone());
                }
            }
        }
    }

    None
}

fn classify_safety(reason: &str, source: anyhow::Error, page_index: usize) -> ClassifiedError {
    let reason = strip_support_codes(reason);
    let lowered = reason.to_lowercase();
    let category = SAFETY_CATEGORIES
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, cat)| *cat)
        .unwrap_or(SafetyCategory::UnknownSafety);

    let page = page_index + 1;
    let message = match category {
        SafetyCategory::Copyright => format!("Page {} was filtered for copyrighted material.", page),
        SafetyCategory::Hate => format!("Page {} was filtered for hateful content.", page),
        SafetyCategory::Violence => format!("Page {} was filtered for violence.", page),
        SafetyCategory::Sexual => format!("Page {} was filtered for sexual content.", page),
        SafetyCategory::Dangerous => format!("Page {} was filtered for dangerous content.", page),
        SafetyCategory::GenericSafety => format!("Page {} was blocked by the safety filter.", page),
        SafetyCategory::PersonalInfo => format!("Page {} was filtered for personal information.", page),
        SafetyCategory::Medical => format!("Page {} was filtered for medical content.", page),
        SafetyCategory::Political => format!("Page {} was filtered for political content.", page),
        SafetyCategory::UnknownSafety => format!("Page {} was blocked by a content filter.", page),
    };

    let remediation = match category {
        SafetyCategory::Copyright => {
            "Describe characters and settings with original, non-referential descriptions instead of named franchises or celebrities."
        }
        SafetyCategory::Hate => "Remove language that could target a protected group and regenerate.",
        SafetyCategory::Violence => "Soften or remove violent elements from the scene and regenerate.",
        SafetyCategory::Sexual => "Remove suggestive elements from the scene and regenerate.",
        SafetyCategory::Dangerous => "Remove dangerous activities or items from the scene and regenerate.",
        SafetyCategory::GenericSafety => "Reword the scene description and regenerate.",
        SafetyCategory::PersonalInfo => "Remove names, addresses or other personal details and regenerate.",
        SafetyCategory::Medical => "Remove medical imagery or advice from the scene and regenerate.",
        SafetyCategory::Political => "Remove references to political figures or events and regenerate.",
        SafetyCategory::UnknownSafety => "Reword the scene description and try again.",
    };

    let details = strip_support_codes(&format!("{} (reason: {})", remediation, reason));

    ClassifiedError { kind: ErrorKind::ContentSafety(category), message, details, source }
}

fn classify_transport(source: anyhow::Error, model: &str, page_index: usize) -> ClassifiedError {
    let status = source
        .chain()
        .find_map(|c| c.downcast_ref::<ImageApiError>())
        .and_then(|api| api.status);
    let rendered = format!("{:#}", source).to_lowercase();
    let is_timeout = rendered.contains("timeout")
        || rendered.contains("timed out")
        || source
            .chain()
            .find_map(|c| c.downcast_ref::<reqwest::Error>())
            .is_some_and(|e| e.is_timeout());

    let page = page_index + 1;
    let (kind, message) = match status {
        Some(401) => (ErrorKind::Auth, format!("Authentication with {} failed for page {}.", model, page)),
        Some(403) => (ErrorKind::Permission, format!("Access to {} was denied for page {}.", model, page)),
        Some(408) => (ErrorKind::Timeout, format!("{} timed out generating page {}.", model, page)),
        Some(s) if (500..=599).contains(&s) => {
            (ErrorKind::Server, format!("{} had a server error generating page {}.", model, page))
        }
        _ if is_timeout => (ErrorKind::Timeout, format!("{} timed out generating page {}.", model, page)),
        _ => (ErrorKind::Unknown, format!("Image generation failed for page {}.", page)),
    };

    let details = strip_support_codes(&format!("{:#}", source));

    ClassifiedError { kind, message, details, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_structured_reason_wins() {
        let err = anyhow::Error::new(ImageApiError {
            status: Some(400),
            message: "blocked".to_string(),
            rai_reason: Some("Violence in generated content".to_string()),
        });
        let classified = classify_image_error(err, "imagen", 1);
        assert_eq!(classified.kind, ErrorKind::ContentSafety(SafetyCategory::Violence));
        assert!(classified.message.contains("filtered for violence"));
    }

    #[test]
    fn test_reason_pattern_in_message() {
        let err = anyhow!("upstream rejected request, reason: sexual content detected");
        let classified = classify_image_error(err, "imagen", 0);
        assert_eq!(classified.kind, ErrorKind::ContentSafety(SafetyCategory::Sexual));
    }

    #[test]
    fn test_no_image_data_pairs_with_nested_reason() {
        let api = ImageApiError {
            status: None,
            message: "filter hit".to_string(),
            rai_reason: Some("hate speech".to_string()),
        };
        let err = anyhow::Error::new(api).context("no image data in response");
        let classified = classify_image_error(err, "imagen", 0);
        assert_eq!(classified.kind, ErrorKind::ContentSafety(SafetyCategory::Hate));
    }

    #[test]
    fn test_copyright_remediation_mentions_original_descriptions() {
        let err = anyhow!("reason: copyright material detected");
        let classified = classify_image_error(err, "imagen", 4);
        assert_eq!(classified.kind, ErrorKind::ContentSafety(SafetyCategory::Copyright));
        assert!(classified.details.contains("original, non-referential descriptions"));
    }

    #[test]
    fn test_support_code_is_stripped_from_details() {
        let err = anyhow!("blocked, reason: safety policy violation Support codes: 39322892, 29310472");
        let classified = classify_image_error(err, "imagen", 0);
        assert!(!classified.details.contains("39322892"));
        assert!(!classified.details.to_lowercase().contains("support code"));
    }

    #[test]
    fn test_unknown_safety_reason() {
        let err = anyhow!("reason: quantum entanglement");
        let classified = classify_image_error(err, "imagen", 0);
        assert_eq!(classified.kind, ErrorKind::ContentSafety(SafetyCategory::UnknownSafety));
    }

    #[test]
    fn test_transport_status_mapping() {
        for (status, kind) in [
            (401, ErrorKind::Auth),
            (403, ErrorKind::Permission),
            (408, ErrorKind::Timeout),
            (500, ErrorKind::Server),
            (503, ErrorKind::Server),
        ] {
            let err = anyhow::Error::new(ImageApiError {
                status: Some(status),
                message: "boom".to_string(),
                rai_reason: None,
            });
            let classified = classify_image_error(err, "imagen", 0);
            assert_eq!(classified.kind, kind, "status {}", status);
        }
    }

    #[test]
    fn test_timeout_by_message() {
        let err = anyhow!("connection timed out after 60s");
        let classified = classify_image_error(err, "imagen", 0);
        assert_eq!(classified.kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_unknown_preserves_source() {
        let err = anyhow!("something odd");
        let classified = classify_image_error(err, "imagen", 2);
        assert_eq!(classified.kind, ErrorKind::Unknown);
        assert!(format!("{:#}", classified.source).contains("something odd"));
    }
}
