use std::collections::HashMap;

use crate::tale::{CharacterProfile, PageDraft, SceneType};

/// Artifacts excluded from every image, regardless of scene. The image models
/// love sneaking typography into storybook art.
pub const NEGATIVE_PROMPT: &[&str] = &[
    "text",
    "words",
    "letters",
    "captions",
    "subtitles",
    "typography",
    "written language",
    "numbers",
    "alphabet",
    "calligraphy",
    "watermark",
    "signature",
    "logo",
    "signage",
    "street signs",
    "labels",
    "speech bubbles",
    "ui elements",
    "borders",
    "frames",
];

pub fn negative_prompt() -> String {
    NEGATIVE_PROMPT.join(", ")
}

fn composition_phrase(aspect_ratio: &str) -> &'static str {
    match aspect_ratio {
        "16:9" => "Wide cinematic composition with room for the scene to breathe.",
        "9:16" => "Tall vertical composition, subject framed for a portrait page.",
        "4:3" => "Classic picture-book composition, subject slightly off-center.",
        "3:4" => "Vertical picture-book composition, subject filling the frame.",
        _ => "Balanced square composition centered on the scene.",
    }
}

/// Synthesizes the full prompt for one page. Scene type `none` explicitly
/// excludes characters; otherwise each named character's visual descriptors
/// are embedded so the model can hold continuity across pages.
pub fn build_page_prompt(
    page: &PageDraft,
    characters: &HashMap<String, CharacterProfile>,
    art_style: &str,
    aspect_ratio: &str,
) -> String {
    let mut prompt = format!("{} illustration. {}", art_style, page.image_prompt);

    if page.scene_type == SceneType::None {
        prompt.push_str(" This scene contains no characters; depict the environment only.");
    } else {
        for name in &page.scene_characters {
            let Some(profile) = characters.get(name) else { continue };
            prompt.push_str(&format!(
                " {}: {}, wearing {}.",
                name, profile.appearance, profile.clothing
            ));
        }
        if page.index == 0 {
            prompt.push_str(" This is the first page: establish the definitive visual design of each character.");
        } else {
            prompt.push_str(" Keep every character visually consistent with their appearance on previous pages.");
        }
    }

    prompt.push(' ');
    prompt.push_str(composition_phrase(aspect_ratio));
    prompt
}

/// Deterministic seed: identical inputs reproduce identical requests.
pub fn page_seed(base: u64, index: usize) -> u64 {
    base + index as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characters() -> HashMap<String, CharacterProfile> {
        let mut map = HashMap::new();
        map.insert(
            "Fox".to_string(),
            CharacterProfile {
                appearance: "small red fox with amber eyes".to_string(),
                clothing: "a blue scarf".to_string(),
                personality: "curious".to_string(),
            },
        );
        map
    }

    fn page(index: usize, scene_type: SceneType, names: &[&str]) -> PageDraft {
        PageDraft {
            index,
            text: "story text".to_string(),
            image_prompt: "a moonlit forest clearing".to_string(),
            scene_type,
            scene_characters: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_scene_none_excludes_characters() {
        let prompt = build_page_prompt(&page(0, SceneType::None, &["Fox"]), &characters(), "watercolor", "1:1");
        assert!(prompt.contains("no characters"));
        assert!(!prompt.contains("Fox:"));
    }

    #[test]
    fn test_lead_scene_embeds_character_descriptors() {
        let prompt = build_page_prompt(&page(2, SceneType::Lead, &["Fox"]), &characters(), "watercolor", "1:1");
        assert!(prompt.contains("small red fox with amber eyes"));
        assert!(prompt.contains("a blue scarf"));
    }

    #[test]
    fn test_first_page_establishes_later_pages_stay_consistent() {
        let chars = characters();
        let first = build_page_prompt(&page(0, SceneType::Lead, &["Fox"]), &chars, "watercolor", "1:1");
        let later = build_page_prompt(&page(3, SceneType::Lead, &["Fox"]), &chars, "watercolor", "1:1");
        assert!(first.contains("establish"));
        assert!(later.contains("consistent with"));
        assert!(!later.contains("establish the definitive"));
    }

    #[test]
    fn test_unknown_scene_character_is_skipped() {
        let prompt = build_page_prompt(&page(1, SceneType::Ensemble, &["Ghost"]), &characters(), "watercolor", "1:1");
        assert!(!prompt.contains("Ghost:"));
    }

    #[test]
    fn test_aspect_ratio_phrase_is_appended() {
        let chars = characters();
        let wide = build_page_prompt(&page(0, SceneType::None, &[]), &chars, "watercolor", "16:9");
        let tall = build_page_prompt(&page(0, SceneType::None, &[]), &chars, "watercolor", "9:16");
        assert!(wide.contains("Wide cinematic"));
        assert!(tall.contains("vertical composition"));
    }

    #[test]
    fn test_negative_prompt_covers_text_artifacts() {
        let joined = negative_prompt();
        for token in ["watermark", "signage", "text"] {
            assert!(joined.contains(token));
        }
    }

    #[test]
    fn test_page_seed_is_deterministic() {
        assert_eq!(page_seed(7000, 2), 7002);
        assert_eq!(page_seed(7000, 2), page_seed(7000, 2));
        assert_ne!(page_seed(7000, 2), page_seed(7000, 3));
    }
}
