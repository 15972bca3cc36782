use serde::{Deserialize, Serialize};

/// Style guidance distilled from a job's reference images. Derived at most
/// once per job, before any generation task starts, then shared read-only.
/// All fields may be empty; an empty extraction merges to nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleExtraction {
    pub color_palette: String,
    pub lighting: String,
    pub composition: String,
    pub mood: String,
}

impl StyleExtraction {
    pub fn is_empty(&self) -> bool {
        self.color_palette.is_empty()
            && self.lighting.is_empty()
            && self.composition.is_empty()
            && self.mood.is_empty()
    }
}

/// Pulls the four style fields out of the analysis model's free text. The
/// analysis prompt asks for labeled sections, so each field is the first
/// `keyword ...: <sentence>.` fragment found for its keyword.
pub fn parse_style_extraction(text: &str) -> StyleExtraction {
    StyleExtraction {
        color_palette: extract_section(text, "color"),
        lighting: extract_section(text, "lighting"),
        composition: extract_section(text, "composition"),
        mood: extract_section(text, "mood"),
    }
}

fn extract_section(text: &str, keyword: &str) -> String {
    let lowered = text.to_ascii_lowercase();
    let Some(start) = lowered.find(&keyword.to_ascii_lowercase()) else {
        return String::new();
    };
    let after = &text[start..];
    let Some(colon) = after.find(':') else {
        return String::new();
    };
    let rest = &after[colon + 1..];
    let Some(period) = rest.find('.') else {
        return String::new();
    };
    rest[..=period].trim().to_string()
}
