use super::extraction::StyleExtraction;
use super::presets::{style_enhancement, StylePreset, StyleRegistry, MIDJOURNEY_STYLE_ID};

const STYLE_REFERENCE_HEADER: &str = "\n\n=== STYLE REFERENCE (from uploaded images) ===";
const STYLE_REFERENCE_INSTRUCTION: &str = "\n\n=== INSTRUCTION ===\nCreate an image that \
EXACTLY matches the subject description above while CAREFULLY replicating the visual style \
characteristics from the reference images. Pay special attention to matching the color \
scheme, lighting quality, compositional approach, and overall atmosphere.";

/// Final prompt for one task: weighted builder for the midjourney preset,
/// template builder for everything else. Pure — same inputs, same string.
pub fn build_final_prompt(
    registry: &StyleRegistry,
    user_prompt: &str,
    style_id: &str,
    custom_style: Option<&str>,
    extraction: Option<&StyleExtraction>,
) -> String {
    let preset = registry.resolve(style_id);
    if preset.id == MIDJOURNEY_STYLE_ID {
        build_weighted_prompt(user_prompt, extraction)
    } else {
        build_styled_prompt(user_prompt, preset, custom_style, extraction)
    }
}

/// Template builder: user prompt + per-style enhancement phrases substituted
/// into the preset structure, then the labeled style-reference block when an
/// extraction carries anything.
pub fn build_styled_prompt(
    user_prompt: &str,
    preset: &StylePreset,
    custom_style: Option<&str>,
    extraction: Option<&StyleExtraction>,
) -> String {
    let enhanced = format!("{user_prompt}, {}", style_enhancement(&preset.name));
    let mut prompt = preset.prompt_structure.replace("{prompt}", &enhanced);
    if prompt.contains("{customStyle}") {
        prompt = prompt.replace("{customStyle}", custom_style.unwrap_or_default().trim());
    }

    if let Some(extraction) = extraction.filter(|extraction| !extraction.is_empty()) {
        prompt.push_str(STYLE_REFERENCE_HEADER);
        for (label, value) in [
            ("COLOR PALETTE", &extraction.color_palette),
            ("LIGHTING", &extraction.lighting),
            ("COMPOSITION", &extraction.composition),
            ("MOOD", &extraction.mood),
        ] {
            if !value.is_empty() {
                prompt.push_str(&format!("\n• {label}: {value}"));
            }
        }
        prompt.push_str(STYLE_REFERENCE_INSTRUCTION);
    }

    prompt
}

/// Midjourney-style weighted builder. Extraction color/lighting join the
/// weight list instead of the labeled block.
pub fn build_weighted_prompt(user_prompt: &str, extraction: Option<&StyleExtraction>) -> String {
    let mut prompt = format!(
        "{user_prompt} ::2 | professional photography ::1.5 | highly detailed ::1.5 | \
         8K resolution ::1 | sharp focus ::1 | cinematic lighting ::1.5 | artifact-free ::2"
    );

    if let Some(extraction) = extraction.filter(|extraction| !extraction.color_palette.is_empty()) {
        prompt.push_str(&format!(
            " | {} ::1.2 | {} ::1.3",
            extraction.color_palette, extraction.lighting
        ));
    }

    prompt + " --style raw --quality 2"
}
