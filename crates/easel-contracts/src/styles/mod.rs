mod extraction;
mod presets;
mod prompt;

pub use extraction::{parse_style_extraction, StyleExtraction};
pub use presets::{StylePreset, StyleRegistry, CUSTOM_STYLE_ID, MIDJOURNEY_STYLE_ID};
pub use prompt::{build_final_prompt, build_styled_prompt, build_weighted_prompt};
