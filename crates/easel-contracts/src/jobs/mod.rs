use std::fmt;

use serde::{Deserialize, Serialize};

pub const MIN_IMAGE_COUNT: usize = 1;
pub const MAX_IMAGE_COUNT: usize = 20;
pub const DEFAULT_IMAGE_COUNT: usize = 10;
pub const MAX_CONCURRENT_REQUESTS: usize = 3;
pub const MAX_REFERENCE_IMAGES: usize = 4;

/// Requested shape of a generated image, expressed as the wire label the
/// generation endpoint accepts (`"16:9"`, `"1:1"`, ...). Custom carries
/// explicit pixel dimensions instead of a named ratio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    Square,
    Landscape16x9,
    Landscape4x3,
    Portrait3x4,
    Portrait9x16,
    Custom { width: u32, height: u32 },
}

impl AspectRatio {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim() {
            "1:1" => Some(Self::Square),
            "16:9" => Some(Self::Landscape16x9),
            "4:3" => Some(Self::Landscape4x3),
            "3:4" => Some(Self::Portrait3x4),
            "9:16" => Some(Self::Portrait9x16),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Square => "1:1".to_string(),
            Self::Landscape16x9 => "16:9".to_string(),
            Self::Landscape4x3 => "4:3".to_string(),
            Self::Portrait3x4 => "3:4".to_string(),
            Self::Portrait9x16 => "9:16".to_string(),
            Self::Custom { width, height } => format!("{width}:{height}"),
        }
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::Square
    }
}

/// One user-initiated request to generate `count` images from a single
/// prompt/style/aspect configuration. Immutable once handed to the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub prompt: String,
    pub style_id: String,
    pub custom_style: Option<String>,
    pub reference_images: Vec<Vec<u8>>,
    pub aspect_ratio: AspectRatio,
    pub count: usize,
}

impl GenerationJob {
    pub fn new(prompt: impl Into<String>, style_id: impl Into<String>, count: usize) -> Self {
        Self {
            prompt: prompt.into(),
            style_id: style_id.into(),
            custom_style: None,
            reference_images: Vec::new(),
            aspect_ratio: AspectRatio::default(),
            count: count.max(MIN_IMAGE_COUNT),
        }
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn with_reference_images(mut self, reference_images: Vec<Vec<u8>>) -> Self {
        self.reference_images = reference_images;
        self
    }
}

/// One unit of work within a job. Owned exclusively by the dispatcher until
/// it reaches a terminal outcome; `attempt` counts completed remote calls.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub index: usize,
    pub built_prompt: String,
    pub attempt: u32,
}

impl GenerationTask {
    pub fn new(index: usize, built_prompt: String) -> Self {
        Self {
            index,
            built_prompt,
            attempt: 0,
        }
    }
}

/// Closed failure taxonomy for remote generation. Classification is by
/// ordered substring rules over the upstream error text, so the variants
/// deliberately stay coarse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SafetyBlocked,
    QuotaExceeded,
    Transient,
    InvalidCredential,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::SafetyBlocked => "content blocked by safety filter",
            Self::QuotaExceeded => "API quota exceeded",
            Self::Transient => "transient failure",
            Self::InvalidCredential => "invalid or missing API key",
        };
        f.write_str(text)
    }
}

/// Terminal result of one task. Produced exactly once per task and delivered
/// to the sink keyed by task index, in whatever order tasks resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success {
        image_bytes: Vec<u8>,
        mime_type: String,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl GenerationOutcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_ratio_parses_known_labels() {
        assert_eq!(AspectRatio::parse("16:9"), Some(AspectRatio::Landscape16x9));
        assert_eq!(AspectRatio::parse(" 1:1 "), Some(AspectRatio::Square));
        assert_eq!(AspectRatio::parse("9:16"), Some(AspectRatio::Portrait9x16));
        assert_eq!(AspectRatio::parse("21:9"), None);
        assert_eq!(AspectRatio::parse("custom"), None);
    }

    #[test]
    fn aspect_ratio_label_round_trips() {
        for label in ["1:1", "16:9", "4:3", "3:4", "9:16"] {
            let parsed = AspectRatio::parse(label).expect("known label");
            assert_eq!(parsed.label(), label);
        }
        let custom = AspectRatio::Custom {
            width: 800,
            height: 600,
        };
        assert_eq!(custom.label(), "800:600");
    }

    #[test]
    fn job_count_is_clamped_to_minimum() {
        let job = GenerationJob::new("boat", "no-style", 0);
        assert_eq!(job.count, MIN_IMAGE_COUNT);
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::SafetyBlocked.is_retryable());
        assert!(!FailureKind::QuotaExceeded.is_retryable());
        assert!(!FailureKind::InvalidCredential.is_retryable());
    }
}
