use std::env;
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use easel_contracts::canvas::{
    batch_position, node_display_name, resolve_target_size, single_position, InsertionRequest,
    PlacedNode, Viewport, MAX_IMAGE_BYTES,
};
use easel_contracts::jobs::{
    AspectRatio, FailureKind, GenerationJob, GenerationOutcome, GenerationTask,
};
use easel_contracts::styles::{
    build_final_prompt, parse_style_extraction, StyleExtraction, StyleRegistry,
};
use image::{GenericImageView, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

const REQUEST_TIMEOUT_SECS: u64 = 120;

const STYLE_ANALYSIS_PROMPT: &str = "Analyze these reference images and extract their visual \
style. Describe:\n1. Main colors and palette\n2. Lighting quality and direction\n3. Composition \
and framing\n4. Overall mood and atmosphere\nBe specific and concise.";

/// Maps upstream failure text (plus the HTTP status when there is one) into
/// the closed taxonomy. Deliberately an ordered substring rule list — the
/// upstream API does not guarantee stable error codes, so safety wording is
/// checked first, quota wording second, and everything else (network
/// failures, timeouts, malformed payloads) is treated as transient even when
/// the condition may in fact be permanent.
pub fn classify_failure(message: &str, status: Option<u16>) -> FailureKind {
    if message.contains("SAFETY")
        || message.contains("blocked")
        || message.contains("content_filtered")
    {
        return FailureKind::SafetyBlocked;
    }
    if status == Some(429)
        || message.contains("quota")
        || message.contains("QUOTA")
        || message.contains("limit")
        || message.contains("exceeded")
        || message.contains("insufficient")
    {
        return FailureKind::QuotaExceeded;
    }
    FailureKind::Transient
}

pub const RETRY_DELAYS_MS: [u64; 3] = [2000, 4000, 8000];

/// Retry schedule for transient failures: a fixed attempt ceiling with an
/// escalating delay between consecutive attempts. Safety and quota failures
/// are terminal on first occurrence.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delays_ms: [u64; 3],
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays_ms: RETRY_DELAYS_MS,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt should follow after `attempts_made` completed
    /// calls ended with `kind`.
    pub fn should_retry(&self, kind: FailureKind, attempts_made: u32) -> bool {
        kind.is_retryable() && attempts_made < self.max_attempts
    }

    /// Delay to wait between attempt `attempts_made` and the next one.
    pub fn delay_before_retry(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made == 0 {
            return None;
        }
        self.delays_ms
            .get(attempts_made as usize - 1)
            .map(|ms| Duration::from_millis(*ms))
    }
}

/// One remote generation backend. `generate` is a single attempt — retry
/// lives in the dispatcher — and failures are encoded in the outcome rather
/// than raised, so one task's failure can never abort its siblings.
pub trait ImageSource {
    fn generate(&self, prompt: &str, aspect_ratio: &AspectRatio) -> GenerationOutcome;

    /// One multimodal analysis pass over a job's reference images. The
    /// default (and any failure path) degrades to an empty extraction rather
    /// than failing the job.
    fn extract_style(&self, _reference_images: &[Vec<u8>]) -> StyleExtraction {
        StyleExtraction::default()
    }
}

/// Blocking client for the Gemini `generateContent` endpoint, used for both
/// image generation and reference-style analysis.
pub struct GeminiClient {
    http: HttpClient,
    api_base: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_base: env::var("EASEL_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            model: DEFAULT_IMAGE_MODEL.to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn generate_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    fn post_generate(&self, payload: &Value) -> std::result::Result<Value, GenerationOutcome> {
        let response = self
            .http
            .post(self.generate_url())
            .query(&[("key", self.api_key.as_str())])
            .json(payload)
            .send()
            .map_err(|err| {
                GenerationOutcome::failure(
                    FailureKind::Transient,
                    format!("request failed: {}", truncate_text(&err.to_string(), 220)),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let message = upstream_error_message(&body)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            let kind = classify_failure(&message, Some(status.as_u16()));
            return Err(GenerationOutcome::failure(kind, message));
        }

        response.json::<Value>().map_err(|err| {
            GenerationOutcome::failure(
                FailureKind::Transient,
                format!("invalid JSON response: {}", truncate_text(&err.to_string(), 220)),
            )
        })
    }
}

impl ImageSource for GeminiClient {
    fn generate(&self, prompt: &str, aspect_ratio: &AspectRatio) -> GenerationOutcome {
        if self.api_key.trim().is_empty() {
            return GenerationOutcome::failure(
                FailureKind::InvalidCredential,
                "no API key configured",
            );
        }

        let payload = json!({
            "contents": [{
                "parts": [{ "text": prompt }],
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "temperature": 1.0,
                "maxOutputTokens": 8192,
                "imageConfig": {
                    "aspectRatio": aspect_ratio.label(),
                },
            },
        });

        let response_payload = match self.post_generate(&payload) {
            Ok(parsed) => parsed,
            Err(outcome) => return outcome,
        };

        let Some((data, mime_type)) = first_inline_image(&response_payload) else {
            return GenerationOutcome::failure(
                FailureKind::Transient,
                "no image data in response",
            );
        };
        if data.is_empty() {
            return GenerationOutcome::failure(
                FailureKind::Transient,
                "empty image payload in response",
            );
        }

        match BASE64.decode(data.as_bytes()) {
            Ok(image_bytes) => GenerationOutcome::Success {
                image_bytes,
                mime_type,
            },
            Err(err) => GenerationOutcome::failure(
                FailureKind::Transient,
                format!("image payload is not valid base64: {err}"),
            ),
        }
    }

    fn extract_style(&self, reference_images: &[Vec<u8>]) -> StyleExtraction {
        let mut parts = vec![json!({ "text": STYLE_ANALYSIS_PROMPT })];
        for bytes in reference_images {
            parts.push(json!({
                "inlineData": {
                    "mimeType": sniff_reference_mime(bytes),
                    "data": BASE64.encode(bytes),
                }
            }));
        }

        let payload = json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "temperature": 0.4,
                "maxOutputTokens": 500,
            },
        });

        let Ok(response_payload) = self.post_generate(&payload) else {
            return StyleExtraction::default();
        };
        let analysis = first_text_part(&response_payload).unwrap_or_default();
        parse_style_extraction(&analysis)
    }
}

/// First response fragment carrying inline binary image data, as
/// (base64 payload, mime type).
fn first_inline_image(payload: &Value) -> Option<(String, String)> {
    for part in candidate_parts(payload) {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let Some(data) = inline.get("data").and_then(Value::as_str) else {
            continue;
        };
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png")
            .to_string();
        return Some((data.to_string(), mime_type));
    }
    None
}

fn first_text_part(payload: &Value) -> Option<String> {
    for part in candidate_parts(payload) {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    None
}

fn candidate_parts(payload: &Value) -> Vec<Value> {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|candidate| {
            candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
        })
        .flatten()
        .collect()
}

fn upstream_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("error")
        .and_then(Value::as_object)
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(|message| truncate_text(message, 512))
}

fn sniff_reference_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&PNG_SIGNATURE) {
        "image/png"
    } else {
        "image/jpeg"
    }
}

/// Offline source that renders a flat-color PNG at the requested dimensions.
pub struct DryrunSource;

impl ImageSource for DryrunSource {
    fn generate(&self, prompt: &str, aspect_ratio: &AspectRatio) -> GenerationOutcome {
        let (width, height) = match aspect_ratio {
            AspectRatio::Custom { width, height } => ((*width).max(1), (*height).max(1)),
            named => resolve_target_size(Some(&named.label()), None),
        };
        let (r, g, b) = color_from_prompt(prompt);
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }

        let mut image_bytes = Vec::new();
        let encoded = image::DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut image_bytes), image::ImageFormat::Png);
        match encoded {
            Ok(()) => GenerationOutcome::Success {
                image_bytes,
                mime_type: "image/png".to_string(),
            },
            Err(err) => GenerationOutcome::failure(
                FailureKind::Transient,
                format!("dryrun render failed: {err}"),
            ),
        }
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let seed = prompt
        .bytes()
        .fold(0u32, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte.into()));
    let bytes = seed.to_be_bytes();
    (bytes[0], bytes[1], bytes[2])
}

/// Admission-controls one job's tasks across a bounded worker pool.
///
/// Tasks are queued in ascending index order and at most `concurrency`
/// remote calls are in flight at once; each worker drives the retry loop for
/// its task and the caller's sink sees `(index, outcome)` pairs in whatever
/// order tasks resolve. `run` returns only after every index has a terminal
/// outcome.
pub struct BatchDispatcher {
    concurrency: usize,
    retry: RetryPolicy,
    registry: StyleRegistry,
}

impl BatchDispatcher {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            retry: RetryPolicy::default(),
            registry: StyleRegistry::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn run<S, F>(&self, job: &GenerationJob, source: &S, mut on_outcome: F)
    where
        S: ImageSource + Sync,
        F: FnMut(usize, GenerationOutcome),
    {
        let extraction = if job.reference_images.is_empty() {
            None
        } else {
            Some(source.extract_style(&job.reference_images))
        };

        let tasks: Vec<GenerationTask> = (0..job.count.max(1))
            .map(|index| {
                GenerationTask::new(
                    index,
                    build_final_prompt(
                        &self.registry,
                        &job.prompt,
                        &job.style_id,
                        job.custom_style.as_deref(),
                        extraction.as_ref(),
                    ),
                )
            })
            .collect();
        let total = tasks.len();

        let (task_tx, task_rx) = mpsc::channel::<GenerationTask>();
        for task in tasks {
            let _ = task_tx.send(task);
        }
        drop(task_tx);
        let task_rx = Mutex::new(task_rx);

        let (outcome_tx, outcome_rx) = mpsc::channel::<(usize, GenerationOutcome)>();
        let workers = self.concurrency.min(total);

        thread::scope(|scope| {
            for _ in 0..workers {
                let outcome_tx = outcome_tx.clone();
                let task_rx = &task_rx;
                scope.spawn(move || loop {
                    let next = task_rx
                        .lock()
                        .ok()
                        .and_then(|receiver| receiver.recv().ok());
                    let Some(mut task) = next else {
                        break;
                    };
                    let outcome = self.execute_task(source, &mut task, &job.aspect_ratio);
                    if outcome_tx.send((task.index, outcome)).is_err() {
                        break;
                    }
                });
            }
            drop(outcome_tx);

            for (index, outcome) in outcome_rx.iter() {
                on_outcome(index, outcome);
            }
        });
    }

    fn execute_task<S: ImageSource + Sync>(
        &self,
        source: &S,
        task: &mut GenerationTask,
        aspect_ratio: &AspectRatio,
    ) -> GenerationOutcome {
        loop {
            task.attempt += 1;
            let outcome = source.generate(&task.built_prompt, aspect_ratio);
            let retry = match &outcome {
                GenerationOutcome::Failure { kind, .. } => {
                    self.retry.should_retry(*kind, task.attempt)
                }
                GenerationOutcome::Success { .. } => false,
            };
            if !retry {
                return outcome;
            }
            if let Some(delay) = self.retry.delay_before_retry(task.attempt) {
                thread::sleep(delay);
            }
        }
    }
}

pub const PNG_SIGNATURE: [u8; 4] = [0x89, 0x50, 0x4E, 0x47];
pub const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];
pub const GIF_SIGNATURE: [u8; 3] = [0x47, 0x49, 0x46];

/// Why one insertion was rejected. Failures abort only the insertion they
/// belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    EmptyPayload,
    PayloadTooLarge { size: usize },
    UnsupportedFormat { leading: Vec<u8> },
    DecodeFailed { reason: String },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPayload => write!(f, "image payload is empty"),
            Self::PayloadTooLarge { size } => {
                write!(f, "image payload too large ({size} bytes, limit {MAX_IMAGE_BYTES})")
            }
            Self::UnsupportedFormat { leading } => {
                let bytes = leading
                    .iter()
                    .map(|byte| byte.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "unsupported image format; first bytes: {bytes}")
            }
            Self::DecodeFailed { reason } => write!(f, "failed to decode image: {reason}"),
        }
    }
}

impl std::error::Error for IngestError {}

/// Pre-decode validation: non-empty, under the size ceiling, and a
/// recognized PNG/JPEG/GIF signature. Runs before any decode attempt.
pub fn validate_image_signature(bytes: &[u8]) -> std::result::Result<(), IngestError> {
    if bytes.is_empty() {
        return Err(IngestError::EmptyPayload);
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(IngestError::PayloadTooLarge { size: bytes.len() });
    }
    if bytes.starts_with(&PNG_SIGNATURE)
        || bytes.starts_with(&JPEG_SIGNATURE)
        || bytes.starts_with(&GIF_SIGNATURE)
    {
        return Ok(());
    }
    Err(IngestError::UnsupportedFormat {
        leading: bytes.iter().take(4).copied().collect(),
    })
}

/// Decodes the payload and confirms it has real pixels. A failing decode or
/// a zero-area result means the bytes are corrupt.
pub fn decoded_dimensions(bytes: &[u8]) -> std::result::Result<(u32, u32), IngestError> {
    let decoded = image::load_from_memory(bytes).map_err(|err| IngestError::DecodeFailed {
        reason: err.to_string(),
    })?;
    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(IngestError::DecodeFailed {
            reason: "decoded image has zero area".to_string(),
        });
    }
    Ok((width, height))
}

/// One placed node plus whether the canvas should now frame the accumulated
/// selection (always for single inserts, on the last item for batches).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node: PlacedNode,
    pub frame_selection: bool,
}

/// Ingestion pipeline state for one run of inserts against a viewport:
/// validate, decode, size, place, and accumulate the running selection.
pub struct InsertionSession {
    viewport: Viewport,
    selection: Vec<PlacedNode>,
}

impl InsertionSession {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            selection: Vec::new(),
        }
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn selection(&self) -> &[PlacedNode] {
        &self.selection
    }

    pub fn insert(
        &mut self,
        request: &InsertionRequest,
    ) -> std::result::Result<Placement, IngestError> {
        validate_image_signature(&request.image_bytes)?;
        decoded_dimensions(&request.image_bytes)?;

        let (width, height) =
            resolve_target_size(request.aspect_ratio.as_deref(), request.custom_size());

        match (request.batch_index, request.batch_total) {
            (Some(batch_index), Some(batch_total)) => {
                let name = node_display_name(&request.prompt, Some(batch_index));
                let (x, y) = batch_position(&self.viewport, batch_index, width, height);
                let node = PlacedNode {
                    name,
                    x,
                    y,
                    width,
                    height,
                };
                self.selection.push(node.clone());
                Ok(Placement {
                    node,
                    frame_selection: batch_index + 1 == batch_total,
                })
            }
            _ => {
                let name = node_display_name(&request.prompt, None);
                let (x, y) = single_position(&self.viewport, width, height);
                let node = PlacedNode {
                    name,
                    x,
                    y,
                    width,
                    height,
                };
                self.selection = vec![node.clone()];
                Ok(Placement {
                    node,
                    frame_selection: true,
                })
            }
        }
    }
}

pub const API_KEY_STORAGE_KEY: &str = "gemini_api_key";

/// File-backed store for the single credential string, scoped to a storage
/// directory. Loaded once at job start and never mutated mid-job.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: storage_dir.into().join("credentials.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading {}", self.path.display()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid credential file {}", self.path.display()))?;
        Ok(parsed
            .get(API_KEY_STORAGE_KEY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string))
    }

    pub fn save(&self, api_key: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let payload = json!({ API_KEY_STORAGE_KEY: api_key.trim() });
        fs::write(&self.path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed writing {}", self.path.display()))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed removing {}", self.path.display()))?;
        }
        Ok(())
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use easel_contracts::jobs::MAX_CONCURRENT_REQUESTS;

    use super::*;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delays_ms: [1, 1, 1],
        }
    }

    struct ScriptedSource {
        outcome: GenerationOutcome,
        calls: AtomicUsize,
        extractions: AtomicUsize,
    }

    impl ScriptedSource {
        fn failing(kind: FailureKind, message: &str) -> Self {
            Self {
                outcome: GenerationOutcome::failure(kind, message),
                calls: AtomicUsize::new(0),
                extractions: AtomicUsize::new(0),
            }
        }

        fn succeeding() -> Self {
            Self {
                outcome: GenerationOutcome::Success {
                    image_bytes: vec![1, 2, 3],
                    mime_type: "image/png".to_string(),
                },
                calls: AtomicUsize::new(0),
                extractions: AtomicUsize::new(0),
            }
        }
    }

    impl ImageSource for ScriptedSource {
        fn generate(&self, _prompt: &str, _aspect_ratio: &AspectRatio) -> GenerationOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }

        fn extract_style(&self, _reference_images: &[Vec<u8>]) -> StyleExtraction {
            self.extractions.fetch_add(1, Ordering::SeqCst);
            StyleExtraction {
                color_palette: "muted pastels.".to_string(),
                lighting: "soft dawn light.".to_string(),
                composition: String::new(),
                mood: String::new(),
            }
        }
    }

    struct GaugeSource {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GaugeSource {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl ImageSource for GaugeSource {
        fn generate(&self, _prompt: &str, _aspect_ratio: &AspectRatio) -> GenerationOutcome {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            GenerationOutcome::Success {
                image_bytes: vec![0],
                mime_type: "image/png".to_string(),
            }
        }
    }

    #[test]
    fn classifier_maps_safety_wording_first() {
        assert_eq!(
            classify_failure("Request blocked: SAFETY", Some(400)),
            FailureKind::SafetyBlocked
        );
        assert_eq!(
            classify_failure("prompt was blocked", None),
            FailureKind::SafetyBlocked
        );
        assert_eq!(
            classify_failure("content_filtered", None),
            FailureKind::SafetyBlocked
        );
        // Safety wording wins even when quota wording is also present.
        assert_eq!(
            classify_failure("blocked because quota", Some(429)),
            FailureKind::SafetyBlocked
        );
    }

    #[test]
    fn classifier_maps_quota_wording_and_429() {
        for message in [
            "quota exhausted",
            "QUOTA",
            "rate limit reached",
            "resource exhausted: exceeded",
            "insufficient tokens",
        ] {
            assert_eq!(classify_failure(message, None), FailureKind::QuotaExceeded);
        }
        assert_eq!(
            classify_failure("too many requests", Some(429)),
            FailureKind::QuotaExceeded
        );
    }

    #[test]
    fn classifier_defaults_to_transient() {
        assert_eq!(
            classify_failure("connection reset by peer", None),
            FailureKind::Transient
        );
        assert_eq!(classify_failure("HTTP 500", Some(500)), FailureKind::Transient);
        assert_eq!(
            classify_failure("no image data in response", None),
            FailureKind::Transient
        );
    }

    #[test]
    fn retry_schedule_escalates_between_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_before_retry(1),
            Some(Duration::from_millis(2000))
        );
        assert_eq!(
            policy.delay_before_retry(2),
            Some(Duration::from_millis(4000))
        );
        assert!(policy.should_retry(FailureKind::Transient, 1));
        assert!(policy.should_retry(FailureKind::Transient, 2));
        assert!(!policy.should_retry(FailureKind::Transient, 3));
    }

    #[test]
    fn retry_policy_never_retries_terminal_kinds() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(FailureKind::SafetyBlocked, 1));
        assert!(!policy.should_retry(FailureKind::QuotaExceeded, 1));
        assert!(!policy.should_retry(FailureKind::InvalidCredential, 1));
    }

    #[test]
    fn dispatcher_delivers_every_index_exactly_once() {
        let source = ScriptedSource::succeeding();
        let job = GenerationJob::new("boat", "no-style", 7);
        let dispatcher = BatchDispatcher::new(MAX_CONCURRENT_REQUESTS);

        let mut seen = vec![0usize; job.count];
        dispatcher.run(&job, &source, |index, outcome| {
            assert!(outcome.is_success());
            seen[index] += 1;
        });

        assert!(seen.iter().all(|count| *count == 1));
        assert_eq!(source.calls.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn dispatcher_never_exceeds_the_concurrency_limit() {
        let source = GaugeSource::new();
        let job = GenerationJob::new("boat", "no-style", 12);
        let dispatcher = BatchDispatcher::new(3);

        let mut delivered = 0;
        dispatcher.run(&job, &source, |_, _| delivered += 1);

        assert_eq!(delivered, 12);
        assert!(source.peak.load(Ordering::SeqCst) <= 3);
        assert!(source.peak.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn transient_failures_stop_after_three_attempts() {
        let source = ScriptedSource::failing(FailureKind::Transient, "connection reset");
        let job = GenerationJob::new("boat", "no-style", 1);
        let dispatcher = BatchDispatcher::new(1).with_retry_policy(fast_retry());

        let mut outcomes = Vec::new();
        dispatcher.run(&job, &source, |index, outcome| {
            outcomes.push((index, outcome));
        });

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0].1 {
            GenerationOutcome::Failure { kind, message } => {
                assert_eq!(*kind, FailureKind::Transient);
                assert_eq!(message, "connection reset");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn safety_and_quota_failures_are_not_retried() {
        for kind in [FailureKind::SafetyBlocked, FailureKind::QuotaExceeded] {
            let source = ScriptedSource::failing(kind, "upstream rejection");
            let job = GenerationJob::new("boat", "no-style", 1);
            let dispatcher = BatchDispatcher::new(1).with_retry_policy(fast_retry());

            let mut kinds = Vec::new();
            dispatcher.run(&job, &source, |_, outcome| {
                kinds.push(outcome.failure_kind());
            });

            assert_eq!(source.calls.load(Ordering::SeqCst), 1);
            assert_eq!(kinds, vec![Some(kind)]);
        }
    }

    #[test]
    fn reference_images_trigger_exactly_one_style_extraction() {
        let source = ScriptedSource::succeeding();
        let job = GenerationJob::new("boat", "no-style", 4)
            .with_reference_images(vec![vec![1, 2, 3], vec![4, 5, 6]]);
        let dispatcher = BatchDispatcher::new(2);

        dispatcher.run(&job, &source, |_, _| {});

        assert_eq!(source.extractions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jobs_without_references_skip_style_extraction() {
        let source = ScriptedSource::succeeding();
        let job = GenerationJob::new("boat", "no-style", 2);
        let dispatcher = BatchDispatcher::new(2);

        dispatcher.run(&job, &source, |_, _| {});

        assert_eq!(source.extractions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn signature_check_accepts_png_jpeg_and_gif() {
        assert!(validate_image_signature(&[0x89, 0x50, 0x4E, 0x47, 0x0D]).is_ok());
        assert!(validate_image_signature(&[0xFF, 0xD8, 0xFF, 0xE0]).is_ok());
        assert!(validate_image_signature(&[0x47, 0x49, 0x46, 0x38]).is_ok());
    }

    #[test]
    fn signature_check_rejects_unknown_and_empty_payloads() {
        assert_eq!(
            validate_image_signature(&[]),
            Err(IngestError::EmptyPayload)
        );
        assert_eq!(
            validate_image_signature(&[0x00, 0x01, 0x02, 0x03]),
            Err(IngestError::UnsupportedFormat {
                leading: vec![0x00, 0x01, 0x02, 0x03],
            })
        );
    }

    #[test]
    fn signature_check_rejects_oversized_payloads() {
        let mut oversized = vec![0u8; MAX_IMAGE_BYTES + 1];
        oversized[..4].copy_from_slice(&PNG_SIGNATURE);
        assert_eq!(
            validate_image_signature(&oversized),
            Err(IngestError::PayloadTooLarge {
                size: MAX_IMAGE_BYTES + 1,
            })
        );
    }

    #[test]
    fn ingest_rejects_truncated_image_data() {
        let mut session = InsertionSession::new(Viewport::default());
        let mut corrupt = PNG_SIGNATURE.to_vec();
        corrupt.extend_from_slice(b"not a real png body");
        let request = InsertionRequest::single(corrupt, "broken");
        match session.insert(&request) {
            Err(IngestError::DecodeFailed { .. }) => {}
            other => panic!("expected decode failure, got {other:?}"),
        }
    }

    #[test]
    fn generated_image_round_trips_into_a_square_node() {
        let outcome = DryrunSource.generate("boat", &AspectRatio::Square);
        let GenerationOutcome::Success { image_bytes, mime_type } = outcome else {
            panic!("dryrun generation failed");
        };
        assert_eq!(mime_type, "image/png");
        assert!(validate_image_signature(&image_bytes).is_ok());

        let mut session = InsertionSession::new(Viewport::default());
        let mut request = InsertionRequest::single(image_bytes, "boat");
        request.aspect_ratio = Some("1:1".to_string());
        let placement = session.insert(&request).expect("insert succeeds");
        assert_eq!(placement.node.width, 1024);
        assert_eq!(placement.node.height, 1024);
        assert!(placement.frame_selection);
    }

    #[test]
    fn dryrun_respects_named_aspect_ratios() {
        let outcome = DryrunSource.generate("boat", &AspectRatio::Landscape16x9);
        let GenerationOutcome::Success { image_bytes, .. } = outcome else {
            panic!("dryrun generation failed");
        };
        assert_eq!(decoded_dimensions(&image_bytes), Ok((1024, 576)));
    }

    #[test]
    fn batch_inserts_accumulate_selection_and_frame_on_last() {
        let mut session = InsertionSession::new(Viewport::default());
        let total = 3;
        for index in 0..total {
            let outcome = DryrunSource.generate("boat", &AspectRatio::Square);
            let GenerationOutcome::Success { image_bytes, .. } = outcome else {
                panic!("dryrun generation failed");
            };
            let request = InsertionRequest {
                image_bytes,
                prompt: "A Cat! @Night (v2)".to_string(),
                aspect_ratio: Some("1:1".to_string()),
                custom_width: None,
                custom_height: None,
                batch_index: Some(index),
                batch_total: Some(total),
            };
            let placement = session.insert(&request).expect("insert succeeds");
            assert_eq!(placement.frame_selection, index + 1 == total);
            assert_eq!(
                placement.node.name,
                format!("A Cat Night v2 {:02}", index + 1)
            );
        }
        assert_eq!(session.selection().len(), total);
    }

    #[test]
    fn failed_batch_item_leaves_siblings_untouched() {
        let mut session = InsertionSession::new(Viewport::default());
        let good = DryrunSource.generate("boat", &AspectRatio::Square);
        let GenerationOutcome::Success { image_bytes, .. } = good else {
            panic!("dryrun generation failed");
        };

        let mut first = InsertionRequest::single(image_bytes.clone(), "boat");
        first.batch_index = Some(0);
        first.batch_total = Some(3);
        session.insert(&first).expect("first insert succeeds");

        let mut bad = InsertionRequest::single(vec![0x00, 0x01], "boat");
        bad.batch_index = Some(1);
        bad.batch_total = Some(3);
        assert!(session.insert(&bad).is_err());

        let mut last = InsertionRequest::single(image_bytes, "boat");
        last.batch_index = Some(2);
        last.batch_total = Some(3);
        let placement = session.insert(&last).expect("last insert succeeds");
        assert!(placement.frame_selection);
        assert_eq!(session.selection().len(), 2);
    }

    #[test]
    fn custom_dimensions_override_aspect_ratio() {
        let mut session = InsertionSession::new(Viewport::default());
        let outcome = DryrunSource.generate("boat", &AspectRatio::Square);
        let GenerationOutcome::Success { image_bytes, .. } = outcome else {
            panic!("dryrun generation failed");
        };
        let mut request = InsertionRequest::single(image_bytes, "boat");
        request.aspect_ratio = Some("16:9".to_string());
        request.custom_width = Some(640);
        request.custom_height = Some(480);
        let placement = session.insert(&request).expect("insert succeeds");
        assert_eq!((placement.node.width, placement.node.height), (640, 480));
    }

    #[test]
    fn credential_store_round_trips_the_api_key() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = CredentialStore::new(temp.path());

        assert_eq!(store.load()?, None);
        store.save("  secret-key  ")?;
        assert_eq!(store.load()?, Some("secret-key".to_string()));
        store.clear()?;
        assert_eq!(store.load()?, None);
        Ok(())
    }

    #[test]
    fn credential_store_treats_blank_keys_as_missing() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = CredentialStore::new(temp.path());
        store.save("   ")?;
        assert_eq!(store.load()?, None);
        Ok(())
    }

    #[test]
    fn upstream_error_messages_are_extracted_from_json_bodies() {
        let body = r#"{"error":{"message":"Resource has been exhausted (e.g. check quota)."}}"#;
        assert_eq!(
            upstream_error_message(body).as_deref(),
            Some("Resource has been exhausted (e.g. check quota).")
        );
        assert_eq!(upstream_error_message("not json"), None);
    }

    #[test]
    fn inline_image_lookup_skips_text_parts() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "here is your image" },
                        { "inlineData": { "mimeType": "image/png", "data": "QUJD" } },
                    ],
                },
            }],
        });
        let (data, mime_type) = first_inline_image(&payload).expect("inline image present");
        assert_eq!(data, "QUJD");
        assert_eq!(mime_type, "image/png");
    }

    #[test]
    fn inline_image_lookup_handles_snake_case_and_absence() {
        let snake = json!({
            "candidates": [{
                "content": {
                    "parts": [{ "inline_data": { "mime_type": "image/jpeg", "data": "QQ==" } }],
                },
            }],
        });
        assert_eq!(
            first_inline_image(&snake),
            Some(("QQ==".to_string(), "image/jpeg".to_string()))
        );

        let text_only = json!({
            "candidates": [{ "content": { "parts": [{ "text": "no image here" }] } }],
        });
        assert_eq!(first_inline_image(&text_only), None);
    }

    #[test]
    fn reference_mime_sniffing_prefers_png_signature() {
        assert_eq!(sniff_reference_mime(&[0x89, 0x50, 0x4E, 0x47]), "image/png");
        assert_eq!(sniff_reference_mime(&[0xFF, 0xD8, 0xFF]), "image/jpeg");
    }
}
