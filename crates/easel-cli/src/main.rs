use std::env;
use std::fs;
use std::net::TcpStream;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use easel_contracts::canvas::{InsertionRequest, Viewport};
use easel_contracts::events::{EventPayload, EventWriter};
use easel_contracts::jobs::{
    AspectRatio, FailureKind, GenerationJob, GenerationOutcome, MAX_CONCURRENT_REQUESTS,
    MAX_IMAGE_COUNT, MAX_REFERENCE_IMAGES,
};
use easel_engine::{
    BatchDispatcher, CredentialStore, DryrunSource, GeminiClient, InsertionSession,
};
use serde_json::{json, Value};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "easel-rs", version, about = "Easel canvas image engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Insert(InsertArgs),
    Bridge(BridgeArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "no-style")]
    style: String,
    #[arg(long)]
    custom_style: Option<String>,
    #[arg(long, default_value = "1:1")]
    aspect_ratio: String,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long, default_value_t = 4)]
    count: usize,
    #[arg(long, default_value_t = MAX_CONCURRENT_REQUESTS)]
    concurrency: usize,
    #[arg(long)]
    reference: Vec<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct InsertArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    batch_index: Option<usize>,
    #[arg(long)]
    batch_total: Option<usize>,
    #[arg(long, default_value_t = 0.0)]
    viewport_x: f64,
    #[arg(long, default_value_t = 0.0)]
    viewport_y: f64,
}

#[derive(Debug, Parser)]
struct BridgeArgs {
    #[arg(long)]
    url: String,
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 0.0)]
    viewport_x: f64,
    #[arg(long, default_value_t = 0.0)]
    viewport_y: f64,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Insert(args) => {
            run_insert(args)?;
            Ok(0)
        }
        Command::Bridge(args) => {
            run_bridge(args)?;
            Ok(0)
        }
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let aspect_ratio = resolve_aspect_ratio(&args.aspect_ratio, args.width, args.height)?;
    let count = args.count.clamp(1, MAX_IMAGE_COUNT);
    if args.reference.len() > MAX_REFERENCE_IMAGES {
        bail!("at most {MAX_REFERENCE_IMAGES} reference images are supported");
    }
    let mut reference_images = Vec::new();
    for path in &args.reference {
        let bytes =
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        reference_images.push(bytes);
    }

    let mut job = GenerationJob::new(&args.prompt, &args.style, count)
        .with_aspect_ratio(aspect_ratio)
        .with_reference_images(reference_images);
    job.custom_style = args.custom_style.clone();

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let job_id = Uuid::new_v4().to_string();
    let events = EventWriter::new(&events_path, &job_id);

    let mut payload = EventPayload::new();
    payload.insert("prompt".to_string(), Value::String(args.prompt.clone()));
    payload.insert("style".to_string(), Value::String(args.style.clone()));
    payload.insert("count".to_string(), Value::from(count));
    payload.insert(
        "concurrency".to_string(),
        Value::from(args.concurrency.max(1)),
    );
    events.emit("job_started", payload)?;

    let dispatcher = BatchDispatcher::new(args.concurrency);
    let mut results: Vec<Option<GenerationOutcome>> = vec![None; count];
    let mut quota_prompted = false;

    let sink = |index: usize, outcome: GenerationOutcome| {
        report_outcome(
            &args.out,
            &events,
            index,
            &outcome,
            &mut quota_prompted,
        );
        if let Some(slot) = results.get_mut(index) {
            *slot = Some(outcome);
        }
    };

    if args.dryrun {
        dispatcher.run(&job, &DryrunSource, sink);
    } else {
        let api_key = resolve_api_key(args.api_key.as_deref(), args.storage_dir.clone())?;
        let client = GeminiClient::new(api_key)?;
        dispatcher.run(&job, &client, sink);
    }

    let succeeded = results
        .iter()
        .filter(|slot| matches!(slot, Some(outcome) if outcome.is_success()))
        .count();
    let mut payload = EventPayload::new();
    payload.insert("succeeded".to_string(), Value::from(succeeded));
    payload.insert("failed".to_string(), Value::from(count - succeeded));
    events.emit("job_finished", payload)?;

    println!(
        "generated {succeeded}/{count} images into {}",
        args.out.display()
    );
    Ok(if succeeded == 0 { 1 } else { 0 })
}

fn report_outcome(
    out_dir: &PathBuf,
    events: &EventWriter,
    index: usize,
    outcome: &GenerationOutcome,
    quota_prompted: &mut bool,
) {
    match outcome {
        GenerationOutcome::Success {
            image_bytes,
            mime_type,
        } => {
            let path = out_dir.join(format!(
                "artifact-{index:02}.{}",
                extension_for_mime(mime_type)
            ));
            match fs::write(&path, image_bytes) {
                Ok(()) => {
                    let mut payload = EventPayload::new();
                    payload.insert("index".to_string(), Value::from(index));
                    payload.insert(
                        "path".to_string(),
                        Value::String(path.display().to_string()),
                    );
                    let _ = events.emit("task_completed", payload);
                    println!("image {index} done: {}", path.display());
                }
                Err(err) => {
                    let mut payload = EventPayload::new();
                    payload.insert("index".to_string(), Value::from(index));
                    payload.insert("kind".to_string(), Value::String("io".to_string()));
                    payload.insert("message".to_string(), Value::String(err.to_string()));
                    let _ = events.emit("task_failed", payload);
                    eprintln!("image {index} failed: {err}");
                }
            }
        }
        GenerationOutcome::Failure { kind, message } => {
            let mut payload = EventPayload::new();
            payload.insert("index".to_string(), Value::from(index));
            payload.insert(
                "kind".to_string(),
                Value::String(failure_kind_label(*kind).to_string()),
            );
            payload.insert("message".to_string(), Value::String(message.clone()));
            let _ = events.emit("task_failed", payload);
            eprintln!("image {index} failed: {message}");

            // One prompt per job, no matter how many tasks hit the quota.
            if *kind == FailureKind::QuotaExceeded && !*quota_prompted {
                *quota_prompted = true;
                let _ = events.emit("credential_refresh_required", EventPayload::new());
                eprintln!("API quota exceeded; update the stored API key and retry");
            }
        }
    }
}

fn run_insert(args: InsertArgs) -> Result<()> {
    let image_bytes = fs::read(&args.image)
        .with_context(|| format!("failed reading {}", args.image.display()))?;
    let request = InsertionRequest {
        image_bytes,
        prompt: args.prompt,
        aspect_ratio: args.aspect_ratio,
        custom_width: args.width,
        custom_height: args.height,
        batch_index: args.batch_index,
        batch_total: args.batch_total,
    };

    let mut session = InsertionSession::new(Viewport::new(args.viewport_x, args.viewport_y));
    let placement = match session.insert(&request) {
        Ok(placement) => placement,
        Err(err) => bail!("insert failed: {err}"),
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "node": placement.node,
            "frame_selection": placement.frame_selection,
        }))?
    );
    Ok(())
}

/// Messages the canvas host sends over the bridge socket.
#[derive(Debug, PartialEq)]
enum HostMessage {
    GetApiKey,
    SaveApiKey(String),
    InsertImage(Box<InsertionRequest>),
    MalformedInsert,
    ClosePlugin,
    Unknown(String),
}

fn run_bridge(args: BridgeArgs) -> Result<()> {
    let store = CredentialStore::new(storage_dir(args.storage_dir.clone())?);
    let mut session = InsertionSession::new(Viewport::new(args.viewport_x, args.viewport_y));

    let (mut ws, _) = websocket_connect(args.url.as_str())
        .with_context(|| format!("failed to connect to canvas host at {}", args.url))?;
    eprintln!("bridge connected to {}", args.url);

    loop {
        let message = match ws.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => bail!("bridge socket read failed: {err}"),
        };

        let raw = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };

        match parse_host_message(&parsed) {
            HostMessage::GetApiKey => {
                let api_key = store.load().unwrap_or_default().unwrap_or_default();
                websocket_send_json(
                    &mut ws,
                    &json!({ "type": "api-key-loaded", "apiKey": api_key }),
                )?;
            }
            HostMessage::SaveApiKey(api_key) => {
                if let Err(err) = store.save(&api_key) {
                    send_notify(&mut ws, &format!("Failed to save API key: {err}"), true)?;
                }
            }
            HostMessage::InsertImage(request) => {
                // Insertion failures stay scoped to this one request.
                match session.insert(&request) {
                    Ok(placement) => {
                        let message = if placement.frame_selection && request.is_batch() {
                            format!(
                                "Inserted {} images to canvas",
                                request.batch_total.unwrap_or(session.selection().len())
                            )
                        } else {
                            format!("Inserted '{}'", placement.node.name)
                        };
                        websocket_send_json(
                            &mut ws,
                            &json!({
                                "type": "image-inserted",
                                "node": placement.node,
                                "frameSelection": placement.frame_selection,
                            }),
                        )?;
                        send_notify(&mut ws, &message, false)?;
                    }
                    Err(err) => send_notify(&mut ws, &format!("Failed: {err}"), true)?,
                }
            }
            HostMessage::MalformedInsert => {
                send_notify(&mut ws, "Failed: invalid insert-image payload", true)?;
            }
            HostMessage::ClosePlugin => break,
            HostMessage::Unknown(kind) => {
                eprintln!("ignoring unknown message type '{kind}'");
            }
        }
    }

    Ok(())
}

fn parse_host_message(payload: &Value) -> HostMessage {
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match kind {
        "get-api-key" => HostMessage::GetApiKey,
        "save-api-key" => HostMessage::SaveApiKey(
            payload
                .get("apiKey")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        "close-plugin" => HostMessage::ClosePlugin,
        "insert-image" => match insertion_request_from_message(payload) {
            Some(request) => HostMessage::InsertImage(Box::new(request)),
            None => HostMessage::MalformedInsert,
        },
        other => HostMessage::Unknown(other.to_string()),
    }
}

fn insertion_request_from_message(payload: &Value) -> Option<InsertionRequest> {
    let data = payload.get("data").unwrap_or(payload);
    let bytes_value = data.get("imageBytes").and_then(Value::as_array)?;
    let mut image_bytes = Vec::with_capacity(bytes_value.len());
    for value in bytes_value {
        let byte = value.as_u64().and_then(|value| u8::try_from(value).ok())?;
        image_bytes.push(byte);
    }

    Some(InsertionRequest {
        image_bytes,
        prompt: data
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        aspect_ratio: data
            .get("aspectRatio")
            .and_then(Value::as_str)
            .map(str::to_string),
        custom_width: data
            .get("customWidth")
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok()),
        custom_height: data
            .get("customHeight")
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok()),
        batch_index: data
            .get("batchIndex")
            .and_then(Value::as_u64)
            .map(|value| value as usize),
        batch_total: data
            .get("batchTotal")
            .and_then(Value::as_u64)
            .map(|value| value as usize),
    })
}

fn send_notify(
    ws: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    message: &str,
    error: bool,
) -> Result<()> {
    websocket_send_json(
        ws,
        &json!({ "type": "notify", "message": message, "error": error }),
    )
}

fn websocket_send_json(ws: &mut WebSocket<MaybeTlsStream<TcpStream>>, value: &Value) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    ws.send(WsMessage::Text(raw.into()))
        .context("failed sending bridge message")?;
    Ok(())
}

fn resolve_aspect_ratio(
    label: &str,
    width: Option<u32>,
    height: Option<u32>,
) -> Result<AspectRatio> {
    if let (Some(width), Some(height)) = (width, height) {
        if width == 0 || height == 0 {
            bail!("custom dimensions must be positive");
        }
        return Ok(AspectRatio::Custom { width, height });
    }
    match AspectRatio::parse(label) {
        Some(ratio) => Ok(ratio),
        None => bail!("unsupported aspect ratio '{label}' (try 1:1, 16:9, 4:3, 3:4 or 9:16)"),
    }
}

fn resolve_api_key(flag: Option<&str>, storage_dir_flag: Option<PathBuf>) -> Result<String> {
    if let Some(api_key) = flag.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(api_key.to_string());
    }
    if let Some(api_key) = env::var("GEMINI_API_KEY")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return Ok(api_key);
    }
    let store = CredentialStore::new(storage_dir(storage_dir_flag)?);
    if let Some(api_key) = store.load()? {
        return Ok(api_key);
    }
    bail!("no API key configured; pass --api-key, set GEMINI_API_KEY, or save one with the bridge")
}

fn storage_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    match env::var_os("HOME") {
        Some(home) => Ok(PathBuf::from(home).join(".easel")),
        None => bail!("cannot locate storage directory; pass --storage-dir"),
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    "png"
}

fn failure_kind_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::SafetyBlocked => "safety_blocked",
        FailureKind::QuotaExceeded => "quota_exceeded",
        FailureKind::Transient => "transient",
        FailureKind::InvalidCredential => "invalid_credential",
    }
}
