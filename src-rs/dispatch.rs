use crate::chatgpt::{ChatUi, MAX_CONVERSATIONS};
use crate::error::{BridgeError, BridgeResult};
use crate::files::DownloadManager;
use crate::rate_limit::RateLimiter;
use crate::sanitize::{sanitize_text, validate_path, MAX_LABEL_CHARS, MAX_PROMPT_CHARS};
use crate::tasks::BackgroundTasks;
use crate::tracker::{compose_image_prompt, GenerationRequest, GenerationState, GenerationTracker};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ASK: &str = "ask";
pub const GET_CONVERSATIONS: &str = "get_conversations";
pub const GENERATE_IMAGE: &str = "generate_image";
pub const START_IMAGE_GENERATION: &str = "start_image_generation";
pub const CHECK_GENERATION_STATUS: &str = "check_generation_status";
pub const GET_LATEST_IMAGE: &str = "get_latest_image";

const LATEST_IMAGE_CAVEAT: &str = "Note: this is the newest image visible in the open ChatGPT conversation. It is not tied to any generation_id.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    String,
    Boolean,
    Number,
}

impl ArgKind {
    fn type_name(self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Boolean => "boolean",
            ArgKind::Number => "number",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Boolean => value.is_boolean(),
            ArgKind::Number => value.is_number(),
        }
    }
}

struct ArgSpec {
    name: &'static str,
    kind: ArgKind,
    required: bool,
}

struct ToolSpec {
    name: &'static str,
    args: &'static [ArgSpec],
}

const fn arg(name: &'static str, kind: ArgKind, required: bool) -> ArgSpec {
    ArgSpec {
        name,
        kind,
        required,
    }
}

const CONVERSATION_ARG: ArgSpec = arg("conversationRef", ArgKind::String, false);
const SAVE_PATH_ARG: ArgSpec = arg("savePath", ArgKind::String, false);

/// Argument table checked before any tool runs. Advertised schemas come from
/// the typed argument structs in `server.rs`; this table keeps the
/// dispatcher strict for any caller.
static TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: ASK,
        args: &[arg("prompt", ArgKind::String, true), CONVERSATION_ARG],
    },
    ToolSpec {
        name: GET_CONVERSATIONS,
        args: &[arg("limit", ArgKind::Number, false)],
    },
    ToolSpec {
        name: GENERATE_IMAGE,
        args: &[
            arg("prompt", ArgKind::String, true),
            arg("style", ArgKind::String, false),
            arg("size", ArgKind::String, false),
            CONVERSATION_ARG,
            arg("downloadImage", ArgKind::Boolean, false),
            SAVE_PATH_ARG,
            arg("cleanupAfter", ArgKind::Boolean, false),
        ],
    },
    ToolSpec {
        name: START_IMAGE_GENERATION,
        args: &[
            arg("prompt", ArgKind::String, true),
            arg("style", ArgKind::String, false),
            arg("size", ArgKind::String, false),
            CONVERSATION_ARG,
        ],
    },
    ToolSpec {
        name: CHECK_GENERATION_STATUS,
        args: &[arg("generation_id", ArgKind::String, true)],
    },
    ToolSpec {
        name: GET_LATEST_IMAGE,
        args: &[SAVE_PATH_ARG],
    },
];

/// Tool output before it is wrapped for the protocol layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(err: &BridgeError) -> Self {
        let mut text = format!("Error: {}", err.public_message());
        if let Some(hint) = err.hint() {
            text.push_str("\n\nHint: ");
            text.push_str(hint);
        }
        Self {
            content: vec![ToolContent::Text { text }],
            is_error: true,
        }
    }

    #[cfg(test)]
    pub fn first_text(&self) -> &str {
        match self.content.first() {
            Some(ToolContent::Text { text }) => text,
            None => "",
        }
    }
}

/// Knobs the dispatcher needs beyond what its collaborators carry.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub sync_generation_timeout: Duration,
    pub poll_interval: Duration,
    pub opportunistic_cleanup_ratio: f64,
    pub require_new_image_marker: bool,
}

pub struct ToolDispatcher {
    settings: DispatchSettings,
    ui: Arc<dyn ChatUi>,
    tracker: Arc<GenerationTracker>,
    files: Arc<DownloadManager>,
    limiter: Arc<RateLimiter>,
    tasks: Arc<BackgroundTasks>,
}

struct Args<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Args<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.map?.get(name).filter(|v| !v.is_null())
    }

    fn str(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(Value::as_str)
    }

    fn required_str(&self, name: &str) -> BridgeResult<&'a str> {
        self.str(name)
            .ok_or_else(|| BridgeError::InvalidArguments(format!("missing `{name}`")))
    }

    fn bool_or(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(default)
    }

    fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }
}

fn validate_args<'a>(tool: &ToolSpec, args: &'a Value) -> BridgeResult<Args<'a>> {
    let map = match args {
        Value::Null => None,
        Value::Object(map) => Some(map),
        _ => {
            return Err(BridgeError::InvalidArguments(
                "arguments must be an object".to_string(),
            ))
        }
    };
    let parsed = Args { map };
    for spec in tool.args {
        match parsed.get(spec.name) {
            None if spec.required => {
                return Err(BridgeError::InvalidArguments(format!(
                    "`{}` is required for {}",
                    spec.name, tool.name
                )))
            }
            None => {}
            Some(value) if !spec.kind.accepts(value) => {
                return Err(BridgeError::InvalidArguments(format!(
                    "`{}` must be a {}",
                    spec.name,
                    spec.kind.type_name()
                )))
            }
            Some(_) => {}
        }
    }
    Ok(parsed)
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|err| format!("{{\"error\": \"{err}\"}}"))
}

fn optional_label(args: &Args<'_>, name: &str) -> BridgeResult<Option<String>> {
    match args.str(name).map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => sanitize_text(v, MAX_LABEL_CHARS).map(Some),
        None => Ok(None),
    }
}

fn checked_prompt(raw: &str) -> BridgeResult<String> {
    if raw.chars().count() > MAX_PROMPT_CHARS {
        return Err(BridgeError::InvalidInput(format!(
            "prompt exceeds {MAX_PROMPT_CHARS} characters"
        )));
    }
    sanitize_text(raw, MAX_PROMPT_CHARS)
}

impl ToolDispatcher {
    pub fn new(
        settings: DispatchSettings,
        ui: Arc<dyn ChatUi>,
        tracker: Arc<GenerationTracker>,
        files: Arc<DownloadManager>,
        limiter: Arc<RateLimiter>,
        tasks: Arc<BackgroundTasks>,
    ) -> Self {
        Self {
            settings,
            ui,
            tracker,
            files,
            limiter,
            tasks,
        }
    }

    /// Runs one tool call. Never panics on bad input and never returns a
    /// raw error: every failure becomes an `is_error` response.
    pub fn handle(&self, name: &str, args: &Value) -> ToolResponse {
        self.maybe_schedule_cleanup();
        let started = Instant::now();
        let result = self.route(name, args);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(text) => {
                info!(tool = name, elapsed_ms, "tool call finished");
                ToolResponse::text(text)
            }
            Err(err) => {
                warn!(tool = name, elapsed_ms, code = err.code(), error = %err.public_message(), "tool call failed");
                ToolResponse::error(&err)
            }
        }
    }

    fn route(&self, name: &str, raw_args: &Value) -> BridgeResult<String> {
        let tool = TOOLS
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| BridgeError::InvalidArguments(format!("unknown tool: {name}")))?;
        let args = validate_args(tool, raw_args)?;
        debug!(tool = name, "dispatching");

        match tool.name {
            ASK => self.ask(&args),
            GET_CONVERSATIONS => self.get_conversations(&args),
            GENERATE_IMAGE => self.generate_image(&args),
            START_IMAGE_GENERATION => self.start_generation(&args),
            CHECK_GENERATION_STATUS => self.check_status(&args),
            GET_LATEST_IMAGE => self.latest_image(&args),
            other => Err(BridgeError::InvalidArguments(format!("unknown tool: {other}"))),
        }
    }

    fn maybe_schedule_cleanup(&self) {
        let ratio = self.settings.opportunistic_cleanup_ratio.clamp(0.0, 1.0);
        if ratio <= 0.0 || !rand::thread_rng().gen_bool(ratio) {
            return;
        }
        let files = Arc::clone(&self.files);
        let tracker = Arc::clone(&self.tracker);
        self.tasks.spawn("opportunistic-cleanup", move || {
            if let Err(err) = files.cleanup_all() {
                warn!(error = %err.public_message(), "download cleanup failed");
            }
            tracker.cleanup();
        });
    }

    fn ask(&self, args: &Args<'_>) -> BridgeResult<String> {
        let prompt = checked_prompt(args.required_str("prompt")?)?;
        let conversation = optional_label(args, "conversationRef")?;
        self.limiter.check(ASK)?;
        let reply = self.ui.ask(&prompt, conversation.as_deref())?;
        if reply.trim().is_empty() {
            return Ok("ChatGPT returned an empty reply.".to_string());
        }
        Ok(reply)
    }

    fn get_conversations(&self, args: &Args<'_>) -> BridgeResult<String> {
        let limit = match args.number("limit") {
            Some(n) if n.fract() == 0.0 && (1.0..=MAX_CONVERSATIONS as f64).contains(&n) => {
                n as usize
            }
            Some(_) => {
                return Err(BridgeError::InvalidArguments(format!(
                    "`limit` must be a whole number between 1 and {MAX_CONVERSATIONS}"
                )))
            }
            None => MAX_CONVERSATIONS,
        };
        let titles = self.ui.list_conversations(limit)?;
        if titles.is_empty() {
            return Ok("No conversations found.".to_string());
        }
        let mut lines = vec![format!("Found {} conversations:", titles.len())];
        lines.extend(
            titles
                .iter()
                .enumerate()
                .map(|(i, title)| format!("{}. {title}", i + 1)),
        );
        Ok(lines.join("\n"))
    }

    fn generate_image(&self, args: &Args<'_>) -> BridgeResult<String> {
        let prompt = checked_prompt(args.required_str("prompt")?)?;
        let style = optional_label(args, "style")?;
        let size = optional_label(args, "size")?;
        let conversation = optional_label(args, "conversationRef")?;
        let download = args.bool_or("downloadImage", true);
        let cleanup_after = args.bool_or("cleanupAfter", false);
        let save_path = args.str("savePath").map(str::trim).filter(|p| !p.is_empty());
        if let (true, Some(path)) = (download, save_path) {
            validate_path(path, self.files.root())?;
        }
        self.limiter.check(GENERATE_IMAGE)?;

        let text = compose_image_prompt(&prompt, style.as_deref(), size.as_deref());
        self.ui.trigger_generation(&text, conversation.as_deref())?;
        info!("image generation triggered, waiting for completion");
        self.wait_for_image()?;

        let mut lines = vec![
            "Image generated successfully.".to_string(),
            format!("Prompt: {prompt}"),
        ];
        if download {
            let outcome = self.files.download(self.ui.as_ref(), save_path)?;
            if !outcome.success {
                return Err(BridgeError::FileVerification(format!(
                    "image generated but download failed: {}",
                    outcome.error.unwrap_or_default()
                )));
            }
            if let Some(path) = &outcome.path {
                lines.push(format!(
                    "Saved to: {} ({}x{}, {} bytes)",
                    path.display(),
                    outcome.width.unwrap_or(0),
                    outcome.height.unwrap_or(0),
                    outcome.bytes.unwrap_or(0)
                ));
            }
        }
        if cleanup_after {
            let report = self.files.cleanup_all()?;
            lines.push(format!(
                "Cleanup removed {} old file(s), freeing {} bytes.",
                report.deleted, report.freed_bytes
            ));
        }
        Ok(lines.join("\n"))
    }

    fn wait_for_image(&self) -> BridgeResult<()> {
        let timeout = self.settings.sync_generation_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            thread::sleep(self.settings.poll_interval);
            match self.ui.probe_generation() {
                Ok(probe) if probe.is_complete(self.settings.require_new_image_marker) => {
                    return Ok(())
                }
                Ok(probe) => debug!(?probe, "still generating"),
                Err(err) => debug!(error = %err.public_message(), "generation probe failed"),
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::GenerationTimeout {
                    minutes: (timeout.as_secs() as i64 + 59) / 60,
                });
            }
        }
    }

    fn start_generation(&self, args: &Args<'_>) -> BridgeResult<String> {
        let request = GenerationRequest {
            prompt: args.required_str("prompt")?.to_string(),
            style: args.str("style").map(str::to_string),
            size: args.str("size").map(str::to_string),
            conversation_ref: args.str("conversationRef").map(str::to_string),
        };
        let id = self.tracker.start(request)?;
        Ok(pretty(&json!({
            "generation_id": id,
            "status": GenerationState::Pending,
            "message": "Image generation started. Poll check_generation_status with this generation_id.",
        })))
    }

    fn check_status(&self, args: &Args<'_>) -> BridgeResult<String> {
        let id = args.required_str("generation_id")?.trim();
        let status = self
            .tracker
            .status(id)
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;
        Ok(pretty(&status))
    }

    fn latest_image(&self, args: &Args<'_>) -> BridgeResult<String> {
        let outcome = self
            .tracker
            .latest_image(&self.files, args.str("savePath"))?;
        if !outcome.success {
            return Err(BridgeError::FileVerification(
                outcome.error.unwrap_or_else(|| "download failed".to_string()),
            ));
        }
        Ok(format!("{}\n\n{LATEST_IMAGE_CAVEAT}", pretty(&outcome)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatgpt::testing::{FakeChatUi, SaveMode};
    use crate::clock::ManualClock;
    use crate::config::{CleanupPolicy, RateLimits, TrackerLimits};
    use tempfile::TempDir;

    struct Fixture {
        dispatcher: ToolDispatcher,
        ui: Arc<FakeChatUi>,
        tasks: Arc<BackgroundTasks>,
        tracker: Arc<GenerationTracker>,
        clock: Arc<ManualClock>,
        dir: TempDir,
    }

    fn fixture_with(ratio: f64, rate_max: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ui = Arc::new(FakeChatUi::new());
        let clock = Arc::new(ManualClock::new());
        let tasks = Arc::new(BackgroundTasks::new());
        let limiter = Arc::new(RateLimiter::new(
            RateLimits {
                default_max: rate_max,
                ..RateLimits::default()
            },
            clock.clone(),
        ));
        let tracker = Arc::new(GenerationTracker::new(
            ui.clone(),
            limiter.clone(),
            clock.clone(),
            TrackerLimits::default(),
            tasks.clone(),
        ));
        let files = Arc::new(DownloadManager::new(
            dir.path().to_path_buf(),
            CleanupPolicy::default(),
            Duration::ZERO,
        ));
        let settings = DispatchSettings {
            sync_generation_timeout: Duration::from_millis(200),
            poll_interval: Duration::ZERO,
            opportunistic_cleanup_ratio: ratio,
            require_new_image_marker: false,
        };
        let dispatcher = ToolDispatcher::new(
            settings,
            ui.clone(),
            tracker.clone(),
            files,
            limiter,
            tasks.clone(),
        );
        Fixture {
            dispatcher,
            ui,
            tasks,
            tracker,
            clock,
            dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(0.0, 1000)
    }

    #[test]
    fn unknown_tool_is_an_error_response() {
        let f = fixture();
        let resp = f.dispatcher.handle("delete_everything", &json!({}));
        assert!(resp.is_error);
        assert!(resp.first_text().contains("unknown tool"));
    }

    #[test]
    fn missing_and_mistyped_arguments_are_rejected() {
        let f = fixture();
        let resp = f.dispatcher.handle(ASK, &json!({}));
        assert!(resp.is_error);
        assert!(resp.first_text().contains("`prompt` is required"));

        let resp = f.dispatcher.handle(ASK, &json!({ "prompt": 42 }));
        assert!(resp.is_error);
        assert!(resp.first_text().contains("must be a string"));

        let resp = f
            .dispatcher
            .handle(GENERATE_IMAGE, &json!({ "prompt": "x", "downloadImage": "yes" }));
        assert!(resp.is_error);
        assert!(resp.first_text().contains("must be a boolean"));

        let resp = f.dispatcher.handle(ASK, &json!(["prompt"]));
        assert!(resp.is_error);
    }

    #[test]
    fn ask_sanitizes_and_returns_reply() {
        let f = fixture();
        let resp = f
            .dispatcher
            .handle(ASK, &json!({ "prompt": "say \"hi\"\nplease" }));
        assert!(!resp.is_error);
        assert_eq!(resp.first_text(), "pong");
        assert_eq!(f.ui.asked.lock().unwrap()[0], "say \\\"hi\\\" please");
    }

    #[test]
    fn ask_is_rate_limited() {
        let f = fixture_with(0.0, 1);
        assert!(!f.dispatcher.handle(ASK, &json!({ "prompt": "one" })).is_error);
        let resp = f.dispatcher.handle(ASK, &json!({ "prompt": "two" }));
        assert!(resp.is_error);
        assert!(resp.first_text().contains("rate limited"));
        assert!(resp.first_text().contains("Hint:"));
    }

    #[test]
    fn conversations_are_numbered() {
        let f = fixture();
        *f.ui.conversations.lock().unwrap() = vec!["Trip".to_string(), "Rust".to_string()];
        let resp = f.dispatcher.handle(GET_CONVERSATIONS, &json!({}));
        assert_eq!(resp.first_text(), "Found 2 conversations:\n1. Trip\n2. Rust");

        let resp = f.dispatcher.handle(GET_CONVERSATIONS, &json!({ "limit": 1 }));
        assert_eq!(resp.first_text(), "Found 1 conversations:\n1. Trip");

        let resp = f.dispatcher.handle(GET_CONVERSATIONS, &json!({ "limit": 500 }));
        assert!(resp.is_error);
    }

    #[test]
    fn async_flow_through_dispatcher() {
        let f = fixture();
        let resp = f
            .dispatcher
            .handle(START_IMAGE_GENERATION, &json!({ "prompt": "a red balloon" }));
        assert!(!resp.is_error, "{}", resp.first_text());
        let body: Value = serde_json::from_str(resp.first_text()).unwrap();
        assert_eq!(body["status"], "pending");
        let id = body["generation_id"].as_str().unwrap().to_string();
        f.tasks.wait_idle();

        let resp = f
            .dispatcher
            .handle(CHECK_GENERATION_STATUS, &json!({ "generation_id": id }));
        let status: Value = serde_json::from_str(resp.first_text()).unwrap();
        assert_eq!(status["status"], "generating");

        f.ui.set_probe(false, 1);
        let resp = f
            .dispatcher
            .handle(CHECK_GENERATION_STATUS, &json!({ "generation_id": id }));
        let status: Value = serde_json::from_str(resp.first_text()).unwrap();
        assert_eq!(status["status"], "completed");
        assert_eq!(status["id"], id.as_str());
        assert!(status.get("imagePath").is_none());
    }

    #[test]
    fn unknown_generation_id_is_not_found() {
        let f = fixture();
        let resp = f
            .dispatcher
            .handle(CHECK_GENERATION_STATUS, &json!({ "generation_id": "gen_nope" }));
        assert!(resp.is_error);
        assert!(resp.first_text().contains("generation not found: gen_nope"));
    }

    #[test]
    fn sync_generation_downloads_image() {
        let f = fixture();
        f.ui.set_probe(false, 1);
        let resp = f.dispatcher.handle(
            GENERATE_IMAGE,
            &json!({ "prompt": "a kite", "style": "pixel art", "savePath": "kite.png" }),
        );
        assert!(!resp.is_error, "{}", resp.first_text());
        assert!(resp.first_text().contains("Saved to:"));
        assert!(resp.first_text().contains("4x3"));
        assert!(f.dir.path().join("kite.png").exists());
        assert_eq!(
            f.ui.triggered.lock().unwrap()[0].0,
            "Generate an image: a kite. Style: pixel art"
        );
    }

    #[test]
    fn sync_generation_without_download() {
        let f = fixture();
        f.ui.set_probe(false, 1);
        let resp = f.dispatcher.handle(
            GENERATE_IMAGE,
            &json!({ "prompt": "a kite", "downloadImage": false, "cleanupAfter": true }),
        );
        assert!(!resp.is_error, "{}", resp.first_text());
        assert!(!resp.first_text().contains("Saved to:"));
        assert!(resp.first_text().contains("Cleanup removed 0"));
        assert!(f.ui.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn sync_generation_rejects_bad_save_path_before_triggering() {
        let f = fixture();
        let resp = f.dispatcher.handle(
            GENERATE_IMAGE,
            &json!({ "prompt": "a kite", "savePath": "../../etc/passwd" }),
        );
        assert!(resp.is_error);
        assert!(resp.first_text().contains("escapes the download directory"));
        assert!(f.ui.triggered.lock().unwrap().is_empty());
    }

    #[test]
    fn sync_generation_times_out() {
        let f = fixture();
        let resp = f
            .dispatcher
            .handle(GENERATE_IMAGE, &json!({ "prompt": "never finishes" }));
        assert!(resp.is_error);
        assert!(resp.first_text().contains("GenerationTimeout"));
    }

    #[test]
    fn latest_image_reports_caveat() {
        let f = fixture();
        let resp = f
            .dispatcher
            .handle(GET_LATEST_IMAGE, &json!({ "savePath": "latest.webp" }));
        assert!(!resp.is_error, "{}", resp.first_text());
        assert!(resp.first_text().contains("not tied to any generation_id"));

        f.ui.set_save_mode(SaveMode::Fail);
        let resp = f.dispatcher.handle(GET_LATEST_IMAGE, &json!({}));
        assert!(resp.is_error);
        assert!(resp.first_text().contains("no image found"));
    }

    #[test]
    fn opportunistic_cleanup_runs_in_background() {
        let f = fixture_with(1.0, 1000);
        f.ui.fail_trigger("composer missing");
        let resp = f
            .dispatcher
            .handle(START_IMAGE_GENERATION, &json!({ "prompt": "x" }));
        assert!(!resp.is_error);
        f.tasks.wait_idle();
        assert_eq!(f.tracker.finished_count(), 1);

        let stale = f.dir.path().join("old.png");
        let fresh = f.dir.path().join("new.png");
        std::fs::write(&stale, b"old").unwrap();
        std::fs::write(&fresh, b"new").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(48 * 3600))
            .unwrap();
        f.clock.advance(chrono::Duration::hours(2));

        let resp = f.dispatcher.handle(GET_CONVERSATIONS, &json!({}));
        assert!(!resp.is_error);
        f.tasks.wait_idle();
        assert_eq!(f.tasks.outstanding(), 0);
        assert_eq!(f.tracker.finished_count(), 0);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }
}
