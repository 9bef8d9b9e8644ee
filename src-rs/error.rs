use regex::Regex;
use std::env;
use std::sync::OnceLock;
use thiserror::Error;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Failure kinds surfaced to MCP callers.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("rate limited: too many `{key}` requests, retry in {retry_after_secs}s")]
    RateLimited { key: String, retry_after_secs: u64 },

    #[error("path escapes the download directory: {0}")]
    PathTraversal(String),

    #[error("unsupported file extension: {0}")]
    InvalidExtension(String),

    #[error("invalid file name: {0}")]
    InvalidFilename(String),

    #[error("ChatGPT app is not accessible: {0}")]
    AppNotAccessible(String),

    #[error("ChatGPT app is not running: {0}")]
    AppNotRunning(String),

    #[error("UI automation failed: {0}")]
    Automation(String),

    #[error("GenerationTimeout: image generation did not finish within {minutes} minutes")]
    GenerationTimeout { minutes: i64 },

    #[error("too many concurrent generations (limit {limit})")]
    BatchLimitExceeded { limit: usize },

    #[error("generation not found: {0}")]
    NotFound(String),

    #[error("downloaded file rejected: {0}")]
    FileVerification(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::InvalidInput(_) => "invalid_input",
            BridgeError::InvalidArguments(_) => "invalid_arguments",
            BridgeError::RateLimited { .. } => "rate_limited",
            BridgeError::PathTraversal(_) => "path_traversal",
            BridgeError::InvalidExtension(_) => "invalid_extension",
            BridgeError::InvalidFilename(_) => "invalid_filename",
            BridgeError::AppNotAccessible(_) => "app_not_accessible",
            BridgeError::AppNotRunning(_) => "app_not_running",
            BridgeError::Automation(_) => "automation_failed",
            BridgeError::GenerationTimeout { .. } => "generation_timeout",
            BridgeError::BatchLimitExceeded { .. } => "batch_limit_exceeded",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::FileVerification(_) => "file_verification_failed",
            BridgeError::Io(_) => "io_error",
        }
    }

    /// Short remediation text appended to the tool response.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            BridgeError::AppNotAccessible(_) => Some(
                "Grant accessibility permission to your terminal or MCP host in System Settings > Privacy & Security > Accessibility.",
            ),
            BridgeError::AppNotRunning(_) => {
                Some("Start the ChatGPT desktop app and sign in, then retry.")
            }
            BridgeError::Automation(_) => {
                Some("Make sure the ChatGPT window is open and not showing a modal dialog.")
            }
            BridgeError::RateLimited { .. } | BridgeError::BatchLimitExceeded { .. } => {
                Some("Wait a moment before sending more requests.")
            }
            BridgeError::PathTraversal(_)
            | BridgeError::InvalidExtension(_)
            | BridgeError::InvalidFilename(_) => Some(
                "Use a plain .png/.jpg/.jpeg/.gif/.webp file name inside the download directory.",
            ),
            _ => None,
        }
    }

    /// Caller-facing message, scrubbed of local paths and credentials.
    pub fn public_message(&self) -> String {
        scrub_message(&self.to_string())
    }
}

fn secret_pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)\b([a-z_\-]*(?:api[_\-]?key|token|password|passwd|secret)[a-z_\-]*)(\s*[:=]\s*)("[^"]*"|'[^']*'|[^\s,;]+)"#,
        )
        .expect("secret pair pattern")
    })
}

fn bearer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._\-]+").expect("bearer pattern"))
}

fn key_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bsk-[A-Za-z0-9_\-]{16,}").expect("key literal pattern"))
}

fn home_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/(Users|home)/[^/\s:'\x22]+").expect("home dir pattern"))
}

/// Removes home directories, the local user name and credential-looking
/// substrings from a message before it is logged or returned.
pub fn scrub_message(message: &str) -> String {
    let mut out = message.to_string();

    if let Some(home) = env::var("HOME").ok().filter(|h| h.len() > 1) {
        out = out.replace(home.trim_end_matches('/'), "~");
    }
    out = home_dir_re().replace_all(&out, "/$1/[user]").into_owned();
    out = secret_pair_re()
        .replace_all(&out, "$1$2[redacted]")
        .into_owned();
    out = bearer_re().replace_all(&out, "Bearer [redacted]").into_owned();
    out = key_literal_re().replace_all(&out, "[redacted]").into_owned();

    let user = env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .ok()
        .filter(|u| u.len() >= 3 && u != "user");
    if let Some(user) = user {
        if let Ok(re) = Regex::new(&format!(r"\b{}\b", regex::escape(&user))) {
            out = re.replace_all(&out, "[user]").into_owned();
        }
    }
    out
}
