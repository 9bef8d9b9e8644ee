use chrono::Duration as TimeDelta;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DOWNLOAD_DIR_ENV: &str = "CHATGPT_MCP_DOWNLOAD_DIR";
pub const DEBUG_ENV: &str = "CHATGPT_MCP_DEBUG";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            max_jitter: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerLimits {
    /// Active jobs allowed before `start` fails with a batch limit error.
    pub max_active: usize,
    /// Hard ceilings enforced by cleanup, oldest first.
    pub active_cap: usize,
    pub finished_cap: usize,
    pub max_prompt_chars: usize,
    pub generation_timeout: TimeDelta,
    pub status_retention: TimeDelta,
    pub require_new_image_marker: bool,
}

impl Default for TrackerLimits {
    fn default() -> Self {
        Self {
            max_active: 10,
            active_cap: 50,
            finished_cap: 100,
            max_prompt_chars: 4000,
            generation_timeout: TimeDelta::minutes(30),
            status_retention: TimeDelta::hours(1),
            require_new_image_marker: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimits {
    pub window: TimeDelta,
    pub default_max: usize,
    pub per_key: HashMap<String, usize>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            window: TimeDelta::seconds(60),
            default_max: 5,
            per_key: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    pub max_age_hours: u64,
    pub max_size_mb: u64,
    pub keep_last: usize,
    /// Upper bound on files deleted by a single sweep.
    pub max_files_per_sweep: usize,
    pub max_file_bytes: u64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            max_age_hours: 24,
            max_size_mb: 500,
            keep_last: 100,
            max_files_per_sweep: 200,
            max_file_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub app_name: String,
    pub download_dir: PathBuf,
    pub debug: bool,
    pub retry: RetryPolicy,
    pub tracker: TrackerLimits,
    pub rate_limits: RateLimits,
    pub cleanup: CleanupPolicy,
    pub cleanup_interval: Duration,
    pub opportunistic_cleanup_ratio: f64,
    pub script_timeout: Duration,
    pub ask_timeout: Duration,
    pub sync_generation_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_name: "ChatGPT".to_string(),
            download_dir: default_download_dir(),
            debug: false,
            retry: RetryPolicy::default(),
            tracker: TrackerLimits::default(),
            rate_limits: RateLimits::default(),
            cleanup: CleanupPolicy::default(),
            cleanup_interval: Duration::from_secs(5 * 60),
            opportunistic_cleanup_ratio: 0.1,
            script_timeout: Duration::from_secs(60),
            ask_timeout: Duration::from_secs(180),
            sync_generation_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    /// Applies CLI values on top of environment values on top of defaults.
    pub fn resolve(download_dir: Option<PathBuf>, debug: bool) -> Self {
        let mut config = Self::default();
        if let Some(dir) = download_dir.or_else(env_download_dir) {
            config.download_dir = dir;
        }
        config.debug = debug || env_flag(DEBUG_ENV);
        config
    }
}

fn env_download_dir() -> Option<PathBuf> {
    env::var(DOWNLOAD_DIR_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn default_download_dir() -> PathBuf {
    env::var("HOME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|home| PathBuf::from(home).join("Downloads").join("ChatGPT-MCP"))
        .unwrap_or_else(|| PathBuf::from(".chatgpt-mcp").join("downloads"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = BridgeConfig::default();
        assert_eq!(config.tracker.max_active, 10);
        assert_eq!(config.tracker.max_prompt_chars, 4000);
        assert_eq!(config.tracker.generation_timeout, TimeDelta::minutes(30));
        assert_eq!(config.rate_limits.default_max, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cleanup.max_file_bytes, 50 * 1024 * 1024);
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
    }

    #[test]
    fn cli_download_dir_wins() {
        let config = BridgeConfig::resolve(Some(PathBuf::from("/tmp/cli-dir")), true);
        assert_eq!(config.download_dir, PathBuf::from("/tmp/cli-dir"));
        assert!(config.debug);
    }
}
