//! Async image-generation jobs.
//!
//! A job lives in the active map from `start` until a status check (or
//! cleanup) observes it finishing, failing, or timing out. It then moves to
//! the finished map as an immutable [`GenerationStatus`] and never returns to
//! the active map. The trigger call runs on a detached thread; if it fails the
//! thread records the failure directly.

use crate::chatgpt::ChatUi;
use crate::clock::Clock;
use crate::config::TrackerLimits;
use crate::error::{BridgeError, BridgeResult};
use crate::files::{DownloadManager, DownloadOutcome};
use crate::rate_limit::RateLimiter;
use crate::sanitize::{sanitize_text, MAX_LABEL_CHARS};
use crate::tasks::BackgroundTasks;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const START_KEY: &str = "start_image_generation";
pub const LATEST_IMAGE_KEY: &str = "get_latest_image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl GenerationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, GenerationState::Completed | GenerationState::Failed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub style: Option<String>,
    pub size: Option<String>,
    pub conversation_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub id: String,
    pub prompt: String,
    pub style: Option<String>,
    pub size: Option<String>,
    pub conversation_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set once the prompt has been handed to the app.
    pub triggered: bool,
}

impl GenerationJob {
    /// Prompt text as typed into the composer.
    pub fn composed_prompt(&self) -> String {
        compose_image_prompt(&self.prompt, self.style.as_deref(), self.size.as_deref())
    }

    fn snapshot(&self, status: GenerationState) -> GenerationStatus {
        GenerationStatus {
            id: self.id.clone(),
            status,
            prompt: self.prompt.clone(),
            timestamp: self.started_at,
            error: None,
            image_path: None,
        }
    }
}

pub fn compose_image_prompt(prompt: &str, style: Option<&str>, size: Option<&str>) -> String {
    let mut text = format!("Generate an image: {prompt}");
    if let Some(style) = style {
        text.push_str(&format!(". Style: {style}"));
    }
    if let Some(size) = size {
        text.push_str(&format!(". Size: {size}"));
    }
    text
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub id: String,
    pub status: GenerationState,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerCleanupReport {
    pub timed_out: usize,
    pub expired: usize,
    pub evicted_active: usize,
    pub evicted_finished: usize,
}

#[derive(Default)]
struct TrackerState {
    active: HashMap<String, GenerationJob>,
    finished: HashMap<String, GenerationStatus>,
}

impl TrackerState {
    /// Moves `id` out of the active map. Only a job that is still active gets
    /// a record; otherwise whatever is already recorded for `id` (possibly
    /// nothing, once cleanup dropped it) is returned unchanged.
    fn finish(&mut self, id: &str, status: GenerationStatus) -> Option<GenerationStatus> {
        debug_assert!(status.status.is_terminal());
        if self.active.remove(id).is_none() {
            return self.finished.get(id).cloned();
        }
        self.finished.insert(id.to_string(), status.clone());
        Some(status)
    }
}

pub struct GenerationTracker {
    state: Arc<Mutex<TrackerState>>,
    ui: Arc<dyn ChatUi>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    limits: TrackerLimits,
    tasks: Arc<BackgroundTasks>,
}

impl GenerationTracker {
    pub fn new(
        ui: Arc<dyn ChatUi>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        limits: TrackerLimits,
        tasks: Arc<BackgroundTasks>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            ui,
            limiter,
            clock,
            limits,
            tasks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn finished_count(&self) -> usize {
        self.lock().finished.len()
    }

    /// Registers a job and fires the generation request without waiting on it.
    pub fn start(&self, request: GenerationRequest) -> BridgeResult<String> {
        let max_chars = self.limits.max_prompt_chars;
        if request.prompt.chars().count() > max_chars {
            return Err(BridgeError::InvalidInput(format!(
                "prompt exceeds {max_chars} characters"
            )));
        }
        let prompt = sanitize_text(&request.prompt, max_chars)?;
        let style = sanitize_optional(request.style.as_deref())?;
        let size = sanitize_optional(request.size.as_deref())?;
        let conversation_ref = sanitize_optional(request.conversation_ref.as_deref())?;

        self.limiter.check(START_KEY)?;

        let job = {
            let mut state = self.lock();
            if state.active.len() >= self.limits.max_active {
                warn!(active = state.active.len(), "generation batch limit reached");
                return Err(BridgeError::BatchLimitExceeded {
                    limit: self.limits.max_active,
                });
            }
            let job = GenerationJob {
                id: new_generation_id(),
                prompt,
                style,
                size,
                conversation_ref,
                started_at: self.clock.now(),
                triggered: false,
            };
            state.active.insert(job.id.clone(), job.clone());
            job
        };
        info!(id = %job.id, "image generation started");

        let state = Arc::clone(&self.state);
        let ui = Arc::clone(&self.ui);
        let clock = Arc::clone(&self.clock);
        let id = job.id.clone();
        let text = job.composed_prompt();
        let conversation = job.conversation_ref.clone();
        let snapshot = job.snapshot(GenerationState::Failed);
        self.tasks.spawn("generation-trigger", move || {
            let result = ui.trigger_generation(&text, conversation.as_deref());
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            match result {
                Ok(()) => {
                    if let Some(job) = state.active.get_mut(&id) {
                        job.triggered = true;
                    }
                }
                Err(err) => {
                    let message = err.public_message();
                    warn!(id = %id, error = %message, "generation trigger failed");
                    let _ = state.finish(
                        &id,
                        GenerationStatus {
                            timestamp: clock.now(),
                            error: Some(message),
                            ..snapshot
                        },
                    );
                }
            }
        });

        Ok(job.id)
    }

    /// Current status of `id`, or `None` when the id was never issued (or has
    /// been evicted). A job past the generation timeout fails without touching
    /// the UI. Other active jobs are re-evaluated against the UI, except that
    /// a job whose prompt has not been sent yet is never probed.
    pub fn status(&self, id: &str) -> Option<GenerationStatus> {
        let job = {
            let state = self.lock();
            if let Some(done) = state.finished.get(id) {
                return Some(done.clone());
            }
            state.active.get(id)?.clone()
        };

        let now = self.clock.now();
        if now - job.started_at > self.limits.generation_timeout {
            return self.lock().finish(id, self.timeout_status(&job, now));
        }
        if !job.triggered {
            return Some(job.snapshot(GenerationState::Generating));
        }

        let complete = match self.ui.probe_generation() {
            Ok(probe) => {
                debug!(id, ?probe, "generation probe");
                probe.is_complete(self.limits.require_new_image_marker)
            }
            Err(err) => {
                warn!(id, error = %err.public_message(), "generation probe failed");
                false
            }
        };

        if complete {
            info!(id, "image generation completed");
            let status = GenerationStatus {
                timestamp: self.clock.now(),
                ..job.snapshot(GenerationState::Completed)
            };
            return self.lock().finish(id, status);
        }

        let state = self.lock();
        if let Some(done) = state.finished.get(id) {
            return Some(done.clone());
        }
        Some(job.snapshot(GenerationState::Generating))
    }

    fn timeout_status(&self, job: &GenerationJob, now: DateTime<Utc>) -> GenerationStatus {
        warn!(id = %job.id, "image generation timed out");
        GenerationStatus {
            timestamp: now,
            error: Some(
                BridgeError::GenerationTimeout {
                    minutes: self.limits.generation_timeout.num_minutes(),
                }
                .to_string(),
            ),
            ..job.snapshot(GenerationState::Failed)
        }
    }

    /// Times out stale jobs, drops finished statuses past retention, and
    /// enforces the hard caps oldest-first.
    pub fn cleanup(&self) -> TrackerCleanupReport {
        let now = self.clock.now();
        let mut report = TrackerCleanupReport::default();
        let mut state = self.lock();

        let stale: Vec<GenerationJob> = state
            .active
            .values()
            .filter(|job| now - job.started_at > self.limits.generation_timeout)
            .cloned()
            .collect();
        for job in stale {
            let status = self.timeout_status(&job, now);
            let _ = state.finish(&job.id, status);
            report.timed_out += 1;
        }

        if state.active.len() > self.limits.active_cap {
            let mut by_age: Vec<(DateTime<Utc>, String)> = state
                .active
                .values()
                .map(|job| (job.started_at, job.id.clone()))
                .collect();
            by_age.sort();
            let excess = state.active.len() - self.limits.active_cap;
            for (_, id) in by_age.into_iter().take(excess) {
                if let Some(job) = state.active.get(&id).cloned() {
                    let status = GenerationStatus {
                        timestamp: now,
                        error: Some("evicted".to_string()),
                        ..job.snapshot(GenerationState::Failed)
                    };
                    let _ = state.finish(&id, status);
                    report.evicted_active += 1;
                }
            }
        }

        let retention = self.limits.status_retention;
        let before = state.finished.len();
        state
            .finished
            .retain(|_, status| now - status.timestamp <= retention);
        report.expired = before - state.finished.len();

        if state.finished.len() > self.limits.finished_cap {
            let mut by_age: Vec<(DateTime<Utc>, String)> = state
                .finished
                .values()
                .map(|status| (status.timestamp, status.id.clone()))
                .collect();
            by_age.sort();
            let excess = state.finished.len() - self.limits.finished_cap;
            for (_, id) in by_age.into_iter().take(excess) {
                state.finished.remove(&id);
                report.evicted_finished += 1;
            }
        }

        if report != TrackerCleanupReport::default() {
            info!(?report, "generation tracker cleanup");
        }
        report
    }

    /// Saves whatever image is newest in the open conversation. This is not
    /// tied to any tracked job: if several generations ran, the saved file
    /// belongs to whichever one the app shows last.
    pub fn latest_image(
        &self,
        files: &DownloadManager,
        save_path: Option<&str>,
    ) -> BridgeResult<DownloadOutcome> {
        self.limiter.check(LATEST_IMAGE_KEY)?;
        files.download(self.ui.as_ref(), save_path)
    }
}

fn sanitize_optional(value: Option<&str>) -> BridgeResult<Option<String>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => sanitize_text(v, MAX_LABEL_CHARS).map(Some),
        None => Ok(None),
    }
}

fn new_generation_id() -> String {
    format!("gen_{}", Uuid::new_v4().simple())
}
