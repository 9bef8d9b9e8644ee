use crate::chatgpt::ChatUi;
use crate::config::CleanupPolicy;
use crate::error::{BridgeError, BridgeResult};
use crate::sanitize::{has_allowed_extension, is_within, validate_path};
use chrono::Utc;
use image::ImageReader;
use rand::Rng;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Upper bound on directory entries inspected by one sweep.
const MAX_SCAN_ENTRIES: usize = 10_000;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl DownloadOutcome {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub freed_bytes: u64,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.scanned = self.scanned.max(other.scanned);
        self.deleted += other.deleted;
        self.freed_bytes += other.freed_bytes;
    }
}

#[derive(Debug, Clone)]
struct ImageEntry {
    path: PathBuf,
    bytes: u64,
    modified: SystemTime,
}

/// Owns the download directory: saves images into it and sweeps it.
pub struct DownloadManager {
    root: PathBuf,
    policy: CleanupPolicy,
    save_wait: Duration,
}

impl DownloadManager {
    /// `save_wait` bounds how long `download` waits for the save dialog to
    /// produce the file.
    pub fn new(root: PathBuf, policy: CleanupPolicy, save_wait: Duration) -> Self {
        Self {
            root,
            policy,
            save_wait,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_directory(&self) -> BridgeResult<PathBuf> {
        if self.root.exists() && !self.root.is_dir() {
            return Err(BridgeError::InvalidFilename(format!(
                "download path is not a directory: {}",
                self.root.display()
            )));
        }
        fs::create_dir_all(&self.root)?;
        Ok(self.root.clone())
    }

    /// Asks the app to save its newest image, then checks the file landed,
    /// is non-empty, under the size ceiling and decodes as an image. Rejected
    /// files are deleted.
    pub fn download(&self, ui: &dyn ChatUi, save_path: Option<&str>) -> BridgeResult<DownloadOutcome> {
        self.ensure_directory()?;
        let target = match save_path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(candidate) => validate_path(candidate, &self.root)?,
            None => validate_path(&default_image_name(), &self.root)?,
        };
        if target.exists() {
            return Err(BridgeError::InvalidFilename(format!(
                "{} already exists",
                target.file_name().and_then(|n| n.to_str()).unwrap_or("file")
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Err(err) = ui.save_latest_image(&target) {
            return Ok(DownloadOutcome::failed(err.public_message()));
        }
        self.wait_for_file(&target);

        match self.verify(&target) {
            Ok((bytes, width, height)) => {
                info!(path = %target.display(), bytes, width, height, "image downloaded");
                Ok(DownloadOutcome {
                    success: true,
                    path: Some(target),
                    error: None,
                    bytes: Some(bytes),
                    width: Some(width),
                    height: Some(height),
                })
            }
            Err(err) => {
                if target.exists() {
                    if let Err(remove_err) = fs::remove_file(&target) {
                        warn!(error = %remove_err, "failed to remove rejected download");
                    }
                }
                Ok(DownloadOutcome::failed(err.public_message()))
            }
        }
    }

    fn wait_for_file(&self, target: &Path) {
        let deadline = Instant::now() + self.save_wait;
        loop {
            let size = fs::metadata(target).map(|m| m.len()).unwrap_or(0);
            if size > 0 || Instant::now() >= deadline {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    fn verify(&self, target: &Path) -> BridgeResult<(u64, u32, u32)> {
        let meta = fs::metadata(target).map_err(|_| {
            BridgeError::FileVerification("the app did not write the image file".to_string())
        })?;
        if !meta.is_file() {
            return Err(BridgeError::FileVerification("not a regular file".to_string()));
        }
        let bytes = meta.len();
        if bytes == 0 {
            return Err(BridgeError::FileVerification("file is empty".to_string()));
        }
        if bytes > self.policy.max_file_bytes {
            return Err(BridgeError::FileVerification(format!(
                "file is {bytes} bytes, limit is {}",
                self.policy.max_file_bytes
            )));
        }
        let (width, height) = ImageReader::open(target)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(BridgeError::from)?
            .into_dimensions()
            .map_err(|err| BridgeError::FileVerification(format!("not a readable image: {err}")))?;
        Ok((bytes, width, height))
    }

    fn scoped_dir(&self, dir: &Path) -> BridgeResult<PathBuf> {
        if !is_within(dir, &self.root) {
            return Err(BridgeError::PathTraversal(dir.display().to_string()));
        }
        Ok(dir.to_path_buf())
    }

    fn list_images(&self, dir: &Path) -> BridgeResult<Vec<ImageEntry>> {
        let mut entries = Vec::new();
        let read = match fs::read_dir(dir) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        for entry in read.take(MAX_SCAN_ENTRIES) {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            if !meta.is_file() || !has_allowed_extension(&path) {
                continue;
            }
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            if hidden {
                continue;
            }
            entries.push(ImageEntry {
                path,
                bytes: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }

    fn delete(&self, entry: &ImageEntry, report: &mut CleanupReport) {
        let inside = match (fs::canonicalize(&entry.path), fs::canonicalize(&self.root)) {
            (Ok(path), Ok(root)) => path.starts_with(root),
            _ => false,
        };
        if !inside {
            warn!(path = %entry.path.display(), "refusing to delete file outside download directory");
            return;
        }
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                debug!(path = %entry.path.display(), "deleted");
                report.deleted += 1;
                report.freed_bytes += entry.bytes;
            }
            Err(err) => warn!(path = %entry.path.display(), error = %err, "delete failed"),
        }
    }

    pub fn cleanup_by_age(&self, dir: &Path, max_age_hours: u64) -> BridgeResult<CleanupReport> {
        let dir = self.scoped_dir(dir)?;
        let mut entries = self.list_images(&dir)?;
        let mut report = CleanupReport {
            scanned: entries.len(),
            ..CleanupReport::default()
        };
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(max_age_hours.saturating_mul(3600)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.sort_by_key(|e| e.modified);
        for entry in entries
            .iter()
            .filter(|e| e.modified < cutoff)
            .take(self.policy.max_files_per_sweep)
        {
            self.delete(entry, &mut report);
        }
        Ok(report)
    }

    pub fn cleanup_by_size(&self, dir: &Path, max_size_mb: u64) -> BridgeResult<CleanupReport> {
        let dir = self.scoped_dir(dir)?;
        let mut entries = self.list_images(&dir)?;
        let mut report = CleanupReport {
            scanned: entries.len(),
            ..CleanupReport::default()
        };
        let limit = max_size_mb.saturating_mul(MIB);
        let mut total: u64 = entries.iter().map(|e| e.bytes).sum();
        entries.sort_by_key(|e| e.modified);
        for entry in &entries {
            if total <= limit || report.deleted >= self.policy.max_files_per_sweep {
                break;
            }
            let before = report.deleted;
            self.delete(entry, &mut report);
            if report.deleted > before {
                total = total.saturating_sub(entry.bytes);
            }
        }
        Ok(report)
    }

    pub fn cleanup_by_count(&self, dir: &Path, keep_last: usize) -> BridgeResult<CleanupReport> {
        let dir = self.scoped_dir(dir)?;
        let mut entries = self.list_images(&dir)?;
        let mut report = CleanupReport {
            scanned: entries.len(),
            ..CleanupReport::default()
        };
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        for entry in entries
            .iter()
            .skip(keep_last)
            .rev()
            .take(self.policy.max_files_per_sweep)
        {
            self.delete(entry, &mut report);
        }
        Ok(report)
    }

    /// Runs the age, size and count sweeps with the configured policy.
    pub fn cleanup_all(&self) -> BridgeResult<CleanupReport> {
        let root = self.root.clone();
        let mut report = self.cleanup_by_age(&root, self.policy.max_age_hours)?;
        report.merge(self.cleanup_by_size(&root, self.policy.max_size_mb)?);
        report.merge(self.cleanup_by_count(&root, self.policy.keep_last)?);
        if report.deleted > 0 {
            info!(
                deleted = report.deleted,
                freed_bytes = report.freed_bytes,
                "download directory cleanup"
            );
        }
        Ok(report)
    }
}

fn default_image_name() -> String {
    let ts = Utc::now().format("%Y%m%d-%H%M%S");
    let rand = rand::thread_rng().gen_range(1000..9999);
    format!("chatgpt-image-{ts}-{}-{rand}.png", std::process::id())
}
