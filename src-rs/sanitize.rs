use crate::error::{BridgeError, BridgeResult};
use std::env;
use std::path::{Component, Path, PathBuf};

pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

pub const MAX_PROMPT_CHARS: usize = 4000;
pub const MAX_LABEL_CHARS: usize = 200;

/// Makes free text safe to embed in an AppleScript string literal.
///
/// Whitespace runs (including newlines and tabs) collapse to one space,
/// other control characters are dropped, and the result is cut to
/// `max_chars` characters before backslashes and quotes are escaped.
pub fn sanitize_text(input: &str, max_chars: usize) -> BridgeResult<String> {
    let collapsed = input
        .split_whitespace()
        .map(|word| word.chars().filter(|c| !c.is_control()).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.is_empty() {
        return Err(BridgeError::InvalidInput(
            "text must be a non-empty string".to_string(),
        ));
    }

    let mut out = String::with_capacity(collapsed.len());
    for ch in collapsed.chars().take(max_chars) {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(ch),
        }
    }
    Ok(out)
}

/// Resolves `candidate` against `root` and checks that it names an image file
/// inside `root`. Relative candidates are taken relative to `root`.
pub fn validate_path(candidate: &str, root: &Path) -> BridgeResult<PathBuf> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed.contains('\0') {
        return Err(BridgeError::InvalidFilename(
            "path must be a non-empty string".to_string(),
        ));
    }

    let root_abs = normalize(&absolute(root));
    let expanded = expand_home(trimmed);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        root_abs.join(expanded)
    };
    let resolved = normalize(&joined);

    if !resolved.starts_with(&root_abs) {
        return Err(BridgeError::PathTraversal(trimmed.to_string()));
    }

    let name = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BridgeError::InvalidFilename(trimmed.to_string()))?;
    if name.starts_with('.') || name.contains("..") || name.contains(['/', '\\', ':']) {
        return Err(BridgeError::InvalidFilename(name.to_string()));
    }

    if !has_allowed_extension(&resolved) {
        let ext = resolved
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        return Err(BridgeError::InvalidExtension(if ext.is_empty() {
            "(none)".to_string()
        } else {
            ext
        }));
    }

    Ok(resolved)
}

pub fn has_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// True when `path` is `root` or nested under it after lexical normalization.
pub fn is_within(path: &Path, root: &Path) -> bool {
    normalize(&absolute(path)).starts_with(normalize(&absolute(root)))
}

pub fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Lexical normalization: drops `.` and folds `..` without touching the
/// filesystem. `..` never climbs above the filesystem root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
