use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const WORKTREES_DIR: &str = "worktrees";

/// Branch/directory name for a workspace: lowercase ASCII letters and
/// digits joined by single dashes.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        return format!("workspace-{secs}");
    }
    out
}

/// Stable id for a worktree: truncated SHA-256 of its absolute path.
pub fn worktree_id(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Absolute form of `path`: canonical when it exists, lexically
/// normalized otherwise.
pub fn resolve(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return Ok(canonical);
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize(&absolute))
}

/// True when `candidate` lies strictly below `root`. Both must already be
/// resolved.
pub fn is_contained(root: &Path, candidate: &Path) -> bool {
    let candidate = normalize(candidate);
    candidate != root && candidate.starts_with(root)
}

/// True when any component of the path is literally `worktrees`.
pub fn has_worktrees_segment(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(name) if name == WORKTREES_DIR))
}
