use crate::config::CONFIG_FILE_NAME;
use crate::version::CACHE_SCHEMA_VERSION;
use std::path::{Path, PathBuf};
use weave_util::hash::{fingerprint_bytes, short};

/// Find the project root by walking up from `cwd`.
///
/// Returns the first directory containing `weave.config.json`, `package.json`
/// or `.git`, or `None` if no marker is found.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join(CONFIG_FILE_NAME).exists()
            || current.join("package.json").exists()
            || current.join(".git").exists()
        {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Get the cache directory for weave.
///
/// Uses platform-appropriate locations with versioning:
/// - Linux: `$XDG_CACHE_HOME/weave/v{N}/cache` or `~/.cache/weave/v{N}/cache`
/// - macOS: `~/Library/Caches/weave/v{N}/cache`
/// - Windows: `%LOCALAPPDATA%\weave\v{N}\cache`
#[must_use]
pub fn cache_dir() -> PathBuf {
    let base = dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".weave-cache"),
                |p| p.join(".cache").join("weave"),
            )
        },
        |p| p.join("weave"),
    );

    base.join(format!("v{CACHE_SCHEMA_VERSION}")).join("cache")
}

/// Persisted cache directory for one project, keyed by a hash of its root.
#[must_use]
pub fn project_cache_dir(root: &Path) -> PathBuf {
    let digest = fingerprint_bytes(root.to_string_lossy().as_bytes());
    cache_dir().join(short(&digest, 16))
}

/// Render `path` relative to `root` with forward slashes.
///
/// Paths outside `root` are returned as-is.
#[must_use]
pub fn display_relative(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}
