//! `weave cache` command implementation.

use super::{print_json, ErrorJson};
use miette::Result;
use serde::Serialize;
use std::path::Path;
use weave_core::{paths, BuildConfig, IncrementalCache};

#[derive(Debug, Clone, Copy)]
pub enum CacheAction {
    Clear,
    Stats,
}

#[derive(Serialize)]
struct CacheResultJson {
    ok: bool,
    action: &'static str,
    dir: String,
    files: usize,
    bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorJson>,
}

/// Run a cache command against the project's persisted cache directory.
///
/// The directory is the configured one even when the current mode would
/// not use it.
pub fn run(root: &Path, action: CacheAction, json: bool) -> Result<()> {
    let dir = match BuildConfig::load(root, None, None) {
        Ok(config) => config
            .cache
            .dir
            .unwrap_or_else(|| paths::project_cache_dir(root)),
        Err(e) => {
            if json {
                print_json(&CacheResultJson {
                    ok: false,
                    action: action_name(action),
                    dir: String::new(),
                    files: 0,
                    bytes: 0,
                    error: Some(ErrorJson::from_configuration(&e)),
                })?;
            } else {
                eprintln!("error[{}]: {e}", e.code());
            }
            std::process::exit(1);
        }
    };
    let cache = IncrementalCache::with_disk(&dir);

    let error = match action {
        CacheAction::Clear => cache.clear().err(),
        CacheAction::Stats => None,
    };
    let (bytes, files) = cache.disk_usage().unwrap_or_default();

    if json {
        print_json(&CacheResultJson {
            ok: error.is_none(),
            action: action_name(action),
            dir: dir.display().to_string(),
            files,
            bytes,
            error: error.as_ref().map(|e| ErrorJson {
                code: e.code().to_string(),
                message: e.to_string(),
                path: Some(e.path.display().to_string()),
            }),
        })?;
    } else if let Some(e) = &error {
        eprintln!("error[{}]: {e}", e.code());
    } else {
        match action {
            CacheAction::Clear => println!("Cleared {}", dir.display()),
            CacheAction::Stats => {
                println!("Cache: {}", dir.display());
                println!("  {files} files, {bytes} bytes");
            }
        }
    }

    if error.is_some() {
        std::process::exit(1);
    }
    Ok(())
}

fn action_name(action: CacheAction) -> &'static str {
    match action {
        CacheAction::Clear => "clear",
        CacheAction::Stats => "stats",
    }
}
