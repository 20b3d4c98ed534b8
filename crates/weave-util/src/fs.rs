use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use walkdir::WalkDir;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically write bytes to a file by writing a sibling temp file and renaming it.
///
/// Missing parent directories are created. Readers observe either the old or
/// the new contents, never a partial write.
///
/// # Errors
/// Returns an error if the directory, the temp file, or the rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    // pid + counter keeps concurrent writers in one process apart
    let temp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Windows refuses to rename over an existing file
            if cfg!(windows) {
                fs::copy(&temp_path, path)?;
                let _ = fs::remove_file(&temp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
        }
    }
}

/// Remove everything inside `dir`, keeping the directory itself.
///
/// A missing directory is not an error.
///
/// # Errors
/// Returns an error if an entry cannot be removed.
pub fn empty_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Total size in bytes and number of files below `dir`.
#[must_use]
pub fn dir_usage(dir: &Path) -> (u64, usize) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .fold((0, 0), |(bytes, files), meta| (bytes + meta.len(), files + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_creates_parents_and_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("js").join("main.js");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.js");

        atomic_write(&path, b"content").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["bundle.js".to_string()]);
    }

    #[test]
    fn test_empty_dir_keeps_root() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("dist");
        atomic_write(&out.join("css").join("main.css"), b"a{}").unwrap();
        atomic_write(&out.join("stale.js"), b"1").unwrap();

        empty_dir(&out).unwrap();

        assert!(out.is_dir());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_dir_missing_is_ok() {
        let dir = tempdir().unwrap();
        assert!(empty_dir(&dir.path().join("nope")).is_ok());
    }

    #[test]
    fn test_dir_usage() {
        let dir = tempdir().unwrap();
        atomic_write(&dir.path().join("a").join("x.json"), b"12345").unwrap();
        atomic_write(&dir.path().join("y.json"), b"123").unwrap();

        assert_eq!(dir_usage(dir.path()), (8, 2));
    }
}
