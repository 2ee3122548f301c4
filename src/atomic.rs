//! Atomic file writes: temp file in the same directory, then rename.
//!
//! The teacher (`checkpoint/storage.rs`) writes manifests and timelines with
//! a plain `fs::write`, which is not crash-safe against concurrent readers.
//! Spec §5 requires every shared file (manifest, head signature, anti-spam
//! map, restore history, conversation metadata map) to use atomic
//! temp-plus-rename writes, so this crate centralizes the pattern instead of
//! repeating it at each call site.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Write `bytes` to `path` atomically: write to a sibling temp file, fsync,
/// then rename over `path`. The rename is same-filesystem by construction
/// (the temp file lives in `path`'s own directory), so it is atomic on POSIX.
pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("creating directory {:?}", dir))?;

    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("rewind"),
        uuid::Uuid::new_v4()
    );
    let tmp_path = dir.join(tmp_name);

    {
        let mut f = fs::File::create(&tmp_path)
            .with_context(|| format!("creating temp file {:?}", tmp_path))?;
        use std::io::Write;
        f.write_all(bytes)
            .with_context(|| format!("writing temp file {:?}", tmp_path))?;
        f.sync_all()
            .with_context(|| format!("fsyncing temp file {:?}", tmp_path))?;
    }

    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Cross-filesystem rename is not expected here (tmp_path and
            // path share a parent), but fall back to copy+remove for safety,
            // per spec §6.3's documented filesystem contract.
            if e.raw_os_error() == Some(libc_exdev()) {
                fs::copy(&tmp_path, path)
                    .with_context(|| format!("copying {:?} to {:?}", tmp_path, path))?;
                let _ = fs::remove_file(&tmp_path);
                Ok(())
            } else {
                let _ = fs::remove_file(&tmp_path);
                Err(e).with_context(|| format!("renaming {:?} to {:?}", tmp_path, path))
            }
        }
    }
}

pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing JSON")?;
    write_bytes(path, json.as_bytes())
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {:?}", path))
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18 // EXDEV on Linux/macOS/BSD
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    i32::MIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_json(&path, &serde_json::json!({"a": 1})).unwrap();
        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn overwrite_is_atomic_from_readers_perspective() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        write_bytes(&path, b"first").unwrap();
        write_bytes(&path, b"second-longer-value").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "second-longer-value");
    }
}
