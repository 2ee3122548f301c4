//! Checkpoint manifest persistence (spec §4.1 `write_manifest`,
//! `read_manifest`, `list`, head-signature accessors).
//!
//! Grounded in the teacher's `checkpoint/storage.rs::save_checkpoint`, which
//! writes a `checkpoint.json` alongside each content-addressable snapshot;
//! this engine keeps that one-manifest-per-checkpoint shape but writes it
//! through [`crate::atomic::write_json`] instead of a plain `fs::write`.

use crate::atomic::{read_json, write_bytes, write_json};
use crate::model::Checkpoint;
use crate::paths::StorageLayout;
use anyhow::{Context, Result};
use std::path::PathBuf;

pub fn write_manifest(layout: &StorageLayout, checkpoint: &Checkpoint) -> Result<()> {
    std::fs::create_dir_all(layout.snapshot_dir(&checkpoint.name))
        .with_context(|| format!("creating snapshot directory for {}", checkpoint.name))?;
    write_json(&layout.manifest_file(&checkpoint.name), checkpoint)
}

pub fn read_manifest(layout: &StorageLayout, checkpoint_name: &str) -> Result<Checkpoint> {
    read_json(&layout.manifest_file(checkpoint_name))
        .with_context(|| format!("reading manifest for checkpoint {}", checkpoint_name))
}

/// List checkpoint names present under `snapshots/`, newest first
/// (reverse-lexicographic on name, which sorts newest-first since names are
/// timestamp-prefixed — spec §4.1 naming convention `checkpoint_<ISO8601>`).
pub fn list(layout: &StorageLayout) -> Result<Vec<String>> {
    let dir = layout.snapshots_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {:?}", dir))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort_by(|a, b| b.cmp(a));
    Ok(names)
}

/// Read every manifest in `list()` order, skipping (and logging) any entry
/// whose `manifest.json` fails to parse rather than failing the whole
/// listing — one corrupt checkpoint should not hide the rest.
pub fn list_checkpoints(layout: &StorageLayout) -> Result<Vec<Checkpoint>> {
    let mut out = Vec::new();
    for name in list(layout)? {
        match read_manifest(layout, &name) {
            Ok(checkpoint) => out.push(checkpoint),
            Err(e) => log::warn!("skipping unreadable checkpoint {}: {}", name, e),
        }
    }
    Ok(out)
}

pub fn delete_checkpoint(layout: &StorageLayout, checkpoint_name: &str) -> Result<()> {
    let dir = layout.snapshot_dir(checkpoint_name);
    if dir.exists() {
        std::fs::remove_dir_all(&dir).with_context(|| format!("removing {:?}", dir))?;
    }
    Ok(())
}

/// The working tree's last-known signature, used by the Change Detector to
/// decide whether a new checkpoint is warranted (spec §4.3 "Unchanged").
pub fn get_head_signature(layout: &StorageLayout) -> Result<Option<String>> {
    let path = layout.head_signature_file();
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
    Ok(Some(raw.trim().to_string()))
}

pub fn set_head_signature(layout: &StorageLayout, signature: &str) -> Result<()> {
    write_bytes(&layout.head_signature_file(), signature.as_bytes())
}

pub fn manifest_path(layout: &StorageLayout, checkpoint_name: &str) -> PathBuf {
    layout.manifest_file(checkpoint_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageMode;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_checkpoint(name: &str) -> Checkpoint {
        Checkpoint {
            name: name.to_string(),
            timestamp: Utc::now(),
            description: "test".to_string(),
            files: vec![],
            file_count: 0,
            total_size: 0,
            signature: "abc".to_string(),
            file_metadata: vec![],
            transcript: None,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::resolve(dir.path(), StorageMode::Project).unwrap();
        layout.ensure_dirs().unwrap();

        let checkpoint = sample_checkpoint("checkpoint_2026-07-28T00-00-00Z");
        write_manifest(&layout, &checkpoint).unwrap();
        let loaded = read_manifest(&layout, &checkpoint.name).unwrap();
        assert_eq!(loaded.name, checkpoint.name);
    }

    #[test]
    fn list_is_newest_first() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::resolve(dir.path(), StorageMode::Project).unwrap();
        layout.ensure_dirs().unwrap();

        write_manifest(&layout, &sample_checkpoint("checkpoint_2026-07-28T00-00-00Z")).unwrap();
        write_manifest(&layout, &sample_checkpoint("checkpoint_2026-07-28T01-00-00Z")).unwrap();

        let names = list(&layout).unwrap();
        assert_eq!(
            names,
            vec![
                "checkpoint_2026-07-28T01-00-00Z".to_string(),
                "checkpoint_2026-07-28T00-00-00Z".to_string(),
            ]
        );
    }

    #[test]
    fn head_signature_round_trips() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::resolve(dir.path(), StorageMode::Project).unwrap();
        layout.ensure_dirs().unwrap();

        assert!(get_head_signature(&layout).unwrap().is_none());
        set_head_signature(&layout, "deadbeef").unwrap();
        assert_eq!(get_head_signature(&layout).unwrap(), Some("deadbeef".to_string()));
    }
}
