//! Checkpoint Store (C1): scans the working tree, archives it, and persists
//! the manifest that ties an archive back to its file list and signature.
//! See spec §4.1.

pub mod archive;
pub mod manifest;
pub mod retention;
pub mod scan;

use crate::config::{Config, IgnoreConfig};
use crate::model::{Checkpoint, FileMetadata, TranscriptBlock};
use crate::paths::StorageLayout;
use anyhow::{Context, Result};
use chrono::Utc;

/// Thin facade over the free functions in this module's submodules, holding
/// the `StorageLayout` so callers (the controller) don't thread it through
/// every call.
pub struct CheckpointStore<'a> {
    pub layout: &'a StorageLayout,
}

impl<'a> CheckpointStore<'a> {
    pub fn new(layout: &'a StorageLayout) -> Self {
        Self { layout }
    }

    /// Scan, stat, and hash the working tree without writing anything —
    /// used by the Change Detector to decide whether a checkpoint is
    /// warranted before paying for an archive write.
    pub fn capture_signature(
        &self,
        project_root: &std::path::Path,
        ignore_config: &IgnoreConfig,
    ) -> Result<(Vec<std::path::PathBuf>, Vec<FileMetadata>, String)> {
        let files = scan::scan_working_tree_excluding(project_root, ignore_config, Some(&self.layout.root))?;
        let stats = scan::stat_files(project_root, &files)?;
        let signature = scan::compute_signature(&stats);
        Ok((files, stats, signature))
    }

    /// Build and persist a new checkpoint: archive the given files, write
    /// the manifest, and return the resulting `Checkpoint`. Does not touch
    /// the transcript; callers attach a `TranscriptBlock` separately via
    /// [`Self::attach_transcript`] when one is available.
    pub fn create_checkpoint(
        &self,
        project_root: &std::path::Path,
        name: &str,
        description: &str,
        files: Vec<std::path::PathBuf>,
        file_metadata: Vec<FileMetadata>,
        signature: String,
    ) -> Result<Checkpoint> {
        std::fs::create_dir_all(self.layout.snapshot_dir(name))
            .with_context(|| format!("creating snapshot directory for {}", name))?;

        let total_size = file_metadata.iter().map(|f| f.size).sum();
        if let Err(e) = archive::create_archive(project_root, &files, &self.layout.archive_file(name)) {
            // spec §4.1: "If archive creation fails, the snapshot directory
            // is removed so that list() never returns a half-written
            // checkpoint."
            let snapshot_dir = self.layout.snapshot_dir(name);
            if let Err(cleanup_err) = std::fs::remove_dir_all(&snapshot_dir) {
                log::warn!(
                    "failed to clean up snapshot directory {:?} after archive error: {}",
                    snapshot_dir,
                    cleanup_err
                );
            }
            return Err(e);
        }

        let checkpoint = Checkpoint {
            name: name.to_string(),
            timestamp: Utc::now(),
            description: description.to_string(),
            file_count: files.len(),
            files,
            total_size,
            signature: signature.clone(),
            file_metadata,
            transcript: None,
        };
        manifest::write_manifest(self.layout, &checkpoint)?;
        manifest::set_head_signature(self.layout, &signature)?;
        Ok(checkpoint)
    }

    pub fn attach_transcript(&self, mut checkpoint: Checkpoint, transcript: TranscriptBlock) -> Result<Checkpoint> {
        checkpoint.transcript = Some(transcript);
        manifest::write_manifest(self.layout, &checkpoint)?;
        Ok(checkpoint)
    }

    pub fn restore_files(&self, checkpoint_name: &str, project_root: &std::path::Path) -> Result<usize> {
        archive::extract_archive(&self.layout.archive_file(checkpoint_name), project_root)
    }

    pub fn get(&self, checkpoint_name: &str) -> Result<Checkpoint> {
        manifest::read_manifest(self.layout, checkpoint_name)
    }

    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        manifest::list_checkpoints(self.layout)
    }

    pub fn prune(&self, config: &Config, protected: &[String]) -> Result<Vec<String>> {
        retention::prune(self.layout, &config.retention, protected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageMode;
    use tempfile::TempDir;

    #[test]
    fn create_then_restore_round_trips_contents() {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("a.txt"), "hello").unwrap();

        let storage_dir = TempDir::new().unwrap();
        let layout = StorageLayout::resolve(storage_dir.path(), StorageMode::Project).unwrap();
        layout.ensure_dirs().unwrap();

        let store = CheckpointStore::new(&layout);
        let ignore_config = IgnoreConfig { honor_gitignore: false, ..IgnoreConfig::default() };
        let (files, stats, signature) = store
            .capture_signature(project.path(), &ignore_config)
            .unwrap();

        let checkpoint = store
            .create_checkpoint(project.path(), "checkpoint_test", "test", files, stats, signature)
            .unwrap();
        assert_eq!(checkpoint.file_count, 1);

        let restore_dir = TempDir::new().unwrap();
        let count = store.restore_files("checkpoint_test", restore_dir.path()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            std::fs::read_to_string(restore_dir.path().join("a.txt")).unwrap(),
            "hello"
        );
    }

    /// Forces `archive::create_archive` to fail (snapshot directory made
    /// read-only so the temp archive file can't be created inside it) and
    /// checks the cleanup spec §4.1 requires: no half-written checkpoint
    /// directory left behind for `list()` to trip over. `env_logger` is
    /// initialized so the warning this path logs is visible under
    /// `cargo test -- --nocapture`, the same harness the teacher's tests use.
    #[test]
    #[cfg(unix)]
    fn create_checkpoint_cleans_up_snapshot_dir_on_archive_failure() {
        use std::os::unix::fs::PermissionsExt;

        let _ = env_logger::builder().is_test(true).try_init();

        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("a.txt"), "hello").unwrap();

        let storage_dir = TempDir::new().unwrap();
        let layout = StorageLayout::resolve(storage_dir.path(), StorageMode::Project).unwrap();
        layout.ensure_dirs().unwrap();

        let store = CheckpointStore::new(&layout);
        let ignore_config = IgnoreConfig { honor_gitignore: false, ..IgnoreConfig::default() };
        let (files, stats, signature) = store
            .capture_signature(project.path(), &ignore_config)
            .unwrap();

        let name = "checkpoint_archive_fail";
        let snapshot_dir = layout.snapshot_dir(name);
        std::fs::create_dir_all(&snapshot_dir).unwrap();
        std::fs::set_permissions(&snapshot_dir, std::fs::Permissions::from_mode(0o500)).unwrap();

        let result = store.create_checkpoint(project.path(), name, "test", files, stats, signature);
        // restore write permission so the TempDir's own Drop cleanup can
        // remove the tree regardless of the assertions below
        let _ = std::fs::set_permissions(&snapshot_dir, std::fs::Permissions::from_mode(0o700));

        assert!(result.is_err());
        assert!(
            !snapshot_dir.exists(),
            "snapshot directory must be removed after an archive failure"
        );
    }
}
