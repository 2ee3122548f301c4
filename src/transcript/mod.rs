//! Transcript Manager (C2): cursoring, snapshotting, forking, and in-place
//! rewriting of a JSONL transcript the agent process owns. See spec §4.2.
//!
//! Mirrors [`crate::store::CheckpointStore`]'s shape: a thin facade over this
//! module's submodules, holding the per-agent [`AgentSchema`] so callers
//! (the Controller) don't thread it through every call.

pub mod cursor;
pub mod fork;

use crate::config::AgentSchema;
use crate::model::TranscriptCursor;
use anyhow::Result;
use std::path::{Path, PathBuf};

pub struct TranscriptManager<'a> {
    pub schema: &'a AgentSchema,
}

impl<'a> TranscriptManager<'a> {
    pub fn new(schema: &'a AgentSchema) -> Self {
        Self { schema }
    }

    /// spec §4.2 `compute_cursor`.
    pub fn compute_cursor(&self, transcript_path: &Path) -> Result<TranscriptCursor> {
        cursor::compute_cursor(transcript_path, self.schema)
    }

    /// spec §4.2 `find_boundary_by_user_prompts`.
    pub fn find_boundary_by_user_prompts(
        &self,
        transcript_path: &Path,
        n: usize,
    ) -> Result<TranscriptCursor> {
        cursor::find_boundary_by_user_prompts(transcript_path, n, self.schema)
    }

    /// Invariant 5 ("prefix stability for fast-path"): true iff the
    /// transcript's current bytes still match `cursor`.
    pub fn verify_cursor(&self, transcript_path: &Path, target: &TranscriptCursor) -> Result<bool> {
        cursor::verify_cursor(transcript_path, target)
    }

    /// spec §4.2 `snapshot`.
    pub fn snapshot(&self, transcript_path: &Path, out_path: &Path) -> Result<()> {
        fork::snapshot(transcript_path, out_path)
    }

    /// spec §4.2 `fork`: copy-truncate fast path or materialise-from-snapshot
    /// fallback, returning the new file's path.
    pub fn fork(
        &self,
        transcript_path: Option<&Path>,
        target: &TranscriptCursor,
        snapshot_path: &Path,
    ) -> Result<PathBuf> {
        fork::fork(transcript_path, target, snapshot_path, self.schema)
    }

    /// spec §4.2 `rewrite_in_place`.
    pub fn rewrite_in_place(
        &self,
        transcript_path: &Path,
        target: &TranscriptCursor,
        snapshot_path: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf> {
        fork::rewrite_in_place(transcript_path, target, snapshot_path, backup_dir)
    }

    /// spec §4.2 `restore_transcript_from_snapshot`.
    pub fn restore_transcript_from_snapshot(
        &self,
        snapshot_path: &Path,
        transcript_path: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf> {
        fork::restore_transcript_from_snapshot(snapshot_path, transcript_path, backup_dir)
    }
}
