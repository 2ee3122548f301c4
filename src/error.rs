//! Crate-wide typed error for the public API surface.
//!
//! Internal plumbing (scanning, archiving, transcript cursoring) uses
//! `anyhow::Result` for ergonomic `?`/`.context()` composition, the same way
//! the checkpoint module this crate is descended from does. The `Controller`
//! converts those into a `RewindError` variant at the public boundary so
//! external callers get something they can match on instead of an opaque
//! `anyhow::Error`.

use std::path::PathBuf;
use thiserror::Error;

/// The outcome of an attempted rollback after a failed restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Error)]
pub enum RewindError {
    #[error("project root {0:?} does not exist or equals the home directory")]
    ProjectRootInvalid(PathBuf),

    #[error("could not create or write storage root {0:?}: {1}")]
    StorageUnavailable(PathBuf, #[source] anyhow::Error),

    #[error("failed to scan working tree: {0}")]
    ScanError(#[source] anyhow::Error),

    #[error("archive operation failed: {0}")]
    ArchiveError(#[source] anyhow::Error),

    #[error("manifest at {0:?} is corrupt: {1}")]
    ManifestCorrupt(PathBuf, #[source] anyhow::Error),

    #[error("transcript at {0:?} is unavailable: {1}")]
    TranscriptUnavailable(PathBuf, #[source] anyhow::Error),

    #[error("transcript at {0:?} contains no complete events")]
    NoEventsError(PathBuf),

    #[error("transcript at {0:?} has fewer than {requested} user prompts (found {found})")]
    InsufficientPromptsError {
        path: PathBuf,
        requested: usize,
        found: usize,
    },

    #[error("restore failed: {source}")]
    RestoreFailed {
        #[source]
        source: anyhow::Error,
        safety_backup_name: Option<String>,
        rollback: Option<RollbackOutcome>,
    },

    #[error("checkpoint {0} is referenced by a pending restore history entry")]
    RetentionConflict(String),

    #[error("no checkpoint named {0}")]
    CheckpointNotFound(String),

    #[error("no restore history entry to undo")]
    NoRestoreHistory,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RewindError {
    /// Recovers a typed variant from an `anyhow::Error` raised by the
    /// Transcript Manager's internal plumbing (`transcript::cursor`), which
    /// speaks in `anyhow::Result` but raises the concrete, downcastable
    /// [`crate::transcript::cursor::NoEventsError`] /
    /// [`crate::transcript::cursor::InsufficientPromptsError`] types at its
    /// bail sites. Searches the whole error chain, not just the top-level
    /// error, since `.context(...)` wraps the original cause rather than
    /// replacing it. Falls back to `TranscriptUnavailable` — an unreadable
    /// or otherwise inaccessible transcript — when neither is found.
    pub fn from_transcript_failure(path: &std::path::Path, error: anyhow::Error) -> Self {
        use crate::transcript::cursor::{InsufficientPromptsError, NoEventsError};

        if let Some(e) = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<InsufficientPromptsError>())
        {
            return RewindError::InsufficientPromptsError {
                path: e.path.clone(),
                requested: e.requested,
                found: e.found,
            };
        }
        if error
            .chain()
            .any(|cause| cause.downcast_ref::<NoEventsError>().is_some())
        {
            return RewindError::NoEventsError(path.to_path_buf());
        }
        RewindError::TranscriptUnavailable(path.to_path_buf(), error)
    }
}

pub type Result<T> = std::result::Result<T, RewindError>;
