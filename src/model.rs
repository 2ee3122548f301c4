//! Data model entities from the specification's data model section:
//! Checkpoint, Transcript Cursor, Conversation Metadata Record, Restore
//! History Entry. Serialization follows the on-disk manifest shape exactly
//! (plain `snake_case` JSON keys, no camelCase renaming, since this crate has
//! no JS/TS frontend to serve).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// `{size, mtime_ms}` for one file, used for diff summaries and as the
/// signature's raw material — never for integrity checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_ms: i64,
}

/// A byte-exact pointer into a JSONL transcript plus fingerprints of its
/// prefix. See spec §3 "Transcript Cursor".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptCursor {
    pub byte_offset_end: u64,
    pub last_event_id: String,
    pub prefix_sha256: String,
    pub tail_sha256: String,
}

/// The transcript block attached to a checkpoint manifest, iff a transcript
/// was observed at capture time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptBlock {
    pub agent: String,
    pub original_path: PathBuf,
    /// Filename of the snapshot within the checkpoint directory
    /// (`transcript.jsonl.gz`).
    pub snapshot: String,
    pub cursor: TranscriptCursor,
}

/// An immutable record of code (and optionally transcript) state at an
/// instant. See spec §3 "Checkpoint".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub files: Vec<PathBuf>,
    pub file_count: usize,
    pub total_size: u64,
    pub signature: String,
    pub file_metadata: Vec<FileMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<TranscriptBlock>,
}

impl Checkpoint {
    pub fn has_transcript(&self) -> bool {
        self.transcript.is_some()
    }

    /// Whether this name belongs to a safety/emergency backup taken
    /// immediately before a restore. Safety backups are exempt from
    /// count-based pruning (spec §4.1 `prune`).
    pub fn is_safety_backup(&self) -> bool {
        self.name.starts_with("emergency_backup_")
    }
}

/// Associates a checkpoint name with conversation-side metadata. Stored in
/// one JSON mapping file (`conversation_metadata.json`) per project, keyed by
/// checkpoint name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMetadataRecord {
    pub agent_kind: String,
    pub session_id: String,
    pub transcript_path: PathBuf,
    pub last_event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
}

pub type ConversationMetadataMap = HashMap<String, ConversationMetadataRecord>;

/// One record per restore operation, enabling undo-of-restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub checkpoint: String,
    pub backup_checkpoint_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_backup_path: Option<PathBuf>,
}

/// `{timestamp, action, description, details}`, a bounded changelog of
/// controller-level actions, independent of the checkpoint history itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Restore mode, spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    Code,
    Context,
    Both,
    Fork,
}

impl Default for RestoreMode {
    fn default() -> Self {
        RestoreMode::Fork
    }
}
