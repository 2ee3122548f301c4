//! Controller (C4): the crate's single public entry point. Composes the
//! Checkpoint Store, Transcript Manager, Change Detector, and Hook Policy
//! into the atomic, reversible operations spec §4.4 describes:
//! `create_checkpoint`, `list_checkpoints`, `restore`, `undo_last_checkpoint`,
//! `undo_restore`, `rewind_back`, `gc`, plus [`Self::handle_hook_event`] (an
//! (AMBIENT) convenience that ties the Hook Policy's decision directly to
//! `create_checkpoint`, since every hook adapter needs exactly that
//! composition).
//!
//! Internal plumbing returns `anyhow::Result`; this module is where those
//! get converted into typed [`RewindError`]s via the `#[from]` conversion on
//! [`RewindError::Other`] — callers outside the crate get something
//! matchable, while call sites here keep using `?` freely, the same balance
//! spec §7's error-handling design calls for.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use chrono::Utc;

use crate::atomic::{read_json, write_json};
use crate::config::{AgentSchema, Config};
use crate::detector::{self, ChangeStatus};
use crate::error::{RewindError, RollbackOutcome};
use crate::hook::{HookEvent, HookPolicy};
use crate::model::{
    ChangelogEntry, Checkpoint, ConversationMetadataMap, ConversationMetadataRecord,
    RestoreHistoryEntry, RestoreMode, TranscriptBlock, TranscriptCursor,
};
use crate::paths::StorageLayout;
use crate::store::CheckpointStore;
use crate::transcript::TranscriptManager;

pub type Result<T> = crate::error::Result<T>;

/// Bounds `changelog.json` so it doesn't grow without limit (spec §6.1:
/// "bounded list of {timestamp, action, description, details}").
const CHANGELOG_CAP: usize = 500;

static NAME_DISAMBIGUATOR: AtomicU64 = AtomicU64::new(0);

/// What the Controller needs to know about a live conversation transcript
/// to attach one to a checkpoint, spec §4.4 step 7's `hook_payload`.
#[derive(Debug, Clone, Default)]
pub struct TranscriptPayload {
    pub transcript_path: PathBuf,
    pub agent_kind: String,
    pub session_id: String,
    pub user_prompt: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateCheckpointRequest {
    pub description: String,
    pub name: Option<String>,
    pub force: bool,
    pub hook_payload: Option<TranscriptPayload>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateCheckpointResult {
    pub ok: bool,
    pub no_changes: bool,
    pub empty: bool,
    pub name: Option<String>,
    pub signature: Option<String>,
    pub file_count: usize,
    pub total_bytes: u64,
    pub has_transcript: bool,
}

/// spec §4.4 `restore`'s `name_or_selector`.
#[derive(Debug, Clone)]
pub enum RestoreSelector {
    Named(String),
    Newest,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub selector: RestoreSelector,
    pub mode: RestoreMode,
    pub skip_backup: bool,
    pub dry_run: bool,
}

impl Default for RestoreRequest {
    fn default() -> Self {
        Self {
            selector: RestoreSelector::Newest,
            mode: RestoreMode::default(),
            skip_backup: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreResult {
    pub ok: bool,
    pub restored_name: Option<String>,
    pub safety_backup_name: Option<String>,
    pub fork_path: Option<PathBuf>,
    /// "A single line instructing the user to reload the agent session",
    /// present only for context-affecting restores (spec §6.4).
    pub action_required: Option<String>,
    pub rollback: Option<RollbackOutcome>,
}

/// One entry as returned by [`Controller::list_checkpoints`], joined against
/// its conversation metadata record (spec §4.4 "Joins in the conversation
/// metadata side-by-side").
#[derive(Debug, Clone)]
pub struct CheckpointListing {
    pub checkpoint: Checkpoint,
    pub conversation: Option<ConversationMetadataRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct RewindBackOptions {
    pub both: bool,
    pub in_place: bool,
}

/// spec §4.4: single public entry point, owning one project's storage root.
pub struct Controller {
    pub project_root: PathBuf,
    pub layout: StorageLayout,
    pub config: Config,
}

impl Controller {
    /// Resolve `project_root`'s storage layout (bootstrapping off the
    /// project-local default to find a `config.json` that might declare
    /// global mode — see DESIGN.md's resolution of this Open Question),
    /// load its configuration, and ensure the storage directories exist.
    pub fn new(project_root: &Path) -> Result<Self> {
        let probe = StorageLayout::resolve(project_root, crate::config::StorageMode::Project)
            .map_err(|_| RewindError::ProjectRootInvalid(project_root.to_path_buf()))?;
        let config = Config::load(&probe.root).unwrap_or_default();
        Self::with_config(project_root, config)
    }

    pub fn with_config(project_root: &Path, config: Config) -> Result<Self> {
        let layout = StorageLayout::resolve(project_root, config.storage_mode)
            .map_err(|_| RewindError::ProjectRootInvalid(project_root.to_path_buf()))?;
        layout
            .ensure_dirs()
            .map_err(|e| RewindError::StorageUnavailable(layout.root.clone(), e))?;
        Ok(Self {
            project_root: project_root.to_path_buf(),
            layout,
            config,
        })
    }

    // ---- create_checkpoint (spec §4.4) --------------------------------

    pub fn create_checkpoint(&self, request: CreateCheckpointRequest) -> Result<CreateCheckpointResult> {
        let store = CheckpointStore::new(&self.layout);
        let (files, stats, signature) = store
            .capture_signature(&self.project_root, &self.config.ignore)
            .map_err(RewindError::ScanError)?;

        if !request.force {
            let status = detector::detect(&self.layout, &signature)?;
            if status == ChangeStatus::Unchanged {
                log::debug!("create_checkpoint: unchanged since last head signature, skipping");
                return Ok(CreateCheckpointResult {
                    ok: true,
                    no_changes: true,
                    ..Default::default()
                });
            }
        }

        if files.is_empty() {
            log::debug!("create_checkpoint: working tree is empty, skipping");
            return Ok(CreateCheckpointResult {
                ok: true,
                no_changes: true,
                empty: true,
                ..Default::default()
            });
        }

        let name = self.mint_name(request.name.as_deref())?;
        let mut checkpoint = store
            .create_checkpoint(
                &self.project_root,
                &name,
                &request.description,
                files,
                stats,
                signature.clone(),
            )
            .map_err(RewindError::ArchiveError)?;
        log::info!("created checkpoint {} ({} files)", name, checkpoint.file_count);

        let mut has_transcript = false;
        if let Some(payload) = &request.hook_payload {
            match self.attach_transcript(&store, &checkpoint, payload) {
                Ok(updated) => {
                    checkpoint = updated;
                    has_transcript = true;
                }
                Err(e) => {
                    let typed = RewindError::from_transcript_failure(&payload.transcript_path, e);
                    log::warn!(
                        "transcript unavailable for checkpoint {}, code-only: {}",
                        name,
                        typed
                    );
                }
            }
            if let Err(e) = self.record_conversation_metadata(&name, payload, &checkpoint) {
                log::warn!("failed to record conversation metadata for {}: {}", name, e);
            }
        }

        match self.protected_checkpoint_names().and_then(|protected| {
            store.prune(&self.config, &protected)
        }) {
            Ok(deleted) if !deleted.is_empty() => {
                log::info!("pruned {} checkpoint(s): {:?}", deleted.len(), deleted)
            }
            Ok(_) => {}
            Err(e) => log::warn!("retention prune failed: {}", e),
        }

        if let Err(e) = self.append_changelog(
            "create_checkpoint",
            &request.description,
            serde_json::json!({"name": name, "file_count": checkpoint.file_count}),
        ) {
            log::warn!("failed to append changelog entry: {}", e);
        }

        Ok(CreateCheckpointResult {
            ok: true,
            no_changes: false,
            empty: false,
            name: Some(checkpoint.name.clone()),
            signature: Some(checkpoint.signature.clone()),
            file_count: checkpoint.file_count,
            total_bytes: checkpoint.total_size,
            has_transcript,
        })
    }

    fn attach_transcript(
        &self,
        store: &CheckpointStore,
        checkpoint: &Checkpoint,
        payload: &TranscriptPayload,
    ) -> anyhow::Result<Checkpoint> {
        let schema = self.config.schema_for(&payload.agent_kind);
        let manager = TranscriptManager::new(&schema);
        let cursor = manager
            .compute_cursor(&payload.transcript_path)
            .context("computing transcript cursor")?;
        let snapshot_path = self.layout.transcript_snapshot_file(&checkpoint.name);
        manager
            .snapshot(&payload.transcript_path, &snapshot_path)
            .context("snapshotting transcript")?;
        let block = TranscriptBlock {
            agent: payload.agent_kind.clone(),
            original_path: payload.transcript_path.clone(),
            snapshot: "transcript.jsonl.gz".to_string(),
            cursor,
        };
        store.attach_transcript(checkpoint.clone(), block)
    }

    fn record_conversation_metadata(
        &self,
        name: &str,
        payload: &TranscriptPayload,
        checkpoint: &Checkpoint,
    ) -> anyhow::Result<()> {
        let mut map = self.load_conversation_metadata()?;
        let last_event_id = checkpoint
            .transcript
            .as_ref()
            .map(|t| t.cursor.last_event_id.clone())
            .unwrap_or_default();
        map.insert(
            name.to_string(),
            ConversationMetadataRecord {
                agent_kind: payload.agent_kind.clone(),
                session_id: payload.session_id.clone(),
                transcript_path: payload.transcript_path.clone(),
                last_event_id,
                user_prompt: payload.user_prompt.clone(),
            },
        );
        write_json(&self.layout.conversation_metadata_file(), &map)
    }

    fn load_conversation_metadata(&self) -> anyhow::Result<ConversationMetadataMap> {
        let path = self.layout.conversation_metadata_file();
        if !path.exists() {
            return Ok(ConversationMetadataMap::new());
        }
        read_json(&path)
    }

    /// Mint a lexicographically-increasing, project-unique checkpoint name
    /// (spec §3 invariant 1, §4.4 step 5). Collisions — same slug and second
    /// within one process, or a concurrent hook process racing us — are
    /// broken with a monotonic in-process counter suffix, which keeps
    /// candidates strictly increasing even when the wall clock hasn't
    /// advanced (a longer string that is an extension of a shorter one
    /// always sorts after it).
    fn mint_name(&self, requested: Option<&str>) -> Result<String> {
        let slug = requested
            .map(slugify)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "checkpoint".to_string());
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        let base = format!("{}_{}", slug, timestamp);

        let existing: HashSet<String> = crate::store::manifest::list(&self.layout)?
            .into_iter()
            .collect();
        if !existing.contains(&base) {
            return Ok(base);
        }
        loop {
            let n = NAME_DISAMBIGUATOR.fetch_add(1, Ordering::SeqCst) + 1;
            let candidate = format!("{}-{}", base, n);
            if !existing.contains(&candidate) {
                return Ok(candidate);
            }
        }
    }

    fn protected_checkpoint_names(&self) -> anyhow::Result<Vec<String>> {
        let history = self.load_restore_history()?;
        let mut names = Vec::with_capacity(history.len() * 2);
        for entry in &history {
            names.push(entry.checkpoint.clone());
            names.push(entry.backup_checkpoint_name.clone());
        }
        Ok(names)
    }

    fn load_restore_history(&self) -> anyhow::Result<Vec<RestoreHistoryEntry>> {
        let path = self.layout.restore_history_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }

    fn save_restore_history(&self, history: &[RestoreHistoryEntry]) -> anyhow::Result<()> {
        write_json(&self.layout.restore_history_file(), &history)
    }

    fn append_changelog(&self, action: &str, description: &str, details: serde_json::Value) -> anyhow::Result<()> {
        let path = self.layout.changelog_file();
        let mut entries: Vec<ChangelogEntry> = if path.exists() {
            read_json(&path).unwrap_or_default()
        } else {
            Vec::new()
        };
        entries.push(ChangelogEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            description: description.to_string(),
            details,
        });
        if entries.len() > CHANGELOG_CAP {
            let excess = entries.len() - CHANGELOG_CAP;
            entries.drain(0..excess);
        }
        write_json(&path, &entries)
    }

    // ---- list_checkpoints (spec §4.4) ----------------------------------

    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointListing>> {
        let store = CheckpointStore::new(&self.layout);
        let checkpoints = store.list()?;
        let metadata = self.load_conversation_metadata().unwrap_or_default();
        Ok(checkpoints
            .into_iter()
            .map(|checkpoint| {
                let conversation = metadata.get(&checkpoint.name).cloned();
                CheckpointListing { checkpoint, conversation }
            })
            .collect())
    }

    fn resolve_target(&self, selector: &RestoreSelector) -> Result<Checkpoint> {
        let store = CheckpointStore::new(&self.layout);
        match selector {
            // A manifest that exists but fails to parse is `ManifestCorrupt`
            // (spec §7: "fatal for direct read"), distinct from a checkpoint
            // that was never created, which is `CheckpointNotFound` — the
            // two must not be conflated just because both surface as a
            // `read_manifest` error.
            RestoreSelector::Named(name) => store.get(name).map_err(|e| {
                let manifest_path = self.layout.manifest_file(name);
                if manifest_path.exists() {
                    RewindError::ManifestCorrupt(manifest_path, e)
                } else {
                    RewindError::CheckpointNotFound(name.clone())
                }
            }),
            RestoreSelector::Newest => {
                let checkpoints = store.list()?;
                checkpoints
                    .into_iter()
                    .find(|c| !c.is_safety_backup())
                    .ok_or_else(|| RewindError::CheckpointNotFound("<newest>".to_string()))
            }
        }
    }

    // ---- restore (spec §4.4) -------------------------------------------

    /// State machine per spec §4.4: `Planning -> SafetyBackup -> Mutating ->
    /// Verifying -> Done`, terminating in `RolledBack` or `Failed` on
    /// failure. Transitions are only logged here (no separate persisted
    /// state) since one controller call always runs to completion or fails
    /// before returning — there is no re-entry to resume across.
    pub fn restore(&self, request: RestoreRequest) -> Result<RestoreResult> {
        let target = self.resolve_target(&request.selector)?;
        log::debug!("restore[Planning]: target={}", target.name);

        if request.dry_run {
            let action_required = matches!(request.mode, RestoreMode::Context | RestoreMode::Both)
                .then(|| "Reload your agent session to pick up the rewound conversation.".to_string());
            return Ok(RestoreResult {
                ok: true,
                restored_name: Some(target.name.clone()),
                action_required,
                ..Default::default()
            });
        }

        let mut safety_backup_name: Option<String> = None;
        if !request.skip_backup {
            log::debug!("restore[Planning->SafetyBackup]: target={}", target.name);
            let hook_payload = self.current_transcript_payload();
            let safety = self
                .create_checkpoint(CreateCheckpointRequest {
                    description: format!("emergency backup before restoring {}", target.name),
                    name: Some("emergency_backup".to_string()),
                    force: true,
                    hook_payload,
                })
                .map_err(|e| RewindError::RestoreFailed {
                    source: anyhow::anyhow!("{}", e),
                    safety_backup_name: None,
                    rollback: None,
                })?;
            safety_backup_name = safety.name;
        }

        log::debug!("restore[SafetyBackup->Mutating]: target={}", target.name);
        match self.mutate_for_restore(&target, request.mode) {
            Ok((fork_path, transcript_backup_path, action_required)) => {
                log::debug!("restore[Mutating->Verifying->Done]: target={}", target.name);
                if let Err(e) =
                    self.record_restore_history(&target.name, safety_backup_name.as_deref(), transcript_backup_path)
                {
                    log::warn!("failed to record restore history: {}", e);
                }
                if matches!(request.mode, RestoreMode::Code | RestoreMode::Both) {
                    if let Err(e) = crate::store::manifest::set_head_signature(&self.layout, &target.signature) {
                        log::warn!("failed to update head signature after restore: {}", e);
                    }
                }
                if let Err(e) = self.append_changelog(
                    "restore",
                    &format!("restored {}", target.name),
                    serde_json::json!({"mode": format!("{:?}", request.mode)}),
                ) {
                    log::warn!("failed to append changelog entry: {}", e);
                }

                Ok(RestoreResult {
                    ok: true,
                    restored_name: Some(target.name.clone()),
                    safety_backup_name,
                    fork_path,
                    action_required,
                    rollback: None,
                })
            }
            Err(e) => {
                log::error!("restore[Mutating->Failed]: target={} error={}", target.name, e);
                match safety_backup_name.as_deref() {
                    Some(safety_name) => {
                        let outcome = match self.rollback_to(safety_name) {
                            Ok(()) => {
                                log::info!("restore[RolledBack]: to safety backup {}", safety_name);
                                RollbackOutcome::Succeeded
                            }
                            Err(rollback_err) => {
                                log::error!("rollback to {} failed: {}", safety_name, rollback_err);
                                RollbackOutcome::Failed
                            }
                        };
                        Err(RewindError::RestoreFailed {
                            source: e,
                            safety_backup_name: Some(safety_name.to_string()),
                            rollback: Some(outcome),
                        })
                    }
                    None => Err(RewindError::RestoreFailed {
                        source: e,
                        safety_backup_name: None,
                        rollback: None,
                    }),
                }
            }
        }
    }

    /// Best-effort transcript payload for the safety backup taken before a
    /// restore: the most recent checkpoint with a conversation metadata
    /// record supplies the live transcript path to snapshot.
    fn current_transcript_payload(&self) -> Option<TranscriptPayload> {
        let metadata = self.load_conversation_metadata().ok()?;
        let checkpoints = CheckpointStore::new(&self.layout).list().ok()?;
        let latest = checkpoints.into_iter().find(|c| metadata.contains_key(&c.name))?;
        let record = metadata.get(&latest.name)?;
        Some(TranscriptPayload {
            transcript_path: record.transcript_path.clone(),
            agent_kind: record.agent_kind.clone(),
            session_id: record.session_id.clone(),
            user_prompt: None,
        })
    }

    /// Performs the mutation for a single restore's `mode`, returning
    /// `(fork_path, transcript_backup_path, action_required)`.
    fn mutate_for_restore(
        &self,
        target: &Checkpoint,
        mode: RestoreMode,
    ) -> anyhow::Result<(Option<PathBuf>, Option<PathBuf>, Option<String>)> {
        let store = CheckpointStore::new(&self.layout);

        if matches!(mode, RestoreMode::Code | RestoreMode::Both) {
            self.delete_files_absent_from(target)?;
            store.restore_files(&target.name, &self.project_root)?;
        }

        match mode {
            RestoreMode::Code => Ok((None, None, None)),
            RestoreMode::Fork => {
                let transcript = target
                    .transcript
                    .as_ref()
                    .context("checkpoint has no transcript to fork")?;
                let schema = self.config.schema_for(&transcript.agent);
                let manager = TranscriptManager::new(&schema);
                let snapshot_path = self.layout.transcript_snapshot_file(&target.name);
                let live = transcript.original_path.exists().then(|| transcript.original_path.as_path());
                let fork_path = manager.fork(live, &transcript.cursor, &snapshot_path)?;
                Ok((Some(fork_path), None, None))
            }
            RestoreMode::Context | RestoreMode::Both => {
                let transcript = target
                    .transcript
                    .as_ref()
                    .context("checkpoint has no transcript to restore")?;
                let schema = self.config.schema_for(&transcript.agent);
                let manager = TranscriptManager::new(&schema);
                let snapshot_path = self.layout.transcript_snapshot_file(&target.name);
                let backup_path = manager.rewrite_in_place(
                    &transcript.original_path,
                    &transcript.cursor,
                    &snapshot_path,
                    &self.layout.transcript_backup_dir(),
                )?;
                Ok((
                    None,
                    Some(backup_path),
                    Some("Reload your agent session to pick up the rewound conversation.".to_string()),
                ))
            }
        }
    }

    /// Deletes files present in the working tree but absent from `target`'s
    /// file list, then prunes now-empty directories. Grounded in the
    /// teacher's `CheckpointManager::restore_checkpoint`, which performs
    /// exactly this pre-extraction cleanup pass (spec §4.1: "the Controller
    /// ... is responsible for deleting files ... the Store only restores
    /// what the archive contains").
    fn delete_files_absent_from(&self, target: &Checkpoint) -> anyhow::Result<()> {
        let current = crate::store::scan::scan_working_tree_excluding(
            &self.project_root,
            &self.config.ignore,
            Some(&self.layout.root),
        )?;
        let keep: HashSet<&PathBuf> = target.files.iter().collect();
        for file in &current {
            if !keep.contains(file) {
                let full = self.project_root.join(file);
                if let Err(e) = std::fs::remove_file(&full) {
                    log::warn!("failed to delete {:?} (absent from {}): {}", full, target.name, e);
                }
            }
        }
        remove_empty_dirs(&self.project_root, &self.project_root);
        Ok(())
    }

    fn rollback_to(&self, safety_name: &str) -> anyhow::Result<()> {
        let store = CheckpointStore::new(&self.layout);
        let safety = store.get(safety_name)?;
        self.delete_files_absent_from(&safety)?;
        store.restore_files(safety_name, &self.project_root)?;
        if let Some(transcript) = &safety.transcript {
            let schema = self.config.schema_for(&transcript.agent);
            let manager = TranscriptManager::new(&schema);
            let snapshot_path = self.layout.transcript_snapshot_file(safety_name);
            manager.restore_transcript_from_snapshot(
                &snapshot_path,
                &transcript.original_path,
                &self.layout.transcript_backup_dir(),
            )?;
        }
        Ok(())
    }

    fn record_restore_history(
        &self,
        checkpoint: &str,
        safety_backup_name: Option<&str>,
        transcript_backup_path: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        // A restore taken with `skip_backup` has nothing to undo to later;
        // spec §3's Restore History Entry exists to enable undo-of-restore,
        // which is meaningless without a safety backup to restore back to.
        let Some(safety_name) = safety_backup_name else {
            return Ok(());
        };
        let mut history = self.load_restore_history()?;
        history.push(RestoreHistoryEntry {
            timestamp: Utc::now(),
            checkpoint: checkpoint.to_string(),
            backup_checkpoint_name: safety_name.to_string(),
            transcript_backup_path,
        });
        self.save_restore_history(&history)
    }

    // ---- undo_last_checkpoint / undo_restore (spec §4.4) ---------------

    pub fn undo_last_checkpoint(&self, mode: RestoreMode) -> Result<RestoreResult> {
        self.restore(RestoreRequest {
            selector: RestoreSelector::Newest,
            mode,
            skip_backup: false,
            dry_run: false,
        })
    }

    /// Reads the most recent restore history entry and restores its
    /// `backup_checkpoint_name` (code) and, if present, `transcript_backup_path`
    /// (context), consuming the entry on success.
    pub fn undo_restore(&self) -> Result<RestoreResult> {
        let mut history = self.load_restore_history()?;
        let Some(entry) = history.pop() else {
            return Err(RewindError::NoRestoreHistory);
        };

        let store = CheckpointStore::new(&self.layout);
        let backup = store
            .get(&entry.backup_checkpoint_name)
            .map_err(|_| RewindError::CheckpointNotFound(entry.backup_checkpoint_name.clone()))?;

        let mutation: anyhow::Result<()> = (|| {
            self.delete_files_absent_from(&backup)?;
            store.restore_files(&backup.name, &self.project_root)?;
            if let Some(backup_path) = &entry.transcript_backup_path {
                if let Some(transcript) = &backup.transcript {
                    let bytes = std::fs::read(backup_path)
                        .with_context(|| format!("reading transcript backup {:?}", backup_path))?;
                    crate::atomic::write_bytes(&transcript.original_path, &bytes)
                        .context("restoring transcript from backup")?;
                }
            }
            Ok(())
        })();

        match mutation {
            Ok(()) => {
                if let Err(e) = crate::store::manifest::set_head_signature(&self.layout, &backup.signature) {
                    log::warn!("failed to update head signature after undo_restore: {}", e);
                }
                self.save_restore_history(&history)?;
                if let Err(e) = self.append_changelog(
                    "undo_restore",
                    &format!("restored {}", entry.backup_checkpoint_name),
                    serde_json::json!({}),
                ) {
                    log::warn!("failed to append changelog entry: {}", e);
                }
                Ok(RestoreResult {
                    ok: true,
                    restored_name: Some(entry.backup_checkpoint_name.clone()),
                    action_required: entry
                        .transcript_backup_path
                        .as_ref()
                        .map(|_| "Reload your agent session to pick up the restored conversation.".to_string()),
                    ..Default::default()
                })
            }
            Err(e) => Err(RewindError::RestoreFailed {
                source: e,
                safety_backup_name: Some(entry.backup_checkpoint_name.clone()),
                rollback: None,
            }),
        }
    }

    // ---- rewind_back (spec §4.4) ---------------------------------------

    /// Combines `find_boundary_by_user_prompts(n)` with either a fork or an
    /// in-place rewrite; when `opts.both`, also restores the newest code
    /// checkpoint at or before the resulting boundary for the same
    /// transcript.
    pub fn rewind_back(
        &self,
        transcript_path: &Path,
        agent_kind: &str,
        n: usize,
        opts: RewindBackOptions,
    ) -> Result<RestoreResult> {
        let schema = self.config.schema_for(agent_kind);
        let manager = TranscriptManager::new(&schema);
        let cursor = manager
            .find_boundary_by_user_prompts(transcript_path, n)
            .map_err(|e| RewindError::from_transcript_failure(transcript_path, e))?;

        let safety = self.create_checkpoint(CreateCheckpointRequest {
            description: format!("safety backup before rewinding back {} prompt(s)", n),
            name: Some("emergency_backup".to_string()),
            force: true,
            hook_payload: Some(TranscriptPayload {
                transcript_path: transcript_path.to_path_buf(),
                agent_kind: agent_kind.to_string(),
                session_id: String::new(),
                user_prompt: None,
            }),
        })?;
        let safety_backup_name = safety.name;

        match self.mutate_rewind_back(transcript_path, &cursor, &schema, &opts) {
            Ok((restored_name, fork_path, transcript_backup_path, action_required)) => {
                if let Err(e) = self.record_restore_history(
                    restored_name.as_deref().unwrap_or(transcript_path.to_string_lossy().as_ref()),
                    safety_backup_name.as_deref(),
                    transcript_backup_path,
                ) {
                    log::warn!("failed to record restore history: {}", e);
                }
                Ok(RestoreResult {
                    ok: true,
                    restored_name,
                    safety_backup_name,
                    fork_path,
                    action_required,
                    rollback: None,
                })
            }
            Err(e) => {
                let rollback = safety_backup_name.as_deref().map(|name| match self.rollback_to(name) {
                    Ok(()) => RollbackOutcome::Succeeded,
                    Err(_) => RollbackOutcome::Failed,
                });
                Err(RewindError::RestoreFailed {
                    source: e,
                    safety_backup_name,
                    rollback,
                })
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn mutate_rewind_back(
        &self,
        transcript_path: &Path,
        cursor: &TranscriptCursor,
        schema: &AgentSchema,
        opts: &RewindBackOptions,
    ) -> anyhow::Result<(Option<String>, Option<PathBuf>, Option<PathBuf>, Option<String>)> {
        let manager = TranscriptManager::new(schema);

        let restored_name = if opts.both {
            let store = CheckpointStore::new(&self.layout);
            let candidate = store.list()?.into_iter().filter(|c| !c.is_safety_backup()).find(|c| {
                c.transcript.as_ref().is_some_and(|t| {
                    t.original_path.as_path() == transcript_path && t.cursor.byte_offset_end <= cursor.byte_offset_end
                })
            });
            match candidate {
                Some(candidate) => {
                    self.delete_files_absent_from(&candidate)?;
                    store.restore_files(&candidate.name, &self.project_root)?;
                    Some(candidate.name)
                }
                None => {
                    log::warn!("rewind_back: no code checkpoint found at or before the requested boundary");
                    None
                }
            }
        } else {
            None
        };

        let scratch_snapshot = self
            .layout
            .transcript_backup_dir()
            .join(format!("rewind-scratch-{}.jsonl.gz", uuid::Uuid::new_v4()));
        manager.snapshot(transcript_path, &scratch_snapshot)?;

        let (fork_path, transcript_backup_path, action_required) = if opts.in_place {
            let backup_path = manager.rewrite_in_place(
                transcript_path,
                cursor,
                &scratch_snapshot,
                &self.layout.transcript_backup_dir(),
            )?;
            (
                None,
                Some(backup_path),
                Some("Reload your agent session to pick up the rewound conversation.".to_string()),
            )
        } else {
            let fork_path = manager.fork(Some(transcript_path), cursor, &scratch_snapshot)?;
            (Some(fork_path), None, None)
        };
        let _ = std::fs::remove_file(&scratch_snapshot);

        Ok((restored_name, fork_path, transcript_backup_path, action_required))
    }

    // ---- gc (spec §4.4) -------------------------------------------------

    pub fn gc(&self) -> Result<Vec<String>> {
        let protected = self.protected_checkpoint_names()?;
        let deleted = CheckpointStore::new(&self.layout).prune(&self.config, &protected)?;
        Ok(deleted)
    }

    // ---- handle_hook_event (AMBIENT) ------------------------------------

    /// Ties the Hook Policy's decision directly to `create_checkpoint` —
    /// every hook adapter needs exactly this composition, so the crate
    /// offers it as the single call a `pre_tool_use`/`session_start`/etc.
    /// hook script makes. `event.transcript_path`'s agent kind isn't part of
    /// spec §4.5's declared hook event fields, so this defaults to
    /// `"claude-code"`; a configuration/environment collaborator that knows
    /// better can call `create_checkpoint` directly instead.
    pub fn handle_hook_event(&self, event: HookEvent) -> Result<CreateCheckpointResult> {
        let has_matching_checkpoint = event.transcript_path.as_ref().is_some_and(|path| {
            self.load_conversation_metadata()
                .map(|m| m.values().any(|r| r.transcript_path.as_path() == path.as_path()))
                .unwrap_or(false)
        });

        let policy = HookPolicy::new(&self.layout, &self.config.tier_runtime);
        let decision = policy.decide(&event, Utc::now(), has_matching_checkpoint)?;

        if !decision.create_checkpoint {
            log::debug!("hook event {:?} produced no checkpoint: {:?}", event.kind, decision.warnings);
            return Ok(CreateCheckpointResult::default());
        }

        let hook_payload = event.transcript_path.clone().map(|path| TranscriptPayload {
            transcript_path: path,
            agent_kind: "claude-code".to_string(),
            session_id: event.session_id.clone().unwrap_or_default(),
            user_prompt: None,
        });

        self.create_checkpoint(CreateCheckpointRequest {
            description: decision.description,
            name: None,
            force: decision.force,
            hook_payload,
        })
    }
}

fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_sep = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Recursively removes empty directories under `base`, never removing
/// `base` itself. Grounded in the teacher's `CheckpointManager::restore_checkpoint`
/// cleanup pass (`remove_empty_dirs`), ported from its async form to this
/// crate's synchronous design.
fn remove_empty_dirs(dir: &Path, base: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    let mut is_empty = true;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if !remove_empty_dirs(&path, base) {
                is_empty = false;
            }
        } else {
            is_empty = false;
        }
    }
    if is_empty && dir != base {
        let _ = std::fs::remove_dir(dir);
    }
    is_empty
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn controller(project: &Path) -> Controller {
        let mut config = Config::default();
        config.ignore.honor_gitignore = false;
        Controller::with_config(project, config).unwrap()
    }

    #[test]
    fn scenario_1_hook_driven_checkpoint_no_transcript() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), "hi\n").unwrap();

        let ctl = controller(project.path());
        let result = ctl
            .create_checkpoint(CreateCheckpointRequest {
                description: "pre_tool_use Edit".to_string(),
                force: true,
                ..Default::default()
            })
            .unwrap();

        assert!(result.ok);
        assert!(!result.no_changes);
        assert_eq!(result.file_count, 1);
        assert_eq!(result.total_bytes, 3);
        assert!(!result.has_transcript);

        let listing = ctl.list_checkpoints().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].checkpoint.files, vec![PathBuf::from("a.txt")]);

        let head = crate::store::manifest::get_head_signature(&ctl.layout).unwrap();
        assert_eq!(head, result.signature);
    }

    #[test]
    fn scenario_2_hook_driven_checkpoint_with_transcript() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), "hi\n").unwrap();
        let transcript_dir = TempDir::new().unwrap();
        let transcript_path = transcript_dir.path().join("session.jsonl");
        fs::write(&transcript_path, "{\"uuid\":\"u1\"}\n{\"uuid\":\"u2\"}\n").unwrap();
        let expected_len = fs::metadata(&transcript_path).unwrap().len();

        let ctl = controller(project.path());
        let result = ctl
            .create_checkpoint(CreateCheckpointRequest {
                description: "session_start".to_string(),
                force: true,
                hook_payload: Some(TranscriptPayload {
                    transcript_path: transcript_path.clone(),
                    agent_kind: "claude-code".to_string(),
                    session_id: "s1".to_string(),
                    user_prompt: None,
                }),
                ..Default::default()
            })
            .unwrap();

        assert!(result.has_transcript);
        let name = result.name.unwrap();
        let checkpoint = CheckpointStore::new(&ctl.layout).get(&name).unwrap();
        let transcript = checkpoint.transcript.unwrap();
        assert_eq!(transcript.cursor.byte_offset_end, expected_len);
        assert_eq!(transcript.cursor.last_event_id, "u2");
    }

    #[test]
    fn scenario_3_fork_restore_fast_path() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), "hi\n").unwrap();
        let transcript_dir = TempDir::new().unwrap();
        let transcript_path = transcript_dir.path().join("session.jsonl");
        fs::write(&transcript_path, "{\"uuid\":\"u1\"}\n{\"uuid\":\"u2\"}\n").unwrap();

        let ctl = controller(project.path());
        let created = ctl
            .create_checkpoint(CreateCheckpointRequest {
                description: "session_start".to_string(),
                force: true,
                hook_payload: Some(TranscriptPayload {
                    transcript_path: transcript_path.clone(),
                    agent_kind: "claude-code".to_string(),
                    session_id: "s1".to_string(),
                    user_prompt: None,
                }),
                ..Default::default()
            })
            .unwrap();

        let result = ctl
            .restore(RestoreRequest {
                selector: RestoreSelector::Named(created.name.clone().unwrap()),
                mode: RestoreMode::Fork,
                skip_backup: true,
                dry_run: false,
            })
            .unwrap();

        assert!(result.ok);
        let fork_path = result.fork_path.unwrap();
        assert_eq!(
            fs::read_to_string(&fork_path).unwrap(),
            "{\"uuid\":\"u1\"}\n{\"uuid\":\"u2\"}\n"
        );
        assert_eq!(
            fs::read_to_string(&transcript_path).unwrap(),
            "{\"uuid\":\"u1\"}\n{\"uuid\":\"u2\"}\n"
        );
    }

    #[test]
    fn scenario_5_undo_restore_round_trip() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), "s0").unwrap();

        let ctl = controller(project.path());
        ctl.create_checkpoint(CreateCheckpointRequest {
            description: "A".to_string(),
            force: true,
            ..Default::default()
        })
        .unwrap();

        fs::write(project.path().join("a.txt"), "s1").unwrap();
        ctl.create_checkpoint(CreateCheckpointRequest {
            description: "B".to_string(),
            force: true,
            ..Default::default()
        })
        .unwrap();

        let checkpoints = ctl.list_checkpoints().unwrap();
        let oldest = checkpoints
            .iter()
            .map(|l| l.checkpoint.name.clone())
            .filter(|n| !n.starts_with("emergency_backup_"))
            .last()
            .unwrap();

        let restore_a = ctl
            .restore(RestoreRequest {
                selector: RestoreSelector::Named(oldest),
                mode: RestoreMode::Code,
                skip_backup: false,
                dry_run: false,
            })
            .unwrap();
        assert!(restore_a.ok);
        assert_eq!(fs::read_to_string(project.path().join("a.txt")).unwrap(), "s0");
        assert!(restore_a.safety_backup_name.is_some());

        let history = ctl.load_restore_history().unwrap();
        assert_eq!(history.len(), 1);

        let undo = ctl.undo_restore().unwrap();
        assert!(undo.ok);
        assert_eq!(fs::read_to_string(project.path().join("a.txt")).unwrap(), "s1");

        let history_after = ctl.load_restore_history().unwrap();
        assert!(history_after.is_empty());

        // Safety backup itself is not deleted, only unreferenced.
        assert!(CheckpointStore::new(&ctl.layout).get(&restore_a.safety_backup_name.unwrap()).is_ok());

        let second_undo = ctl.undo_restore();
        assert!(matches!(second_undo, Err(RewindError::NoRestoreHistory)));
    }

    #[test]
    fn restore_deletes_files_absent_from_target() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), "keep").unwrap();
        let ctl = controller(project.path());
        let created = ctl
            .create_checkpoint(CreateCheckpointRequest {
                description: "only a.txt".to_string(),
                force: true,
                ..Default::default()
            })
            .unwrap();

        fs::write(project.path().join("b.txt"), "new file").unwrap();

        ctl.restore(RestoreRequest {
            selector: RestoreSelector::Named(created.name.unwrap()),
            mode: RestoreMode::Code,
            skip_backup: true,
            dry_run: false,
        })
        .unwrap();

        assert!(project.path().join("a.txt").exists());
        assert!(!project.path().join("b.txt").exists());
    }

    /// Spec invariant 8: "the core never modifies any file under its storage
    /// root path other than its own data; the checkpoint archive never
    /// includes the storage root." A checkpoint's file list never names
    /// anything under `.agent/rewind/`, so the "delete files absent from
    /// target" pass run by every restore must not treat the engine's own
    /// storage directory as a stray file to remove.
    #[test]
    fn restore_never_deletes_the_storage_root() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), "keep").unwrap();
        let ctl = controller(project.path());
        let created = ctl
            .create_checkpoint(CreateCheckpointRequest {
                description: "only a.txt".to_string(),
                force: true,
                ..Default::default()
            })
            .unwrap();
        assert!(!created
            .name
            .as_ref()
            .unwrap()
            .is_empty());
        assert!(ctl.layout.root.exists());

        ctl.restore(RestoreRequest {
            selector: RestoreSelector::Named(created.name.clone().unwrap()),
            mode: RestoreMode::Code,
            skip_backup: true,
            dry_run: false,
        })
        .unwrap();

        assert!(ctl.layout.root.exists(), "storage root must survive a restore");
        assert!(CheckpointStore::new(&ctl.layout).get(&created.name.unwrap()).is_ok());

        // The checkpoint's own file list never names anything under the
        // storage root.
        let listing = ctl.list_checkpoints().unwrap();
        for entry in &listing {
            for file in &entry.checkpoint.files {
                assert!(!project.path().join(file).starts_with(&ctl.layout.root));
            }
        }
    }

    #[test]
    fn gc_prunes_beyond_retention_policy() {
        let project = TempDir::new().unwrap();
        let mut config = Config::default();
        config.ignore.honor_gitignore = false;
        config.retention.max_count = 1;
        config.retention.max_age_days = 0;
        let ctl = Controller::with_config(project.path(), config).unwrap();

        for i in 0..3 {
            fs::write(project.path().join("a.txt"), format!("v{}", i)).unwrap();
            ctl.create_checkpoint(CreateCheckpointRequest {
                description: format!("v{}", i),
                force: true,
                ..Default::default()
            })
            .unwrap();
        }

        let remaining = ctl.list_checkpoints().unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn undo_last_checkpoint_restores_newest() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), "s0").unwrap();
        let ctl = controller(project.path());
        ctl.create_checkpoint(CreateCheckpointRequest {
            description: "A".to_string(),
            force: true,
            ..Default::default()
        })
        .unwrap();

        fs::write(project.path().join("a.txt"), "s1").unwrap();
        ctl.create_checkpoint(CreateCheckpointRequest {
            description: "B".to_string(),
            force: true,
            ..Default::default()
        })
        .unwrap();

        fs::write(project.path().join("a.txt"), "uncommitted").unwrap();

        let result = ctl.undo_last_checkpoint(RestoreMode::Code).unwrap();
        assert!(result.ok);
        assert_eq!(fs::read_to_string(project.path().join("a.txt")).unwrap(), "s1");
        assert!(result.safety_backup_name.is_some());
    }

    #[test]
    fn mint_name_disambiguates_collisions() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("a.txt"), "x").unwrap();
        let ctl = controller(project.path());

        let first = ctl.mint_name(Some("My Checkpoint!")).unwrap();
        crate::store::manifest::write_manifest(
            &ctl.layout,
            &Checkpoint {
                name: first.clone(),
                timestamp: Utc::now(),
                description: String::new(),
                files: vec![],
                file_count: 0,
                total_size: 0,
                signature: "x".to_string(),
                file_metadata: vec![],
                transcript: None,
            },
        )
        .unwrap();

        let second = ctl.mint_name(Some("My Checkpoint!")).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("my_checkpoint_"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        fn file_name_strategy() -> impl Strategy<Value = String> {
            r"[a-z][a-z0-9_]{0,8}\.txt"
        }

        fn content_strategy() -> impl Strategy<Value = String> {
            r"[a-zA-Z0-9 ]{0,40}"
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(20))]

            /// Rollback atomicity (spec §8, grounded in ricecoder's
            /// `prop_rollback_atomicity`): for any checkpoint followed by a
            /// code-mode restore with no intervening writes, the working
            /// tree ends up bit-identical to the checkpoint, regardless of
            /// how many files or what content it held.
            #[test]
            fn prop_restore_reproduces_checkpoint_contents(
                files in prop::collection::btree_map(file_name_strategy(), content_strategy(), 1..6),
            ) {
                let project = TempDir::new().unwrap();
                for (name, content) in &files {
                    fs::write(project.path().join(name), content).unwrap();
                }
                let ctl = controller(project.path());
                let created = ctl
                    .create_checkpoint(CreateCheckpointRequest {
                        description: "prop".to_string(),
                        force: true,
                        ..Default::default()
                    })
                    .unwrap();
                prop_assert!(!created.no_changes);

                // Mutate the tree arbitrarily after the checkpoint.
                for (name, _) in &files {
                    fs::write(project.path().join(name), "MUTATED").unwrap();
                }
                fs::write(project.path().join("untracked_extra.txt"), "extra").unwrap();

                let result = ctl
                    .restore(RestoreRequest {
                        selector: RestoreSelector::Named(created.name.unwrap()),
                        mode: RestoreMode::Code,
                        skip_backup: true,
                        dry_run: false,
                    })
                    .unwrap();
                prop_assert!(result.ok);

                let mut on_disk = BTreeMap::new();
                for (name, _) in &files {
                    on_disk.insert(name.clone(), fs::read_to_string(project.path().join(name)).unwrap());
                }
                prop_assert_eq!(&on_disk, &files);
                prop_assert!(!project.path().join("untracked_extra.txt").exists());
            }

            /// Checkpoint isolation (spec §8, grounded in ricecoder's
            /// `prop_checkpoint_isolation`): restoring checkpoint A never
            /// leaks content that was only ever written after A was taken.
            #[test]
            fn prop_checkpoints_are_isolated(
                first in prop::collection::btree_map(file_name_strategy(), content_strategy(), 1..4),
                second_content in content_strategy(),
            ) {
                let project = TempDir::new().unwrap();
                for (name, content) in &first {
                    fs::write(project.path().join(name), content).unwrap();
                }
                let ctl = controller(project.path());
                let checkpoint_a = ctl
                    .create_checkpoint(CreateCheckpointRequest {
                        description: "a".to_string(),
                        force: true,
                        ..Default::default()
                    })
                    .unwrap();

                // Long enough to fall outside `file_name_strategy`'s 1-9
                // character stem, so it can never collide with `first`'s keys.
                fs::write(project.path().join("only_ever_written_after_a.txt"), &second_content).unwrap();
                ctl.create_checkpoint(CreateCheckpointRequest {
                    description: "b".to_string(),
                    force: true,
                    ..Default::default()
                })
                .unwrap();

                ctl.restore(RestoreRequest {
                    selector: RestoreSelector::Named(checkpoint_a.name.unwrap()),
                    mode: RestoreMode::Code,
                    skip_backup: true,
                    dry_run: false,
                })
                .unwrap();

                prop_assert!(!project.path().join("only_ever_written_after_a.txt").exists());
            }
        }
    }
}
