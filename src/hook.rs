//! Hook Policy (C5): turns a normalised agent-process event into a
//! checkpoint decision. See spec §4.5.
//!
//! The hook adapter (out of scope, spec §1) is responsible for translating
//! vendor-specific JSON on stdin into the small [`HookEvent`] this module
//! consumes — this module never sees raw hook payloads, only the declared
//! fields spec §4.5 lists as inputs. Persistent state is the single
//! `hook_state.json` map described in spec §6.1, read and written atomically
//! via [`crate::atomic`], mirroring every other shared-state file in the
//! crate (manifest, head signature, restore history).

use crate::atomic::{read_json, write_json};
use crate::config::TierRuntime;
use crate::paths::StorageLayout;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Normalised event kinds, spec §4.5 inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEventKind {
    SessionStart,
    PreToolUse,
    PostToolUse,
    Stop,
    SubagentStart,
    SubagentStop,
    UserPromptSubmit,
    SessionResume,
    SessionClear,
    SessionCompact,
}

impl HookEventKind {
    fn is_structural(self) -> bool {
        matches!(
            self,
            Self::SessionStart | Self::Stop | Self::SubagentStart | Self::SubagentStop
        )
    }

    fn is_resume_class(self) -> bool {
        matches!(
            self,
            Self::SessionResume | Self::SessionClear | Self::SessionCompact
        )
    }
}

/// Tool names treated as file-modifying for the `pre_tool_use` volumetric
/// rule. Matched case-insensitively against `HookEvent::tool_name`.
const FILE_MODIFYING_TOOLS: &[&str] = &["edit", "write", "multiedit", "notebookedit"];
/// Tool names treated as shell for the `post_tool_use` volumetric rule.
const SHELL_TOOLS: &[&str] = &["bash", "shell", "run_command"];

fn matches_any(tool_name: Option<&str>, candidates: &[&str]) -> bool {
    tool_name
        .map(|name| {
            let lower = name.to_ascii_lowercase();
            candidates.iter().any(|c| *c == lower)
        })
        .unwrap_or(false)
}

/// A normalised event handed to the policy by the hook adapter.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub kind: HookEventKind,
    pub tool_name: Option<String>,
    pub transcript_path: Option<PathBuf>,
    pub session_id: Option<String>,
    pub cwd: Option<PathBuf>,
    /// Declared, opaque significance signal (e.g. bytes changed by the
    /// proposed edit), taken from the hook payload's tool input. `None`
    /// disables significance-based suppression for this event. Spec §4.5
    /// "Significance detection (optional, per-tier)".
    pub change_size_hint: Option<u64>,
}

impl HookEvent {
    pub fn new(kind: HookEventKind) -> Self {
        Self {
            kind,
            tool_name: None,
            transcript_path: None,
            session_id: None,
            cwd: None,
            change_size_hint: None,
        }
    }
}

/// The policy's output, spec §4.5 "Outputs".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDecision {
    pub create_checkpoint: bool,
    pub description: String,
    pub force: bool,
    pub update_antispam: bool,
    pub warnings: Vec<String>,
}

impl HookDecision {
    fn skip(reason: &str) -> Self {
        Self {
            create_checkpoint: false,
            description: String::new(),
            force: false,
            update_antispam: false,
            warnings: vec![reason.to_string()],
        }
    }
}

type HookState = HashMap<String, i64>;

fn load_hook_state(layout: &StorageLayout) -> Result<HookState> {
    let path = layout.hook_state_file();
    if !path.exists() {
        return Ok(HookState::new());
    }
    Ok(read_json(&path).unwrap_or_else(|e| {
        log::warn!("hook_state.json is corrupt, starting fresh: {}", e);
        HookState::new()
    }))
}

fn save_hook_state(layout: &StorageLayout, state: &HookState) -> Result<()> {
    write_json(&layout.hook_state_file(), state)
}

/// Applies spec §4.5's volumetric/structural/resume-class rules and
/// persists the anti-spam timer.
pub struct HookPolicy<'a> {
    layout: &'a StorageLayout,
    tier: &'a TierRuntime,
}

impl<'a> HookPolicy<'a> {
    pub fn new(layout: &'a StorageLayout, tier: &'a TierRuntime) -> Self {
        Self { layout, tier }
    }

    /// Decide whether `event` warrants a checkpoint, given `now` and whether
    /// an existing checkpoint's transcript metadata already matches the
    /// event's `transcript_path` (used by the resume-class rule; the caller
    /// — the Controller — answers this by consulting
    /// `conversation_metadata.json`, since this module never reads that
    /// file).
    pub fn decide(&self, event: &HookEvent, now: DateTime<Utc>, has_matching_checkpoint: bool) -> Result<HookDecision> {
        if event.kind.is_structural() {
            return Ok(HookDecision {
                create_checkpoint: true,
                description: format!("auto: {:?}", event.kind),
                force: true,
                update_antispam: false,
                warnings: Vec::new(),
            });
        }

        if event.kind.is_resume_class() {
            return self.decide_resume_class(event, now, has_matching_checkpoint);
        }

        match event.kind {
            HookEventKind::PreToolUse => {
                if !matches_any(event.tool_name.as_deref(), FILE_MODIFYING_TOOLS) {
                    return Ok(HookDecision::skip("pre_tool_use tool is not file-modifying"));
                }
                self.decide_volumetric(event, now)
            }
            HookEventKind::PostToolUse => {
                if !matches_any(event.tool_name.as_deref(), SHELL_TOOLS) {
                    return Ok(HookDecision::skip("post_tool_use tool is not shell"));
                }
                self.decide_volumetric(event, now)
            }
            // `user_prompt_submit` is listed among the normalised kinds
            // (spec §4.5 inputs) but spec §4.5's rules never assign it a
            // checkpoint-creating behavior; it exists for significance or
            // conversation bookkeeping a future tier may add.
            HookEventKind::UserPromptSubmit => {
                Ok(HookDecision::skip("user_prompt_submit carries no checkpoint rule"))
            }
            _ => unreachable!("structural and resume-class kinds handled above"),
        }
    }

    fn decide_volumetric(&self, event: &HookEvent, now: DateTime<Utc>) -> Result<HookDecision> {
        let Some(session_id) = event.session_id.as_deref() else {
            return Ok(HookDecision::skip("volumetric event missing session_id"));
        };

        let mut state = load_hook_state(self.layout)?;
        let now_secs = now.timestamp();
        if let Some(&last) = state.get(session_id) {
            let elapsed = now_secs.saturating_sub(last);
            if (elapsed as u64) < self.tier.anti_spam_seconds {
                return Ok(HookDecision::skip("anti-spam cooldown not elapsed"));
            }
        }

        if let (Some(min_size), Some(hint)) = (self.tier.min_change_size, event.change_size_hint) {
            if hint < min_size {
                return Ok(HookDecision::skip("change below significance threshold"));
            }
        }

        state.insert(session_id.to_string(), now_secs);
        save_hook_state(self.layout, &state)?;

        Ok(HookDecision {
            create_checkpoint: true,
            description: format!(
                "auto: {:?} ({})",
                event.kind,
                event.tool_name.as_deref().unwrap_or("?")
            ),
            force: false,
            update_antispam: true,
            warnings: Vec::new(),
        })
    }

    fn decide_resume_class(
        &self,
        event: &HookEvent,
        now: DateTime<Utc>,
        has_matching_checkpoint: bool,
    ) -> Result<HookDecision> {
        // Resume-class events always reset the anti-spam timer, whether or
        // not a baseline checkpoint is actually proposed.
        if let Some(session_id) = event.session_id.as_deref() {
            let mut state = load_hook_state(self.layout)?;
            state.insert(session_id.to_string(), now.timestamp());
            save_hook_state(self.layout, &state)?;
        }

        if has_matching_checkpoint {
            return Ok(HookDecision {
                create_checkpoint: false,
                description: String::new(),
                force: false,
                update_antispam: true,
                warnings: Vec::new(),
            });
        }

        Ok(HookDecision {
            create_checkpoint: true,
            description: format!("auto: baseline on {:?}", event.kind),
            force: true,
            update_antispam: true,
            warnings: Vec::new(),
        })
    }
}
