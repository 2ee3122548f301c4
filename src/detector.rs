//! Change Detector (C3): decides whether a fresh signature warrants a new
//! checkpoint. See spec §4.3.
//!
//! Stateless by design — the only persisted state it reads is the Head
//! Signature file the Checkpoint Store owns (`store::manifest::get_head_signature`).
//! Kept as its own small module (rather than folded into the Store or
//! Controller) so its single responsibility — and the "no head signature yet
//! means Changed" rule — stays testable in isolation, the way the teacher
//! keeps `FileTracker`'s hash comparison in `checkpoint/mod.rs` separate from
//! `CheckpointManager`'s orchestration.

use crate::paths::StorageLayout;
use crate::store::manifest;
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Unchanged,
    Changed,
}

/// Compare `current_signature` against the persisted Head Signature.
/// Absence of a head signature (first checkpoint in a project) is reported
/// as `Changed`, per spec §4.3.
pub fn detect(layout: &StorageLayout, current_signature: &str) -> Result<ChangeStatus> {
    match manifest::get_head_signature(layout)? {
        Some(head) if head == current_signature => Ok(ChangeStatus::Unchanged),
        _ => Ok(ChangeStatus::Changed),
    }
}
