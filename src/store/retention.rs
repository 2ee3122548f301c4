//! Pruning policy (spec §4.1 `prune`, §4.6 "Retention").
//!
//! Grounded in the teacher's `checkpoint/manager.rs` auto-checkpoint cleanup,
//! generalized into two independent limits (count, age) plus the safety-
//! backup exemption spec §4.6 calls out explicitly: an `emergency_backup_*`
//! checkpoint is never pruned by the count limit (it exists to protect a
//! specific restore), but it still ages out under `max_age_days` like any
//! other checkpoint.

use crate::config::RetentionPolicy;
use crate::error::RewindError;
use crate::model::Checkpoint;
use crate::store::manifest;
use anyhow::Result;
use chrono::Utc;

/// Names that `prune` would delete, in the order they should be deleted,
/// given the current manifest set and policy. Pure function over already
/// loaded checkpoints so retention decisions are easy to unit test without
/// touching disk.
pub fn checkpoints_to_prune(checkpoints: &[Checkpoint], policy: &RetentionPolicy) -> Vec<String> {
    let now = Utc::now();
    let mut to_prune = Vec::new();

    // Age-based: applies to every checkpoint, safety backups included.
    let mut survivors = Vec::new();
    for checkpoint in checkpoints {
        let age_days = (now - checkpoint.timestamp).num_days();
        if policy.max_age_days > 0 && age_days > policy.max_age_days as i64 {
            to_prune.push(checkpoint.name.clone());
        } else {
            survivors.push(checkpoint);
        }
    }

    // Count-based: applies only to non-safety-backup checkpoints, oldest
    // first. `survivors` is already newest-first (manifest::list order).
    let prunable: Vec<&&Checkpoint> = survivors
        .iter()
        .filter(|c| !c.is_safety_backup())
        .collect();
    if policy.max_count > 0 && prunable.len() > policy.max_count {
        for checkpoint in prunable.iter().skip(policy.max_count) {
            to_prune.push(checkpoint.name.clone());
        }
    }

    to_prune
}

/// Delete every checkpoint `checkpoints_to_prune` names, except any whose
/// name appears in `protected` (checkpoints referenced by a pending restore
/// history entry, per spec §4.6's `RetentionConflict`).
pub fn prune(
    layout: &crate::paths::StorageLayout,
    policy: &RetentionPolicy,
    protected: &[String],
) -> Result<Vec<String>> {
    let checkpoints = manifest::list_checkpoints(layout)?;
    let candidates = checkpoints_to_prune(&checkpoints, policy);

    let mut deleted = Vec::new();
    for name in candidates {
        if protected.contains(&name) {
            // Deferred, not fatal (spec §9): the conflict is logged through
            // the typed variant so it reads the same way a surfaced error
            // would, but pruning simply moves on to the next candidate.
            log::info!("{}", RewindError::RetentionConflict(name.clone()));
            continue;
        }
        manifest::delete_checkpoint(layout, &name)?;
        deleted.push(name);
    }
    Ok(deleted)
}
