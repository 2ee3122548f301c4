//! Working-tree scanning and signature computation (spec §4.1
//! `scan_working_tree`, `stat_files`, `compute_signature`).
//!
//! The teacher's own scanners (`checkpoint/manager.rs::collect_files`,
//! `commands/usage.rs`'s `walkdir::WalkDir` use) hand-roll a recursive
//! directory walk that only skips dot-directories. This engine instead walks
//! with the `ignore` crate (grounded in `danielchristiancazares-forge`,
//! which depends on it for exactly this purpose) so `.gitignore` and
//! configured patterns are honored without reimplementing glob matching.

use crate::config::IgnoreConfig;
use crate::model::FileMetadata;
use anyhow::{bail, Context, Result};
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Walk `project_root` depth-first, applying `ignore_config`, and return the
/// project-relative file paths in sorted order. Sorting makes the resulting
/// signature stable regardless of filesystem iteration order (spec invariant
/// "round-trip" in §8).
pub fn scan_working_tree(project_root: &Path, ignore_config: &IgnoreConfig) -> Result<Vec<PathBuf>> {
    scan_working_tree_excluding(project_root, ignore_config, None)
}

/// Same as [`scan_working_tree`], but additionally prunes any entry under
/// `exclude_root` (when project-local storage mode puts the storage root
/// inside the project tree). Spec invariant 8: "the core never modifies any
/// file under its storage root path other than its own data; the checkpoint
/// archive never includes the storage root." Without this, a project-local
/// `.agent/rewind/` would both bloat every archive and — far worse — be
/// treated by `restore`'s "delete files absent from the target" pass as
/// stray files to remove, destroying the engine's own checkpoint history.
pub fn scan_working_tree_excluding(
    project_root: &Path,
    ignore_config: &IgnoreConfig,
    exclude_root: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    if let Some(home) = dirs::home_dir() {
        if project_root == home {
            bail!("refusing to scan the home directory");
        }
    }

    let mut builder = WalkBuilder::new(project_root);
    builder
        .git_ignore(ignore_config.honor_gitignore)
        .git_global(ignore_config.honor_gitignore)
        .git_exclude(ignore_config.honor_gitignore)
        .hidden(false)
        .standard_filters(ignore_config.honor_gitignore);

    // Relative glob for `exclude_root`, if it falls inside `project_root`
    // (project-local storage mode). Added as an override, same mechanism as
    // `.git`/`node_modules`/`target` above, so the walker prunes the whole
    // directory rather than merely filtering it out after the fact.
    // Canonicalize both sides first: `exclude_root` (a `StorageLayout::root`)
    // is always canonical, but `project_root` as handed in by a caller may
    // not be, and a symlink mismatch here would silently defeat the
    // exclusion.
    let exclude_rel = exclude_root.and_then(|root| {
        let root = root.canonicalize().ok()?;
        let base = project_root.canonicalize().ok()?;
        root.strip_prefix(&base).ok().map(Path::to_path_buf)
    });

    let mut overrides = ignore::overrides::OverrideBuilder::new(project_root);
    for pattern in ignore_config.patterns.iter().chain(ignore_config.additional.iter()) {
        let _ = overrides.add(&format!("!{}", pattern));
    }
    if let Some(rel) = exclude_rel {
        let _ = overrides.add(&format!("!/{}", rel.to_string_lossy()));
    }
    for pattern in &ignore_config.force_include {
        let _ = overrides.add(pattern);
    }
    if let Ok(built) = overrides.build() {
        builder.overrides(built);
    }

    let mut files = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("skipping unreadable entry while scanning {:?}: {}", project_root, e);
                continue;
            }
        };
        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(project_root) {
            files.push(rel.to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

/// Stat each path (relative to `project_root`), tolerating concurrent
/// deletion by the agent process: a missing file contributes
/// `{size: 0, mtime_ms: 0}` rather than aborting the whole stat pass (spec
/// §4.1 `stat_files`).
pub fn stat_files(project_root: &Path, paths: &[PathBuf]) -> Result<Vec<FileMetadata>> {
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let full_path = project_root.join(path);
        let (size, mtime_ms) = match std::fs::metadata(&full_path) {
            Ok(metadata) => {
                let mtime_ms = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                (metadata.len(), mtime_ms)
            }
            Err(_) => (0, 0),
        };
        out.push(FileMetadata {
            path: path.clone(),
            size,
            mtime_ms,
        });
    }
    Ok(out)
}

/// SHA-256 over the concatenation of `(path, size, mtime_ms)` for every stat
/// in order, with no separator bytes between fields (spec §4.1
/// `compute_signature`: collision resistance comes from the hash, not from
/// framing).
pub fn compute_signature(stats: &[FileMetadata]) -> String {
    let mut hasher = Sha256::new();
    for stat in stats {
        hasher.update(stat.path.to_string_lossy().as_bytes());
        hasher.update(stat.size.to_string().as_bytes());
        hasher.update(stat.mtime_ms.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
