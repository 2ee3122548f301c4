//! Transcript snapshotting, forking, and in-place rewriting (spec §4.2
//! `snapshot`, `fork`, `rewrite_in_place`, `restore_transcript_from_snapshot`).
//!
//! `fork`'s two-tier fast-path/fallback split and the atomic rename used by
//! `rewrite_in_place` mirror [`crate::atomic::write_bytes`]; this module adds
//! the transcript-specific streaming and backup-before-mutate steps the
//! teacher's `checkpoint/storage.rs` does for code snapshots but never had to
//! do for a live, externally-written file.

use super::cursor::verify_cursor;
use crate::config::AgentSchema;
use crate::model::TranscriptCursor;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const COPY_BUF_SIZE: usize = 256 * 1024;

/// Gzip-compress the full current transcript into `out_path`, streaming so
/// memory use is bounded regardless of transcript size.
pub fn snapshot(transcript_path: &Path, out_path: &Path) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {:?}", parent))?;
    }
    let input = File::open(transcript_path)
        .with_context(|| format!("opening transcript {:?}", transcript_path))?;
    let output = File::create(out_path)
        .with_context(|| format!("creating snapshot {:?}", out_path))?;
    let mut reader = BufReader::new(input);
    let mut writer = GzEncoder::new(BufWriter::new(output), Compression::default());
    io::copy(&mut reader, &mut writer).context("compressing transcript snapshot")?;
    writer.finish().context("finalizing gzip stream")?;
    Ok(())
}

/// Decompress `snapshot_path` (gzip) into `out_path` as plain bytes, streamed.
pub fn decompress_snapshot(snapshot_path: &Path, out_path: &Path) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {:?}", parent))?;
    }
    let input = File::open(snapshot_path)
        .with_context(|| format!("opening snapshot {:?}", snapshot_path))?;
    let output =
        File::create(out_path).with_context(|| format!("creating {:?}", out_path))?;
    let mut reader = GzDecoder::new(BufReader::new(input));
    let mut writer = BufWriter::new(output);
    io::copy(&mut reader, &mut writer).context("decompressing transcript snapshot")?;
    writer.flush().context("flushing decompressed transcript")?;
    Ok(())
}

/// Stream-copy the first `len` bytes of `src` into a fresh file at `dest`,
/// appending a trailing `\n` if the copied bytes don't already end in one.
fn copy_prefix(src: &Path, len: u64, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {:?}", parent))?;
    }
    let mut input = File::open(src).with_context(|| format!("opening {:?}", src))?;
    let output = File::create(dest).with_context(|| format!("creating {:?}", dest))?;
    let mut writer = BufWriter::new(output);

    let mut remaining = len;
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut last_byte = None;
    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        input.read_exact(&mut buf[..to_read])?;
        writer.write_all(&buf[..to_read])?;
        if to_read > 0 {
            last_byte = Some(buf[to_read - 1]);
        }
        remaining -= to_read as u64;
    }
    if last_byte != Some(b'\n') {
        writer.write_all(b"\n")?;
    }
    writer.flush().context("flushing prefix copy")?;
    Ok(())
}

fn random_fork_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Optionally rewrite the first line's `title` field with a short prefix.
/// Non-fatal on any failure: the fork remains usable even if this step is
/// skipped (spec §4.2 fork step 3).
fn try_rewrite_title_prefix(dest_path: &Path, prefix: &str) {
    if let Err(e) = rewrite_title_prefix(dest_path, prefix) {
        log::warn!("title prefix rewrite skipped for {:?}: {}", dest_path, e);
    }
}

fn rewrite_title_prefix(dest_path: &Path, prefix: &str) -> Result<()> {
    let content = std::fs::read_to_string(dest_path)?;
    let Some(first_newline) = content.find('\n') else {
        return Ok(());
    };
    let (first_line, rest) = content.split_at(first_newline);
    let mut value: serde_json::Value = serde_json::from_str(first_line.trim())?;
    let Some(title) = value.get("title").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    if title.starts_with(prefix) {
        return Ok(());
    }
    let new_title = format!("{}{}", prefix, title);
    value["title"] = serde_json::Value::String(new_title);
    let new_first_line = serde_json::to_string(&value)?;
    let rewritten = format!("{}{}", new_first_line, rest);
    crate::atomic::write_bytes(dest_path, rewritten.as_bytes())?;
    Ok(())
}

/// spec §4.2 `fork`: copy-truncate fast path, or materialise-from-snapshot
/// fallback. Returns the path actually written.
pub fn fork(
    transcript_path: Option<&Path>,
    cursor: &TranscriptCursor,
    snapshot_path: &Path,
    schema: &AgentSchema,
) -> Result<PathBuf> {
    let dest_dir = transcript_path
        .and_then(|p| p.parent())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| {
            snapshot_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
        });
    let dest_path = dest_dir.join(format!("{}.jsonl", random_fork_id()));

    let used_fast_path = match transcript_path {
        Some(path) if path.exists() => match verify_cursor(path, cursor) {
            Ok(true) => {
                copy_prefix(path, cursor.byte_offset_end, &dest_path)?;
                true
            }
            _ => false,
        },
        _ => false,
    };

    if !used_fast_path {
        decompress_snapshot(snapshot_path, &dest_path)?;
    }

    if schema.title_prefix_policy {
        try_rewrite_title_prefix(&dest_path, "[Fork] ");
    }

    Ok(dest_path)
}

/// Copy `transcript_path`'s current bytes into `backup_dir/<timestamp>.jsonl`
/// before any in-place mutation. Spec §4.2: "backup write failure aborts the
/// rewrite before any destructive action."
fn backup_live_transcript(transcript_path: &Path, backup_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(backup_dir)
        .with_context(|| format!("creating backup directory {:?}", backup_dir))?;
    let backup_path = backup_dir.join(format!("{}.jsonl", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
    std::fs::copy(transcript_path, &backup_path).with_context(|| {
        format!(
            "backing up {:?} to {:?} before in-place rewrite",
            transcript_path, backup_path
        )
    })?;
    Ok(backup_path)
}

/// spec §4.2 `rewrite_in_place`: back up, then atomically overwrite
/// `transcript_path` with the chosen prefix (fast path if the cursor still
/// matches, else from the checkpoint's snapshot).
pub fn rewrite_in_place(
    transcript_path: &Path,
    cursor: &TranscriptCursor,
    snapshot_path: &Path,
    backup_dir: &Path,
) -> Result<PathBuf> {
    let backup_path = backup_live_transcript(transcript_path, backup_dir)?;

    let matches = verify_cursor(transcript_path, cursor).unwrap_or(false);
    let new_bytes = if matches {
        read_prefix_bytes(transcript_path, cursor.byte_offset_end)?
    } else {
        read_decompressed_bytes(snapshot_path)?
    };

    crate::atomic::write_bytes(transcript_path, &new_bytes)
        .context("writing rewritten transcript in place")?;
    Ok(backup_path)
}

/// spec §4.2 `restore_transcript_from_snapshot`: like `rewrite_in_place` but
/// the source is always the checkpoint's snapshot, not the live file.
pub fn restore_transcript_from_snapshot(
    snapshot_path: &Path,
    transcript_path: &Path,
    backup_dir: &Path,
) -> Result<PathBuf> {
    let backup_path = if transcript_path.exists() {
        backup_live_transcript(transcript_path, backup_dir)?
    } else {
        std::fs::create_dir_all(backup_dir)?;
        backup_dir.join(format!("{}.jsonl", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")))
    };

    let bytes = read_decompressed_bytes(snapshot_path)?;
    crate::atomic::write_bytes(transcript_path, &bytes)
        .context("restoring transcript from snapshot")?;
    Ok(backup_path)
}

fn read_prefix_bytes(path: &Path, len: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    if buf.last() != Some(&b'\n') {
        buf.push(b'\n');
    }
    Ok(buf)
}

fn read_decompressed_bytes(snapshot_path: &Path) -> Result<Vec<u8>> {
    let file = File::open(snapshot_path)
        .with_context(|| format!("opening snapshot {:?}", snapshot_path))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf).context("decompressing snapshot")?;
    if !buf.is_empty() && buf.last() != Some(&b'\n') {
        buf.push(b'\n');
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::cursor::compute_cursor;
    use tempfile::TempDir;

    fn schema() -> AgentSchema {
        AgentSchema {
            event_id_field: vec!["uuid".to_string()],
            parent_id_field: None,
            title_prefix_policy: false,
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(&transcript, "{\"uuid\":\"u1\"}\n").unwrap();
        let snap = dir.path().join("t.jsonl.gz");
        snapshot(&transcript, &snap).unwrap();

        let restored = dir.path().join("restored.jsonl");
        decompress_snapshot(&snap, &restored).unwrap();
        assert_eq!(
            std::fs::read_to_string(&restored).unwrap(),
            "{\"uuid\":\"u1\"}\n"
        );
    }

    #[test]
    fn fork_fast_path_copies_prefix() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(&transcript, "{\"uuid\":\"u1\"}\n{\"uuid\":\"u2\"}\n").unwrap();
        let cursor = compute_cursor(&transcript, &schema()).unwrap();

        let snap = dir.path().join("t.jsonl.gz");
        snapshot(&transcript, &snap).unwrap();

        let fork_path = fork(Some(&transcript), &cursor, &snap, &schema()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&fork_path).unwrap(),
            "{\"uuid\":\"u1\"}\n{\"uuid\":\"u2\"}\n"
        );
    }

    #[test]
    fn fork_falls_back_to_snapshot_when_diverged() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(&transcript, "{\"uuid\":\"u1\"}\n").unwrap();
        let cursor = compute_cursor(&transcript, &schema()).unwrap();

        let snap = dir.path().join("t.jsonl.gz");
        snapshot(&transcript, &snap).unwrap();

        // Transcript diverges after the checkpoint was taken.
        std::fs::write(&transcript, "{\"uuid\":\"changed\"}\n").unwrap();

        let fork_path = fork(Some(&transcript), &cursor, &snap, &schema()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&fork_path).unwrap(),
            "{\"uuid\":\"u1\"}\n"
        );
    }

    #[test]
    fn rewrite_in_place_backs_up_before_mutating() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(&transcript, "{\"uuid\":\"u1\"}\n{\"uuid\":\"u2\"}\n").unwrap();

        // A cursor pointing at the boundary after the first line only; its
        // hashes must cover that 14-byte prefix, not the whole file, or
        // `verify_cursor` will (correctly) treat it as diverged.
        let first_line_only = dir.path().join("first_line.jsonl");
        std::fs::write(&first_line_only, "{\"uuid\":\"u1\"}\n").unwrap();
        let prefix_only_cursor = compute_cursor(&first_line_only, &schema()).unwrap();
        assert_eq!(prefix_only_cursor.byte_offset_end, 14);

        let snap = dir.path().join("t.jsonl.gz");
        snapshot(&transcript, &snap).unwrap();

        let backup_dir = dir.path().join("backups");
        let backup_path =
            rewrite_in_place(&transcript, &prefix_only_cursor, &snap, &backup_dir).unwrap();

        assert!(backup_path.exists());
        assert_eq!(
            std::fs::read_to_string(&backup_path).unwrap(),
            "{\"uuid\":\"u1\"}\n{\"uuid\":\"u2\"}\n"
        );
        assert_eq!(
            std::fs::read_to_string(&transcript).unwrap(),
            "{\"uuid\":\"u1\"}\n"
        );
    }
}
