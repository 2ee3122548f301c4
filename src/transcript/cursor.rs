//! Cursoring over a JSONL transcript (spec §4.2 `compute_cursor`,
//! `find_boundary_by_user_prompts`).
//!
//! The tail scan reads backwards in fixed-size chunks rather than loading the
//! whole file, the same technique `other_examples/.../vigilo__src-hook.rs`
//! uses in `read_transcript_meta` to find usage/model fields near the end of
//! a multi-gigabyte session log without paying for a full read.

use crate::config::AgentSchema;
use crate::model::TranscriptCursor;
use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Raised when a transcript has no complete (newline-terminated, parseable)
/// JSON line to cursor — spec §4.2 `compute_cursor`'s `NoEventsError`. A
/// concrete, downcastable type rather than a bare `anyhow!` string so the
/// Controller can recover the typed `RewindError::NoEventsError` variant at
/// its boundary instead of losing the discriminant to `anyhow::Error`.
#[derive(Debug)]
pub struct NoEventsError {
    pub path: PathBuf,
}

impl fmt::Display for NoEventsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transcript {:?} contains no complete events", self.path)
    }
}

impl std::error::Error for NoEventsError {}

/// Raised by `find_boundary_by_user_prompts` when the transcript has fewer
/// than `requested` user-role lines — spec §4.2's `InsufficientPromptsError`.
#[derive(Debug)]
pub struct InsufficientPromptsError {
    pub path: PathBuf,
    pub requested: usize,
    pub found: usize,
}

impl fmt::Display for InsufficientPromptsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transcript {:?} has fewer than {} user prompts (found {})",
            self.path, self.requested, self.found
        )
    }
}

impl std::error::Error for InsufficientPromptsError {}

const TAIL_HASH_WINDOW: usize = 64 * 1024;
/// Successive window sizes tried when tail-scanning for a complete line,
/// doubling from 64 KiB the way vigilo's `read_transcript_meta` widens its
/// scan region (64 KiB, giving up after 512 KiB) — here widened further
/// since a cursor must always be found if the file has any complete line.
const SCAN_WINDOWS: &[u64] = &[64 * 1024, 256 * 1024, 1024 * 1024, 8 * 1024 * 1024];

/// Read the last `window` bytes of `file` (or the whole file if smaller).
/// Returns the byte offset where the returned buffer begins.
fn read_tail_window(file: &mut File, file_len: u64, window: u64) -> Result<(u64, Vec<u8>)> {
    let start = file_len.saturating_sub(window);
    file.seek(SeekFrom::Start(start))
        .context("seeking while tail-scanning transcript")?;
    let mut buf = vec![0u8; (file_len - start) as usize];
    file.read_exact(&mut buf)
        .context("reading chunk while tail-scanning transcript")?;
    Ok((start, buf))
}

/// Yield `(line_start, line_end)` ranges within `buf` from the last line to
/// the first, skipping trailing blank/whitespace-only lines. If the first
/// yielded line's start cannot be determined because it runs off the start
/// of `buf` and `start != 0`, that line is omitted — the caller should widen
/// the window and retry rather than trust a possibly-truncated line.
fn lines_from_end(buf: &[u8], start: u64) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut end = buf.len();
    loop {
        while end > 0 && (buf[end - 1] == b'\n' || buf[end - 1] == b'\r') {
            end -= 1;
        }
        if end == 0 {
            break;
        }
        match buf[..end].iter().rposition(|&b| b == b'\n') {
            Some(pos) => {
                ranges.push((pos + 1, end));
                end = pos + 1;
            }
            None => {
                if start == 0 {
                    ranges.push((0, end));
                }
                break;
            }
        }
    }
    ranges
}

fn newline_width(buf: &[u8], end: usize) -> u64 {
    let mut n = 0u64;
    let mut i = end;
    while i < buf.len() && (buf[i] == b'\n' || buf[i] == b'\r') {
        n += 1;
        i += 1;
    }
    n
}

/// Find the last complete (newline-terminated) JSON line in the file and
/// return `(byte_offset_end, event_id, last_line_json)`. `byte_offset_end`
/// is the offset just past the terminating newline of that last complete
/// line — i.e. the length of the file's well-formed prefix.
fn last_complete_line(
    path: &Path,
    event_id_field: &[String],
) -> Result<(u64, String, serde_json::Value)> {
    let mut file = File::open(path).with_context(|| format!("opening transcript {:?}", path))?;
    let file_len = file
        .metadata()
        .with_context(|| format!("statting transcript {:?}", path))?
        .len();

    if file_len == 0 {
        return Err(NoEventsError { path: path.to_path_buf() }.into());
    }

    for &window in SCAN_WINDOWS {
        let window = window.min(file_len);
        let (start, buf) = read_tail_window(&mut file, file_len, window)?;
        for (line_start, end) in lines_from_end(&buf, start) {
            let line = &buf[line_start..end];
            let Ok(text) = std::str::from_utf8(line) else {
                continue;
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                let byte_offset_end = start + end as u64 + newline_width(&buf, end);
                let event_id = extract_event_id(&value, event_id_field);
                return Ok((byte_offset_end, event_id, value));
            }
        }
        if window == file_len {
            break;
        }
    }

    Err(NoEventsError { path: path.to_path_buf() }.into())
}

fn extract_event_id(value: &serde_json::Value, event_id_field: &[String]) -> String {
    for field in event_id_field {
        if let Some(id) = value.get(field).and_then(|v| v.as_str()) {
            return id.to_string();
        }
    }
    String::new()
}

fn sha256_range(path: &Path, end: u64) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut remaining = end;
    let mut buf = [0u8; 64 * 1024];
    file.seek(SeekFrom::Start(0))?;
    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..to_read])?;
        hasher.update(&buf[..to_read]);
        remaining -= to_read as u64;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn sha256_tail(path: &Path, end: u64) -> Result<String> {
    let start = end.saturating_sub(TAIL_HASH_WINDOW as u64);
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf)?;
    let mut hasher = Sha256::new();
    hasher.update(&buf);
    Ok(format!("{:x}", hasher.finalize()))
}

/// spec §4.2 `compute_cursor`: tail-read to the last complete JSON line,
/// then hash the well-formed prefix and its tail.
pub fn compute_cursor(transcript_path: &Path, schema: &AgentSchema) -> Result<TranscriptCursor> {
    let (byte_offset_end, last_event_id, _) =
        last_complete_line(transcript_path, &schema.event_id_field)
            .context("computing transcript cursor")?;
    let prefix_sha256 = sha256_range(transcript_path, byte_offset_end)?;
    let tail_sha256 = sha256_tail(transcript_path, byte_offset_end)?;
    Ok(TranscriptCursor {
        byte_offset_end,
        last_event_id,
        prefix_sha256,
        tail_sha256,
    })
}

/// Verify a cursor against the transcript's *current* contents: tail hash
/// first (cheap), then full prefix hash only if the tail matches. Returns
/// `true` iff the transcript's first `cursor.byte_offset_end` bytes are
/// unchanged since the cursor was captured.
pub fn verify_cursor(transcript_path: &Path, cursor: &TranscriptCursor) -> Result<bool> {
    let file_len = std::fs::metadata(transcript_path)?.len();
    if file_len < cursor.byte_offset_end {
        return Ok(false);
    }
    if sha256_tail(transcript_path, cursor.byte_offset_end)? != cursor.tail_sha256 {
        return Ok(false);
    }
    Ok(sha256_range(transcript_path, cursor.byte_offset_end)? == cursor.prefix_sha256)
}

/// spec §4.2 `find_boundary_by_user_prompts`: tail-scan, counting user-role
/// lines from the end, stopping at the n-th and returning a cursor at the
/// *start* of that line (excluding it and everything after).
///
/// Uses the same growing-window re-read as [`last_complete_line`] rather
/// than fixed, non-overlapping chunks, so a line that would otherwise
/// straddle a chunk boundary is never mistaken for a complete one.
pub fn find_boundary_by_user_prompts(
    transcript_path: &Path,
    n: usize,
    schema: &AgentSchema,
) -> Result<TranscriptCursor> {
    if n == 0 {
        bail!("n must be at least 1");
    }
    let mut file =
        File::open(transcript_path).with_context(|| format!("opening {:?}", transcript_path))?;
    let file_len = file.metadata()?.len();

    for &window in SCAN_WINDOWS {
        let window = window.min(file_len);
        let (start, buf) = read_tail_window(&mut file, file_len, window)?;
        let mut found = 0usize;
        for (line_start, end) in lines_from_end(&buf, start) {
            let line = &buf[line_start..end];
            let Ok(text) = std::str::from_utf8(line) else {
                continue;
            };
            if !is_user_role_line(text) {
                continue;
            }
            found += 1;
            if found == n {
                let boundary = start + line_start as u64;
                let prefix_sha256 = sha256_range(transcript_path, boundary)?;
                let tail_sha256 = sha256_tail(transcript_path, boundary)?;
                let event_id = serde_json::from_str::<serde_json::Value>(text.trim())
                    .ok()
                    .map(|v| extract_event_id(&v, &schema.event_id_field))
                    .unwrap_or_default();
                return Ok(TranscriptCursor {
                    byte_offset_end: boundary,
                    last_event_id: event_id,
                    prefix_sha256,
                    tail_sha256,
                });
            }
        }
        if window == file_len {
            return Err(InsufficientPromptsError {
                path: transcript_path.to_path_buf(),
                requested: n,
                found,
            }
            .into());
        }
    }
    unreachable!("SCAN_WINDOWS always reaches file_len")
}

fn is_user_role_line(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => value
            .get("role")
            .or_else(|| value.get("type"))
            .and_then(|v| v.as_str())
            .map(|role| role == "user")
            .unwrap_or(false),
        Err(_) => false,
    }
}
