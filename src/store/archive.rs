//! Archive creation and extraction (spec §4.1 `create_archive`,
//! `extract_archive`): gzip-compressed tar, written atomically.
//!
//! Grounded in `aptos-labs-aptos-core`'s `storage/backup/backup-cli` and
//! `moabualruz-ricecoder`, both of which depend on `tar` + `flate2` for
//! durable archive snapshots; the teacher's own `checkpoint/storage.rs` uses
//! `zstd` with a content-addressable pool instead, which this crate departs
//! from because spec §3/§6.2 fix the on-disk format as a single
//! gzip-compressed tar per checkpoint (see DESIGN.md).

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Write a gzip-compressed tar archive containing exactly `files` (paths
/// relative to `project_root`) to `out_path`. Writes through a temp file in
/// the same directory, then renames, so a reader never observes a
/// partially-written archive.
pub fn create_archive(project_root: &Path, files: &[PathBuf], out_path: &Path) -> Result<()> {
    let dir = out_path.parent().context("archive path has no parent")?;
    fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;

    let tmp_path = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    {
        let file = File::create(&tmp_path)
            .with_context(|| format!("creating temp archive {:?}", tmp_path))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for rel_path in files {
            let full_path = project_root.join(rel_path);
            match builder.append_path_with_name(&full_path, rel_path) {
                Ok(()) => {}
                Err(e) => {
                    // The agent may have deleted the file between scan and
                    // archive; skip it rather than aborting the checkpoint.
                    log::warn!("skipping {:?} while archiving: {}", full_path, e);
                }
            }
        }

        let encoder = builder
            .into_inner()
            .context("finalizing tar stream")?;
        encoder.finish().context("finalizing gzip stream")?;
    }

    fs::rename(&tmp_path, out_path).with_context(|| {
        format!("renaming temp archive {:?} to {:?}", tmp_path, out_path)
    })?;
    Ok(())
}

/// Extract `archive_path` into `project_root`, overwriting existing files.
/// Refuses any entry whose path normalizes outside `project_root` (no
/// absolute paths, no `..` components) — spec §4.1 and the "Restore
/// atomicity" testable property depend on this.
pub fn extract_archive(archive_path: &Path, project_root: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening archive {:?}", archive_path))?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let mut extracted = 0;
    for entry in archive.entries().context("reading tar entries")? {
        let mut entry = entry.context("reading tar entry")?;
        let entry_path = entry.path().context("reading entry path")?.into_owned();

        if entry_path.is_absolute() || entry_path.components().any(|c| c == std::path::Component::ParentDir) {
            bail!("archive entry {:?} escapes project root", entry_path);
        }

        let dest = project_root.join(&entry_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {:?}", parent))?;
        }
        entry
            .unpack(&dest)
            .with_context(|| format!("extracting {:?}", dest))?;
        extracted += 1;
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_file_contents() {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir_all(project.path().join("sub")).unwrap();
        std::fs::write(project.path().join("sub/b.txt"), b"world").unwrap();

        let archive_dir = TempDir::new().unwrap();
        let archive_path = archive_dir.path().join("files.tar.gz");
        create_archive(
            project.path(),
            &[PathBuf::from("a.txt"), PathBuf::from("sub/b.txt")],
            &archive_path,
        )
        .unwrap();

        let restore_dir = TempDir::new().unwrap();
        let count = extract_archive(&archive_path, restore_dir.path()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            std::fs::read_to_string(restore_dir.path().join("a.txt")).unwrap(),
            "hello"
        );
        assert_eq!(
            std::fs::read_to_string(restore_dir.path().join("sub/b.txt")).unwrap(),
            "world"
        );
    }

    #[test]
    fn skips_files_deleted_after_scan() {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("a.txt"), b"hello").unwrap();

        let archive_dir = TempDir::new().unwrap();
        let archive_path = archive_dir.path().join("files.tar.gz");
        // "missing.txt" was scanned but deleted before archiving.
        create_archive(
            project.path(),
            &[PathBuf::from("a.txt"), PathBuf::from("missing.txt")],
            &archive_path,
        )
        .unwrap();

        let restore_dir = TempDir::new().unwrap();
        let count = extract_archive(&archive_path, restore_dir.path()).unwrap();
        assert_eq!(count, 1);
    }
}
