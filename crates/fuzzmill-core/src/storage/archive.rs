//! Corpus ZIP packing and unpacking.
//!
//! Archives are standard ZIPs with deflate compression. Relative paths,
//! POSIX modes, and explicit directory entries (trailing `/`) are preserved
//! so that a download → unzip → zip → upload round-trip is lossless.

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;

use thiserror::Error;
use tracing::info;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Fallback entry mode used on platforms without POSIX permissions.
#[cfg(not(unix))]
const DEFAULT_FILE_MODE: u32 = 0o644;
#[cfg(not(unix))]
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Errors from archive packing/unpacking.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArchiveError {
    /// Underlying ZIP format error.
    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Filesystem access failed.
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory traversal failed.
    #[error("walking directory: {0}")]
    Walk(#[from] walkdir::Error),

    /// An archive entry would extract outside the destination directory.
    #[error("zip entry {name:?} escapes the destination directory")]
    UnsafeEntry {
        /// Offending entry name.
        name: String,
    },
}

fn entry_mode(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        metadata.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        if metadata.is_dir() {
            DEFAULT_DIR_MODE
        } else {
            DEFAULT_FILE_MODE
        }
    }
}

/// Zips the contents of `src_dir` into an in-memory archive.
///
/// Paths are stored relative to `src_dir` with `/` separators. Directories
/// get explicit entries with a trailing `/`. File and directory modes are
/// recorded.
///
/// # Errors
///
/// Returns an error when the tree cannot be walked or an entry cannot be
/// read or written.
pub fn zip_dir(src_dir: &Path) -> Result<Vec<u8>, ArchiveError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for entry in WalkDir::new(src_dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src_dir).unwrap_or(entry.path());
        let name = rel.to_string_lossy().replace('\\', "/");
        let metadata = entry.metadata()?;
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(entry_mode(&metadata));

        if entry.file_type().is_dir() {
            writer.add_directory(format!("{name}/"), options)?;
        } else {
            writer.start_file(name, options)?;
            writer.write_all(&std::fs::read(entry.path())?)?;
        }
    }

    let cursor = writer.finish()?;
    info!(source = %src_dir.display(), "directory zipped");
    Ok(cursor.into_inner())
}

/// Extracts `src_zip` into `dest_dir`, preserving directory structure and
/// POSIX modes. An archive with zero entries is skipped with a log line.
///
/// # Errors
///
/// Returns an error when the archive is malformed, an entry escapes the
/// destination, or the filesystem cannot be written.
pub fn unzip(src_zip: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let file = File::open(src_zip)?;
    let mut archive = ZipArchive::new(file)?;

    if archive.is_empty() {
        info!(zip_file = %src_zip.display(), "zip archive is empty, skipping unzip");
        return Ok(());
    }

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(ArchiveError::UnsafeEntry {
                name: entry.name().to_string(),
            });
        };
        let full_path = dest_dir.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&full_path)?;
            set_mode(&full_path, entry.unix_mode())?;
            continue;
        }

        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&full_path)?;
        std::io::copy(&mut entry, &mut out)?;
        drop(out);
        set_mode(&full_path, entry.unix_mode())?;
    }

    info!(
        zip_file = %src_zip.display(),
        destination = %dest_dir.display(),
        "extracted zip archive"
    );
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> std::io::Result<()> {
    if let Some(mode) = mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_unzip_round_trip() {
        let src = tempfile::tempdir().unwrap();
        let nested = src.path().join("pkg").join("testdata").join("fuzz");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("input-a"), b"corpus entry a").unwrap();
        std::fs::write(src.path().join("top.txt"), b"top-level").unwrap();

        let bytes = zip_dir(src.path()).unwrap();

        let zip_path = src.path().join("round-trip.zip");
        std::fs::write(&zip_path, &bytes).unwrap();
        let dest = tempfile::tempdir().unwrap();
        unzip(&zip_path, dest.path()).unwrap();

        assert_eq!(
            std::fs::read(dest.path().join("pkg/testdata/fuzz/input-a")).unwrap(),
            b"corpus entry a"
        );
        assert_eq!(
            std::fs::read(dest.path().join("top.txt")).unwrap(),
            b"top-level"
        );
        assert!(dest.path().join("pkg/testdata/fuzz").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_round_trip_preserves_modes() {
        let src = tempfile::tempdir().unwrap();
        let dir = src.path().join("bin");
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("run.sh");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        let bytes = zip_dir(src.path()).unwrap();
        let zip_path = src.path().join("modes.zip");
        std::fs::write(&zip_path, &bytes).unwrap();

        let dest = tempfile::tempdir().unwrap();
        unzip(&zip_path, dest.path()).unwrap();

        let script_mode = std::fs::metadata(dest.path().join("bin/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        let dir_mode = std::fs::metadata(dest.path().join("bin"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(script_mode & 0o777, 0o755);
        assert_eq!(dir_mode & 0o777, 0o755);
    }

    #[test]
    fn test_unzip_empty_archive_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("empty.zip");
        let writer = ZipWriter::new(File::create(&zip_path).unwrap());
        writer.finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        unzip(&zip_path, dest.path()).unwrap();
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_zip_of_empty_dir_round_trips() {
        let src = tempfile::tempdir().unwrap();
        let bytes = zip_dir(src.path()).unwrap();

        let zip_path = src.path().join("empty.zip");
        std::fs::write(&zip_path, &bytes).unwrap();
        let dest = tempfile::tempdir().unwrap();
        unzip(&zip_path, dest.path()).unwrap();
    }
}
