//! Archiver (C6): in-process tar+gzip, no shelling out to a `tar` binary.

use crate::error::BackupError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs::File as StdFile;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

/// Packs `staging_dir` into `<staging_dir>.tar.gz`, entries relative to
/// `staging_dir`. Returns the archive path.
pub fn pack(staging_dir: &Path) -> Result<PathBuf, BackupError> {
    let archive_path = staging_dir.with_extension("tar.gz");
    let out = StdFile::create(&archive_path).map_err(|e| BackupError::Archiver(e.into()))?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = Builder::new(encoder);
    builder
        .append_dir_all(".", staging_dir)
        .map_err(|e| BackupError::Archiver(e.into()))?;
    builder
        .into_inner()
        .map_err(|e| BackupError::Archiver(e.into()))?
        .finish()
        .map_err(|e| BackupError::Archiver(e.into()))?;
    Ok(archive_path)
}

/// Extracts only the entries named in `files` (relative paths, leading `/`
/// stripped) into `dest_dir`. `directories` are pre-created instead of
/// extracted (a directory entry may legitimately be absent from the
/// archive if it held no new bytes this generation).
pub fn extract_subset(
    archive: &Path,
    dest_dir: &Path,
    files: &[String],
    directories: &[String],
) -> Result<(), BackupError> {
    for dir in directories {
        let target = dest_dir.join(dir.trim_start_matches('/'));
        std::fs::create_dir_all(target).map_err(|e| BackupError::Archiver(e.into()))?;
    }

    if files.is_empty() {
        return Ok(());
    }

    let wanted: HashSet<&str> = files.iter().map(|f| f.trim_start_matches('/')).collect();
    let input = StdFile::open(archive).map_err(|e| BackupError::Archiver(e.into()))?;
    let decoder = GzDecoder::new(input);
    let mut tar = Archive::new(decoder);

    for entry in tar.entries().map_err(|e| BackupError::Archiver(e.into()))? {
        let mut entry = entry.map_err(|e| BackupError::Archiver(e.into()))?;
        let path = entry.path().map_err(|e| BackupError::Archiver(e.into()))?.into_owned();
        let path_str = path.to_string_lossy();
        if wanted.contains(path_str.as_ref()) {
            entry
                .unpack_in(dest_dir)
                .map_err(|e| BackupError::Archiver(e.into()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_extract_subset_roundtrips_selected_file() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(staging.join("sub")).unwrap();
        std::fs::write(staging.join("a.txt"), b"hello").unwrap();
        std::fs::write(staging.join("sub/b.txt"), b"world").unwrap();

        let archive = pack(&staging).unwrap();
        assert!(archive.exists());

        let dest = tmp.path().join("dest");
        extract_subset(
            &archive,
            &dest,
            &["a.txt".to_string()],
            &["sub".to_string()],
        )
        .unwrap();

        assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"hello");
        assert!(dest.join("sub").is_dir());
        assert!(!dest.join("sub/b.txt").exists());
    }

    #[test]
    fn extract_subset_with_empty_file_list_only_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("a.txt"), b"hello").unwrap();
        let archive = pack(&staging).unwrap();

        let dest = tmp.path().join("dest");
        extract_subset(&archive, &dest, &[], &["empty_dir".to_string()]).unwrap();

        assert!(dest.join("empty_dir").is_dir());
        assert!(!dest.join("a.txt").exists());
    }
}
