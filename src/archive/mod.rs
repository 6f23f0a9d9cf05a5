//! Container packing and unpacking.
//!
//! A container is a zstd-compressed tar stream holding the raw byte content
//! of many source files plus their slash-normalized relative paths. Pack and
//! unpack round-trip bytes exactly; there is no transcoding and no
//! line-ending normalization.

use crate::utils::errors::{Result, StoreError};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// File extension for snapshot containers
pub const CONTAINER_EXTENSION: &str = "tar.zst";

/// zstd compression level for container writes
const COMPRESSION_LEVEL: i32 = 3;

/// A single regular file captured from a source tree.
///
/// Relative paths use `/` separators on every platform and never escape the
/// capture root. Directories are structural only and are not stored.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub relative_path: String,
    pub data: Vec<u8>,
}

/// Pack entries into a container at `dest`.
///
/// The container is written to a temporary sibling file and renamed into
/// place, so `dest` either holds a complete container or nothing; a
/// cancelled or failed pack leaves no partial file behind. Cancellation is
/// checked between entries. Returns the byte length of the written
/// container.
pub fn pack(entries: &[ArchiveEntry], dest: &Path, cancel: &CancellationToken) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_sibling(dest);
    match write_container(entries, &tmp, cancel) {
        Ok(()) => {
            fs::rename(&tmp, dest)?;
            Ok(fs::metadata(dest)?.len())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_container(entries: &[ArchiveEntry], tmp: &Path, cancel: &CancellationToken) -> Result<()> {
    let file = File::create(tmp)?;
    let encoder = zstd::Encoder::new(file, COMPRESSION_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let mut header = tar::Header::new_gnu();
        header.set_size(entry.data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, &entry.relative_path, entry.data.as_slice())?;
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

/// Unpack a container into `target`.
///
/// Missing parent directories are created. When `overwrite` is false, an
/// existing file at an entry's destination is a conflict error. Entries
/// whose path is absolute or contains `..` are rejected; a container never
/// writes outside the target directory. Returns the number of files
/// written.
pub fn unpack(container: &Path, target: &Path, overwrite: bool) -> Result<usize> {
    let file = File::open(container)?;
    let decoder =
        zstd::Decoder::new(file).map_err(|e| StoreError::CorruptContainer(e.to_string()))?;
    let mut archive = tar::Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| StoreError::CorruptContainer(e.to_string()))?;

    let mut written = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| StoreError::CorruptContainer(e.to_string()))?;

        if !entry.header().entry_type().is_file() {
            debug!("Skipping non-file container entry");
            continue;
        }

        let relative = entry
            .path()
            .map_err(|e| StoreError::CorruptContainer(e.to_string()))?
            .into_owned();
        validate_entry_path(&relative)?;

        let dest = target.join(&relative);
        if !overwrite && dest.exists() {
            return Err(StoreError::Conflict(format!(
                "{} already exists and overwrite is disabled",
                relative.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }

    Ok(written)
}

/// Count the entries in a container without extracting it.
pub fn entry_count(container: &Path) -> Result<usize> {
    let file = File::open(container)?;
    let decoder =
        zstd::Decoder::new(file).map_err(|e| StoreError::CorruptContainer(e.to_string()))?;
    let mut archive = tar::Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| StoreError::CorruptContainer(e.to_string()))?;

    let mut count = 0usize;
    for entry in entries {
        entry.map_err(|e| StoreError::CorruptContainer(e.to_string()))?;
        count += 1;
    }
    Ok(count)
}

/// Reject container entry paths that would resolve outside the target.
fn validate_entry_path(relative: &Path) -> Result<()> {
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::Conflict(format!(
                    "Entry path escapes the target directory: {}",
                    relative.display()
                )));
            }
        }
    }
    Ok(())
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(path: &str, data: &[u8]) -> ArchiveEntry {
        ArchiveEntry {
            relative_path: path.to_string(),
            data: data.to_vec(),
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn test_round_trip_preserves_bytes_exactly() {
        let dir = TempDir::new().unwrap();
        let container = dir.path().join("snap.tar.zst");
        let entries = vec![
            entry("a.txt", b"hello"),
            entry("nested/deep/b.bin", b"\x00\x01\xff\r\n\r\n"),
            entry("empty", b""),
        ];

        let size = pack(&entries, &container, &token()).unwrap();
        assert_eq!(size, fs::metadata(&container).unwrap().len());

        let target = TempDir::new().unwrap();
        let written = unpack(&container, target.path(), false).unwrap();
        assert_eq!(written, 3);

        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(
            fs::read(target.path().join("nested/deep/b.bin")).unwrap(),
            b"\x00\x01\xff\r\n\r\n"
        );
        assert_eq!(fs::read(target.path().join("empty")).unwrap(), b"");
    }

    #[test]
    fn test_unpack_without_overwrite_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let container = dir.path().join("snap.tar.zst");
        pack(&[entry("a.txt", b"new")], &container, &token()).unwrap();

        let target = TempDir::new().unwrap();
        fs::write(target.path().join("a.txt"), b"old").unwrap();

        let err = unpack(&container, target.path(), false).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"old");
    }

    #[test]
    fn test_unpack_with_overwrite_replaces_files() {
        let dir = TempDir::new().unwrap();
        let container = dir.path().join("snap.tar.zst");
        pack(&[entry("a.txt", b"new")], &container, &token()).unwrap();

        let target = TempDir::new().unwrap();
        fs::write(target.path().join("a.txt"), b"old").unwrap();

        unpack(&container, target.path(), true).unwrap();
        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"new");
    }

    #[test]
    fn test_unpack_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let container = dir.path().join("evil.tar.zst");

        // Craft a header whose name contains `..` by writing the raw name
        // bytes; the tar builder's path API refuses to produce one.
        let file = File::create(&container).unwrap();
        let encoder = zstd::Encoder::new(file, COMPRESSION_LEVEL).unwrap();
        let mut builder = tar::Builder::new(encoder);
        let data = b"owned";
        let mut header = tar::Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            let name = b"../escape.txt";
            gnu.name[..name.len()].copy_from_slice(name);
        }
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &data[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let target = TempDir::new().unwrap();
        let inner = target.path().join("inner");
        fs::create_dir(&inner).unwrap();

        let err = unpack(&container, &inner, true).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(!target.path().join("escape.txt").exists());
    }

    #[test]
    fn test_unpack_garbage_is_corrupt_container() {
        let dir = TempDir::new().unwrap();
        let container = dir.path().join("junk.tar.zst");
        fs::write(&container, b"this is not a container").unwrap();

        let target = TempDir::new().unwrap();
        let err = unpack(&container, target.path(), true).unwrap_err();
        assert!(matches!(err, StoreError::CorruptContainer(_)));
    }

    #[test]
    fn test_cancelled_pack_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let container = dir.path().join("snap.tar.zst");

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pack(&[entry("a.txt", b"data")], &container, &cancel).unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_entry_count() {
        let dir = TempDir::new().unwrap();
        let container = dir.path().join("snap.tar.zst");
        let entries = vec![entry("a", b"1"), entry("b", b"2"), entry("c/d", b"3")];
        pack(&entries, &container, &token()).unwrap();

        assert_eq!(entry_count(&container).unwrap(), 3);
    }

    #[test]
    fn test_pack_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let container = dir.path().join("store/deep/snap.tar.zst");
        pack(&[entry("a.txt", b"x")], &container, &token()).unwrap();
        assert!(container.exists());
    }
}
