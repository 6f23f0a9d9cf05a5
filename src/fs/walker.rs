//! Directory traversal feeding captures.
//!
//! Walks a source tree, consults the pattern filter, and loads the content
//! of every accepted file. Excluded directories are pruned before descent so
//! an excluded subtree costs nothing. Scans are best-effort over large
//! trees: unreadable entries are skipped and reported as warnings rather
//! than aborting the capture.

use crate::archive::ArchiveEntry;
use crate::filter::PatternFilter;
use crate::utils::errors::{Result, StoreError};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

/// A per-file problem encountered during scanning.
#[derive(Debug, Clone)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Result of scanning a source tree. Entry order is traversal order.
#[derive(Debug)]
pub struct ScanOutcome {
    pub entries: Vec<ArchiveEntry>,
    pub warnings: Vec<ScanWarning>,
}

/// Recursively scan `root`, producing the entry set for a capture.
///
/// `skip_dir` is the storage directory itself; a capture never includes
/// its own containers. Symbolic links are not followed and not captured.
/// Cancellation is checked between directory entries.
pub fn scan_tree(
    root: &Path,
    filter: &PatternFilter,
    skip_dir: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<ScanOutcome> {
    if !root.is_dir() {
        return Err(StoreError::Storage(format!(
            "Source directory {} does not exist",
            root.display()
        )));
    }

    let mut entries = Vec::new();
    let mut warnings = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            if skip_dir.is_some_and(|skip| entry.path() == skip) {
                return false;
            }
            let Some(relative) = relative_slash_path(entry.path(), root) else {
                return false;
            };
            if entry.file_type().is_dir() {
                filter.allows_dir(&relative)
            } else {
                true
            }
        });

    for result in walker {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                warn!("Skipping unreadable entry {}: {}", path.display(), e);
                warnings.push(ScanWarning {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        // Directories are structural only; symlinks are not captured
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(relative) = relative_slash_path(entry.path(), root) else {
            continue;
        };
        if !filter.allows_file(&relative) {
            continue;
        }

        match fs::read(entry.path()) {
            Ok(data) => entries.push(ArchiveEntry {
                relative_path: relative,
                data,
            }),
            Err(e) => {
                warn!("Skipping unreadable file {}: {}", entry.path().display(), e);
                warnings.push(ScanWarning {
                    path: entry.path().to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(ScanOutcome { entries, warnings })
}

/// Derive the slash-normalized relative path of `path` under `root`.
/// Anything that is not a plain chain of normal components is rejected.
fn relative_slash_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| s.to_string()).collect()
    }

    fn filter(excludes: &[&str], includes: &[&str]) -> PatternFilter {
        PatternFilter::build(&strings(excludes), &[], &strings(includes)).unwrap()
    }

    fn paths(outcome: &ScanOutcome) -> Vec<&str> {
        outcome
            .entries
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect()
    }

    #[test]
    fn test_scan_collects_files_with_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"beta").unwrap();

        let outcome =
            scan_tree(dir.path(), &filter(&[], &[]), None, &CancellationToken::new()).unwrap();

        assert_eq!(outcome.entries.len(), 2);
        assert!(outcome.warnings.is_empty());
        let beta = outcome
            .entries
            .iter()
            .find(|e| e.relative_path == "sub/b.txt")
            .unwrap();
        assert_eq!(beta.data, b"beta");
    }

    #[test]
    fn test_excluded_directories_are_pruned() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config"), b"x").unwrap();
        fs::write(dir.path().join("kept.txt"), b"y").unwrap();

        let outcome = scan_tree(
            dir.path(),
            &filter(&[".git"], &[]),
            None,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(paths(&outcome), vec!["kept.txt"]);
    }

    #[test]
    fn test_storage_directory_is_always_skipped() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join(".snapshots");
        fs::create_dir(&storage).unwrap();
        fs::write(storage.join("old.tar.zst"), b"container").unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let outcome = scan_tree(
            dir.path(),
            &filter(&[], &[]),
            Some(&storage),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(paths(&outcome), vec!["a.txt"]);
    }

    #[test]
    fn test_include_patterns_gate_files_not_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), b"fn main() {}").unwrap();
        fs::write(dir.path().join("README.md"), b"docs").unwrap();

        let outcome = scan_tree(
            dir.path(),
            &filter(&[], &["*.rs"]),
            None,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(paths(&outcome), vec!["src/main.rs"]);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let err = scan_tree(
            &missing,
            &filter(&[], &[]),
            None,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[test]
    fn test_cancelled_scan_stops() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = scan_tree(dir.path(), &filter(&[], &[]), None, &cancel).unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_becomes_warning() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ok.txt"), b"fine").unwrap();
        let locked = dir.path().join("locked.txt");
        fs::write(&locked, b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits do not bind a root test runner; only assert when
        // the read actually fails.
        if fs::read(&locked).is_err() {
            let outcome =
                scan_tree(dir.path(), &filter(&[], &[]), None, &CancellationToken::new()).unwrap();
            assert_eq!(paths(&outcome), vec!["ok.txt"]);
            assert_eq!(outcome.warnings.len(), 1);
            assert_eq!(outcome.warnings[0].path, locked);
        }

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_captured() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let outcome =
            scan_tree(dir.path(), &filter(&[], &[]), None, &CancellationToken::new()).unwrap();
        assert_eq!(paths(&outcome), vec!["real.txt"]);
    }
}
