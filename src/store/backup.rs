//! Automatic backup capture taken before a destructive restore.

use crate::archive::{self, CONTAINER_EXTENSION};
use crate::filter::PatternFilter;
use crate::fs::walker::{self, ScanWarning};
use crate::index::SnapshotRecord;
use crate::utils::errors::Result;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Message attached to every automatic backup record
pub const BACKUP_MESSAGE: &str = "Automatic backup before restore";

/// Captures the current state of a restore target before it is overwritten.
///
/// Backups apply the default excludes only; per-operation user patterns do
/// not apply. The resulting record carries `backup: true` and lives in the
/// primary index like any other snapshot: listable, restorable, deletable.
pub struct BackupManager {
    storage_dir: PathBuf,
    default_excludes: Vec<String>,
}

impl BackupManager {
    pub fn new(storage_dir: PathBuf, default_excludes: Vec<String>) -> Self {
        Self {
            storage_dir,
            default_excludes,
        }
    }

    /// Capture `target_dir` into a backup container. Any failure here
    /// aborts the restore that requested it.
    pub fn capture(
        &self,
        target_dir: &Path,
        timestamp: i64,
        cancel: &CancellationToken,
    ) -> Result<(SnapshotRecord, Vec<ScanWarning>)> {
        let filter = PatternFilter::build(&self.default_excludes, &[], &[])?;
        let scan = walker::scan_tree(target_dir, &filter, Some(&self.storage_dir), cancel)?;

        let id = SnapshotRecord::generate_id(timestamp);
        let container = self
            .storage_dir
            .join(format!("{}.{}", id, CONTAINER_EXTENSION));
        let size = archive::pack(&scan.entries, &container, cancel)?;

        info!(
            "Backup {} captured from {}: {} files, {} bytes",
            id,
            target_dir.display(),
            scan.entries.len(),
            size
        );

        let record = SnapshotRecord {
            id,
            timestamp,
            message: Some(BACKUP_MESSAGE.to_string()),
            file_count: scan.entries.len(),
            size,
            workspace_path: crate::store::absolute(target_dir),
            backup: true,
        };

        Ok((record, scan.warnings))
    }
}
