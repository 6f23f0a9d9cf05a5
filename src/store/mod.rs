//! Snapshot storage orchestrator.
//!
//! Composes the scanner, pattern filter, archive codec, and metadata index
//! into the public operations: create, list, get, restore, delete. One
//! storage root holds one container file per snapshot plus the index
//! document; the two are kept in lockstep by every mutating operation.
//!
//! Mutations are serialized by a per-root mutex so two concurrent creates
//! cannot lose each other's index update. Long-running filesystem work runs
//! on the blocking pool, with cooperative cancellation through the
//! storage's [`CancellationToken`].

pub mod backup;

use crate::archive::{self, CONTAINER_EXTENSION};
use crate::config::StoreConfig;
use crate::filter::PatternFilter;
use crate::fs::walker::{self, ScanWarning};
use crate::index::{MetadataIndex, SnapshotRecord};
use crate::utils::errors::{Result, StoreError};
use backup::BackupManager;
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Options for creating a snapshot.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub message: Option<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

/// A created snapshot plus the per-file problems encountered while
/// scanning, so the caller can inform the user about skipped files.
#[derive(Debug)]
pub struct CreateOutcome {
    pub record: SnapshotRecord,
    pub warnings: Vec<ScanWarning>,
}

/// Snapshot storage rooted at one workspace directory.
pub struct SnapshotStorage {
    storage_dir: PathBuf,
    config: StoreConfig,
    index: MetadataIndex,
    /// Serializes operations on this storage root
    op_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl SnapshotStorage {
    /// Open (creating if needed) the storage directory inside
    /// `workspace_root`.
    pub fn open(workspace_root: &Path, config: StoreConfig) -> Result<Self> {
        Self::open_with_cancel(workspace_root, config, CancellationToken::new())
    }

    /// Open with an externally owned cancellation token. Cancelling the
    /// token makes in-flight scans and packs return [`StoreError::Cancelled`]
    /// without leaving partial containers behind.
    pub fn open_with_cancel(
        workspace_root: &Path,
        config: StoreConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let storage_dir = workspace_root.join(&config.storage_dir);
        fs::create_dir_all(&storage_dir).map_err(|e| {
            StoreError::Storage(format!(
                "Failed to create storage directory {}: {}",
                storage_dir.display(),
                e
            ))
        })?;

        let index = MetadataIndex::new(&storage_dir);
        Ok(Self {
            storage_dir,
            config,
            index,
            op_lock: Mutex::new(()),
            cancel,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Capture `source_dir` into a new snapshot.
    pub async fn create(&self, source_dir: &Path, options: CreateOptions) -> Result<CreateOutcome> {
        let _guard = self.op_lock.lock().await;

        let filter = PatternFilter::build(
            &self.config.default_excludes,
            &options.exclude_patterns,
            &options.include_patterns,
        )?;

        let records = self.load_index_recovering()?;
        let timestamp = next_timestamp(&records);
        let id = SnapshotRecord::generate_id(timestamp);
        let container = self.container_path(&id);

        info!("Creating snapshot {} from {}", id, source_dir.display());

        let (file_count, size, warnings) = {
            let source = source_dir.to_path_buf();
            let storage_dir = self.storage_dir.clone();
            let container = container.clone();
            let cancel = self.cancel.clone();
            tokio::task::spawn_blocking(move || -> Result<(usize, u64, Vec<ScanWarning>)> {
                let scan = walker::scan_tree(&source, &filter, Some(&storage_dir), &cancel)?;
                let size = archive::pack(&scan.entries, &container, &cancel)?;
                Ok((scan.entries.len(), size, scan.warnings))
            })
            .await
            .map_err(|e| StoreError::Storage(format!("Capture task failed: {}", e)))??
        };

        if size > self.config.max_snapshot_size {
            warn!(
                "Snapshot {} is {} bytes, over the {} byte warning threshold",
                id, size, self.config.max_snapshot_size
            );
        }

        let record = SnapshotRecord {
            id,
            timestamp,
            message: options.message,
            file_count,
            size,
            workspace_path: absolute(source_dir),
            backup: false,
        };

        if let Err(e) = self.index.append(record.clone()) {
            // A record we cannot persist must not leave its container behind
            let _ = fs::remove_file(&container);
            return Err(e);
        }

        info!(
            "Snapshot {} created: {} files, {} bytes, {} skipped",
            record.id,
            record.file_count,
            record.size,
            warnings.len()
        );

        Ok(CreateOutcome { record, warnings })
    }

    /// All records, newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotRecord>> {
        let _guard = self.op_lock.lock().await;
        let mut records = self.load_index_recovering()?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }

    /// Look up one record. Absence is a normal `None`, not an error.
    pub async fn get(&self, id: &str) -> Result<Option<SnapshotRecord>> {
        let _guard = self.op_lock.lock().await;
        let records = self.load_index_recovering()?;
        Ok(records.into_iter().find(|r| r.id == id))
    }

    /// Restore a snapshot into `target_dir`, overwriting existing files.
    ///
    /// With `create_backup`, the target's current state is captured first
    /// and indexed as a backup record; a failed backup aborts the restore
    /// with the target untouched. Returns the backup record when one was
    /// taken.
    pub async fn restore(
        &self,
        id: &str,
        target_dir: &Path,
        create_backup: bool,
    ) -> Result<Option<SnapshotRecord>> {
        let _guard = self.op_lock.lock().await;

        let records = self.load_index_recovering()?;
        if !records.iter().any(|r| r.id == id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let container = self.container_path(id);
        if !container.exists() {
            return Err(StoreError::NotFound(format!(
                "{} (container file is missing)",
                id
            )));
        }

        let backup_record = if create_backup {
            let timestamp = next_timestamp(&records);
            let manager = BackupManager::new(
                self.storage_dir.clone(),
                self.config.default_excludes.clone(),
            );
            let target = target_dir.to_path_buf();
            let cancel = self.cancel.clone();

            let (record, warnings) =
                match tokio::task::spawn_blocking(move || manager.capture(&target, timestamp, &cancel))
                    .await
                    .map_err(|e| StoreError::Storage(format!("Backup task failed: {}", e)))?
                {
                    Ok(captured) => captured,
                    Err(e) => {
                        error!("Backup capture failed, aborting restore of {}: {}", id, e);
                        return Err(e);
                    }
                };

            if !warnings.is_empty() {
                warn!(
                    "Backup of {} skipped {} unreadable files",
                    target_dir.display(),
                    warnings.len()
                );
            }

            // Index the backup before touching the target so the safety
            // copy stays reachable even if extraction then fails
            if let Err(e) = self.index.append(record.clone()) {
                let _ = fs::remove_file(self.container_path(&record.id));
                return Err(e);
            }
            Some(record)
        } else {
            None
        };

        let extracted = {
            let container = container.clone();
            let target = target_dir.to_path_buf();
            tokio::task::spawn_blocking(move || archive::unpack(&container, &target, true))
                .await
                .map_err(|e| StoreError::Storage(format!("Extract task failed: {}", e)))??
        };

        info!(
            "Restored snapshot {} into {}: {} files",
            id,
            target_dir.display(),
            extracted
        );

        Ok(backup_record)
    }

    /// Delete a snapshot's container and index record. Idempotent: deleting
    /// an id twice, or an id whose container was already removed by hand,
    /// succeeds.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let container = self.container_path(id);
        match fs::remove_file(&container) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }

        // A corrupt document must not block record removal
        self.load_index_recovering()?;

        if self.index.remove(id)? {
            info!("Deleted snapshot {}", id);
        } else {
            debug!("Delete of {}: no index record", id);
        }
        Ok(())
    }

    fn container_path(&self, id: &str) -> PathBuf {
        self.storage_dir
            .join(format!("{}.{}", id, CONTAINER_EXTENSION))
    }

    /// Load the index, rebuilding it from the containers on disk when the
    /// document itself cannot be parsed.
    fn load_index_recovering(&self) -> Result<Vec<SnapshotRecord>> {
        match self.index.load() {
            Ok(records) => Ok(records),
            Err(StoreError::CorruptIndex(reason)) => {
                warn!("Index is corrupt ({}), rebuilding from containers", reason);
                let quarantined = self.index.quarantine()?;
                warn!("Corrupt index document moved to {}", quarantined.display());

                let mut rebuilt = self.rebuild_index_from_containers()?;
                self.index.save(&mut rebuilt)?;
                info!("Index rebuilt: {} records recovered", rebuilt.len());
                Ok(rebuilt)
            }
            Err(e) => Err(e),
        }
    }

    /// Reconstruct records for every container present on disk. Id and
    /// timestamp come from the container file name, size from file
    /// metadata, file count from the container itself; the original message
    /// and backup flag are unrecoverable.
    fn rebuild_index_from_containers(&self) -> Result<Vec<SnapshotRecord>> {
        let suffix = format!(".{}", CONTAINER_EXTENSION);
        let workspace = self
            .storage_dir
            .parent()
            .unwrap_or(&self.storage_dir)
            .to_path_buf();

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.storage_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name.strip_suffix(&suffix) else {
                continue;
            };

            let path = entry.path();
            let file_count = match archive::entry_count(&path) {
                Ok(count) => count,
                Err(e) => {
                    warn!("Skipping unreadable container {}: {}", path.display(), e);
                    continue;
                }
            };

            records.push(SnapshotRecord {
                id: id.to_string(),
                timestamp: SnapshotRecord::timestamp_from_id(id).unwrap_or(0),
                message: None,
                file_count,
                size: entry.metadata().map(|m| m.len()).unwrap_or(0),
                workspace_path: workspace.clone(),
                backup: false,
            });
        }
        Ok(records)
    }
}

/// Timestamps are strictly increasing per storage root so descending order
/// is total even for captures taken within the same millisecond.
fn next_timestamp(records: &[SnapshotRecord]) -> i64 {
    let now = Utc::now().timestamp_millis();
    let newest = records.iter().map(|r| r.timestamp).max().unwrap_or(i64::MIN);
    now.max(newest.saturating_add(1))
}

pub(crate) fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
