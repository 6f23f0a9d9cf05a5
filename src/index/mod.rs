//! Snapshot metadata records and the durable index document.
//!
//! The index is one JSON document holding the full ordered array of records,
//! newest first. Every mutation rewrites the whole document through a
//! temporary file renamed into place, so a crash mid-write can never leave a
//! truncated index behind.

use crate::utils::errors::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the index document inside the storage directory
pub const INDEX_FILE: &str = "index.json";

/// Descriptor of one stored snapshot. Immutable once created; records are
/// only ever appended and deleted, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: String,

    /// Creation time, epoch milliseconds
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Number of files packed into the container
    pub file_count: usize,

    /// Byte length of the container on disk
    pub size: u64,

    /// Absolute path of the captured source directory
    pub workspace_path: PathBuf,

    /// Automatic pre-restore backup, as opposed to a user snapshot
    #[serde(default)]
    pub backup: bool,
}

impl SnapshotRecord {
    /// Identifiers are the creation time plus a short random disambiguator,
    /// so ids sort the same way timestamps do.
    pub fn generate_id(timestamp: i64) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", timestamp, &suffix[..8])
    }

    /// Recover the creation time from an identifier.
    pub fn timestamp_from_id(id: &str) -> Option<i64> {
        id.split('-').next()?.parse().ok()
    }
}

/// Durable ordered collection of snapshot records.
pub struct MetadataIndex {
    path: PathBuf,
}

impl MetadataIndex {
    pub fn new(storage_dir: &Path) -> Self {
        Self {
            path: storage_dir.join(INDEX_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all records. A missing document is an empty index; an
    /// unparsable one is a typed error so the caller can reconcile against
    /// the containers on disk instead of silently losing the records.
    pub fn load(&self) -> Result<Vec<SnapshotRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        serde_json::from_str(&content)
            .map_err(|e| StoreError::CorruptIndex(format!("{}: {}", self.path.display(), e)))
    }

    /// Insert a record and persist the re-sorted index.
    pub fn append(&self, record: SnapshotRecord) -> Result<()> {
        let mut records = self.load()?;
        records.push(record);
        self.save(&mut records)
    }

    /// Remove the record with the given id, reporting whether one was found.
    /// Removing an absent id is not an error.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut records = self.load()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.save(&mut records)?;
        Ok(true)
    }

    /// Persist the full index, sorted newest first. The document is written
    /// to a temporary sibling and renamed into place.
    pub fn save(&self, records: &mut [SnapshotRecord]) -> Result<()> {
        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });

        let json = serde_json::to_string_pretty(&*records)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Move an unparsable document aside so a rebuilt one can take its
    /// place. Returns the quarantine path.
    pub fn quarantine(&self) -> Result<PathBuf> {
        let quarantined = self.path.with_extension("json.corrupt");
        fs::rename(&self.path, &quarantined)?;
        Ok(quarantined)
    }
}
