//! Workspace Snapshot Store
//!
//! Storage engine that captures the state of a working directory tree as a
//! single container file plus an ordered index record, and restores it
//! later with an automatic backup of the state being overwritten. The
//! interactive command surface sits on top of [`store::SnapshotStorage`];
//! this crate owns scanning, filtering, packing, and index consistency.

pub mod archive;
pub mod config;
pub mod filter;
pub mod fs;
pub mod index;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::StoreConfig;
pub use filter::PatternFilter;
pub use fs::walker::ScanWarning;
pub use index::{MetadataIndex, SnapshotRecord};
pub use store::{backup::BackupManager, CreateOptions, CreateOutcome, SnapshotStorage};
pub use utils::errors::StoreError;
pub type Result<T> = std::result::Result<T, StoreError>;
