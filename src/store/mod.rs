//! # Durable storage primitives
//!
//! This module provides the on-disk building blocks of the sector store:
//!
//! - `bitmap`: per-folder usage bitmap with a rotating first-fit cursor
//! - `folder`: a storage folder's sector and metadata files
//! - `overflow`: memory-mapped persistent overflow reference counts
//! - `settings`: the checksummed settings snapshot with atomic rename
//! - `wal`: write-ahead log records, framing, writer and replay
//!
//! ## On-disk layout
//!
//! The store directory contains only metadata; sector payloads live in
//! the operator-chosen storage folders:
//!
//! ```text
//! <store dir>/
//! ├── settings.dat          # settings snapshot
//! ├── settings.tmp          # present only mid-checkpoint
//! ├── wal.dat               # active write-ahead log
//! ├── wal.dat.tmp           # rotated WAL pending deletion
//! ├── sectoroverflow.dat    # overflow reference counts
//! └── lock                  # advisory lock held while open
//!
//! <storage folder>/
//! ├── siahostdata.dat       # capacity x 4 MiB sector payloads
//! └── siahostmetadata.dat   # capacity x 14 B (id || count) entries
//! ```
//!
//! All multi-byte integers on disk are little-endian.

mod bitmap;
mod folder;
mod overflow;
mod settings;
mod wal;

pub use bitmap::UsageBitmap;
pub use folder::{
    FolderHealth, MetadataEntry, StorageFolder, METADATA_FILE_NAME, SECTOR_FILE_NAME,
};
pub use overflow::{OverflowMap, OVERFLOW_ENTRY_SIZE, OVERFLOW_HEADER_SIZE, OVERFLOW_MAGIC};
pub use settings::{
    sync_dir, FolderSettings, Settings, SETTINGS_FILE_NAME, SETTINGS_TMP_NAME, SETTINGS_VERSION,
};
pub use wal::{WalReader, WalRecord, WalWriter, WAL_FILE_NAME, WAL_TMP_NAME};

/// Name of the advisory lock file inside the store directory.
pub const LOCK_FILE_NAME: &str = "lock";
