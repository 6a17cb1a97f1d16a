//! # sectorstore: durable content-addressed sector storage
//!
//! `sectorstore` is a crash-safe block store for fixed-size 4 MiB data
//! blobs ("sectors"), each identified by the Merkle root of its contents.
//! Sectors are spread across operator-provided storage folders, with
//! placement weighted by remaining capacity, reference counting for
//! duplicate roots, and a write-ahead log that makes every acknowledged
//! operation durable.
//!
//! ## Quick start
//!
//! ```ignore
//! use sectorstore::SectorStore;
//!
//! let store = SectorStore::open("/var/lib/host/contractmanager")?;
//! store.add_storage_folder("/mnt/disk1/hostdata", 1 << 40)?;
//!
//! store.add_sector(root, &data)?;           // durable once this returns
//! let bytes = store.read_sector(root)?;
//! store.remove_sector(root)?;               // reference-counted
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │       Public API (SectorStore)               │
//! ├──────────────┬───────────────┬───────────────┤
//! │ keyed sector │  location     │  placement    │
//! │ locks        │  index        │  policy       │
//! ├──────────────┴───────────────┴───────────────┤
//! │   WAL + sync loop (checkpoint protocol)      │
//! ├──────────────────────────────────────────────┤
//! │ storage folders │ overflow map │ settings    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Durability model: mutations update in-memory state, append a WAL
//! record, and block until the background sync loop fsyncs the log. The
//! loop periodically folds the whole state into a checksummed settings
//! snapshot (atomic rename) and truncates the log; startup replays
//! whatever logs a crash left behind.
//!
//! ## Module overview
//!
//! - [`store`]: usage bitmaps, storage folders, overflow map, settings
//!   snapshot, WAL framing
//! - [`manager`]: the `SectorStore` itself, with sector and folder
//!   operations, recovery, and the sync loop
//! - [`error`]: caller-distinguishable error kinds
//! - [`hooks`]: fault-injection points for crash tests

pub mod config;
pub mod error;
pub mod hooks;
pub mod id;
pub mod manager;
pub mod store;

pub use config::{StoreConfig, SECTOR_SIZE, STORAGE_FOLDER_GRANULARITY};
pub use error::{kind as error_kind, StoreError};
pub use hooks::{Hooks, ProductionHooks};
pub use id::{MerkleRoot, SectorId};
pub use manager::{SectorStore, SectorStoreBuilder, StorageFolderInfo};
