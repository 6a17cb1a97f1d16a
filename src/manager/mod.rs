//! # Sector store orchestration
//!
//! This module ties the durable primitives together into the public
//! [`SectorStore`] API. The store owns a set of storage folders, the
//! in-memory location index, the overflow map and the WAL; a single
//! background thread runs the sync loop that turns appended WAL records
//! into acknowledged, durable operations.
//!
//! ## Locking discipline
//!
//! Lock acquisition follows a fixed order to stay deadlock-free:
//!
//! 1. keyed sector lock (one per in-flight sector ID)
//! 2. folders map (`RwLock`; the write lock is never held across any
//!    other lock acquisition)
//! 3. per-folder usage bitmap mutex
//! 4. overflow map mutex
//! 5. WAL append mutex
//! 6. sync-state mutex (only ever taken while holding the WAL mutex, or
//!    alone)
//!
//! The sync loop holds the WAL mutex for the duration of a checkpoint,
//! which both serializes appends against rotation and makes the settings
//! snapshot a superset of every record the rotation discards.
//!
//! ## Durability
//!
//! Mutating calls append WAL records and then block on the next sync
//! barrier. The barrier is generation-counted: an appender computes its
//! target generation while still holding the WAL mutex, so a record is
//! always covered by the fsync that bumps the generation past the
//! target.

mod folders;
mod index;
mod placement;
mod recovery;
mod sector_locks;
mod sectors;
mod sync_loop;

pub use index::{SectorIndex, SectorLocation};
pub use sector_locks::{SectorLockGuard, SectorLocks};

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::warn;

use crate::config::{StoreConfig, SECTOR_SIZE};
use crate::error::StoreError;
use crate::hooks::{Hooks, ProductionHooks};
use crate::store::{
    FolderSettings, OverflowMap, Settings, StorageFolder, WalRecord, WalWriter,
};

/// Operator-facing snapshot of one storage folder.
#[derive(Debug, Clone)]
pub struct StorageFolderInfo {
    pub index: u16,
    pub path: PathBuf,
    /// Total capacity in bytes.
    pub capacity: u64,
    /// Unused capacity in bytes.
    pub capacity_remaining: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
}

pub(crate) struct SyncState {
    /// Number of completed sync barriers.
    pub generation: u64,
    /// Records have been appended since the last barrier.
    pub dirty: bool,
    /// The store is draining; the loop exits after its next barrier.
    pub shutdown: bool,
}

pub(crate) struct Shared {
    pub dir: PathBuf,
    pub config: StoreConfig,
    pub hooks: Arc<dyn Hooks>,
    pub salt: [u8; 16],
    pub folders: RwLock<HashMap<u16, Arc<StorageFolder>>>,
    pub index: SectorIndex,
    pub locks: SectorLocks,
    pub overflow: Mutex<OverflowMap>,
    pub wal: Mutex<WalWriter>,
    pub sync_state: Mutex<SyncState>,
    /// Wakes the sync loop.
    pub sync_wake: Condvar,
    /// Wakes committers waiting on a barrier.
    pub sync_done: Condvar,
    pub closed: AtomicBool,
    /// Held (flocked) for the lifetime of the store.
    _lock_file: File,
}

impl Shared {
    pub fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::ShuttingDown.into());
        }
        Ok(())
    }

    pub fn folder(&self, index: u16) -> Result<Arc<StorageFolder>> {
        self.folders
            .read()
            .get(&index)
            .cloned()
            .ok_or_else(|| {
                eyre::Report::new(StoreError::NotFound)
                    .wrap_err(format!("no storage folder with index {}", index))
            })
    }

    /// Appends records to the WAL and returns the barrier generation the
    /// caller must wait for. An append failure is fatal: the store closes
    /// to avoid acknowledging writes it can no longer make durable.
    pub fn append_wal(&self, records: &[WalRecord]) -> Result<u64> {
        let mut wal = self.wal.lock();
        for record in records {
            if let Err(err) = wal.append(record) {
                self.closed.store(true, Ordering::Release);
                return Err(err).wrap_err("WAL append failed, closing the store");
            }
        }
        // Still under the WAL mutex: the generation read here cannot race
        // a checkpoint, so the target is always covered by a real fsync.
        let target = {
            let mut state = self.sync_state.lock();
            state.dirty = true;
            state.generation + 1
        };
        self.sync_wake.notify_all();
        Ok(target)
    }

    /// Blocks until the sync loop has completed barrier `target`.
    pub fn wait_for_sync(&self, target: u64) -> Result<()> {
        let mut state = self.sync_state.lock();
        while state.generation < target {
            if state.shutdown {
                return Err(eyre::Report::new(StoreError::ShuttingDown)
                    .wrap_err("store shut down before the operation became durable"));
            }
            self.sync_done.wait(&mut state);
        }
        Ok(())
    }

    /// Builds the settings snapshot from current in-memory state.
    pub fn current_settings(&self, folders: &[Arc<StorageFolder>]) -> Settings {
        let mut settings = Settings::new(self.salt);
        let mut folder_settings: Vec<FolderSettings> = folders
            .iter()
            .map(|folder| {
                let usage = folder.usage.lock();
                FolderSettings {
                    index: folder.index(),
                    path: folder.path().to_path_buf(),
                    capacity: usage.capacity(),
                    usage: usage.words().to_vec(),
                }
            })
            .collect();
        folder_settings.sort_by_key(|f| f.index);
        settings.folders = folder_settings;
        settings
    }
}

/// A durable, crash-safe, content-addressed sector store.
///
/// Cheap to share behind an `Arc`; all methods take `&self` and are safe
/// under concurrent callers.
pub struct SectorStore {
    pub(crate) shared: Arc<Shared>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorStore").finish_non_exhaustive()
    }
}

impl SectorStore {
    /// Opens the store rooted at `dir` with default configuration,
    /// creating it when absent and recovering from any prior crash.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::builder(dir).open()
    }

    pub fn builder<P: AsRef<Path>>(dir: P) -> SectorStoreBuilder {
        SectorStoreBuilder {
            dir: dir.as_ref().to_path_buf(),
            config: StoreConfig::default(),
            hooks: Arc::new(ProductionHooks),
        }
    }

    pub(crate) fn start(shared: Arc<Shared>) -> Self {
        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("sectorstore-sync".into())
            .spawn(move || sync_loop::run(loop_shared))
            .expect("failed to spawn sync thread");
        Self {
            shared,
            sync_thread: Mutex::new(Some(handle)),
        }
    }

    /// Reports every storage folder, ordered by index.
    pub fn storage_folders(&self) -> Vec<StorageFolderInfo> {
        let folders = self.shared.folders.read();
        let mut infos: Vec<StorageFolderInfo> = folders
            .values()
            .map(|folder| {
                let health = folder.health();
                StorageFolderInfo {
                    index: folder.index(),
                    path: folder.path().to_path_buf(),
                    capacity: folder.capacity() as u64 * SECTOR_SIZE as u64,
                    capacity_remaining: folder.remaining() as u64 * SECTOR_SIZE as u64,
                    successful_reads: health.successful_reads,
                    failed_reads: health.failed_reads,
                    successful_writes: health.successful_writes,
                    failed_writes: health.failed_writes,
                }
            })
            .collect();
        infos.sort_by_key(|info| info.index);
        infos
    }

    /// Drains the sync loop, performs a final checkpoint and releases the
    /// directory lock. In-flight operations finish; new ones fail with
    /// `ShuttingDown`.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(eyre::Report::new(StoreError::ShuttingDown)
                .wrap_err("store is already closed"));
        }

        {
            let mut state = self.shared.sync_state.lock();
            state.shutdown = true;
        }
        self.shared.sync_wake.notify_all();

        if let Some(handle) = self.sync_thread.lock().take() {
            if handle.join().is_err() {
                warn!("sync loop panicked during shutdown");
            }
        }

        self.shared
            .overflow
            .lock()
            .sync()
            .wrap_err("failed to flush overflow map during close")?;
        Ok(())
    }
}

impl Drop for SectorStore {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::Acquire) {
            if let Err(err) = self.close() {
                warn!(error = %err, "implicit close during drop failed");
            }
        }
    }
}

/// Configures and opens a [`SectorStore`].
pub struct SectorStoreBuilder {
    dir: PathBuf,
    config: StoreConfig,
    hooks: Arc<dyn Hooks>,
}

impl SectorStoreBuilder {
    /// Cadence of the background sync loop.
    pub fn sync_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    pub fn min_folder_sectors(mut self, sectors: u32) -> Self {
        self.config.min_folder_sectors = sectors;
        self
    }

    pub fn max_folder_sectors(mut self, sectors: u32) -> Self {
        self.config.max_folder_sectors = sectors;
        self
    }

    pub fn max_concurrent_adds(mut self, adds: u32) -> Self {
        self.config.max_concurrent_adds = adds;
        self
    }

    /// Installs fault-injection hooks. Intended for crash-safety tests.
    pub fn hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn open(self) -> Result<SectorStore> {
        recovery::open_store(self.dir, self.config, self.hooks)
    }
}
