//! Startup and crash recovery.
//!
//! Opening a store is a replay pipeline:
//!
//! 1. take the directory lock (`flock`), so exactly one process owns the
//!    persist directory and every storage folder
//! 2. load the settings snapshot (`settings.dat`, falling back to a
//!    `settings.tmp` left by a crash mid-rename)
//! 3. open the overflow map and every storage folder the snapshot names
//! 4. rebuild the in-memory location index from the folder metadata
//!    files, guided by the snapshot's usage bitmaps
//! 5. replay `wal.dat.tmp` (a rotated log whose deletion never happened)
//!    and then `wal.dat`, applying each record to memory and to the
//!    folder metadata files; records carry absolute counts, so applying
//!    one twice is harmless
//! 6. prune overflow entries whose primary count is no longer saturated
//! 7. run one checkpoint, which folds the replayed state into a fresh
//!    snapshot and truncates the logs, then start the sync loop
//!
//! A torn WAL tail stops replay silently (the write was never
//! acknowledged); unreadable settings or folder metadata abort with
//! `Corrupt` rather than guessing.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{StoreConfig, MAX_SECTOR_COUNT};
use crate::error::StoreError;
use crate::hooks::Hooks;
use crate::id::generate_salt;
use crate::store::{
    OverflowMap, Settings, StorageFolder, UsageBitmap, WalReader, WalRecord, WalWriter,
    LOCK_FILE_NAME, WAL_FILE_NAME, WAL_TMP_NAME,
};

use super::index::{SectorIndex, SectorLocation};
use super::sector_locks::SectorLocks;
use super::{sync_loop, SectorStore, Shared, SyncState};

const OVERFLOW_FILE_NAME: &str = "sectoroverflow.dat";

pub(crate) fn open_store(
    dir: PathBuf,
    config: StoreConfig,
    hooks: Arc<dyn Hooks>,
) -> Result<SectorStore> {
    std::fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("failed to create store directory '{}'", dir.display()))?;

    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(LOCK_FILE_NAME))
        .wrap_err("failed to open lock file")?;
    // Advisory exclusive lock; released automatically when the file
    // handle drops with the store.
    let rc = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    ensure!(
        rc == 0,
        "store directory '{}' is locked by another process",
        dir.display()
    );

    let settings = Settings::load(&dir)?;
    let salt = settings
        .as_ref()
        .map(|s| s.salt)
        .unwrap_or_else(generate_salt);

    let mut overflow = OverflowMap::open(&dir.join(OVERFLOW_FILE_NAME))?;

    let mut folders: HashMap<u16, Arc<StorageFolder>> = HashMap::new();
    if let Some(settings) = &settings {
        for folder_settings in &settings.folders {
            if folder_settings.usage.len() as u64 * 64 != folder_settings.capacity as u64 {
                return Err(eyre::Report::new(StoreError::Corrupt).wrap_err(format!(
                    "settings bitmap for folder {} covers {} sectors but capacity is {}",
                    folder_settings.index,
                    folder_settings.usage.len() * 64,
                    folder_settings.capacity
                )));
            }
            ensure!(
                folder_settings.path.is_dir(),
                "storage folder path '{}' has disappeared",
                folder_settings.path.display()
            );
            let usage = UsageBitmap::from_words(folder_settings.usage.clone());
            let folder = StorageFolder::open(
                folder_settings.index,
                &folder_settings.path,
                usage,
                Arc::clone(&hooks),
            )?;
            folders.insert(folder_settings.index, Arc::new(folder));
        }
    }

    let index = SectorIndex::new();
    for folder in folders.values() {
        load_folder_locations(folder, &index)?;
    }

    // A rotated log that was never deleted holds records older than the
    // active log; replay it first so the active log wins conflicts.
    for name in [WAL_TMP_NAME, WAL_FILE_NAME] {
        let path = dir.join(name);
        if !path.exists() {
            continue;
        }
        let replayed = replay_wal(&path, &mut folders, &index, &mut overflow, &hooks)?;
        if replayed > 0 {
            info!(wal = name, records = replayed, "replayed write-ahead log");
        }
    }

    // Overflow entries only mean something while the primary count is
    // saturated; anything else is leftover bookkeeping.
    for id in overflow.ids() {
        let saturated = index
            .get(&id)
            .map(|location| location.count == MAX_SECTOR_COUNT)
            .unwrap_or(false);
        if !saturated {
            debug!(id = ?id, "pruning stale overflow entry");
            overflow.remove(&id);
        }
    }

    let wal = WalWriter::open(&dir.join(WAL_FILE_NAME))?;

    let shared = Arc::new(Shared {
        dir,
        config,
        hooks,
        salt,
        folders: RwLock::new(folders),
        index,
        locks: SectorLocks::new(),
        overflow: Mutex::new(overflow),
        wal: Mutex::new(wal),
        sync_state: Mutex::new(SyncState {
            generation: 0,
            dirty: false,
            shutdown: false,
        }),
        sync_wake: Condvar::new(),
        sync_done: Condvar::new(),
        closed: AtomicBool::new(false),
        _lock_file: lock_file,
    });

    // Fold the replayed state into a fresh snapshot before accepting
    // traffic.
    sync_loop::sync_once(&shared).wrap_err("startup checkpoint failed")?;

    Ok(SectorStore::start(shared))
}

/// Rebuilds index entries for one folder from its metadata file. The
/// usage bitmap says which slots to read; a set bit whose entry carries a
/// zero count is a torn allocation and is released.
fn load_folder_locations(folder: &Arc<StorageFolder>, index: &SectorIndex) -> Result<()> {
    let set_slots: Vec<u32> = {
        let usage = folder.usage.lock();
        (0..usage.capacity()).filter(|s| usage.is_set(*s)).collect()
    };

    for slot in set_slots {
        let entry = folder
            .read_metadata_entry(slot)
            .wrap_err_with(|| format!("failed to load metadata for slot {}", slot))?;
        if entry.count() == 0 {
            warn!(
                folder = folder.index(),
                slot, "releasing slot with no metadata entry"
            );
            folder.usage.lock().clear(slot);
            continue;
        }
        let id = entry.id();
        if index.contains(&id) {
            warn!(
                folder = folder.index(),
                slot,
                id = ?id,
                "duplicate location for sector, releasing the newer slot"
            );
            folder.usage.lock().clear(slot);
            continue;
        }
        index.insert(
            id,
            SectorLocation {
                folder: folder.index(),
                slot,
                count: entry.count(),
            },
        );
    }
    Ok(())
}

fn replay_wal(
    path: &Path,
    folders: &mut HashMap<u16, Arc<StorageFolder>>,
    index: &SectorIndex,
    overflow: &mut OverflowMap,
    hooks: &Arc<dyn Hooks>,
) -> Result<u64> {
    let mut reader = WalReader::open(path)?;
    let mut replayed = 0u64;
    while let Some(record) = reader.next_record()? {
        apply_record(record, folders, index, overflow, hooks)?;
        replayed += 1;
    }
    Ok(replayed)
}

fn apply_record(
    record: WalRecord,
    folders: &mut HashMap<u16, Arc<StorageFolder>>,
    index: &SectorIndex,
    overflow: &mut OverflowMap,
    hooks: &Arc<dyn Hooks>,
) -> Result<()> {
    match record {
        WalRecord::AddStorageFolder {
            index: folder_index,
            capacity,
            path,
        } => {
            if folders.contains_key(&folder_index) {
                return Ok(());
            }
            if !path.is_dir() {
                warn!(
                    folder = folder_index,
                    path = %path.display(),
                    "logged storage folder path no longer exists, skipping"
                );
                return Ok(());
            }
            let usage = UsageBitmap::new(capacity)?;
            let folder =
                StorageFolder::open(folder_index, &path, usage, Arc::clone(hooks))?;
            folders.insert(folder_index, Arc::new(folder));
        }
        WalRecord::RemoveStorageFolder {
            index: folder_index,
        } => {
            if folders.remove(&folder_index).is_some() {
                // Relocations were logged ahead of the removal; anything
                // still pointing here was intentionally dropped.
                for (id, _) in index.locations_in_folder(folder_index) {
                    index.remove(&id);
                    overflow.remove(&id);
                }
            }
        }
        WalRecord::ResizeStorageFolder {
            index: folder_index,
            new_capacity,
        } => {
            let Some(folder) = folders.get(&folder_index) else {
                warn!(folder = folder_index, "resize record for unknown folder");
                return Ok(());
            };
            let mut usage = folder.usage.lock();
            if new_capacity >= usage.capacity() {
                usage.grow(new_capacity)?;
            } else {
                for slot in new_capacity..usage.capacity() {
                    if usage.is_set(slot) {
                        warn!(
                            folder = folder_index,
                            slot, "releasing slot beyond resized capacity"
                        );
                        usage.clear(slot);
                        let entry = folder.read_metadata_entry(slot)?;
                        if entry.count() > 0 {
                            index.remove(&entry.id());
                        }
                    }
                }
                usage.truncate(new_capacity)?;
            }
            drop(usage);
            folder.resize_files(new_capacity)?;
        }
        WalRecord::UpdateSectorMetadata {
            folder: folder_index,
            slot,
            id,
            count,
        } => {
            let Some(folder) = folders.get(&folder_index) else {
                warn!(folder = folder_index, "sector record for unknown folder");
                return Ok(());
            };
            if slot >= folder.usage.lock().capacity() {
                warn!(
                    folder = folder_index,
                    slot, "sector record points past folder capacity"
                );
                return Ok(());
            }
            // A relocation leaves the old slot behind; release it.
            if let Some(old) = index.get(&id) {
                if (old.folder, old.slot) != (folder_index, slot) {
                    if let Some(old_folder) = folders.get(&old.folder) {
                        old_folder.usage.lock().clear(old.slot);
                        let _ = old_folder.erase_metadata(old.slot);
                    }
                }
            }
            folder.usage.lock().set(slot);
            folder.write_metadata(slot, id, count)?;
            index.insert(
                id,
                SectorLocation {
                    folder: folder_index,
                    slot,
                    count,
                },
            );
        }
        WalRecord::RemoveSector { id } => {
            if let Some(location) = index.remove(&id) {
                if let Some(folder) = folders.get(&location.folder) {
                    folder.usage.lock().clear(location.slot);
                    let _ = folder.erase_metadata(location.slot);
                }
            }
            overflow.remove(&id);
        }
        WalRecord::OverflowUpdate { id, overflow: count } => {
            overflow.set_overflow(id, count)?;
        }
    }
    Ok(())
}
