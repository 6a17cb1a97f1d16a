//! Storage folder lifecycle: add, remove, resize.
//!
//! Removing or shrinking a folder relocates live sectors before any
//! state is retired, one sector at a time under its keyed lock, so
//! client reads and reference updates keep working throughout. The
//! folder is marked busy for the duration, which takes it out of
//! placement and blocks competing lifecycle operations.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use tracing::{info, warn};

use crate::config::{SECTOR_SIZE, STORAGE_FOLDER_GRANULARITY};
use crate::error::StoreError;
use crate::store::{StorageFolder, WalRecord};

use super::index::SectorLocation;
use super::{SectorStore, Shared};

/// Clears a folder's busy flag when a lifecycle operation unwinds.
struct BusyGuard<'a> {
    folder: &'a StorageFolder,
    armed: bool,
}

impl<'a> std::fmt::Debug for BusyGuard<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyGuard")
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl<'a> BusyGuard<'a> {
    /// Marks the folder busy, failing when another lifecycle operation
    /// already owns it.
    fn acquire(folder: &'a StorageFolder) -> Result<Self> {
        if folder.busy.swap(true, Ordering::AcqRel) {
            return Err(eyre::Report::new(StoreError::FolderBusy).wrap_err(format!(
                "storage folder {} is already being resized or removed",
                folder.index()
            )));
        }
        Ok(Self {
            folder,
            armed: true,
        })
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.folder.busy.store(false, Ordering::Release);
        }
    }
}

impl SectorStore {
    /// Registers a new storage folder at `path` with `size` bytes of
    /// capacity. The size must be a multiple of 64 sectors and within the
    /// configured bounds. Returns once the folder is WAL-durable.
    pub fn add_storage_folder<P: AsRef<Path>>(&self, path: P, size: u64) -> Result<()> {
        let shared = &self.shared;
        shared.check_open()?;
        let path = path.as_ref();

        let granule = SECTOR_SIZE as u64 * STORAGE_FOLDER_GRANULARITY as u64;
        ensure!(
            size > 0 && size % granule == 0,
            "storage folder size {} is not a multiple of {} bytes (64 sectors)",
            size,
            granule
        );
        let capacity = (size / SECTOR_SIZE as u64) as u32;
        ensure!(
            capacity >= shared.config.min_folder_sectors,
            "storage folder of {} sectors is below the minimum of {}",
            capacity,
            shared.config.min_folder_sectors
        );
        ensure!(
            capacity <= shared.config.max_folder_sectors,
            "storage folder of {} sectors exceeds the maximum of {}",
            capacity,
            shared.config.max_folder_sectors
        );
        ensure!(
            path.is_dir(),
            "storage folder path '{}' is not an existing directory",
            path.display()
        );

        // Index assignment, the path-collision check and the insert all
        // happen under the write lock so concurrent adds cannot claim the
        // same index or path. Folder creation is rare enough that holding
        // the lock across the file creation is fine.
        let folder = {
            let mut folders = shared.folders.write();
            if folders.values().any(|f| f.path() == path) {
                return Err(eyre::Report::new(StoreError::AlreadyExists).wrap_err(format!(
                    "a storage folder already uses '{}'",
                    path.display()
                )));
            }
            let index = lowest_free_index(folders.keys().copied());
            let folder = Arc::new(
                StorageFolder::create(index, path, capacity, Arc::clone(&shared.hooks))
                    .wrap_err("failed to create storage folder files")?,
            );
            folders.insert(index, Arc::clone(&folder));
            folder
        };

        info!(index = folder.index(), path = %path.display(), capacity, "added storage folder");
        let target = shared.append_wal(&[WalRecord::AddStorageFolder {
            index: folder.index(),
            capacity,
            path: path.to_path_buf(),
        }])?;
        shared.wait_for_sync(target)
    }

    /// Retires the folder at `index`, relocating its sectors to the rest
    /// of the store first. With `force`, sectors that cannot be relocated
    /// are dropped instead of failing the removal.
    pub fn remove_storage_folder(&self, index: u16, force: bool) -> Result<()> {
        let shared = &self.shared;
        shared.check_open()?;
        let folder = shared.folder(index)?;

        let mut busy = BusyGuard::acquire(&folder)?;
        let lost = shared
            .evacuate(&folder, None, force)
            .wrap_err_with(|| format!("failed to empty storage folder {}", index))?;
        if lost > 0 {
            warn!(index, lost, "force-removed storage folder dropped sectors");
        }

        shared.folders.write().remove(&index);
        busy.disarm();

        let target = shared.append_wal(&[WalRecord::RemoveStorageFolder { index }])?;
        if let Err(err) = folder.delete_files() {
            warn!(index, error = %err, "failed to delete retired folder files");
        }
        info!(index, "removed storage folder");
        shared.wait_for_sync(target)
    }

    /// Changes the capacity of the folder at `index` to `new_size` bytes.
    /// Growing extends the files in place; shrinking relocates the
    /// sectors that live past the new capacity first.
    pub fn resize_storage_folder(&self, index: u16, new_size: u64) -> Result<()> {
        let shared = &self.shared;
        shared.check_open()?;

        let granule = SECTOR_SIZE as u64 * STORAGE_FOLDER_GRANULARITY as u64;
        ensure!(
            new_size > 0 && new_size % granule == 0,
            "storage folder size {} is not a multiple of {} bytes (64 sectors)",
            new_size,
            granule
        );
        let new_capacity = (new_size / SECTOR_SIZE as u64) as u32;
        ensure!(
            new_capacity >= shared.config.min_folder_sectors
                && new_capacity <= shared.config.max_folder_sectors,
            "storage folder of {} sectors is outside the configured bounds",
            new_capacity
        );

        let folder = shared.folder(index)?;
        let _busy = BusyGuard::acquire(&folder)?;
        let old_capacity = folder.capacity();

        if new_capacity == old_capacity {
            return Ok(());
        }

        if new_capacity > old_capacity {
            folder
                .resize_files(new_capacity)
                .wrap_err("failed to grow folder files")?;
            folder.usage.lock().grow(new_capacity)?;
        } else {
            shared
                .evacuate(&folder, Some(new_capacity), false)
                .wrap_err_with(|| format!("failed to shrink storage folder {}", index))?;
            folder.usage.lock().truncate(new_capacity)?;
            folder
                .resize_files(new_capacity)
                .wrap_err("failed to shrink folder files")?;
        }

        info!(index, old_capacity, new_capacity, "resized storage folder");
        let target = shared.append_wal(&[WalRecord::ResizeStorageFolder {
            index,
            new_capacity,
        }])?;
        shared.wait_for_sync(target)
    }
}

impl Shared {
    /// Moves sectors out of `folder`. With `keep_below` set, only sectors
    /// at slots past the limit move, and the folder's own surviving
    /// region is the preferred destination. Returns the number of sectors
    /// dropped, which is nonzero only when `force` is set.
    fn evacuate(
        &self,
        folder: &Arc<StorageFolder>,
        keep_below: Option<u32>,
        force: bool,
    ) -> Result<u64> {
        let mut lost = 0u64;
        let mut last_target = None;

        for (id, _) in self.index.locations_in_folder(folder.index()) {
            let _lock = self.locks.lock(id);
            // Re-check under the lock: the sector may have moved or been
            // removed since the snapshot.
            let Some(location) = self.index.get(&id) else {
                continue;
            };
            if location.folder != folder.index() {
                continue;
            }
            if let Some(limit) = keep_below {
                if location.slot < limit {
                    continue;
                }
            }

            let data = match folder.read_sector(location.slot) {
                Ok(data) => data,
                Err(err) if force => {
                    warn!(id = ?id, error = %err, "dropping unreadable sector during forced removal");
                    self.drop_sector_locked(&id, folder, location)?;
                    lost += 1;
                    continue;
                }
                Err(err) => return Err(err).wrap_err("failed to read sector for relocation"),
            };

            let preferred = keep_below.map(|limit| (folder, limit));
            match self.place_and_write(&id, &data, location.count, &[folder.index()], preferred)
            {
                Ok((new_folder, new_slot)) => {
                    self.index.insert(
                        id,
                        SectorLocation {
                            folder: new_folder,
                            slot: new_slot,
                            count: location.count,
                        },
                    );
                    folder.usage.lock().clear(location.slot);
                    if let Err(err) = folder.erase_metadata(location.slot) {
                        warn!(error = %err, "failed to erase metadata of relocated sector");
                    }
                    last_target = Some(self.append_wal(&[WalRecord::UpdateSectorMetadata {
                        folder: new_folder,
                        slot: new_slot,
                        id,
                        count: location.count,
                    }])?);
                }
                Err(err) if force => {
                    warn!(id = ?id, error = %err, "dropping unplaceable sector during forced removal");
                    self.drop_sector_locked(&id, folder, location)?;
                    lost += 1;
                }
                Err(err) => {
                    return Err(err).wrap_err("failed to relocate sector");
                }
            }
        }

        if let Some(target) = last_target {
            self.wait_for_sync(target)?;
        }
        Ok(lost)
    }

    /// Discards one sector during a forced removal. Caller holds the
    /// sector lock.
    fn drop_sector_locked(
        &self,
        id: &crate::id::SectorId,
        folder: &StorageFolder,
        location: SectorLocation,
    ) -> Result<()> {
        folder.usage.lock().clear(location.slot);
        let _ = folder.erase_metadata(location.slot);
        self.index.remove(id);
        self.overflow.lock().remove(id);
        self.append_wal(&[WalRecord::RemoveSector { id: *id }])?;
        Ok(())
    }
}

fn lowest_free_index(used: impl Iterator<Item = u16>) -> u16 {
    let used: hashbrown::HashSet<u16> = used.collect();
    (0..=u16::MAX)
        .find(|candidate| !used.contains(candidate))
        .expect("fewer than 65536 storage folders")
}
