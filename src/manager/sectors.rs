//! Sector operations: add, batch add, remove, delete, read.
//!
//! Every operation runs under the keyed lock for its sector ID. That
//! single rule gives per-ID sequential consistency and collapses the
//! add/add race: the second adder of a brand-new ID blocks on the lock,
//! then finds the winner's location in the index and becomes a count
//! increment instead of a second physical write.
//!
//! ## Reference counting
//!
//! The primary count lives in the folder metadata entry and saturates at
//! 65,535. Crossing the ceiling writes a zero overflow entry in the same
//! operation, so a saturated sector is always distinguishable on disk
//! from one that never saturated. Further adds bump only the overflow;
//! removes drain the overflow back to zero before the primary count
//! moves again, and the overflow entry disappears when the count drops
//! below the ceiling.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::{MAX_SECTOR_COUNT, SECTOR_SIZE};
use crate::error::StoreError;
use crate::id::{MerkleRoot, SectorId};
use crate::store::{StorageFolder, WalRecord};

use super::index::SectorLocation;
use super::placement::pick_folder;
use super::{SectorStore, Shared};

/// Rolls back a bitmap reservation unless the write that justified it
/// completed. Also releases the folder's in-flight add slot.
struct AllocGuard<'a> {
    folder: &'a StorageFolder,
    slot: u32,
    armed: bool,
}

impl<'a> AllocGuard<'a> {
    fn new(folder: &'a StorageFolder, slot: u32) -> Self {
        folder.pending_adds.fetch_add(1, Ordering::AcqRel);
        Self {
            folder,
            slot,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AllocGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.folder.usage.lock().clear(self.slot);
        }
        self.folder.pending_adds.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SectorStore {
    /// Stores `data` under `root`. Adding a root that is already stored
    /// increments its reference count instead of writing again. Returns
    /// once the operation is WAL-durable.
    pub fn add_sector(&self, root: MerkleRoot, data: &[u8]) -> Result<()> {
        self.shared.check_open()?;
        if data.len() != SECTOR_SIZE {
            return Err(eyre::Report::new(StoreError::WrongSize).wrap_err(format!(
                "sector payload is {} bytes, expected {}",
                data.len(),
                SECTOR_SIZE
            )));
        }

        let id = SectorId::from_root(&root);
        let target = {
            let _lock = self.shared.locks.lock(id);
            match self.shared.index.get(&id) {
                Some(location) => self.shared.add_virtual(id, location)?,
                None => self.shared.add_physical(id, data)?,
            }
        };
        self.shared.wait_for_sync(target)
    }

    /// Increments the reference count of every root in `roots`. Only
    /// already-stored sectors can be added this way; unknown roots are
    /// reported in the returned list without aborting the rest of the
    /// batch. One durability wait covers the whole batch.
    pub fn add_sector_batch(
        &self,
        roots: &[MerkleRoot],
    ) -> Result<Vec<(MerkleRoot, eyre::Report)>> {
        self.shared.check_open()?;

        let mut failures = Vec::new();
        let mut last_target = None;
        for root in roots {
            let id = SectorId::from_root(root);
            let _lock = self.shared.locks.lock(id);
            match self.shared.index.get(&id) {
                Some(location) => match self.shared.add_virtual(id, location) {
                    Ok(target) => last_target = Some(target),
                    Err(err) => failures.push((*root, err)),
                },
                None => failures.push((
                    *root,
                    eyre::Report::new(StoreError::NotFound)
                        .wrap_err("batch add only references sectors that are already stored"),
                )),
            }
        }

        if let Some(target) = last_target {
            self.shared.wait_for_sync(target)?;
        }
        Ok(failures)
    }

    /// Drops one reference to the sector. The payload is released once
    /// the last reference goes.
    pub fn remove_sector(&self, root: MerkleRoot) -> Result<()> {
        self.shared.check_open()?;
        let id = SectorId::from_root(&root);

        let target = {
            let _lock = self.shared.locks.lock(id);
            let location = self
                .shared
                .index
                .get(&id)
                .ok_or_else(|| eyre::Report::new(StoreError::NotFound))?;
            self.shared.remove_reference(id, location)?
        };
        self.shared.wait_for_sync(target)
    }

    /// Drops the sector outright, regardless of its reference count, and
    /// clears any overflow bookkeeping.
    pub fn delete_sector(&self, root: MerkleRoot) -> Result<()> {
        self.shared.check_open()?;
        let id = SectorId::from_root(&root);

        let target = {
            let _lock = self.shared.locks.lock(id);
            let location = self
                .shared
                .index
                .get(&id)
                .ok_or_else(|| eyre::Report::new(StoreError::NotFound))?;

            let folder = self.shared.folder(location.folder)?;
            folder
                .erase_metadata(location.slot)
                .wrap_err("failed to erase metadata while deleting sector")?;
            folder.usage.lock().clear(location.slot);
            self.shared.index.remove(&id);
            self.shared.overflow.lock().remove(&id);

            self.shared.append_wal(&[WalRecord::RemoveSector { id }])?
        };
        self.shared.wait_for_sync(target)
    }

    /// Returns the full 4 MiB payload stored under `root`.
    pub fn read_sector(&self, root: MerkleRoot) -> Result<Vec<u8>> {
        self.shared.check_open()?;
        let id = SectorId::from_root(&root);

        let _lock = self.shared.locks.lock(id);
        let location = self
            .shared
            .index
            .get(&id)
            .ok_or_else(|| eyre::Report::new(StoreError::NotFound))?;
        let folder = self.shared.folder(location.folder)?;
        folder.read_sector(location.slot)
    }

    /// Returns `length` bytes starting at `offset` within the sector. A
    /// zero-length read at `offset == SECTOR_SIZE` succeeds with an empty
    /// buffer.
    pub fn read_partial_sector(
        &self,
        root: MerkleRoot,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>> {
        self.shared.check_open()?;
        if offset as u64 + length as u64 > SECTOR_SIZE as u64 {
            return Err(eyre::Report::new(StoreError::OutOfBounds).wrap_err(format!(
                "read of {} bytes at offset {} exceeds the {}-byte sector",
                length, offset, SECTOR_SIZE
            )));
        }

        let id = SectorId::from_root(&root);
        let _lock = self.shared.locks.lock(id);
        let location = self
            .shared
            .index
            .get(&id)
            .ok_or_else(|| eyre::Report::new(StoreError::NotFound))?;
        let folder = self.shared.folder(location.folder)?;
        folder.read_partial(location.slot, offset, length)
    }
}

impl Shared {
    /// Count increment for an ID that already has a physical home. Called
    /// with the sector lock held.
    pub(crate) fn add_virtual(&self, id: SectorId, location: SectorLocation) -> Result<u64> {
        let folder = self.folder(location.folder)?;
        let mut records: SmallVec<[WalRecord; 2]> = SmallVec::new();

        if location.count == MAX_SECTOR_COUNT {
            let mut overflow = self.overflow.lock();
            let current = overflow.overflow(&id).unwrap_or(0);
            overflow
                .set_overflow(id, current + 1)
                .wrap_err("failed to record overflow count")?;
            records.push(WalRecord::OverflowUpdate {
                id,
                overflow: current + 1,
            });
        } else {
            let new_count = location.count + 1;
            folder
                .write_metadata(location.slot, id, new_count)
                .wrap_err("failed to update sector metadata")?;
            self.index.insert(
                id,
                SectorLocation {
                    count: new_count,
                    ..location
                },
            );
            records.push(WalRecord::UpdateSectorMetadata {
                folder: location.folder,
                slot: location.slot,
                id,
                count: new_count,
            });

            if new_count == MAX_SECTOR_COUNT {
                // Write the saturation marker before any reference can
                // spill past the primary count.
                let mut overflow = self.overflow.lock();
                if overflow.overflow(&id).is_none() {
                    overflow
                        .set_overflow(id, 0)
                        .wrap_err("failed to record overflow saturation marker")?;
                    records.push(WalRecord::OverflowUpdate { id, overflow: 0 });
                }
            }
        }

        self.append_wal(&records)
    }

    /// First write of a brand-new ID. Called with the sector lock held.
    pub(crate) fn add_physical(&self, id: SectorId, data: &[u8]) -> Result<u64> {
        let (folder, slot) = self.place_and_write(&id, data, 1, &[], None)?;
        self.index.insert(
            id,
            SectorLocation {
                folder,
                slot,
                count: 1,
            },
        );
        self.append_wal(&[WalRecord::UpdateSectorMetadata {
            folder,
            slot,
            id,
            count: 1,
        }])
    }

    /// Finds a folder for `id`, reserves a slot and writes payload plus
    /// metadata, retrying on other folders after a failure. Returns the
    /// final (folder index, slot). `extra_exclude` removes folders from
    /// consideration (used while a folder is being emptied).
    pub(crate) fn place_and_write(
        &self,
        id: &SectorId,
        data: &[u8],
        count: u16,
        extra_exclude: &[u16],
        preferred: Option<(&Arc<StorageFolder>, u32)>,
    ) -> Result<(u16, u32)> {
        // A shrinking folder may keep its own sectors when a slot is free
        // in the surviving region.
        if let Some((folder, limit)) = preferred {
            if let Some(slot) = folder.usage.lock().allocate_below(limit) {
                let mut guard = AllocGuard::new(folder, slot);
                match folder
                    .write_sector(slot, data)
                    .and_then(|_| folder.write_metadata(slot, *id, count))
                {
                    Ok(()) => {
                        guard.disarm();
                        folder.record_successful_write();
                        return Ok((folder.index(), slot));
                    }
                    Err(err) => {
                        debug!(folder = folder.index(), error = %err,
                            "in-place relocation failed, trying other folders");
                    }
                }
            }
        }

        let mut exclude: SmallVec<[u16; 4]> = SmallVec::from_slice(extra_exclude);
        let mut attempt = 0u32;
        loop {
            let folders: Vec<Arc<StorageFolder>> =
                self.folders.read().values().cloned().collect();
            let Some(folder) = pick_folder(
                &folders,
                &self.salt,
                id,
                attempt,
                &exclude,
                self.config.max_concurrent_adds,
            ) else {
                return Err(eyre::Report::new(StoreError::InsufficientStorage)
                    .wrap_err("no storage folder accepted the sector"));
            };
            attempt += 1;

            let Some(slot) = folder.usage.lock().allocate() else {
                exclude.push(folder.index());
                continue;
            };

            let mut guard = AllocGuard::new(&folder, slot);
            match folder
                .write_sector(slot, data)
                .and_then(|_| folder.write_metadata(slot, *id, count))
            {
                Ok(()) => {
                    guard.disarm();
                    folder.record_successful_write();
                    return Ok((folder.index(), slot));
                }
                Err(err) => {
                    warn!(folder = folder.index(), slot, error = %err,
                        "sector write failed, steering to another folder");
                    exclude.push(folder.index());
                    // Guard rolls the reservation back on drop.
                }
            }
        }
    }

    /// One reference decrement. Called with the sector lock held.
    pub(crate) fn remove_reference(
        &self,
        id: SectorId,
        location: SectorLocation,
    ) -> Result<u64> {
        let folder = self.folder(location.folder)?;
        let mut records: SmallVec<[WalRecord; 2]> = SmallVec::new();

        if location.count == MAX_SECTOR_COUNT {
            let overflow_count = self.overflow.lock().overflow(&id);
            match overflow_count {
                Some(over) if over > 0 => {
                    self.overflow
                        .lock()
                        .set_overflow(id, over - 1)
                        .wrap_err("failed to drain overflow count")?;
                    records.push(WalRecord::OverflowUpdate {
                        id,
                        overflow: over - 1,
                    });
                }
                existing => {
                    // Leaving saturation: the primary count moves again
                    // and the overflow entry is retired.
                    let new_count = MAX_SECTOR_COUNT - 1;
                    folder
                        .write_metadata(location.slot, id, new_count)
                        .wrap_err("failed to update sector metadata")?;
                    self.index.insert(
                        id,
                        SectorLocation {
                            count: new_count,
                            ..location
                        },
                    );
                    records.push(WalRecord::UpdateSectorMetadata {
                        folder: location.folder,
                        slot: location.slot,
                        id,
                        count: new_count,
                    });
                    if existing.is_some() {
                        self.overflow.lock().remove(&id);
                        records.push(WalRecord::OverflowUpdate { id, overflow: 0 });
                    }
                }
            }
        } else if location.count > 1 {
            let new_count = location.count - 1;
            folder
                .write_metadata(location.slot, id, new_count)
                .wrap_err("failed to update sector metadata")?;
            self.index.insert(
                id,
                SectorLocation {
                    count: new_count,
                    ..location
                },
            );
            records.push(WalRecord::UpdateSectorMetadata {
                folder: location.folder,
                slot: location.slot,
                id,
                count: new_count,
            });
        } else {
            // Last reference: release the slot.
            folder
                .erase_metadata(location.slot)
                .wrap_err("failed to erase sector metadata")?;
            folder.usage.lock().clear(location.slot);
            self.index.remove(&id);
            records.push(WalRecord::RemoveSector { id });
        }

        self.append_wal(&records)
    }
}
