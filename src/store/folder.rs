//! Storage folder: one operator-provided capacity pool.
//!
//! A folder is a pair of files created sparse at their full size: the
//! sector file holds `capacity x 4 MiB` of payload slots, the metadata
//! file holds one 14-byte `(id || count)` entry per slot. All access is
//! positional (`pread`/`pwrite`), so concurrent readers and writers on
//! different slots never contend on a file offset.
//!
//! Folders track their own health. Every failed write bumps a counter
//! that placement consults when steering new sectors, and the counters
//! are reported to operators through `storage_folders()`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{METADATA_ENTRY_SIZE, SECTOR_SIZE};
use crate::error::StoreError;
use crate::hooks::Hooks;
use crate::id::SectorId;

use super::UsageBitmap;

pub const SECTOR_FILE_NAME: &str = "siahostdata.dat";
pub const METADATA_FILE_NAME: &str = "siahostmetadata.dat";

/// One metadata slot on disk: the sector ID plus its primary count.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetadataEntry {
    id: [u8; 12],
    count: U16,
}

const _: () = assert!(std::mem::size_of::<MetadataEntry>() == METADATA_ENTRY_SIZE);

impl MetadataEntry {
    pub fn new(id: SectorId, count: u16) -> Self {
        Self {
            id: id.0,
            count: U16::new(count),
        }
    }

    pub fn id(&self) -> SectorId {
        SectorId(self.id)
    }

    pub fn count(&self) -> u16 {
        self.count.get()
    }
}

/// Snapshot of a folder's health counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderHealth {
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
}

pub struct StorageFolder {
    index: u16,
    path: PathBuf,
    sector_file: File,
    metadata_file: File,
    pub usage: Mutex<UsageBitmap>,
    hooks: Arc<dyn Hooks>,

    successful_reads: AtomicU64,
    failed_reads: AtomicU64,
    successful_writes: AtomicU64,
    failed_writes: AtomicU64,
    /// Physical sector writes currently in flight.
    pub pending_adds: AtomicU32,
    /// Set while the folder is being removed or resized.
    pub busy: AtomicBool,
}

impl StorageFolder {
    /// Creates the folder files at `path` sized for `capacity` sectors.
    /// Both files are extended with `set_len`, which leaves them sparse on
    /// every filesystem that supports holes.
    pub fn create(
        index: u16,
        path: &Path,
        capacity: u32,
        hooks: Arc<dyn Hooks>,
    ) -> Result<Self> {
        let usage = UsageBitmap::new(capacity)?;

        let sector_path = path.join(SECTOR_FILE_NAME);
        let sector_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&sector_path)
            .wrap_err_with(|| format!("failed to create sector file '{}'", sector_path.display()))?;
        sector_file
            .set_len(capacity as u64 * SECTOR_SIZE as u64)
            .wrap_err("failed to size sector file")?;

        let metadata_path = path.join(METADATA_FILE_NAME);
        let metadata_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&metadata_path)
            .wrap_err_with(|| {
                format!("failed to create metadata file '{}'", metadata_path.display())
            })?;
        metadata_file
            .set_len(capacity as u64 * METADATA_ENTRY_SIZE as u64)
            .wrap_err("failed to size metadata file")?;

        Ok(Self {
            index,
            path: path.to_path_buf(),
            sector_file,
            metadata_file,
            usage: Mutex::new(usage),
            hooks,
            successful_reads: AtomicU64::new(0),
            failed_reads: AtomicU64::new(0),
            successful_writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            pending_adds: AtomicU32::new(0),
            busy: AtomicBool::new(false),
        })
    }

    /// Opens an existing folder, repairing file sizes that drifted from
    /// the recorded capacity (a crash can leave a grow or shrink applied
    /// to only one side).
    pub fn open(
        index: u16,
        path: &Path,
        usage: UsageBitmap,
        hooks: Arc<dyn Hooks>,
    ) -> Result<Self> {
        let capacity = usage.capacity();

        let sector_path = path.join(SECTOR_FILE_NAME);
        let sector_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&sector_path)
            .wrap_err_with(|| format!("failed to open sector file '{}'", sector_path.display()))?;
        let want = capacity as u64 * SECTOR_SIZE as u64;
        if sector_file.metadata().wrap_err("sector file metadata")?.len() != want {
            sector_file
                .set_len(want)
                .wrap_err("failed to repair sector file size")?;
        }

        let metadata_path = path.join(METADATA_FILE_NAME);
        let metadata_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&metadata_path)
            .wrap_err_with(|| {
                format!("failed to open metadata file '{}'", metadata_path.display())
            })?;
        let want = capacity as u64 * METADATA_ENTRY_SIZE as u64;
        if metadata_file
            .metadata()
            .wrap_err("metadata file metadata")?
            .len()
            != want
        {
            metadata_file
                .set_len(want)
                .wrap_err("failed to repair metadata file size")?;
        }

        Ok(Self {
            index,
            path: path.to_path_buf(),
            sector_file,
            metadata_file,
            usage: Mutex::new(usage),
            hooks,
            successful_reads: AtomicU64::new(0),
            failed_reads: AtomicU64::new(0),
            successful_writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            pending_adds: AtomicU32::new(0),
            busy: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.usage.lock().capacity()
    }

    pub fn remaining(&self) -> u32 {
        let usage = self.usage.lock();
        usage.capacity() - usage.count_set()
    }

    pub fn health(&self) -> FolderHealth {
        FolderHealth {
            successful_reads: self.successful_reads.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            successful_writes: self.successful_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
        }
    }

    pub fn record_failed_write(&self) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_successful_write(&self) {
        self.successful_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Writes a full sector payload into `slot`.
    pub fn write_sector(&self, slot: u32, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == SECTOR_SIZE,
            "sector payload must be {} bytes, got {}",
            SECTOR_SIZE,
            data.len()
        );
        if self.hooks.fail_write(&self.path) {
            self.record_failed_write();
            return Err(eyre::Report::new(StoreError::DiskFault)
                .wrap_err(format!("injected write failure in '{}'", self.path.display())));
        }
        let offset = slot as u64 * SECTOR_SIZE as u64;
        match self.sector_file.write_all_at(data, offset) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_failed_write();
                Err(eyre::Report::new(StoreError::DiskFault).wrap_err(format!(
                    "failed to write sector slot {} in '{}': {}",
                    slot,
                    self.path.display(),
                    err
                )))
            }
        }
    }

    /// Reads a full sector payload from `slot`.
    pub fn read_sector(&self, slot: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        let offset = slot as u64 * SECTOR_SIZE as u64;
        match self.sector_file.read_exact_at(&mut buf, offset) {
            Ok(()) => {
                self.successful_reads.fetch_add(1, Ordering::Relaxed);
                Ok(buf)
            }
            Err(err) => {
                self.failed_reads.fetch_add(1, Ordering::Relaxed);
                Err(err).wrap_err_with(|| {
                    format!(
                        "failed to read sector slot {} in '{}'",
                        slot,
                        self.path.display()
                    )
                })
            }
        }
    }

    /// Reads `length` bytes at `offset` within the sector at `slot`. The
    /// caller has already bounds-checked the range against the sector
    /// size.
    pub fn read_partial(&self, slot: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        if length == 0 {
            return Ok(buf);
        }
        let pos = slot as u64 * SECTOR_SIZE as u64 + offset as u64;
        match self.sector_file.read_exact_at(&mut buf, pos) {
            Ok(()) => {
                self.successful_reads.fetch_add(1, Ordering::Relaxed);
                Ok(buf)
            }
            Err(err) => {
                self.failed_reads.fetch_add(1, Ordering::Relaxed);
                Err(err).wrap_err_with(|| {
                    format!(
                        "failed to read {} bytes at offset {} of slot {} in '{}'",
                        length,
                        offset,
                        slot,
                        self.path.display()
                    )
                })
            }
        }
    }

    /// Writes the metadata entry for `slot`.
    pub fn write_metadata(&self, slot: u32, id: SectorId, count: u16) -> Result<()> {
        if self.hooks.fail_write(&self.path) {
            self.record_failed_write();
            return Err(eyre::Report::new(StoreError::DiskFault).wrap_err(format!(
                "injected metadata write failure in '{}'",
                self.path.display()
            )));
        }
        let entry = MetadataEntry::new(id, count);
        let offset = slot as u64 * METADATA_ENTRY_SIZE as u64;
        match self.metadata_file.write_all_at(entry.as_bytes(), offset) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.record_failed_write();
                Err(eyre::Report::new(StoreError::DiskFault).wrap_err(format!(
                    "failed to write metadata slot {} in '{}': {}",
                    slot,
                    self.path.display(),
                    err
                )))
            }
        }
    }

    /// Zeroes the metadata entry for `slot`.
    pub fn erase_metadata(&self, slot: u32) -> Result<()> {
        let zeros = [0u8; METADATA_ENTRY_SIZE];
        let offset = slot as u64 * METADATA_ENTRY_SIZE as u64;
        self.metadata_file
            .write_all_at(&zeros, offset)
            .wrap_err_with(|| {
                format!(
                    "failed to erase metadata slot {} in '{}'",
                    slot,
                    self.path.display()
                )
            })
    }

    /// Reads the metadata entry for `slot`.
    pub fn read_metadata_entry(&self, slot: u32) -> Result<MetadataEntry> {
        let mut buf = [0u8; METADATA_ENTRY_SIZE];
        let offset = slot as u64 * METADATA_ENTRY_SIZE as u64;
        self.metadata_file
            .read_exact_at(&mut buf, offset)
            .wrap_err_with(|| {
                format!(
                    "failed to read metadata slot {} in '{}'",
                    slot,
                    self.path.display()
                )
            })?;
        MetadataEntry::read_from_bytes(&buf)
            .map_err(|e| eyre::eyre!("invalid metadata entry at slot {}: {:?}", slot, e))
    }

    /// Resizes both files for `new_capacity` sectors. The usage bitmap is
    /// adjusted by the caller, which knows whether this is a grow or a
    /// shrink with relocated sectors.
    pub fn resize_files(&self, new_capacity: u32) -> Result<()> {
        self.sector_file
            .set_len(new_capacity as u64 * SECTOR_SIZE as u64)
            .wrap_err("failed to resize sector file")?;
        self.metadata_file
            .set_len(new_capacity as u64 * METADATA_ENTRY_SIZE as u64)
            .wrap_err("failed to resize metadata file")?;
        Ok(())
    }

    /// Flushes both files to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.sector_file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync sector file in '{}'", self.path.display()))?;
        self.metadata_file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync metadata file in '{}'", self.path.display()))
    }

    /// Deletes the folder's files. Called after the folder has been
    /// retired from the settings and the WAL.
    pub fn delete_files(&self) -> Result<()> {
        std::fs::remove_file(self.path.join(SECTOR_FILE_NAME))
            .wrap_err("failed to remove sector file")?;
        std::fs::remove_file(self.path.join(METADATA_FILE_NAME))
            .wrap_err("failed to remove metadata file")
    }
}

impl std::fmt::Debug for StorageFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFolder")
            .field("index", &self.index)
            .field("path", &self.path)
            .field("capacity", &self.capacity())
            .finish()
    }
}
