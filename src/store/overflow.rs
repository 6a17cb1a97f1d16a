//! # Persistent overflow reference counts
//!
//! The primary reference count for a sector is a 16-bit field in the
//! folder metadata file. A handful of sectors on a busy host recur more
//! than 65,535 times; their excess references live here, in a dedicated
//! memory-mapped file.
//!
//! ## File format
//!
//! ```text
//! +----------------------+-----------+---------------+----------------+
//! | magic (16 bytes)     | version   | entry count   | entries...     |
//! | "SiaOverflowMap\0\0" | u16 LE    | u32 LE        | 20 bytes each  |
//! +----------------------+-----------+---------------+----------------+
//! ```
//!
//! Each entry is `id[12] || count u64`. Entries are unordered; an
//! in-memory index is rebuilt by scanning the file on open. Removal
//! swaps the last entry into the hole so the live region stays dense.
//!
//! ## Durability
//!
//! Writes land in the mapped region immediately and become durable when
//! the sync loop calls [`OverflowMap::sync`]. An entry is created (at
//! zero) in the same operation that saturates the primary count, so a
//! saturated sector always has a disk record distinguishing "known
//! saturated" from "never saturated"; the entry is removed only once the
//! primary count drops back below the ceiling.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::MmapMut;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::id::SectorId;

pub const OVERFLOW_MAGIC: &[u8; 16] = b"SiaOverflowMap\x00\x00";
pub const OVERFLOW_VERSION: u16 = 1;
pub const OVERFLOW_HEADER_SIZE: usize = 22;
pub const OVERFLOW_ENTRY_SIZE: usize = 20;

/// Entries are appended in chunks so the file is not remapped on every
/// insertion.
const GROWTH_ENTRIES: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct OverflowHeader {
    magic: [u8; 16],
    version: U16,
    entry_count: U32,
}

const _: () = assert!(std::mem::size_of::<OverflowHeader>() == OVERFLOW_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct OverflowEntry {
    id: [u8; 12],
    count: U64,
}

const _: () = assert!(std::mem::size_of::<OverflowEntry>() == OVERFLOW_ENTRY_SIZE);

pub struct OverflowMap {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    /// id -> slot within the entry region. Values are read through the
    /// mapping so the file is the single source of truth.
    index: HashMap<SectorId, usize>,
    entry_count: usize,
}

impl OverflowMap {
    /// Opens the overflow file, creating an empty one when absent, and
    /// rebuilds the in-memory index.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open overflow file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err("overflow file metadata")?
            .len() as usize;

        if len == 0 {
            file.set_len(OVERFLOW_HEADER_SIZE as u64)
                .wrap_err("failed to size new overflow file")?;
            // SAFETY: the file was just created and sized; the store holds
            // an exclusive directory lock, so no other process maps it,
            // and the mapping never outlives this struct.
            let mut mmap = unsafe {
                MmapMut::map_mut(&file)
                    .wrap_err_with(|| format!("failed to map overflow file '{}'", path.display()))?
            };
            let header = OverflowHeader {
                magic: *OVERFLOW_MAGIC,
                version: U16::new(OVERFLOW_VERSION),
                entry_count: U32::new(0),
            };
            mmap[..OVERFLOW_HEADER_SIZE].copy_from_slice(header.as_bytes());
            mmap.flush().wrap_err("failed to flush new overflow header")?;
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                mmap,
                index: HashMap::new(),
                entry_count: 0,
            });
        }

        ensure!(
            len >= OVERFLOW_HEADER_SIZE,
            "overflow file '{}' is shorter than its header",
            path.display()
        );

        // SAFETY: same exclusivity argument as above; existing files are
        // only ever mapped while the directory lock is held.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to map overflow file '{}'", path.display()))?
        };

        let header = OverflowHeader::read_from_bytes(&mmap[..OVERFLOW_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("invalid overflow header: {:?}", e))?;
        if header.magic != *OVERFLOW_MAGIC {
            bail!("overflow file '{}' has bad magic bytes", path.display());
        }
        ensure!(
            header.version.get() == OVERFLOW_VERSION,
            "unsupported overflow file version {}",
            header.version.get()
        );

        let entry_count = header.entry_count.get() as usize;
        ensure!(
            OVERFLOW_HEADER_SIZE + entry_count * OVERFLOW_ENTRY_SIZE <= len,
            "overflow file '{}' records {} entries but is only {} bytes",
            path.display(),
            entry_count,
            len
        );

        let mut index = HashMap::with_capacity(entry_count);
        for slot in 0..entry_count {
            let offset = OVERFLOW_HEADER_SIZE + slot * OVERFLOW_ENTRY_SIZE;
            let entry =
                OverflowEntry::read_from_bytes(&mmap[offset..offset + OVERFLOW_ENTRY_SIZE])
                    .map_err(|e| eyre::eyre!("invalid overflow entry at slot {}: {:?}", slot, e))?;
            index.insert(SectorId(entry.id), slot);
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap,
            index,
            entry_count,
        })
    }

    /// Returns the overflow count for `id`, or `None` when no entry
    /// exists. A `Some(0)` means the primary count is saturated but no
    /// references have spilled over yet.
    pub fn overflow(&self, id: &SectorId) -> Option<u64> {
        let slot = *self.index.get(id)?;
        let offset = OVERFLOW_HEADER_SIZE + slot * OVERFLOW_ENTRY_SIZE;
        let entry = OverflowEntry::read_from_bytes(&self.mmap[offset..offset + OVERFLOW_ENTRY_SIZE])
            .expect("indexed overflow slot is in bounds");
        Some(entry.count.get())
    }

    /// Inserts or updates the entry for `id`.
    pub fn set_overflow(&mut self, id: SectorId, count: u64) -> Result<()> {
        if let Some(&slot) = self.index.get(&id) {
            let offset = OVERFLOW_HEADER_SIZE + slot * OVERFLOW_ENTRY_SIZE;
            let entry = OverflowEntry {
                id: id.0,
                count: U64::new(count),
            };
            self.mmap[offset..offset + OVERFLOW_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
            return Ok(());
        }

        let slot = self.entry_count;
        let end = OVERFLOW_HEADER_SIZE + (slot + 1) * OVERFLOW_ENTRY_SIZE;
        if end > self.mmap.len() {
            self.grow(OVERFLOW_HEADER_SIZE + (slot + GROWTH_ENTRIES) * OVERFLOW_ENTRY_SIZE)?;
        }

        let offset = OVERFLOW_HEADER_SIZE + slot * OVERFLOW_ENTRY_SIZE;
        let entry = OverflowEntry {
            id: id.0,
            count: U64::new(count),
        };
        self.mmap[offset..offset + OVERFLOW_ENTRY_SIZE].copy_from_slice(entry.as_bytes());

        self.entry_count += 1;
        self.write_entry_count();
        self.index.insert(id, slot);
        Ok(())
    }

    /// Removes the entry for `id`, swapping the last entry into its slot.
    /// Removing an absent entry is a no-op.
    pub fn remove(&mut self, id: &SectorId) {
        let Some(slot) = self.index.remove(id) else {
            return;
        };

        let last = self.entry_count - 1;
        if slot != last {
            let last_offset = OVERFLOW_HEADER_SIZE + last * OVERFLOW_ENTRY_SIZE;
            let mut moved = [0u8; OVERFLOW_ENTRY_SIZE];
            moved.copy_from_slice(&self.mmap[last_offset..last_offset + OVERFLOW_ENTRY_SIZE]);

            let hole_offset = OVERFLOW_HEADER_SIZE + slot * OVERFLOW_ENTRY_SIZE;
            self.mmap[hole_offset..hole_offset + OVERFLOW_ENTRY_SIZE].copy_from_slice(&moved);

            let moved_entry = OverflowEntry::read_from_bytes(&moved)
                .expect("entry buffer has the exact entry size");
            self.index.insert(SectorId(moved_entry.id), slot);
        }

        let last_offset = OVERFLOW_HEADER_SIZE + last * OVERFLOW_ENTRY_SIZE;
        self.mmap[last_offset..last_offset + OVERFLOW_ENTRY_SIZE]
            .copy_from_slice(&[0u8; OVERFLOW_ENTRY_SIZE]);

        self.entry_count -= 1;
        self.write_entry_count();
    }

    pub fn len(&self) -> usize {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// IDs of all current entries.
    pub fn ids(&self) -> Vec<SectorId> {
        self.index.keys().copied().collect()
    }

    /// Flushes the mapped region to disk.
    pub fn sync(&self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to flush overflow file '{}'", self.path.display()))
    }

    /// Flushes and drops the mapping.
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    fn write_entry_count(&mut self) {
        let count = U32::new(self.entry_count as u32);
        self.mmap[18..22].copy_from_slice(count.as_bytes());
    }

    fn grow(&mut self, new_len: usize) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err("failed to flush overflow map before grow")?;
        self.file
            .set_len(new_len as u64)
            .wrap_err("failed to extend overflow file")?;
        // SAFETY: the old mapping is replaced atomically under &mut self,
        // so no outstanding references into it can exist; the file has
        // just been extended to cover the new length.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap overflow file after grow")?
        };
        Ok(())
    }
}

impl std::fmt::Debug for OverflowMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverflowMap")
            .field("path", &self.path)
            .field("entries", &self.entry_count)
            .finish()
    }
}
