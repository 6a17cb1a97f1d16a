//! # Write-ahead log
//!
//! Every metadata mutation is appended here before the caller is
//! acknowledged. The log carries only metadata (sector payloads go
//! straight to the folder files), so records are tiny and an fsync
//! covers many operations at once.
//!
//! ## Record framing
//!
//! ```text
//! +-----------+--------+--------------------+------------+
//! | length    | type   | payload            | crc32c     |
//! | u32 LE    | u8     | length - 1 bytes   | u32 LE     |
//! +-----------+--------+--------------------+------------+
//! ```
//!
//! The checksum covers the type byte and the payload. Every count or
//! overflow value in a payload is absolute, never a delta, so replaying
//! a record twice is harmless; recovery exploits this by replaying a
//! stale rotated log ahead of the active one.
//!
//! ## Lifecycle
//!
//! Writers append under a short mutex without syncing; the sync loop
//! fsyncs the file once per tick, which is the durability barrier
//! acknowledged callers have waited on. After a successful settings
//! snapshot the log is rotated: `wal.dat` is renamed to `wal.dat.tmp`, a
//! fresh `wal.dat` is created, and the stale file is deleted. A crash
//! between those steps leaves both files in place; replay handles that.
//!
//! ## Truncated tails
//!
//! A crash can tear the final append. Replay treats a short read or a
//! checksum mismatch as end-of-log: the torn record was never
//! acknowledged (its fsync cannot have completed), so dropping it is
//! correct.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, ensure, Result, WrapErr};

use crate::id::SectorId;

pub const WAL_FILE_NAME: &str = "wal.dat";
pub const WAL_TMP_NAME: &str = "wal.dat.tmp";

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The longest record is an `AddStorageFolder` carrying a path; anything
/// larger than this in a length prefix is corruption, not data.
const MAX_RECORD_LEN: u32 = 64 * 1024;

const TYPE_ADD_FOLDER: u8 = 1;
const TYPE_REMOVE_FOLDER: u8 = 2;
const TYPE_RESIZE_FOLDER: u8 = 3;
const TYPE_UPDATE_SECTOR: u8 = 4;
const TYPE_REMOVE_SECTOR: u8 = 5;
const TYPE_OVERFLOW_UPDATE: u8 = 6;

/// One durable metadata mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    AddStorageFolder {
        index: u16,
        capacity: u32,
        path: PathBuf,
    },
    RemoveStorageFolder {
        index: u16,
    },
    ResizeStorageFolder {
        index: u16,
        new_capacity: u32,
    },
    /// Creates or updates a sector location; `count` is the absolute
    /// primary count after the operation.
    UpdateSectorMetadata {
        folder: u16,
        slot: u32,
        id: SectorId,
        count: u16,
    },
    RemoveSector {
        id: SectorId,
    },
    /// Absolute overflow count after the operation.
    OverflowUpdate {
        id: SectorId,
        overflow: u64,
    },
}

impl WalRecord {
    fn type_byte(&self) -> u8 {
        match self {
            WalRecord::AddStorageFolder { .. } => TYPE_ADD_FOLDER,
            WalRecord::RemoveStorageFolder { .. } => TYPE_REMOVE_FOLDER,
            WalRecord::ResizeStorageFolder { .. } => TYPE_RESIZE_FOLDER,
            WalRecord::UpdateSectorMetadata { .. } => TYPE_UPDATE_SECTOR,
            WalRecord::RemoveSector { .. } => TYPE_REMOVE_SECTOR,
            WalRecord::OverflowUpdate { .. } => TYPE_OVERFLOW_UPDATE,
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            WalRecord::AddStorageFolder {
                index,
                capacity,
                path,
            } => {
                buf.extend_from_slice(&index.to_le_bytes());
                buf.extend_from_slice(&capacity.to_le_bytes());
                let path_bytes = path
                    .to_str()
                    .ok_or_else(|| eyre::eyre!("storage folder path is not valid UTF-8"))?
                    .as_bytes();
                ensure!(
                    path_bytes.len() <= u16::MAX as usize,
                    "storage folder path is too long to log"
                );
                buf.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
                buf.extend_from_slice(path_bytes);
            }
            WalRecord::RemoveStorageFolder { index } => {
                buf.extend_from_slice(&index.to_le_bytes());
            }
            WalRecord::ResizeStorageFolder {
                index,
                new_capacity,
            } => {
                buf.extend_from_slice(&index.to_le_bytes());
                buf.extend_from_slice(&new_capacity.to_le_bytes());
            }
            WalRecord::UpdateSectorMetadata {
                folder,
                slot,
                id,
                count,
            } => {
                buf.extend_from_slice(&folder.to_le_bytes());
                buf.extend_from_slice(&slot.to_le_bytes());
                buf.extend_from_slice(&id.0);
                buf.extend_from_slice(&count.to_le_bytes());
            }
            WalRecord::RemoveSector { id } => {
                buf.extend_from_slice(&id.0);
            }
            WalRecord::OverflowUpdate { id, overflow } => {
                buf.extend_from_slice(&id.0);
                buf.extend_from_slice(&overflow.to_le_bytes());
            }
        }
        Ok(buf)
    }

    /// Encodes the full frame: length, type, payload, checksum.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.payload()?;
        let length = 1 + payload.len() as u32;

        let mut digest = CRC32C.digest();
        digest.update(&[self.type_byte()]);
        digest.update(&payload);
        let checksum = digest.finalize();

        let mut frame = Vec::with_capacity(8 + payload.len() + 1);
        frame.extend_from_slice(&length.to_le_bytes());
        frame.push(self.type_byte());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&checksum.to_le_bytes());
        Ok(frame)
    }

    fn decode(type_byte: u8, payload: &[u8]) -> Result<Self> {
        let record = match type_byte {
            TYPE_ADD_FOLDER => {
                ensure!(payload.len() >= 8, "short add-folder payload");
                let index = u16::from_le_bytes(payload[0..2].try_into().unwrap());
                let capacity = u32::from_le_bytes(payload[2..6].try_into().unwrap());
                let path_len = u16::from_le_bytes(payload[6..8].try_into().unwrap()) as usize;
                ensure!(payload.len() == 8 + path_len, "bad add-folder path length");
                let path = std::str::from_utf8(&payload[8..])
                    .wrap_err("add-folder path is not UTF-8")?;
                WalRecord::AddStorageFolder {
                    index,
                    capacity,
                    path: PathBuf::from(path),
                }
            }
            TYPE_REMOVE_FOLDER => {
                ensure!(payload.len() == 2, "bad remove-folder payload");
                WalRecord::RemoveStorageFolder {
                    index: u16::from_le_bytes(payload.try_into().unwrap()),
                }
            }
            TYPE_RESIZE_FOLDER => {
                ensure!(payload.len() == 6, "bad resize-folder payload");
                WalRecord::ResizeStorageFolder {
                    index: u16::from_le_bytes(payload[0..2].try_into().unwrap()),
                    new_capacity: u32::from_le_bytes(payload[2..6].try_into().unwrap()),
                }
            }
            TYPE_UPDATE_SECTOR => {
                ensure!(payload.len() == 20, "bad update-sector payload");
                let mut id = [0u8; 12];
                id.copy_from_slice(&payload[6..18]);
                WalRecord::UpdateSectorMetadata {
                    folder: u16::from_le_bytes(payload[0..2].try_into().unwrap()),
                    slot: u32::from_le_bytes(payload[2..6].try_into().unwrap()),
                    id: SectorId(id),
                    count: u16::from_le_bytes(payload[18..20].try_into().unwrap()),
                }
            }
            TYPE_REMOVE_SECTOR => {
                ensure!(payload.len() == 12, "bad remove-sector payload");
                let mut id = [0u8; 12];
                id.copy_from_slice(payload);
                WalRecord::RemoveSector { id: SectorId(id) }
            }
            TYPE_OVERFLOW_UPDATE => {
                ensure!(payload.len() == 20, "bad overflow-update payload");
                let mut id = [0u8; 12];
                id.copy_from_slice(&payload[0..12]);
                WalRecord::OverflowUpdate {
                    id: SectorId(id),
                    overflow: u64::from_le_bytes(payload[12..20].try_into().unwrap()),
                }
            }
            other => bail!("unknown WAL record type {}", other),
        };
        Ok(record)
    }
}

/// Appends records to the active WAL. Callers serialize through the
/// manager's append mutex; this type only owns the file handle.
pub struct WalWriter {
    path: PathBuf,
    file: File,
}

impl WalWriter {
    /// Opens the WAL at `path` for appending, creating it when absent.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL at '{}'", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Creates a fresh empty WAL, truncating anything already there.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create WAL at '{}'", path.display()))?;
        file.sync_all().wrap_err("failed to sync fresh WAL")?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. Durability comes later, from [`Self::sync`].
    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        let frame = record.encode()?;
        self.file
            .write_all(&frame)
            .wrap_err_with(|| format!("failed to append WAL record to '{}'", self.path.display()))
    }

    /// Fsyncs the log. Everything appended before this call is durable
    /// once it returns.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync WAL '{}'", self.path.display()))
    }
}

/// Sequentially decodes records from a WAL file. Iteration stops cleanly
/// at a torn or corrupt tail.
pub struct WalReader {
    reader: BufReader<File>,
}

impl WalReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .wrap_err_with(|| format!("failed to open WAL at '{}'", path.display()))?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    /// Reads the next record. `Ok(None)` means a clean or torn end of the
    /// log; either way there is nothing more to replay.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        let mut len_bytes = [0u8; 4];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).wrap_err("failed to read WAL record length"),
        }
        let length = u32::from_le_bytes(len_bytes);
        if length == 0 || length > MAX_RECORD_LEN {
            tracing::warn!(length, "WAL tail has an implausible record length, stopping replay");
            return Ok(None);
        }

        let mut body = vec![0u8; length as usize + 4];
        if self.reader.read_exact(&mut body).is_err() {
            // Torn append: the record was never acknowledged.
            return Ok(None);
        }

        let type_byte = body[0];
        let payload = &body[1..length as usize];
        let stored_crc = u32::from_le_bytes(body[length as usize..].try_into().unwrap());

        let mut digest = CRC32C.digest();
        digest.update(&[type_byte]);
        digest.update(payload);
        if digest.finalize() != stored_crc {
            tracing::warn!("WAL tail failed its checksum, stopping replay");
            return Ok(None);
        }

        WalRecord::decode(type_byte, payload).map(Some)
    }

    /// Drains the reader into a vector.
    pub fn read_all(mut self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}
