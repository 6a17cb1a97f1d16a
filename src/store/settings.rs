//! Settings snapshot persistence.
//!
//! The snapshot is the durable record of everything the WAL does not
//! cover once truncated: the folder list, each folder's usage bitmap,
//! and the balancing salt. It is written as JSON wrapped in a checksum
//! envelope and replaced atomically: write `settings.tmp`, fsync it,
//! rename over `settings.dat`, fsync the directory. A crash at any point
//! leaves at least one readable snapshot on disk.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const SETTINGS_FILE_NAME: &str = "settings.dat";
pub const SETTINGS_TMP_NAME: &str = "settings.tmp";
pub const SETTINGS_VERSION: u32 = 1;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Persisted description of one storage folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSettings {
    pub index: u16,
    pub path: PathBuf,
    /// Capacity in sectors.
    pub capacity: u32,
    /// Usage bitmap as packed 64-bit words.
    pub usage: Vec<u64>,
}

/// The manager state captured at each checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    pub salt: [u8; 16],
    pub folders: Vec<FolderSettings>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: u32,
    settings: serde_json::Value,
}

impl Settings {
    pub fn new(salt: [u8; 16]) -> Self {
        Self {
            version: SETTINGS_VERSION,
            salt,
            folders: Vec::new(),
        }
    }

    /// Writes the snapshot to `dir/settings.tmp`, fsyncs it, renames it
    /// over `dir/settings.dat` and fsyncs the directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let tmp_path = dir.join(SETTINGS_TMP_NAME);
        let final_path = dir.join(SETTINGS_FILE_NAME);

        let body = serde_json::to_value(self).wrap_err("failed to serialize settings")?;
        let body_text =
            serde_json::to_string(&body).wrap_err("failed to serialize settings body")?;
        let envelope = Envelope {
            checksum: CRC32C.checksum(body_text.as_bytes()),
            settings: body,
        };
        let payload =
            serde_json::to_vec_pretty(&envelope).wrap_err("failed to serialize settings envelope")?;

        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .wrap_err_with(|| format!("failed to create '{}'", tmp_path.display()))?;
        tmp.write_all(&payload)
            .wrap_err("failed to write settings snapshot")?;
        tmp.sync_all().wrap_err("failed to sync settings snapshot")?;
        drop(tmp);

        std::fs::rename(&tmp_path, &final_path).wrap_err_with(|| {
            format!(
                "failed to rename '{}' over '{}'",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        sync_dir(dir)
    }

    /// Loads the snapshot from `dir`, preferring `settings.dat` and
    /// falling back to a leftover `settings.tmp`. Returns `Ok(None)` when
    /// neither file exists (a brand-new store).
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        for name in [SETTINGS_FILE_NAME, SETTINGS_TMP_NAME] {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }
            return Self::load_file(&path).map(Some);
        }
        Ok(None)
    }

    fn load_file(path: &Path) -> Result<Self> {
        let payload = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read '{}'", path.display()))?;

        let envelope: Envelope = serde_json::from_slice(&payload).map_err(|e| {
            eyre::Report::new(StoreError::Corrupt)
                .wrap_err(format!("settings file '{}' is not valid JSON: {}", path.display(), e))
        })?;

        let body_text = serde_json::to_string(&envelope.settings)
            .wrap_err("failed to re-serialize settings body")?;
        if CRC32C.checksum(body_text.as_bytes()) != envelope.checksum {
            return Err(eyre::Report::new(StoreError::Corrupt).wrap_err(format!(
                "settings file '{}' failed its checksum",
                path.display()
            )));
        }

        let settings: Settings = serde_json::from_value(envelope.settings).map_err(|e| {
            eyre::Report::new(StoreError::Corrupt)
                .wrap_err(format!("settings file '{}' has a bad body: {}", path.display(), e))
        })?;

        if settings.version != SETTINGS_VERSION {
            return Err(eyre::Report::new(StoreError::Corrupt).wrap_err(format!(
                "settings version {} is not supported",
                settings.version
            )));
        }

        Ok(settings)
    }
}

/// Fsyncs a directory so renames within it are durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .wrap_err_with(|| format!("failed to sync directory '{}'", dir.display()))
}
