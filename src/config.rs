//! Store-wide constants and runtime configuration.
//!
//! The sector size and storage-folder granularity are protocol constants:
//! every deployment shares them and the on-disk layout depends on them.
//! Everything else lives in [`StoreConfig`] and can be adjusted through
//! the builder before the store is opened.

use std::time::Duration;

/// Size of a single sector payload in bytes (4 MiB).
pub const SECTOR_SIZE: usize = 1 << 22;

/// Storage folders grow and shrink in units of this many sectors. Each
/// granule maps to exactly one 64-bit word of the usage bitmap.
pub const STORAGE_FOLDER_GRANULARITY: u32 = 64;

/// Size of one metadata entry: a 12-byte sector ID plus a 16-bit count.
pub const METADATA_ENTRY_SIZE: usize = 14;

/// Primary reference count ceiling. Counts beyond this spill into the
/// overflow map.
pub const MAX_SECTOR_COUNT: u16 = u16::MAX;

/// Runtime configuration for a [`crate::SectorStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Cadence of the background sync loop. Committers block at most
    /// roughly this long before their WAL records are fsynced, and in
    /// practice far less because a waiting committer wakes the loop.
    pub sync_interval: Duration,
    /// Smallest permitted storage folder, in sectors.
    pub min_folder_sectors: u32,
    /// Largest permitted storage folder, in sectors.
    pub max_folder_sectors: u32,
    /// Soft cap on physical sector writes in flight per folder. Placement
    /// steers new sectors away from saturated folders when an alternative
    /// exists.
    pub max_concurrent_adds: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_millis(1500),
            min_folder_sectors: STORAGE_FOLDER_GRANULARITY,
            max_folder_sectors: 1 << 24,
            max_concurrent_adds: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_size_is_4_mib() {
        assert_eq!(SECTOR_SIZE, 4 * 1024 * 1024);
    }

    #[test]
    fn granularity_matches_bitmap_word() {
        assert_eq!(STORAGE_FOLDER_GRANULARITY, u64::BITS);
    }

    #[test]
    fn default_config_is_sane() {
        let config = StoreConfig::default();
        assert!(config.min_folder_sectors >= STORAGE_FOLDER_GRANULARITY);
        assert!(config.max_folder_sectors > config.min_folder_sectors);
        assert!(config.sync_interval >= Duration::from_millis(1));
    }
}
