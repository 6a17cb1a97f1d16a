//! In-memory sector location index.
//!
//! Maps a sector ID to where its payload lives and how many references
//! it holds. Sharded 256 ways on the ID's low byte so concurrent
//! operations on unrelated sectors touch disjoint mutexes. Shard locks
//! are held only for the map operation itself; disk I/O always happens
//! outside, under the keyed sector lock.

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::id::SectorId;

const INDEX_SHARD_COUNT: usize = 256;

/// Where one live sector resides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorLocation {
    /// Storage folder index.
    pub folder: u16,
    /// Slot within the folder's sector file.
    pub slot: u32,
    /// Primary reference count, 1..=65535. Excess references live in the
    /// overflow map.
    pub count: u16,
}

pub struct SectorIndex {
    shards: Vec<Mutex<HashMap<SectorId, SectorLocation>>>,
}

impl SectorIndex {
    pub fn new() -> Self {
        let shards = (0..INDEX_SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    pub fn get(&self, id: &SectorId) -> Option<SectorLocation> {
        self.shards[id.shard()].lock().get(id).copied()
    }

    pub fn insert(&self, id: SectorId, location: SectorLocation) {
        self.shards[id.shard()].lock().insert(id, location);
    }

    pub fn remove(&self, id: &SectorId) -> Option<SectorLocation> {
        self.shards[id.shard()].lock().remove(id)
    }

    pub fn contains(&self, id: &SectorId) -> bool {
        self.shards[id.shard()].lock().contains_key(id)
    }

    /// Total number of distinct sectors.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    /// Snapshot of every sector residing in `folder`. Shards are locked
    /// one at a time, so the result is a point-in-time view per shard,
    /// which is all folder removal and resizing need: they re-check each
    /// location under the sector lock before moving it.
    pub fn locations_in_folder(&self, folder: u16) -> Vec<(SectorId, SectorLocation)> {
        let mut result = Vec::new();
        for shard in &self.shards {
            let map = shard.lock();
            result.extend(
                map.iter()
                    .filter(|(_, loc)| loc.folder == folder)
                    .map(|(id, loc)| (*id, *loc)),
            );
        }
        result
    }
}

impl Default for SectorIndex {
    fn default() -> Self {
        Self::new()
    }
}
