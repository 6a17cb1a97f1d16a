//! Keyed per-sector-ID locks.
//!
//! Every mutation or read of one sector runs under that sector's own
//! mutex. Two operations on different IDs never contend; two operations
//! on the same ID serialize, which is what gives a single sector ID its
//! sequential consistency, and what turns the loser of a concurrent
//! add-new-sector race into a plain count increment.
//!
//! Lock entries are created on demand and removed when the last guard
//! drops, so the table only ever holds in-flight IDs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::id::SectorId;

const LOCK_SHARD_COUNT: usize = 256;

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    refs: AtomicUsize,
}

struct LockShard {
    entries: Mutex<HashMap<SectorId, Arc<LockEntry>>>,
}

pub struct SectorLocks {
    shards: Vec<Arc<LockShard>>,
}

impl SectorLocks {
    pub fn new() -> Self {
        let shards = (0..LOCK_SHARD_COUNT)
            .map(|_| {
                Arc::new(LockShard {
                    entries: Mutex::new(HashMap::new()),
                })
            })
            .collect();
        Self { shards }
    }

    /// Blocks until the lock for `id` is held.
    pub fn lock(&self, id: SectorId) -> SectorLockGuard {
        let shard = &self.shards[id.shard()];

        let entry = {
            let mut entries = shard.entries.lock();
            if let Some(entry) = entries.get(&id) {
                entry.refs.fetch_add(1, Ordering::AcqRel);
                Arc::clone(entry)
            } else {
                let entry = Arc::new(LockEntry {
                    mutex: Arc::new(Mutex::new(())),
                    refs: AtomicUsize::new(1),
                });
                entries.insert(id, Arc::clone(&entry));
                entry
            }
        };

        let guard = entry.mutex.lock_arc();
        SectorLockGuard {
            shard: Arc::clone(shard),
            id,
            entry,
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        self.shards.iter().map(|s| s.entries.lock().len()).sum()
    }
}

impl Default for SectorLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one sector's lock. Dropping it releases the mutex and
/// retires the table entry once no other thread is waiting on it.
pub struct SectorLockGuard {
    shard: Arc<LockShard>,
    id: SectorId,
    entry: Arc<LockEntry>,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl Drop for SectorLockGuard {
    fn drop(&mut self) {
        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut entries = self.shard.entries.lock();
            // A racer may have re-acquired the entry between the decrement
            // and this lock.
            if self.entry.refs.load(Ordering::Acquire) == 0 {
                entries.remove(&self.id);
            }
        }
    }
}
