//! Folder selection for new sectors.
//!
//! A new sector goes to a folder chosen by weight: a folder with twice
//! the remaining capacity receives twice the traffic, which keeps fill
//! levels proportional across mixed-size folders. The choice is driven
//! by the salted balancing hash rather than an RNG, so a given
//! (salt, sector, attempt) triple is reproducible; the attempt counter
//! re-rolls the choice after a folder rejects a write.
//!
//! Unhealthy folders are steered around, not blacklisted: a folder past
//! the failed-write threshold or saturated with in-flight adds is only
//! skipped while a better candidate exists, so a store whose every
//! folder looks bad still accepts data on whichever folder works.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::id::{balance_hash, SectorId};
use crate::store::StorageFolder;

/// A folder stops attracting new sectors once it has failed this many
/// writes and failures outnumber successes.
const FAILED_WRITE_THRESHOLD: u64 = 5;

fn is_degraded(folder: &StorageFolder) -> bool {
    let health = folder.health();
    health.failed_writes >= FAILED_WRITE_THRESHOLD
        && health.failed_writes > health.successful_writes
}

/// Picks the folder for a new sector. `exclude` holds indexes that
/// already rejected this sector during the current operation. Returns
/// `None` when no folder has room.
pub fn pick_folder(
    folders: &[Arc<StorageFolder>],
    salt: &[u8; 16],
    id: &SectorId,
    attempt: u32,
    exclude: &[u16],
    max_concurrent_adds: u32,
) -> Option<Arc<StorageFolder>> {
    let mut candidates: SmallVec<[(&Arc<StorageFolder>, u64); 8]> = folders
        .iter()
        .filter(|f| !f.busy.load(Ordering::Acquire))
        .filter(|f| !exclude.contains(&f.index()))
        .filter_map(|f| {
            let remaining = f.remaining() as u64;
            (remaining > 0).then_some((f, remaining))
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|(f, _)| f.index());

    // Soft filters: drop degraded or saturated folders unless that would
    // leave nothing to write to.
    let healthy: SmallVec<[(&Arc<StorageFolder>, u64); 8]> = candidates
        .iter()
        .filter(|(f, _)| !is_degraded(f))
        .filter(|(f, _)| f.pending_adds.load(Ordering::Acquire) < max_concurrent_adds)
        .cloned()
        .collect();
    let pool = if healthy.is_empty() { &candidates } else { &healthy };

    let total: u64 = pool.iter().map(|&(_, remaining)| remaining).sum();
    let mut roll = balance_hash(salt, id, attempt) % total;
    for &(folder, remaining) in pool.iter() {
        if roll < remaining {
            return Some(Arc::clone(folder));
        }
        roll -= remaining;
    }
    unreachable!("roll is bounded by the sum of weights");
}
