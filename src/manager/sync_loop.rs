//! Background sync loop.
//!
//! One thread turns appended WAL records into acknowledged operations.
//! Each pass is a full checkpoint:
//!
//! 1. fsync the WAL, the durability barrier committers wait on
//! 2. fsync every folder's sector and metadata files, in parallel
//! 3. flush the overflow map
//! 4. write `settings.tmp`, fsync, rename over `settings.dat`
//! 5. rotate the WAL: rename `wal.dat` -> `wal.dat.tmp`, create a fresh
//!    log, fsync the directory, delete the stale file
//! 6. bump the barrier generation and wake committers
//!
//! Steps 4 and 5 honor the fault-injection hooks so crash tests can stop
//! the protocol at each boundary; step 5 only runs when step 4 landed,
//! because rotating the log without a snapshot of its effects would drop
//! acknowledged writes.
//!
//! The loop wakes on a timer or as soon as a committer appends, so idle
//! stores checkpoint at the configured interval while busy stores batch
//! many operations into one fsync.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::{debug, error};

use crate::store::{sync_dir, WalWriter, WAL_FILE_NAME, WAL_TMP_NAME};

use super::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    loop {
        let shutting_down = {
            let mut state = shared.sync_state.lock();
            if !state.shutdown && !state.dirty {
                shared
                    .sync_wake
                    .wait_for(&mut state, shared.config.sync_interval);
            }
            state.dirty = false;
            state.shutdown
        };

        if let Err(err) = sync_once(&shared) {
            // A failed barrier means acknowledgements can no longer be
            // honored; close the store rather than lie to callers.
            error!(error = %err, "sync loop failed, closing the store");
            shared.closed.store(true, Ordering::Release);
            let mut state = shared.sync_state.lock();
            state.shutdown = true;
            drop(state);
            shared.sync_done.notify_all();
            return;
        }

        if shutting_down {
            debug!("sync loop drained, exiting");
            shared.sync_done.notify_all();
            return;
        }
    }
}

/// Runs one full checkpoint. Also used once during startup, after
/// recovery has replayed the WAL.
pub(crate) fn sync_once(shared: &Shared) -> Result<()> {
    let mut wal = shared.wal.lock();

    wal.sync().wrap_err("failed to fsync the WAL")?;

    let folders: Vec<_> = shared.folders.read().values().cloned().collect();
    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = folders
            .iter()
            .map(|folder| scope.spawn(move || folder.sync()))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("folder sync thread panicked"))
            .collect()
    });
    for result in results {
        result?;
    }

    shared
        .overflow
        .lock()
        .sync()
        .wrap_err("failed to flush overflow map")?;

    if !shared.hooks.disrupt("settings-rename") {
        let settings = shared.current_settings(&folders);
        settings
            .save(&shared.dir)
            .wrap_err("failed to save settings snapshot")?;

        if !shared.hooks.disrupt("wal-rename") {
            let wal_path = shared.dir.join(WAL_FILE_NAME);
            let tmp_path = shared.dir.join(WAL_TMP_NAME);
            std::fs::rename(&wal_path, &tmp_path)
                .wrap_err("failed to rotate the WAL")?;
            *wal = WalWriter::create(&wal_path)
                .wrap_err("failed to create a fresh WAL")?;
            sync_dir(&shared.dir)?;

            if !shared.hooks.disrupt("wal-cleanup") {
                std::fs::remove_file(&tmp_path)
                    .wrap_err("failed to delete the rotated WAL")?;
            }
        }
    }

    // Bump the barrier while still holding the WAL mutex: a record
    // appended after this pass's fsync must compute a target beyond the
    // generation published here.
    {
        let mut state = shared.sync_state.lock();
        state.generation += 1;
    }
    shared.sync_done.notify_all();
    drop(wal);
    Ok(())
}
