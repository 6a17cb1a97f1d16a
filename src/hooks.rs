//! Fault-injection capability object.
//!
//! Crash-safety tests need to interrupt the checkpoint protocol at precise
//! points and to make individual folders fail their writes. Production
//! code asks the hooks before each such step; the default implementation
//! never injects anything, so release builds pay a virtual call and
//! nothing more.
//!
//! Recognized disruption tags:
//!
//! - `"settings-rename"`: skip writing and renaming the settings
//!   snapshot during a checkpoint. The WAL is then kept in place so the
//!   records stay replayable.
//! - `"wal-rename"`: keep appending to the current WAL instead of
//!   rotating it after a successful snapshot.
//! - `"wal-cleanup"`: leave the rotated `wal.dat.tmp` on disk instead of
//!   deleting it.

use std::path::Path;

/// Injection points consulted by the store. All methods default to
/// "do not inject".
pub trait Hooks: Send + Sync + 'static {
    /// Returns true when the step identified by `tag` should be skipped.
    fn disrupt(&self, _tag: &str) -> bool {
        false
    }

    /// Returns true when a write touching `path` should fail instead of
    /// reaching the disk.
    fn fail_write(&self, _path: &Path) -> bool {
        false
    }
}

/// Production hooks: never disrupt, never fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProductionHooks;

impl Hooks for ProductionHooks {}
