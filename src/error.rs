//! Caller-distinguishable error kinds.
//!
//! Internally the crate uses `eyre` for error propagation and context, the
//! same way the rest of the storage layer reports failures. Conditions a
//! caller is expected to branch on are raised as a [`StoreError`] placed at
//! the root of the report; [`kind`] recovers the variant from any report
//! regardless of how much context has been layered on top.

use thiserror::Error;

/// Error kinds surfaced by the public API.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No sector with the given Merkle root is stored.
    #[error("sector not found")]
    NotFound,
    /// The payload length does not equal the sector size.
    #[error("sector data has the wrong size")]
    WrongSize,
    /// A partial read extends past the end of the sector.
    #[error("read range exceeds sector bounds")]
    OutOfBounds,
    /// Every storage folder was tried and none accepted the write.
    #[error("insufficient storage remaining to hold sector")]
    InsufficientStorage,
    /// A disk write failed; a retry may succeed on another folder.
    #[error("disk write failed")]
    DiskFault,
    /// The folder is currently being removed or resized.
    #[error("storage folder is busy")]
    FolderBusy,
    /// A storage folder is already registered at this path.
    #[error("storage folder already exists at this path")]
    AlreadyExists,
    /// The store is closing or already closed.
    #[error("sector store is shutting down")]
    ShuttingDown,
    /// Persisted state failed an integrity check at startup.
    #[error("persisted state is corrupt")]
    Corrupt,
}

/// Extracts the [`StoreError`] kind from a report, if one is present.
pub fn kind(report: &eyre::Report) -> Option<StoreError> {
    report.downcast_ref::<StoreError>().copied()
}
