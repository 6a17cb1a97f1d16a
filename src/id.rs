//! Sector identifiers and the salted balancing hash.
//!
//! A sector's identity is the Merkle root of its contents. Internally the
//! store keys everything on a 12-byte prefix of that root: at 96 bits the
//! collision probability across any realistic sector population is
//! negligible, and the shorter key keeps the metadata file at 14 bytes
//! per slot.

use std::fmt;

/// A 32-byte Merkle root identifying a sector's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MerkleRoot(pub [u8; 32]);

/// The 12-byte map key derived from a Merkle root.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorId(pub [u8; 12]);

impl SectorId {
    pub fn from_root(root: &MerkleRoot) -> Self {
        let mut id = [0u8; 12];
        id.copy_from_slice(&root.0[..12]);
        Self(id)
    }

    /// Shard index for the location maps and keyed locks.
    #[inline]
    pub fn shard(&self) -> usize {
        self.0[0] as usize
    }
}

impl fmt::Debug for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Deterministic balancing hash: mixes the persisted salt with the sector
/// ID and a retry counter. The same (salt, id, attempt) triple always
/// lands on the same folder candidate, while different salts give
/// different hosts independent placements.
pub fn balance_hash(salt: &[u8; 16], id: &SectorId, attempt: u32) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(&id.0);
    hasher.update(&attempt.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

/// Generates a fresh 16-byte salt for a brand-new store.
pub fn generate_salt() -> [u8; 16] {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = blake3::Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    let digest = hasher.finalize();

    let mut salt = [0u8; 16];
    salt.copy_from_slice(&digest.as_bytes()[..16]);
    salt
}
