//! Crash safety: every fault point of the checkpoint protocol is
//! injected in turn, and a reopened store must come back with every
//! acknowledged write intact.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use sectorstore::{
    error_kind, Hooks, MerkleRoot, SectorStore, StoreError, SECTOR_SIZE,
    STORAGE_FOLDER_GRANULARITY,
};

fn rand_sector() -> (MerkleRoot, Vec<u8>) {
    let mut rng = rand::thread_rng();
    let mut root = [0u8; 32];
    rng.fill_bytes(&mut root);
    let mut data = vec![0u8; SECTOR_SIZE];
    rng.fill_bytes(&mut data);
    (MerkleRoot(root), data)
}

fn one_granule() -> u64 {
    SECTOR_SIZE as u64 * STORAGE_FOLDER_GRANULARITY as u64
}

/// Skips a set of checkpoint steps for the whole lifetime of the store,
/// simulating a crash window between the WAL fsync and the snapshot.
struct SkipSteps {
    tags: &'static [&'static str],
}

impl SkipSteps {
    fn new(tags: &'static [&'static str]) -> Arc<Self> {
        Arc::new(Self { tags })
    }
}

impl Hooks for SkipSteps {
    fn disrupt(&self, tag: &str) -> bool {
        self.tags.contains(&tag)
    }
}

fn open_with_hooks(dir: &Path, hooks: Arc<dyn Hooks>) -> SectorStore {
    SectorStore::builder(dir)
        .sync_interval(Duration::from_millis(20))
        .hooks(hooks)
        .open()
        .unwrap()
}

fn open_clean(dir: &Path) -> SectorStore {
    SectorStore::builder(dir)
        .sync_interval(Duration::from_millis(20))
        .open()
        .unwrap()
}

/// The settings snapshot never lands: everything must come back from the
/// WAL alone.
#[test]
fn recovery_from_wal_when_settings_never_saved() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();
    let (root, data) = rand_sector();

    {
        let hooks = SkipSteps::new(&["settings-rename"]);
        let store = open_with_hooks(&store_dir, hooks);
        store.add_storage_folder(&folder_dir, one_granule()).unwrap();
        store.add_sector(root, &data).unwrap();
        store.close().unwrap();
    }

    // The crash window left records in the WAL and no snapshot.
    assert!(!store_dir.join("settings.dat").exists());
    assert!(store_dir.join("wal.dat").metadata().unwrap().len() > 0);

    let store = open_clean(&store_dir);
    let folders = store.storage_folders();
    assert_eq!(folders.len(), 1);
    assert_eq!(
        folders[0].capacity_remaining,
        63 * SECTOR_SIZE as u64,
        "the acknowledged sector must survive"
    );
    assert_eq!(store.read_sector(root).unwrap(), data);
    store.close().unwrap();
}

/// The snapshot lands but the WAL is never rotated: replaying the stale
/// records over the snapshot must be harmless.
#[test]
fn recovery_with_unrotated_wal() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();
    let (root, data) = rand_sector();
    let (root2, data2) = rand_sector();

    {
        let hooks = SkipSteps::new(&["wal-rename"]);
        let store = open_with_hooks(&store_dir, hooks);
        store.add_storage_folder(&folder_dir, one_granule()).unwrap();
        store.add_sector(root, &data).unwrap();
        store.add_sector(root2, &data2).unwrap();
        store.remove_sector(root2).unwrap();
        store.close().unwrap();
    }

    assert!(store_dir.join("settings.dat").exists());
    assert!(store_dir.join("wal.dat").metadata().unwrap().len() > 0);

    let store = open_clean(&store_dir);
    assert_eq!(store.read_sector(root).unwrap(), data);
    assert_eq!(
        error_kind(&store.read_sector(root2).unwrap_err()),
        Some(StoreError::NotFound)
    );
    let folders = store.storage_folders();
    assert_eq!(folders[0].capacity_remaining, 63 * SECTOR_SIZE as u64);
    store.close().unwrap();
}

/// The rotated WAL is never deleted: the stale `wal.dat.tmp` replays
/// before the fresh log and must not corrupt anything.
#[test]
fn recovery_with_stale_rotated_wal() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();
    let (root, data) = rand_sector();

    {
        let hooks = SkipSteps::new(&["wal-cleanup"]);
        let store = open_with_hooks(&store_dir, hooks);
        store.add_storage_folder(&folder_dir, one_granule()).unwrap();
        store.add_sector(root, &data).unwrap();
        store.add_sector(root, &data).unwrap();
        store.close().unwrap();
    }

    assert!(store_dir.join("wal.dat.tmp").exists());

    let store = open_clean(&store_dir);
    assert_eq!(store.read_sector(root).unwrap(), data);

    // The reference count of 2 must not have been inflated by the
    // double replay.
    store.remove_sector(root).unwrap();
    store.remove_sector(root).unwrap();
    assert_eq!(
        error_kind(&store.remove_sector(root).unwrap_err()),
        Some(StoreError::NotFound)
    );

    // The clean reopen's checkpoint finally removed the stale log.
    assert!(!store_dir.join("wal.dat.tmp").exists());
    store.close().unwrap();
}

/// All three fault points at once, across several operations.
#[test]
fn recovery_with_every_step_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_a = dir.path().join("a");
    let folder_b = dir.path().join("b");
    std::fs::create_dir_all(&folder_a).unwrap();
    std::fs::create_dir_all(&folder_b).unwrap();

    let sectors: Vec<(MerkleRoot, Vec<u8>)> = (0..8).map(|_| rand_sector()).collect();
    {
        let hooks = SkipSteps::new(&["settings-rename", "wal-rename", "wal-cleanup"]);
        let store = open_with_hooks(&store_dir, hooks);
        store.add_storage_folder(&folder_a, one_granule()).unwrap();
        store.add_storage_folder(&folder_b, one_granule()).unwrap();
        for (root, data) in &sectors {
            store.add_sector(*root, data).unwrap();
        }
        // A second reference on the first sector, and one sector removed.
        store.add_sector(sectors[0].0, &sectors[0].1).unwrap();
        store.remove_sector(sectors[7].0).unwrap();
        store.close().unwrap();
    }

    let store = open_clean(&store_dir);
    assert_eq!(store.storage_folders().len(), 2);
    for (root, data) in &sectors[..7] {
        assert_eq!(&store.read_sector(*root).unwrap(), data);
    }
    assert_eq!(
        error_kind(&store.read_sector(sectors[7].0).unwrap_err()),
        Some(StoreError::NotFound)
    );

    // sectors[0] carries two references.
    store.remove_sector(sectors[0].0).unwrap();
    assert_eq!(store.read_sector(sectors[0].0).unwrap(), sectors[0].1);
    store.close().unwrap();
}

#[test]
fn corrupt_settings_abort_startup() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    {
        let store = open_clean(&store_dir);
        store.add_storage_folder(&folder_dir, one_granule()).unwrap();
        store.close().unwrap();
    }

    std::fs::write(store_dir.join("settings.dat"), b"{definitely not settings")
        .unwrap();

    let err = SectorStore::builder(&store_dir).open().unwrap_err();
    assert_eq!(error_kind(&err), Some(StoreError::Corrupt));
}

#[test]
fn second_opener_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");

    let store = open_clean(&store_dir);
    assert!(SectorStore::builder(&store_dir).open().is_err());
    store.close().unwrap();

    // After close the directory lock is released with the store.
    drop(store);
    let store = open_clean(&store_dir);
    store.close().unwrap();
}
