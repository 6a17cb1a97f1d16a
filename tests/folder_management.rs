//! Storage folder lifecycle: validation, add, remove with relocation,
//! forced removal, and resizing in both directions.

use std::time::Duration;

use rand::RngCore;
use sectorstore::{
    error_kind, MerkleRoot, SectorStore, StoreError, SECTOR_SIZE, STORAGE_FOLDER_GRANULARITY,
};

fn open_store(dir: &std::path::Path) -> SectorStore {
    SectorStore::builder(dir)
        .sync_interval(Duration::from_millis(20))
        .open()
        .unwrap()
}

fn rand_sector() -> (MerkleRoot, Vec<u8>) {
    let mut rng = rand::thread_rng();
    let mut root = [0u8; 32];
    rng.fill_bytes(&mut root);
    let mut data = vec![0u8; SECTOR_SIZE];
    rng.fill_bytes(&mut data);
    (MerkleRoot(root), data)
}

fn granules(n: u64) -> u64 {
    SECTOR_SIZE as u64 * STORAGE_FOLDER_GRANULARITY as u64 * n
}

#[test]
fn folder_size_must_be_granule_aligned() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = open_store(&store_dir);

    assert!(store.add_storage_folder(&folder_dir, 0).is_err());
    assert!(store
        .add_storage_folder(&folder_dir, granules(1) + SECTOR_SIZE as u64)
        .is_err());
    assert!(store
        .add_storage_folder(&folder_dir, SECTOR_SIZE as u64)
        .is_err());

    // An aligned size is accepted.
    store.add_storage_folder(&folder_dir, granules(1)).unwrap();
    store.close().unwrap();
}

#[test]
fn duplicate_folder_path_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = open_store(&store_dir);
    store.add_storage_folder(&folder_dir, granules(1)).unwrap();

    let err = store
        .add_storage_folder(&folder_dir, granules(1))
        .unwrap_err();
    assert_eq!(error_kind(&err), Some(StoreError::AlreadyExists));

    store.close().unwrap();
}

#[test]
fn folder_indexes_are_reused_after_removal() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let store = open_store(&store_dir);

    for name in ["a", "b", "c"] {
        let folder_dir = dir.path().join(name);
        std::fs::create_dir_all(&folder_dir).unwrap();
        store.add_storage_folder(&folder_dir, granules(1)).unwrap();
    }
    let indexes: Vec<u16> = store.storage_folders().iter().map(|f| f.index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);

    store.remove_storage_folder(1, false).unwrap();
    let folder_dir = dir.path().join("d");
    std::fs::create_dir_all(&folder_dir).unwrap();
    store.add_storage_folder(&folder_dir, granules(1)).unwrap();

    let indexes: Vec<u16> = store.storage_folders().iter().map(|f| f.index).collect();
    assert_eq!(indexes, vec![0, 1, 2], "index 1 should be reused");

    store.close().unwrap();
}

#[test]
fn remove_relocates_sectors_to_surviving_folders() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_a = dir.path().join("a");
    let folder_b = dir.path().join("b");
    std::fs::create_dir_all(&folder_a).unwrap();
    std::fs::create_dir_all(&folder_b).unwrap();

    let store = open_store(&store_dir);
    store.add_storage_folder(&folder_a, granules(1)).unwrap();
    store.add_storage_folder(&folder_b, granules(1)).unwrap();

    let sectors: Vec<(MerkleRoot, Vec<u8>)> = (0..10).map(|_| rand_sector()).collect();
    for (root, data) in &sectors {
        store.add_sector(*root, data).unwrap();
    }

    store.remove_storage_folder(0, false).unwrap();

    let folders = store.storage_folders();
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].index, 1);
    assert_eq!(
        folders[0].capacity,
        folders[0].capacity_remaining + 10 * SECTOR_SIZE as u64,
        "all ten sectors should now live in the surviving folder"
    );
    for (root, data) in &sectors {
        assert_eq!(&store.read_sector(*root).unwrap(), data);
    }

    // The retired folder's files are gone.
    assert!(!folder_a.join("siahostdata.dat").exists());
    assert!(!folder_a.join("siahostmetadata.dat").exists());

    store.close().unwrap();
}

#[test]
fn relocated_sectors_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_a = dir.path().join("a");
    let folder_b = dir.path().join("b");
    std::fs::create_dir_all(&folder_a).unwrap();
    std::fs::create_dir_all(&folder_b).unwrap();
    let sectors: Vec<(MerkleRoot, Vec<u8>)> = (0..6).map(|_| rand_sector()).collect();

    {
        let store = open_store(&store_dir);
        store.add_storage_folder(&folder_a, granules(1)).unwrap();
        store.add_storage_folder(&folder_b, granules(1)).unwrap();
        for (root, data) in &sectors {
            store.add_sector(*root, data).unwrap();
        }
        store.remove_storage_folder(0, false).unwrap();
        store.close().unwrap();
    }

    let store = open_store(&store_dir);
    assert_eq!(store.storage_folders().len(), 1);
    for (root, data) in &sectors {
        assert_eq!(&store.read_sector(*root).unwrap(), data);
    }
    store.close().unwrap();
}

#[test]
fn remove_without_space_needs_force() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = open_store(&store_dir);
    store.add_storage_folder(&folder_dir, granules(1)).unwrap();

    let (root, data) = rand_sector();
    store.add_sector(root, &data).unwrap();

    // Nowhere to relocate: a plain removal fails and changes nothing.
    let err = store.remove_storage_folder(0, false).unwrap_err();
    assert_eq!(error_kind(&err), Some(StoreError::InsufficientStorage));
    assert_eq!(store.storage_folders().len(), 1);
    assert_eq!(store.read_sector(root).unwrap(), data);

    // A forced removal drops the sector and retires the folder.
    store.remove_storage_folder(0, true).unwrap();
    assert!(store.storage_folders().is_empty());
    assert_eq!(
        error_kind(&store.read_sector(root).unwrap_err()),
        Some(StoreError::NotFound)
    );

    store.close().unwrap();
}

#[test]
fn grow_extends_capacity_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = open_store(&store_dir);
    store.add_storage_folder(&folder_dir, granules(1)).unwrap();

    let (root, data) = rand_sector();
    store.add_sector(root, &data).unwrap();

    store.resize_storage_folder(0, granules(2)).unwrap();

    let folders = store.storage_folders();
    assert_eq!(folders[0].capacity, granules(2));
    assert_eq!(
        folders[0].capacity_remaining,
        granules(2) - SECTOR_SIZE as u64
    );
    assert_eq!(store.read_sector(root).unwrap(), data);

    store.close().unwrap();
}

#[test]
fn shrink_relocates_displaced_sectors() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_a = dir.path().join("a");
    let folder_b = dir.path().join("b");
    std::fs::create_dir_all(&folder_a).unwrap();
    std::fs::create_dir_all(&folder_b).unwrap();

    let store = open_store(&store_dir);
    store.add_storage_folder(&folder_a, granules(2)).unwrap();

    // Fill 100 of folder 0's 128 slots while it is the only folder, so
    // slots past the first granule are definitely occupied.
    let sectors: Vec<(MerkleRoot, Vec<u8>)> = (0..100).map(|_| rand_sector()).collect();
    for (root, data) in &sectors {
        store.add_sector(*root, data).unwrap();
    }

    store.add_storage_folder(&folder_b, granules(1)).unwrap();
    store.resize_storage_folder(0, granules(1)).unwrap();

    let folders = store.storage_folders();
    assert_eq!(folders[0].capacity, granules(1));
    let total_capacity: u64 = folders.iter().map(|f| f.capacity).sum();
    let total_remaining: u64 = folders.iter().map(|f| f.capacity_remaining).sum();
    assert_eq!(
        total_capacity,
        total_remaining + 100 * SECTOR_SIZE as u64,
        "no sector may be lost by the shrink"
    );
    for (root, data) in &sectors {
        assert_eq!(&store.read_sector(*root).unwrap(), data);
    }

    store.close().unwrap();
}

#[test]
fn shrink_fails_when_sectors_cannot_move() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = open_store(&store_dir);
    store.add_storage_folder(&folder_dir, granules(2)).unwrap();

    // Fill the folder completely: a shrink to one granule cannot fit 128
    // sectors anywhere.
    for _ in 0..128 {
        let (root, data) = rand_sector();
        store.add_sector(root, &data).unwrap();
    }

    let err = store.resize_storage_folder(0, granules(1)).unwrap_err();
    assert_eq!(error_kind(&err), Some(StoreError::InsufficientStorage));

    // The folder still reports its original shape.
    let folders = store.storage_folders();
    assert_eq!(folders[0].capacity, granules(2));

    store.close().unwrap();
}

#[test]
fn lifecycle_ops_on_unknown_folder_fail() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let store = open_store(&store_dir);

    assert!(store.remove_storage_folder(9, false).is_err());
    assert!(store.resize_storage_folder(9, granules(1)).is_err());

    store.close().unwrap();
}
