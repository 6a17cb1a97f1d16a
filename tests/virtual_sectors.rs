//! Reference counting for duplicate roots: serial and parallel virtual
//! adds, batch adds, and the remove/delete distinction.

use std::sync::Arc;
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

fn one_granule() -> u64 {
    SECTOR_SIZE as u64 * STORAGE_FOLDER_GRANULARITY as u64
}

#[test]
fn serial_double_add_consumes_one_slot() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = open_store(&store_dir);
    store.add_storage_folder(&folder_dir, one_granule()).unwrap();

    let (root, data) = rand_sector();
    store.add_sector(root, &data).unwrap();
    store.add_sector(root, &data).unwrap();

    let folders = store.storage_folders();
    assert_eq!(
        folders[0].capacity,
        folders[0].capacity_remaining + SECTOR_SIZE as u64,
        "a virtual add must not consume a second slot"
    );

    // Two references: the first remove keeps the sector alive.
    store.remove_sector(root).unwrap();
    assert_eq!(store.read_sector(root).unwrap(), data);
    store.remove_sector(root).unwrap();
    let err = store.read_sector(root).unwrap_err();
    assert_eq!(error_kind(&err), Some(StoreError::NotFound));

    store.close().unwrap();
}

#[test]
fn double_add_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();
    let (root, data) = rand_sector();

    {
        let store = open_store(&store_dir);
        store.add_storage_folder(&folder_dir, one_granule()).unwrap();
        store.add_sector(root, &data).unwrap();
        store.add_sector(root, &data).unwrap();
        store.close().unwrap();
    }

    let store = open_store(&store_dir);
    // The count of 2 must have persisted: two removes reach zero.
    store.remove_sector(root).unwrap();
    assert_eq!(store.read_sector(root).unwrap(), data);
    store.remove_sector(root).unwrap();
    assert_eq!(
        error_kind(&store.read_sector(root).unwrap_err()),
        Some(StoreError::NotFound)
    );
    store.close().unwrap();
}

#[test]
fn massively_parallel_adds_count_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = Arc::new(open_store(&store_dir));
    store.add_storage_folder(&folder_dir, one_granule()).unwrap();

    let (root, data) = rand_sector();
    let data = Arc::new(data);

    // 10 threads x 10 adds of the same root: one physical write, a count
    // of 100.
    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        let data = Arc::clone(&data);
        handles.push(std::thread::spawn(move || {
            for _ in 0..10 {
                store.add_sector(root, &data).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let folders = store.storage_folders();
    assert_eq!(
        folders[0].capacity,
        folders[0].capacity_remaining + SECTOR_SIZE as u64
    );

    // Exactly 100 removes succeed; the 101st finds nothing.
    for _ in 0..100 {
        store.remove_sector(root).unwrap();
    }
    assert_eq!(
        error_kind(&store.remove_sector(root).unwrap_err()),
        Some(StoreError::NotFound)
    );
    let folders = store.storage_folders();
    assert_eq!(folders[0].capacity, folders[0].capacity_remaining);

    store.close().unwrap();
}

#[test]
fn concurrent_first_adds_produce_one_write_and_count_two() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = Arc::new(open_store(&store_dir));
    store.add_storage_folder(&folder_dir, one_granule()).unwrap();

    let (root, data) = rand_sector();
    let data = Arc::new(data);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let store = Arc::clone(&store);
        let data = Arc::clone(&data);
        handles.push(std::thread::spawn(move || {
            store.add_sector(root, &data).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let folders = store.storage_folders();
    assert_eq!(
        folders[0].capacity,
        folders[0].capacity_remaining + SECTOR_SIZE as u64,
        "the losing racer must become a count increment, not a second slot"
    );

    store.remove_sector(root).unwrap();
    store.remove_sector(root).unwrap();
    assert_eq!(
        error_kind(&store.remove_sector(root).unwrap_err()),
        Some(StoreError::NotFound)
    );

    store.close().unwrap();
}

#[test]
fn batch_add_increments_known_roots_and_reports_unknown_ones() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = open_store(&store_dir);
    store.add_storage_folder(&folder_dir, one_granule()).unwrap();

    let (known, data) = rand_sector();
    let (unknown, _) = rand_sector();
    store.add_sector(known, &data).unwrap();

    let failures = store
        .add_sector_batch(&[known, unknown, known])
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, unknown);
    assert_eq!(error_kind(&failures[0].1), Some(StoreError::NotFound));

    // 1 physical + 2 batch increments = 3 references.
    for _ in 0..3 {
        store.remove_sector(known).unwrap();
    }
    assert_eq!(
        error_kind(&store.remove_sector(known).unwrap_err()),
        Some(StoreError::NotFound)
    );

    store.close().unwrap();
}

#[test]
fn delete_drops_all_references_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let folder_dir = dir.path().join("folder");
    std::fs::create_dir_all(&folder_dir).unwrap();

    let store = open_store(&store_dir);
    store.add_storage_folder(&folder_dir, one_granule()).unwrap();

    let (root, data) = rand_sector();
    for _ in 0..5 {
        store.add_sector(root, &data).unwrap();
    }

    store.delete_sector(root).unwrap();

    assert_eq!(
        error_kind(&store.read_sector(root).unwrap_err()),
        Some(StoreError::NotFound)
    );
    let folders = store.storage_folders();
    assert_eq!(folders[0].capacity, folders[0].capacity_remaining);

    store.close().unwrap();
}
