//! # Key/Value Store Integration Tests
//!
//! End-to-end coverage of the raw snapshot surface: CRUD through
//! snapshots, prefix-overlapping keys, ordered iteration with prefix
//! seek, persistence across reopen, the guard-file protocol and the
//! error taxonomy of `open`.

use ebakusdb::{Db, Options, StoreError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn open_memory() -> Db {
    Db::open_in_memory(Options::default()).unwrap()
}

#[test]
fn basic_crud_through_snapshots() {
    let db = open_memory();

    let snap = db.root_snapshot();

    let (old, updated) = snap.insert(b"key", b"value").unwrap();
    assert_eq!(old, None);
    assert!(!updated);

    let (old, updated) = snap.insert(b"key", b"va").unwrap();
    assert_eq!(old.as_deref(), Some(b"value".as_ref()));
    assert!(updated);

    let (_, updated) = snap.insert(b"harry", b"kalogirou").unwrap();
    assert!(!updated);

    assert_eq!(snap.get(b"key").as_deref(), Some(b"va".as_ref()));

    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    assert_eq!(db.get(b"key").as_deref(), Some(b"va".as_ref()));
    assert_eq!(db.get(b"harry").as_deref(), Some(b"kalogirou".as_ref()));
    assert_eq!(db.get(b"nope"), None);
}

#[test]
fn uncommitted_changes_stay_invisible() {
    let db = open_memory();

    let snap = db.root_snapshot();
    snap.insert(b"key", b"value").unwrap();

    assert_eq!(db.get(b"key"), None);

    db.set_root_snapshot(&snap).unwrap();
    assert_eq!(db.get(b"key").as_deref(), Some(b"value".as_ref()));
}

#[test]
fn key_prefix_subsets_resolve_independently() {
    let db = open_memory();

    let snap = db.root_snapshot();
    let (_, updated) = snap.insert(b"key_long", b"value").unwrap();
    assert!(!updated);
    let (_, updated) = snap.insert(b"key", b"value2").unwrap();
    assert!(!updated);
    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    assert_eq!(db.get(b"key_long").as_deref(), Some(b"value".as_ref()));
    assert_eq!(db.get(b"key").as_deref(), Some(b"value2".as_ref()));
}

#[test]
fn delete_removes_and_reports() {
    let db = open_memory();

    let snap = db.root_snapshot();
    snap.insert(b"key", b"value the big universe dude").unwrap();
    snap.insert(b"harry", b"NEW VALUE").unwrap();
    snap.insert(b"bobby", b"NEW").unwrap();

    assert!(snap.delete(b"key").unwrap());
    assert!(snap.delete(b"harry").unwrap());
    assert!(snap.delete(b"bobby").unwrap());
    assert!(!snap.delete(b"missing").unwrap());

    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    assert_eq!(db.get(b"key"), None);
    assert_eq!(db.get(b"harry"), None);
    assert_eq!(db.get(b"bobby"), None);
}

#[test]
fn iteration_order_and_prefix_seek() {
    let db = open_memory();

    let snap = db.root_snapshot();
    snap.insert(b"Harry", b"value the big universe dude").unwrap();
    snap.insert(b"Kalogirou", b"this is a last name").unwrap();
    snap.insert(b"Anna", b"Easy name").unwrap();
    snap.insert(b"Alexiou", b"Girl").unwrap();
    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    let mut iter = db.iter();
    iter.seek_prefix(b"A");

    let (key, value) = iter.next_entry().unwrap();
    assert_eq!((key.as_slice(), value.as_slice()), (b"Alexiou".as_ref(), b"Girl".as_ref()));
    let (key, _) = iter.next_entry().unwrap();
    assert_eq!(key, b"Anna");
    assert!(iter.next_entry().is_none());
    drop(iter);

    let mut iter = db.iter();
    iter.next_entry().unwrap();
    iter.next_entry().unwrap();
    let (key, value) = iter.next_entry().unwrap();
    assert_eq!(key, b"Harry");
    assert_eq!(value, b"value the big universe dude");
    let (key, _) = iter.next_entry().unwrap();
    assert_eq!(key, b"Kalogirou");
    assert!(iter.next_entry().is_none());
    drop(iter);

    let mut iter = db.iter();
    iter.seek_prefix(b"G");
    assert!(iter.next_entry().is_none());
}

#[test]
fn reverse_iteration() {
    let db = open_memory();

    let snap = db.root_snapshot();
    for key in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
        snap.insert(key, b"x").unwrap();
    }
    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    let mut iter = db.iter();
    let mut keys = Vec::new();
    while let Some((key, _)) = iter.prev_entry() {
        keys.push(key);
    }
    assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
}

#[test]
fn longest_prefix_finds_deepest_entry() {
    let db = open_memory();

    let snap = db.root_snapshot();
    snap.insert(b"key", b"short").unwrap();
    snap.insert(b"key_long", b"long").unwrap();

    let (key, value) = snap.longest_prefix(b"key_longer").unwrap();
    assert_eq!(key, b"key_long");
    assert_eq!(value, b"long");

    let (key, _) = snap.longest_prefix(b"keyhole").unwrap();
    assert_eq!(key, b"key");

    assert!(snap.longest_prefix(b"zzz").is_none());
}

#[test]
fn kilobyte_values_roundtrip() {
    let db = open_memory();
    let snap = db.root_snapshot();

    let mut value = vec![0u8; 1024];
    value[0] = 30;

    snap.insert(b"key", &value).unwrap();
    assert_eq!(snap.get(b"key").as_deref(), Some(value.as_slice()));
}

#[test]
fn oversize_value_is_rejected() {
    let db = open_memory();
    let snap = db.root_snapshot();

    let huge = vec![0u8; ebakusdb::MAX_DATA_SIZE as usize];
    let err = snap.insert(b"key", &huge).unwrap_err();
    assert_eq!(
        err.downcast_ref::<StoreError>(),
        Some(&StoreError::InvalidSize)
    );
}

#[test]
fn persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.edb");

    {
        let db = Db::open(&path, Options::default()).unwrap();
        let snap = db.root_snapshot();
        snap.insert(b"harry", b"kalogirou").unwrap();
        snap.insert(b"key", b"value").unwrap();
        db.set_root_snapshot(&snap).unwrap();
        drop(snap);
        db.close().unwrap();
    }

    let db = Db::open(&path, Options::default()).unwrap();
    assert_eq!(db.get(b"harry").as_deref(), Some(b"kalogirou".as_ref()));
    assert_eq!(db.get(b"key").as_deref(), Some(b"value".as_ref()));
}

#[test]
fn randomized_soak_with_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("soak.edb");
    let mut rng = StdRng::seed_from_u64(1);

    let mut pairs = Vec::new();
    for _ in 0..2000 {
        let key: Vec<u8> = (0..64).map(|_| rng.gen_range(b'a'..=b'z')).collect();
        let value: Vec<u8> = (0..120).map(|_| rng.gen()).collect();
        pairs.push((key, value));
    }

    {
        let db = Db::open(&path, Options::default()).unwrap();
        let snap = db.root_snapshot();
        for (key, value) in &pairs {
            snap.insert(key, value).unwrap();
        }
        db.set_root_snapshot(&snap).unwrap();
        drop(snap);

        for (key, value) in &pairs {
            assert_eq!(db.get(key).as_deref(), Some(value.as_slice()));
        }
        db.close().unwrap();
    }

    let db = Db::open(&path, Options::default()).unwrap();
    for (key, value) in &pairs {
        assert_eq!(db.get(key).as_deref(), Some(value.as_slice()));
    }

    let snap = db.root_snapshot();
    for (key, _) in &pairs {
        assert!(snap.delete(key).unwrap());
    }
    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    for (key, _) in &pairs {
        assert_eq!(db.get(key), None);
    }
}

#[test]
fn guard_file_flags_unclean_shutdown() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dirty.edb");

    let db = Db::open(&path, Options::default()).unwrap();
    // Simulate a crash: the guard file is never removed.
    std::mem::forget(db);

    let err = Db::open(&path, Options::default()).unwrap_err();
    assert_eq!(
        err.downcast_ref::<StoreError>(),
        Some(&StoreError::DirtyDatabase)
    );

    let mut guard = path.as_os_str().to_owned();
    guard.push("~");
    std::fs::remove_file(guard).unwrap();

    let db = Db::open(&path, Options::default()).unwrap();
    db.close().unwrap();
}

#[test]
fn clean_close_removes_guard_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clean.edb");

    let db = Db::open(&path, Options::default()).unwrap();
    db.close().unwrap();

    let mut guard = path.as_os_str().to_owned();
    guard.push("~");
    assert!(!std::path::Path::new(&guard).exists());

    Db::open(&path, Options::default()).unwrap();
}

#[test]
fn foreign_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.edb");
    std::fs::write(&path, vec![0xAAu8; 4096]).unwrap();

    let err = Db::open(&path, Options::default()).unwrap_err();
    assert_eq!(
        err.downcast_ref::<StoreError>(),
        Some(&StoreError::FormatError)
    );

    // The failed open must not leave its guard file behind.
    let mut guard = path.as_os_str().to_owned();
    guard.push("~");
    assert!(!std::path::Path::new(&guard).exists());
}

#[test]
fn read_only_refuses_mutation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.edb");

    {
        let db = Db::open(&path, Options::default()).unwrap();
        let snap = db.root_snapshot();
        snap.insert(b"key", b"value").unwrap();
        db.set_root_snapshot(&snap).unwrap();
    }

    let db = Db::open(&path, Options { read_only: true }).unwrap();
    assert_eq!(db.get(b"key").as_deref(), Some(b"value".as_ref()));

    let snap = db.root_snapshot();
    assert!(snap.insert(b"key", b"other").is_err());
    assert!(snap.delete(b"key").is_err());
    assert!(db.set_root_snapshot(&snap).is_err());
}

#[test]
fn info_reports_allocator_state() {
    let db = open_memory();
    let info = db.info();

    assert_eq!(info.page_size, 192);
    assert_eq!(info.buffer_start, 192);
    assert!(info.total_used >= info.page_size as u64);
    assert_eq!(info.total_capacity, 16 * 1024 * 1024);
    assert!(info.watermark >= info.buffer_start as u64);
}
