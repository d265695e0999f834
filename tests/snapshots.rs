//! # Snapshot Semantics Integration Tests
//!
//! Isolation between snapshots, root commits, reset_to, and the
//! storage-accounting invariant that a full teardown returns every page
//! to the allocator.

use ebakusdb::{Db, Options};

fn open_memory() -> Db {
    Db::open_in_memory(Options::default()).unwrap()
}

#[test]
fn snapshot_isolation_across_commits() {
    let db = open_memory();

    let snap = db.root_snapshot();
    snap.insert(b"key", b"value").unwrap();
    snap.insert(b"harry", b"kalogirou").unwrap();
    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    let frozen = db.root_snapshot();

    let writer = db.root_snapshot();
    let (_, updated) = writer.insert(b"harry", b"Kal").unwrap();
    assert!(updated);

    // Not yet committed: the store still serves the old value.
    assert_eq!(db.get(b"harry").as_deref(), Some(b"kalogirou".as_ref()));

    db.set_root_snapshot(&writer).unwrap();
    drop(writer);

    // The frozen snapshot is unaffected by the commit.
    assert_eq!(frozen.get(b"key").as_deref(), Some(b"value".as_ref()));
    assert_eq!(frozen.get(b"harry").as_deref(), Some(b"kalogirou".as_ref()));

    // The store serves the new tree.
    assert_eq!(db.get(b"harry").as_deref(), Some(b"Kal".as_ref()));
}

#[test]
fn fork_isolates_later_writes() {
    let db = open_memory();

    let parent = db.root_snapshot();
    parent.insert(b"harry", b"kalogirou").unwrap();

    let fork = parent.snapshot();

    parent.insert(b"harry", b"Kal").unwrap();
    parent.insert(b"extra", b"row").unwrap();

    assert_eq!(fork.get(b"harry").as_deref(), Some(b"kalogirou".as_ref()));
    assert_eq!(fork.get(b"extra"), None);
    assert_eq!(parent.get(b"harry").as_deref(), Some(b"Kal".as_ref()));
}

#[test]
fn reset_to_abandons_changes() {
    let db = open_memory();

    let snap = db.root_snapshot();
    snap.insert(b"name", b"Harry").unwrap();

    let checkpoint = snap.snapshot();

    snap.insert(b"name", b"Harry who?").unwrap();
    assert_eq!(snap.get(b"name").as_deref(), Some(b"Harry who?".as_ref()));

    snap.reset_to(&checkpoint);
    drop(checkpoint);

    assert_eq!(snap.get(b"name").as_deref(), Some(b"Harry".as_ref()));
}

#[test]
fn reset_to_same_tree_is_a_noop() {
    let db = open_memory();

    let snap = db.root_snapshot();
    snap.insert(b"key", b"value").unwrap();
    let twin = snap.snapshot();

    snap.reset_to(&twin);
    drop(twin);

    assert_eq!(snap.get(b"key").as_deref(), Some(b"value".as_ref()));
}

#[test]
fn snapshot_iterators_see_their_own_tree() {
    let db = open_memory();

    let snap = db.root_snapshot();
    snap.insert(b"a", b"1").unwrap();
    snap.insert(b"b", b"2").unwrap();
    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    let frozen = db.root_snapshot();

    let writer = db.root_snapshot();
    writer.insert(b"c", b"3").unwrap();
    db.set_root_snapshot(&writer).unwrap();
    drop(writer);

    let mut iter = frozen.iter();
    let mut keys = Vec::new();
    while let Some((key, _)) = iter.next_entry() {
        keys.push(key);
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    drop(iter);

    let mut iter = db.iter();
    let mut keys = Vec::new();
    while let Some((key, _)) = iter.next_entry() {
        keys.push(key);
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn teardown_returns_storage_to_the_allocator() {
    let db = open_memory();
    let baseline = db.info().total_used;

    let keys: &[&[u8]] = &[b"Harry", b"Kalogirou", b"Anna", b"Alexiou"];

    let snap = db.root_snapshot();
    for (i, key) in keys.iter().enumerate() {
        snap.insert(key, format!("value-{i}").as_bytes()).unwrap();
    }
    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    assert!(db.info().total_used > baseline);

    let snap = db.root_snapshot();
    for key in keys {
        assert!(snap.delete(key).unwrap());
    }
    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    // Every page allocated for the four entries is reachable only from
    // the replaced roots; once those are released the accounting returns
    // to the post-open footprint.
    assert_eq!(db.info().total_used, baseline);
}

#[test]
fn dropping_an_uncommitted_snapshot_releases_its_pages() {
    let db = open_memory();
    let baseline = db.info().total_used;

    {
        let snap = db.root_snapshot();
        snap.insert(b"temporary", b"data").unwrap();
        assert!(db.info().total_used > baseline);
    }

    assert_eq!(db.info().total_used, baseline);
}

#[test]
fn concurrent_snapshots_mutate_independently() {
    let db = open_memory();

    let snap = db.root_snapshot();
    snap.insert(b"shared", b"base").unwrap();
    db.set_root_snapshot(&snap).unwrap();
    drop(snap);

    std::thread::scope(|scope| {
        let db = &db;
        let mut workers = Vec::new();
        for worker in 0..4u32 {
            workers.push(scope.spawn(move || {
                let snap = db.root_snapshot();
                for i in 0..100u32 {
                    let key = format!("w{worker}-{i}");
                    snap.insert(key.as_bytes(), &worker.to_be_bytes()).unwrap();
                }
                // Each snapshot sees the base entry plus its own writes.
                assert_eq!(snap.get(b"shared").as_deref(), Some(b"base".as_ref()));
                for i in 0..100u32 {
                    let key = format!("w{worker}-{i}");
                    assert_eq!(
                        snap.get(key.as_bytes()).as_deref(),
                        Some(worker.to_be_bytes().as_ref())
                    );
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
    });

    // No snapshot was committed; the store still holds only the base.
    assert_eq!(db.get(b"shared").as_deref(), Some(b"base".as_ref()));
    assert_eq!(db.get(b"w0-0"), None);
}
