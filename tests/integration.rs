//! End-to-end scenarios exercising the public API against a real directory.

mod common;

use std::time::Duration;

use cellardb::{
    BatchOptions, Cellar, CellarError, EventKind, IteratorOptions, Options, MB,
};
use common::{random_value, test_key};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_db() -> (Cellar, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Cellar::open(Options::default_in(dir.path())).unwrap();
    (db, dir)
}

// ---------------------------------------------------------------------------
// Basic operations
// ---------------------------------------------------------------------------

#[test]
fn test_basic_put_get_delete() {
    let (db, _dir) = open_db();

    db.put(b"name", b"cellardb").unwrap();
    assert_eq!(db.get(b"name").unwrap(), b"cellardb");

    db.delete(b"name").unwrap();
    assert!(matches!(db.get(b"name"), Err(CellarError::KeyNotFound)));

    db.close().unwrap();
}

#[test]
fn test_many_keys_roundtrip() {
    let (db, _dir) = open_db();

    let values: Vec<Vec<u8>> = (0..1_000).map(|_| random_value(64)).collect();
    for (i, value) in values.iter().enumerate() {
        db.put(&test_key(i), value).unwrap();
    }
    for (i, value) in values.iter().enumerate() {
        assert_eq!(db.get(&test_key(i)).unwrap(), *value);
    }
    assert_eq!(db.stats().unwrap().keys, 1_000);
}

#[test]
fn test_ttl_expiry_shrinks_store() {
    let (db, _dir) = open_db();

    db.put(b"stable", b"v").unwrap();
    db.put_with_ttl(b"k", b"v", Duration::from_millis(50)).unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"v");
    assert_eq!(db.stats().unwrap().keys, 2);

    std::thread::sleep(Duration::from_millis(100));
    assert!(matches!(db.get(b"k"), Err(CellarError::KeyNotFound)));
    assert_eq!(db.stats().unwrap().keys, 1);
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

#[test]
fn test_batch_atomic_commit() {
    let (db, _dir) = open_db();
    db.put(b"c", b"x").unwrap();

    let mut batch = db.new_batch(BatchOptions::default()).unwrap();
    batch.put(b"a", b"1").unwrap();
    batch.put(b"b", b"2").unwrap();
    batch.delete(b"c").unwrap();

    // Nothing is visible outside the batch before commit.
    assert!(matches!(db.get(b"a"), Err(CellarError::KeyNotFound)));
    assert_eq!(db.get(b"c").unwrap(), b"x");

    batch.commit().unwrap();

    assert_eq!(db.get(b"a").unwrap(), b"1");
    assert_eq!(db.get(b"b").unwrap(), b"2");
    assert!(matches!(db.get(b"c"), Err(CellarError::KeyNotFound)));
}

#[test]
fn test_torn_batch_invisible_after_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        db.put(b"c", b"x").unwrap();

        let mut batch = db.new_batch(BatchOptions::default()).unwrap();
        batch.put(b"a", b"1").unwrap();
        batch.put(b"b", b"2").unwrap();
        batch.delete(b"c").unwrap();
        batch.commit().unwrap();
        db.close().unwrap();
    }

    // Tear the final chunk (the batch-end marker) off the log, simulating
    // a crash between the record appends and the commit marker reaching disk.
    let segment = dir.path().join("0000000001.seg");
    let len = std::fs::metadata(&segment).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&segment)
        .unwrap();
    file.set_len(len - 1).unwrap();
    drop(file);

    let db = Cellar::open(Options::default_in(dir.path())).unwrap();
    // The whole batch vanished; the earlier commit is intact.
    assert!(matches!(db.get(b"a"), Err(CellarError::KeyNotFound)));
    assert!(matches!(db.get(b"b"), Err(CellarError::KeyNotFound)));
    assert_eq!(db.get(b"c").unwrap(), b"x");
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

#[test]
fn test_ordered_iteration() {
    let (db, _dir) = open_db();
    for key in ["key13", "key11", "key35", "key27", "key41"] {
        db.put(key.as_bytes(), format!("value{}", &key[3..]).as_bytes())
            .unwrap();
    }

    let mut ascending = Vec::new();
    db.ascend_keys(b"", true, |key| {
        ascending.push(String::from_utf8(key.to_vec()).unwrap());
        Ok(true)
    })
    .unwrap();
    assert_eq!(ascending, vec!["key11", "key13", "key27", "key35", "key41"]);

    let mut descending = Vec::new();
    db.descend_keys(b"", true, |key| {
        descending.push(String::from_utf8(key.to_vec()).unwrap());
        Ok(true)
    })
    .unwrap();
    let mut expected = ascending.clone();
    expected.reverse();
    assert_eq!(descending, expected);
}

#[test]
fn test_iterator_snapshot_across_writes() {
    let (db, _dir) = open_db();
    for i in 0..10 {
        db.put(&test_key(i), b"before").unwrap();
    }

    let mut iter = db.iter(IteratorOptions::default()).unwrap();

    for i in 0..10 {
        db.put(&test_key(i), b"after").unwrap();
    }
    db.put(&test_key(10), b"new").unwrap();

    let mut count = 0;
    while iter.valid() {
        assert_eq!(iter.item().unwrap().value, b"before");
        count += 1;
        iter.next();
    }
    assert_eq!(count, 10);
    assert!(iter.err().is_none());
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

#[test]
fn test_watch_stream_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut options = Options::default_in(dir.path());
    options.watch_queue_size = 1_000;
    let db = Cellar::open(options).unwrap();

    let receiver = db.watch().unwrap();
    let consumer = std::thread::spawn(move || {
        let mut events = Vec::new();
        while let Some(event) = receiver.recv() {
            events.push(event);
        }
        events
    });

    for i in 0..10 {
        db.put(&test_key(i), &random_value(16)).unwrap();
    }
    for i in 0..5 {
        db.delete(&test_key(i)).unwrap();
    }
    db.close().unwrap();

    let events = consumer.join().unwrap();
    assert_eq!(events.len(), 15);
    for (i, event) in events.iter().take(10).enumerate() {
        assert_eq!(event.kind, EventKind::Put);
        assert_eq!(event.key, test_key(i));
        assert!(event.value.is_some());
    }
    for (i, event) in events.iter().skip(10).enumerate() {
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.key, test_key(i));
        assert_eq!(event.value, None);
    }
    // Batch ids strictly increase with commit order.
    for pair in events.windows(2) {
        assert!(pair[0].batch_id < pair[1].batch_id);
    }
}

#[test]
fn test_watch_overflow_is_counted() {
    let dir = TempDir::new().unwrap();
    let mut options = Options::default_in(dir.path());
    options.watch_queue_size = 4;
    let db = Cellar::open(options).unwrap();

    let _receiver = db.watch().unwrap();
    for i in 0..10 {
        db.put(&test_key(i), b"v").unwrap();
    }
    // Nobody consumed: the queue kept the newest 4 and dropped 6.
    assert_eq!(db.stats().unwrap().dropped_watch_events, 6);
    db.close().unwrap();
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[test]
fn test_merge_halves_disk_and_preserves_reads() {
    let dir = TempDir::new().unwrap();
    let mut options = Options::default_in(dir.path());
    options.segment_size = MB;
    let db = Cellar::open(options).unwrap();

    let values: Vec<Vec<u8>> = (0..5_000).map(|_| random_value(128)).collect();
    for (i, value) in values.iter().enumerate() {
        db.put(&test_key(i), value).unwrap();
    }
    for i in 0..2_500 {
        db.delete(&test_key(i)).unwrap();
    }

    let before = db.stats().unwrap();
    db.merge(true).unwrap();
    let after = db.stats().unwrap();

    assert_eq!(after.keys, 2_500);
    assert!(after.disk_size < before.disk_size * 2 / 3);

    for i in 2_500..5_000 {
        assert_eq!(db.get(&test_key(i)).unwrap(), values[i]);
    }

    // A second merge is a near no-op.
    db.merge(true).unwrap();
    assert_eq!(db.stats().unwrap().keys, 2_500);
    assert_eq!(db.stats().unwrap().disk_size, after.disk_size);
}
