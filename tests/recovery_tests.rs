//! Crash and corruption behavior: what survives a reopen, what fails it.

mod common;

use std::collections::HashMap;

use cellardb::{Cellar, CellarError, Options, MB};
use common::{random_value, test_key};
use tempfile::TempDir;

fn small_segment_options(dir: &std::path::Path) -> Options {
    let mut options = Options::default_in(dir);
    options.segment_size = MB;
    options
}

#[test]
fn test_recovery_equals_replaying_commits() {
    let dir = TempDir::new().unwrap();

    // A mixed workload: overwrites, deletes, batches.
    let mut expected: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    {
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        for i in 0..500 {
            let value = random_value(32);
            db.put(&test_key(i), &value).unwrap();
            expected.insert(test_key(i), value);
        }
        for i in (0..500).step_by(3) {
            db.delete(&test_key(i)).unwrap();
            expected.remove(&test_key(i));
        }
        for i in (0..500).step_by(7) {
            let value = random_value(48);
            db.put(&test_key(i), &value).unwrap();
            expected.insert(test_key(i), value);
        }

        let mut batch = db.new_batch(Default::default()).unwrap();
        for i in 500..520 {
            let value = random_value(16);
            batch.put(&test_key(i), &value).unwrap();
            expected.insert(test_key(i), value);
        }
        batch.commit().unwrap();
        db.close().unwrap();
    }

    let db = Cellar::open(Options::default_in(dir.path())).unwrap();
    assert_eq!(db.stats().unwrap().keys, expected.len());
    for (key, value) in &expected {
        assert_eq!(db.get(key).unwrap(), *value, "key {:?}", key);
    }
    for i in (0..500).step_by(3) {
        if !expected.contains_key(&test_key(i)) {
            assert!(matches!(db.get(&test_key(i)), Err(CellarError::KeyNotFound)));
        }
    }
}

#[test]
fn test_rolled_back_batch_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    {
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        db.put(b"kept", b"v").unwrap();

        let mut batch = db.new_batch(Default::default()).unwrap();
        batch.put(b"discarded", b"v").unwrap();
        batch.rollback().unwrap();
        db.close().unwrap();
    }
    let db = Cellar::open(Options::default_in(dir.path())).unwrap();
    assert_eq!(db.get(b"kept").unwrap(), b"v");
    assert!(matches!(db.get(b"discarded"), Err(CellarError::KeyNotFound)));
    assert_eq!(db.stats().unwrap().keys, 1);
}

#[test]
fn test_appends_continue_after_torn_tail() {
    let dir = TempDir::new().unwrap();
    {
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        db.put(b"solid", b"v").unwrap();
        db.put(b"torn", b"v").unwrap();
        db.close().unwrap();
    }

    // Chop into the last record's bytes.
    let segment = dir.path().join("0000000001.seg");
    let len = std::fs::metadata(&segment).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&segment)
        .unwrap();
    file.set_len(len - 4).unwrap();
    drop(file);

    {
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        assert_eq!(db.get(b"solid").unwrap(), b"v");
        assert!(matches!(db.get(b"torn"), Err(CellarError::KeyNotFound)));
        db.put(b"fresh", b"v").unwrap();
        db.close().unwrap();
    }

    // And the post-trim append itself survives another reopen.
    let db = Cellar::open(Options::default_in(dir.path())).unwrap();
    assert_eq!(db.get(b"solid").unwrap(), b"v");
    assert_eq!(db.get(b"fresh").unwrap(), b"v");
    assert_eq!(db.stats().unwrap().keys, 2);
}

#[test]
fn test_interior_corruption_fails_open() {
    let dir = TempDir::new().unwrap();
    {
        let db = Cellar::open(small_segment_options(dir.path())).unwrap();
        // Enough data to rotate into a second segment, so damage in the
        // first one is interior, not a torn tail.
        for i in 0..4_000 {
            db.put(&test_key(i), &random_value(400)).unwrap();
        }
        assert!(db.stats().unwrap().segments > 1);
        db.close().unwrap();
    }

    // Flip bytes deep inside the first segment.
    let segment = dir.path().join("0000000001.seg");
    let mut bytes = std::fs::read(&segment).unwrap();
    for i in 200..208 {
        bytes[i] ^= 0xFF;
    }
    std::fs::write(&segment, bytes).unwrap();

    let result = Cellar::open(small_segment_options(dir.path()));
    assert!(matches!(
        result,
        Err(CellarError::ChecksumMismatch { .. }) | Err(CellarError::CorruptRecord { .. })
    ));
}

#[test]
fn test_ttl_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        db.put_with_ttl(b"short", b"v", std::time::Duration::from_millis(40))
            .unwrap();
        db.put_with_ttl(b"long", b"v", std::time::Duration::from_secs(3600))
            .unwrap();
        db.close().unwrap();
    }

    std::thread::sleep(std::time::Duration::from_millis(80));

    // The short key was already expired at open time and never enters the
    // index; the long one keeps its (shrinking) TTL.
    let db = Cellar::open(Options::default_in(dir.path())).unwrap();
    assert_eq!(db.stats().unwrap().keys, 1);
    assert!(matches!(db.get(b"short"), Err(CellarError::KeyNotFound)));
    let remaining = db.ttl(b"long").unwrap().unwrap();
    assert!(remaining <= std::time::Duration::from_secs(3600));
    assert!(remaining > std::time::Duration::from_secs(3590));
}

#[test]
fn test_expire_and_persist_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        db.put(b"a", b"v").unwrap();
        db.expire(b"a", std::time::Duration::from_secs(1800)).unwrap();
        db.put_with_ttl(b"b", b"v", std::time::Duration::from_secs(5))
            .unwrap();
        db.persist(b"b").unwrap();
        db.close().unwrap();
    }

    let db = Cellar::open(Options::default_in(dir.path())).unwrap();
    assert!(db.ttl(b"a").unwrap().is_some());
    assert_eq!(db.ttl(b"b").unwrap(), None);
}
