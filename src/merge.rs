//! Merge: offline compaction of the WAL.
//!
//! Merge rewrites only the live, unexpired records into a fresh WAL inside
//! `merge-staging/`, then atomically swaps it in. The swap uses a marker
//! protocol for crash safety:
//!
//! 1. Stage every live record (original batch id and expiry, one
//!    single-record batch each) and sync.
//! 2. Under the writer lock, append committed batches the snapshot missed
//!    (batch id > the snapshot sequence), sync, and write `MERGE_FINISHED`
//!    into the staging dir recording the snapshot sequence and the highest
//!    staged segment id.
//! 3. Commit point: rename the marker into the live directory.
//! 4. Idempotent swap: delete live segments above the staged range, rename
//!    every staged segment over its live name, remove the marker, sync the
//!    directory.
//!
//! A crash before step 3 leaves the live directory authoritative and the
//! staging dir is discarded on the next open. A crash after step 3 is
//! finished by re-running step 4 on the next open; deleting above the
//! staged range first means a re-run never destroys staged segments that
//! were already moved. A failed merge never impairs the live store.
//!
//! Readers and iterators that still hold the old WAL generation keep
//! working: the swap unlinks the old segment files but their pooled
//! descriptors stay readable until the last holder drops.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use hashbrown::HashMap;
use tracing::{info, warn};

use crate::db::{replay_into, Cellar};
use crate::error::{CellarError, CellarResult};
use crate::fsutil::{durable_sync, sync_dir};
use crate::index::KeyDir;
use crate::record::{Record, RecordKind};
use crate::wal::{list_segment_ids, segment_file_name, ChunkPosition, Wal, BLOCK_SIZE};

pub(crate) const MERGE_DIR_NAME: &str = "merge-staging";
pub(crate) const MERGE_FINISHED_FILE: &str = "MERGE_FINISHED";

/// Entry point used by `Cellar::merge`. Serializes merges and guarantees the
/// in-progress flag is cleared on every exit path.
pub(crate) fn merge(db: &Cellar, reopen: bool) -> CellarResult<()> {
    db.check_open()?;
    if !db.try_begin_merge() {
        return Err(CellarError::MergeInProgress);
    }
    let result = do_merge(db, reopen);
    db.end_merge();
    result
}

fn do_merge(db: &Cellar, reopen: bool) -> CellarResult<()> {
    let dir = db.options().dir_path.clone();
    let staging = dir.join(MERGE_DIR_NAME);

    // A leftover staging dir from an aborted merge is dead weight.
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| CellarError::io(&staging, e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| CellarError::io(&staging, e))?;

    match run_merge(db, reopen, &dir, &staging) {
        Ok(()) => Ok(()),
        Err(err) => {
            // Before the commit point the staging dir is garbage. After it,
            // the next open finishes the swap, so leave everything in place.
            if !dir.join(MERGE_FINISHED_FILE).exists() {
                discard_staging(&staging);
            } else {
                warn!(%err, "merge failed after its commit point; next open will finish the swap");
            }
            Err(err)
        }
    }
}

fn run_merge(db: &Cellar, reopen: bool, dir: &Path, staging: &Path) -> CellarResult<()> {
    let options = db.options();
    let (snapshot, snapshot_seq, live_wal, tail_from) = db.snapshot_state();
    let now = db.now_nanos();
    let before_bytes = live_wal.total_size().unwrap_or(0);

    // Phase 1: copy live records into the staging WAL. Runs concurrently
    // with readers and writers; anything committed after the snapshot is
    // picked up by the tail scan below.
    let staging_wal = Wal::open(staging, options.segment_size, 0)?;
    let mut entries: HashMap<Vec<u8>, ChunkPosition> = HashMap::with_capacity(snapshot.len());
    let mut live_records = 0usize;

    for (key, position) in &snapshot {
        let payload = live_wal.read(*position)?;
        let offset = u64::from(position.block_number) * BLOCK_SIZE + position.chunk_offset;
        let record = Record::decode(&payload, offset)?;
        if record.kind != RecordKind::Put {
            continue;
        }
        if record.expire_at != 0 && record.expire_at <= now {
            continue;
        }
        // The payload is already a fully encoded record; re-append it as a
        // single-record batch under its original batch id.
        let new_position = staging_wal.append(&payload)?;
        staging_wal.append(&Record::batch_end(record.batch_id).encode())?;
        entries.insert(key.clone(), new_position);
        live_records += 1;
    }
    staging_wal.sync()?;

    // Phase 2: quiesce writers, fold in the committed tail the snapshot did
    // not see, and swap.
    let guard = db.writer_lock();
    if db.is_closed() {
        return Err(CellarError::DatabaseClosed);
    }

    let tail = collect_tail(&live_wal, snapshot_seq, tail_from)?;
    let tail_batches = tail.len();
    for batch in &tail {
        for record in batch {
            let new_position = staging_wal.append(&record.encode())?;
            match record.kind {
                RecordKind::Put => {
                    entries.insert(record.key.clone(), new_position);
                }
                RecordKind::Delete => {
                    entries.remove(&record.key);
                }
                RecordKind::BatchEnd => unreachable!("batch-end is never buffered"),
            }
        }
        staging_wal.append(&Record::batch_end(batch[0].batch_id).encode())?;
    }
    staging_wal.sync()?;

    write_marker(
        &staging.join(MERGE_FINISHED_FILE),
        snapshot_seq,
        staging_wal.active_segment_id(),
    )?;
    sync_dir(staging)?;

    // Commit point: from here on the staged generation is authoritative.
    let staged_marker = staging.join(MERGE_FINISHED_FILE);
    let live_marker = dir.join(MERGE_FINISHED_FILE);
    fs::rename(&staged_marker, &live_marker).map_err(|e| CellarError::io(&staged_marker, e))?;

    finish_swap(dir)?;

    let new_wal = Wal::open(dir, options.segment_size, options.bytes_per_sync)?;
    let after_bytes = new_wal.total_size().unwrap_or(0);
    let final_entries = if reopen {
        // The source closes and reopens the whole store here; in-process
        // that means trusting only what is on disk.
        let fresh = KeyDir::new(options.compare.clone());
        replay_into(&new_wal, &fresh, db.now_nanos())?;
        fresh.snapshot()
    } else {
        entries.into_iter().collect()
    };
    db.publish_generation(new_wal, final_entries, &guard);
    drop(guard);

    info!(
        live_records,
        tail_batches,
        before_bytes,
        after_bytes,
        "merge completed"
    );
    Ok(())
}

/// Committed batches with ids above `after`, scanning forward from the
/// snapshot's append position. Called under the writer lock, so the log
/// cannot grow underneath the scan.
fn collect_tail(wal: &Wal, after: u64, from: (u32, u64)) -> CellarResult<Vec<Vec<Record>>> {
    let mut pending: HashMap<u64, Vec<Record>> = HashMap::new();
    let mut batches = Vec::new();

    let mut iter = wal.iter_from(from.0, from.1);
    while let Some((position, payload)) = iter.next_record()? {
        let offset = u64::from(position.block_number) * BLOCK_SIZE + position.chunk_offset;
        let record = Record::decode(&payload, offset)?;
        if record.batch_id <= after {
            continue;
        }
        match record.kind {
            RecordKind::BatchEnd => {
                if let Some(group) = pending.remove(&record.batch_id) {
                    batches.push(group);
                }
            }
            _ => pending.entry(record.batch_id).or_default().push(record),
        }
    }
    Ok(batches)
}

/// Finish a committed swap. Idempotent: safe to re-run after a crash at any
/// point, which is exactly what `recover_interrupted_merge` does.
fn finish_swap(dir: &Path) -> CellarResult<()> {
    let marker = dir.join(MERGE_FINISHED_FILE);
    let (_snapshot_seq, max_staged) = read_marker(&marker)?;
    let staging = dir.join(MERGE_DIR_NAME);

    // Old segments above the staged range have no replacement about to be
    // renamed over them; everything at or below it gets overwritten.
    for id in list_segment_ids(dir)? {
        if id > max_staged {
            let path = dir.join(segment_file_name(id));
            fs::remove_file(&path).map_err(|e| CellarError::io(&path, e))?;
        }
    }

    if staging.is_dir() {
        for id in list_segment_ids(&staging)? {
            let from = staging.join(segment_file_name(id));
            let to = dir.join(segment_file_name(id));
            fs::rename(&from, &to).map_err(|e| CellarError::io(&from, e))?;
        }
        fs::remove_dir_all(&staging).map_err(|e| CellarError::io(&staging, e))?;
    }

    fs::remove_file(&marker).map_err(|e| CellarError::io(&marker, e))?;
    sync_dir(dir)
}

/// Called by `Cellar::open` before the WAL is touched: finish a committed
/// swap, or throw away staging left behind by a merge that never committed.
pub(crate) fn recover_interrupted_merge(dir: &Path) -> CellarResult<()> {
    let marker = dir.join(MERGE_FINISHED_FILE);
    let staging = dir.join(MERGE_DIR_NAME);

    if marker.exists() {
        info!("finishing interrupted merge swap");
        finish_swap(dir)?;
    } else if staging.exists() {
        warn!("discarding merge staging that never committed");
        fs::remove_dir_all(&staging).map_err(|e| CellarError::io(&staging, e))?;
    }
    Ok(())
}

fn discard_staging(staging: &Path) {
    if let Err(err) = fs::remove_dir_all(staging) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(%err, path = %staging.display(), "failed to discard merge staging");
        }
    }
}

fn write_marker(path: &Path, snapshot_seq: u64, max_staged_segment: u32) -> CellarResult<()> {
    let mut file = File::create(path).map_err(|e| CellarError::io(path, e))?;
    file.write_all(format!("{}\n{}\n", snapshot_seq, max_staged_segment).as_bytes())
        .map_err(|e| CellarError::io(path, e))?;
    durable_sync(&file).map_err(|e| CellarError::io(path, e))?;
    Ok(())
}

fn read_marker(path: &Path) -> CellarResult<(u64, u32)> {
    let malformed = || CellarError::CorruptRecord {
        path: Some(path.to_path_buf()),
        offset: 0,
        reason: "malformed merge marker".into(),
    };
    let content = fs::read_to_string(path).map_err(|e| CellarError::io(path, e))?;
    let mut lines = content.lines();
    let snapshot_seq = lines
        .next()
        .and_then(|line| line.trim().parse().ok())
        .ok_or_else(malformed)?;
    let max_staged = lines
        .next()
        .and_then(|line| line.trim().parse().ok())
        .ok_or_else(malformed)?;
    Ok((snapshot_seq, max_staged))
}
