//! Database coordinator.
//!
//! `Cellar` ties the pieces together: the segmented WAL as ground truth, the
//! keydir as the read path, batches for atomicity, the watch queue for change
//! notifications, and merge for space reclamation.
//!
//! Concurrency model: exactly one writer progresses at a time (the writer
//! mutex covers WAL append, index apply, and watch enqueue of one commit);
//! any number of readers run concurrently with each other and with the
//! writer, because a commit finishes its WAL appends before touching the
//! index. Readers pin the current WAL generation with a read lock for the
//! duration of one operation so a concurrent merge swap can never hand them
//! positions from the wrong generation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

use crate::batch::{Batch, PendingWrite};
use crate::error::{CellarError, CellarResult};
use crate::fsutil::LockFile;
use crate::index::KeyDir;
use crate::iterator::CellarIterator;
use crate::merge;
use crate::options::{normalize_cron_expr, BatchOptions, ClockFn, IteratorOptions, Options};
use crate::record::{encode_record, Record, RecordKind};
use crate::wal::{ChunkPosition, Wal, BLOCK_SIZE};
use crate::watch::{Event, EventKind, EventReceiver, Watcher};

const LOCK_FILE_NAME: &str = "LOCK";

/// Point-in-time figures reported by [`Cellar::stats`].
#[derive(Debug, Clone)]
pub struct Stats {
    /// Live keys in the index.
    pub keys: usize,
    /// Total bytes across all segment files.
    pub disk_size: u64,
    /// Number of segment files.
    pub segments: usize,
    /// Watch events dropped because the queue was full.
    pub dropped_watch_events: u64,
}

/// An open database handle. Cheap to clone; all methods take `&self`.
pub struct Cellar {
    pub(crate) inner: Arc<Inner>,
}

impl Clone for Cellar {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct Inner {
    options: Options,
    /// Current WAL generation. Swapped wholesale by merge; readers pin it
    /// with the read half for the duration of one operation.
    wal: RwLock<Arc<Wal>>,
    index: KeyDir,
    /// Serializes commits: WAL append + index apply + watch enqueue.
    write_lock: Mutex<()>,
    /// Last allocated batch id, seeded from recovery.
    batch_seq: AtomicU64,
    closed: AtomicBool,
    merging: AtomicBool,
    watcher: Option<Arc<Watcher>>,
    lock_file: Mutex<Option<LockFile>>,
    scheduler: Mutex<Option<MergeScheduler>>,
    clock: ClockFn,
}

impl Cellar {
    /// Open or create a database at `options.dir_path`.
    ///
    /// Locks the directory, finishes or discards an interrupted merge,
    /// repairs a crash-torn WAL tail, replays committed batches into the
    /// index, and arms the optional watch queue and auto-merge timer.
    pub fn open(options: Options) -> CellarResult<Self> {
        options.validate()?;
        let dir = options.dir_path.clone();
        std::fs::create_dir_all(&dir).map_err(|e| CellarError::io(&dir, e))?;

        let lock_file = LockFile::acquire(dir.join(LOCK_FILE_NAME))?;
        merge::recover_interrupted_merge(&dir)?;

        let wal = Wal::open(&dir, options.segment_size, options.bytes_per_sync)?;
        let clock: ClockFn = options
            .clock
            .clone()
            .unwrap_or_else(|| Arc::new(SystemTime::now));
        let index = KeyDir::new(options.compare.clone());
        let max_batch_id = replay_into(&wal, &index, nanos_of(&clock))?;

        let watcher = (options.watch_queue_size > 0)
            .then(|| Arc::new(Watcher::new(options.watch_queue_size)));

        info!(
            path = %dir.display(),
            keys = index.len(),
            segments = wal.segment_count(),
            "database opened"
        );

        let auto_merge_expr = options.auto_merge_cron_expr.clone();
        let db = Self {
            inner: Arc::new(Inner {
                options,
                wal: RwLock::new(Arc::new(wal)),
                index,
                write_lock: Mutex::new(()),
                batch_seq: AtomicU64::new(max_batch_id),
                closed: AtomicBool::new(false),
                merging: AtomicBool::new(false),
                watcher,
                lock_file: Mutex::new(Some(lock_file)),
                scheduler: Mutex::new(None),
                clock,
            }),
        };

        if !auto_merge_expr.is_empty() {
            let schedule = normalize_cron_expr(&auto_merge_expr)?;
            let scheduler = MergeScheduler::start(schedule, Arc::downgrade(&db.inner))?;
            *db.inner.scheduler.lock() = Some(scheduler);
        }
        Ok(db)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store a key-value pair. A single-record batch committed with
    /// `Options::sync` durability.
    pub fn put(&self, key: &[u8], value: &[u8]) -> CellarResult<()> {
        let mut batch = self.implicit_batch()?;
        batch.put(key, value)?;
        batch.commit()
    }

    /// Store a key-value pair that expires after `ttl`.
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> CellarResult<()> {
        let mut batch = self.implicit_batch()?;
        batch.put_with_ttl(key, value, ttl)?;
        batch.commit()
    }

    /// Remove a key. Deleting an absent key succeeds and changes nothing.
    pub fn delete(&self, key: &[u8]) -> CellarResult<()> {
        let mut batch = self.implicit_batch()?;
        batch.delete(key)?;
        batch.commit()
    }

    fn implicit_batch(&self) -> CellarResult<Batch<'_>> {
        self.new_batch(BatchOptions {
            sync: self.inner.options.sync,
            read_only: false,
        })
    }

    /// Set the remaining lifetime of an existing key, rewriting its value
    /// with the new absolute expiry. A zero `ttl` clears the expiry.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> CellarResult<()> {
        self.rewrite_expiry(key, |db| db.expiry_from_ttl(ttl))
    }

    /// Remove the TTL from a key. No-op if the key has none.
    pub fn persist(&self, key: &[u8]) -> CellarResult<()> {
        self.rewrite_expiry(key, |_| 0)
    }

    fn rewrite_expiry(
        &self,
        key: &[u8],
        new_expiry: impl FnOnce(&Self) -> u64,
    ) -> CellarResult<()> {
        self.check_open()?;
        if key.is_empty() {
            return Err(CellarError::KeyIsEmpty);
        }

        let guard = self.writer_lock();
        let value = {
            let wal = self.inner.wal.read();
            let position = self.inner.index.get(key).ok_or(CellarError::KeyNotFound)?;
            let record = read_indexed_record(&wal, position)?;
            if record.expire_at != 0 && record.expire_at <= self.now_nanos() {
                self.inner.index.remove_if_matches(key, position);
                return Err(CellarError::KeyExpired);
            }
            record.value
        };

        let expire_at = new_expiry(self);
        let pending = [PendingWrite {
            kind: RecordKind::Put,
            key: key.to_vec(),
            value,
            expire_at,
        }];
        self.commit_pending(&pending, self.inner.options.sync, &guard)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Fetch the value of a key. An expired key reads as absent and is
    /// lazily dropped from the index.
    pub fn get(&self, key: &[u8]) -> CellarResult<Vec<u8>> {
        self.check_open()?;
        if key.is_empty() {
            return Err(CellarError::KeyIsEmpty);
        }

        let wal = self.inner.wal.read();
        let position = self.inner.index.get(key).ok_or(CellarError::KeyNotFound)?;
        let record = read_indexed_record(&wal, position)?;
        if record.expire_at != 0 && record.expire_at <= self.now_nanos() {
            self.inner.index.remove_if_matches(key, position);
            return Err(CellarError::KeyNotFound);
        }
        Ok(record.value)
    }

    /// Whether a key is present (and unexpired).
    pub fn exists(&self, key: &[u8]) -> CellarResult<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(CellarError::KeyNotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remaining lifetime of a key. `None` means no TTL is set.
    pub fn ttl(&self, key: &[u8]) -> CellarResult<Option<Duration>> {
        self.check_open()?;
        if key.is_empty() {
            return Err(CellarError::KeyIsEmpty);
        }

        let wal = self.inner.wal.read();
        let position = self.inner.index.get(key).ok_or(CellarError::KeyNotFound)?;
        let record = read_indexed_record(&wal, position)?;
        if record.expire_at == 0 {
            return Ok(None);
        }
        let now = self.now_nanos();
        if record.expire_at <= now {
            self.inner.index.remove_if_matches(key, position);
            return Err(CellarError::KeyExpired);
        }
        Ok(Some(Duration::from_nanos(record.expire_at - now)))
    }

    /// Current store figures.
    pub fn stats(&self) -> CellarResult<Stats> {
        self.check_open()?;
        let wal = self.inner.wal.read();
        Ok(Stats {
            keys: self.inner.index.len(),
            disk_size: wal.total_size()?,
            segments: wal.segment_count(),
            dropped_watch_events: self
                .inner
                .watcher
                .as_ref()
                .map_or(0, |watcher| watcher.dropped_count()),
        })
    }

    // -------------------------------------------------------------------------
    // Traversal
    //
    // Handlers run under the index read lock: they must not write to the
    // store, or they will deadlock against the writer.
    // -------------------------------------------------------------------------

    /// Visit every live entry in ascending key order. The handler returns
    /// `Ok(false)` to stop early; its error stops traversal and propagates.
    pub fn ascend(
        &self,
        mut visit: impl FnMut(&[u8], &[u8]) -> CellarResult<bool>,
    ) -> CellarResult<()> {
        self.check_open()?;
        let wal = self.inner.wal.read();
        let now = self.now_nanos();
        self.inner.index.ascend(&mut |key, position| {
            match read_live_value(&wal, position, now)? {
                Some(value) => visit(key, &value),
                None => Ok(true),
            }
        })
    }

    /// Visit every live entry in descending key order.
    pub fn descend(
        &self,
        mut visit: impl FnMut(&[u8], &[u8]) -> CellarResult<bool>,
    ) -> CellarResult<()> {
        self.check_open()?;
        let wal = self.inner.wal.read();
        let now = self.now_nanos();
        self.inner.index.descend(&mut |key, position| {
            match read_live_value(&wal, position, now)? {
                Some(value) => visit(key, &value),
                None => Ok(true),
            }
        })
    }

    /// Visit live entries with keys in `[start, end)`, ascending.
    pub fn ascend_range(
        &self,
        start: &[u8],
        end: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> CellarResult<bool>,
    ) -> CellarResult<()> {
        self.check_open()?;
        let wal = self.inner.wal.read();
        let now = self.now_nanos();
        self.inner.index.ascend_range(start, end, &mut |key, position| {
            match read_live_value(&wal, position, now)? {
                Some(value) => visit(key, &value),
                None => Ok(true),
            }
        })
    }

    /// Visit live entries with keys in `[start, end)`, descending.
    pub fn descend_range(
        &self,
        start: &[u8],
        end: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> CellarResult<bool>,
    ) -> CellarResult<()> {
        self.check_open()?;
        let wal = self.inner.wal.read();
        let now = self.now_nanos();
        self.inner.index.descend_range(start, end, &mut |key, position| {
            match read_live_value(&wal, position, now)? {
                Some(value) => visit(key, &value),
                None => Ok(true),
            }
        })
    }

    /// Visit live entries with keys >= `from`, ascending.
    pub fn ascend_greater_or_equal(
        &self,
        from: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> CellarResult<bool>,
    ) -> CellarResult<()> {
        self.check_open()?;
        let wal = self.inner.wal.read();
        let now = self.now_nanos();
        self.inner.index.ascend_from(from, &mut |key, position| {
            match read_live_value(&wal, position, now)? {
                Some(value) => visit(key, &value),
                None => Ok(true),
            }
        })
    }

    /// Visit live entries with keys <= `from`, descending.
    pub fn descend_less_or_equal(
        &self,
        from: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> CellarResult<bool>,
    ) -> CellarResult<()> {
        self.check_open()?;
        let wal = self.inner.wal.read();
        let now = self.now_nanos();
        self.inner.index.descend_from(from, &mut |key, position| {
            match read_live_value(&wal, position, now)? {
                Some(value) => visit(key, &value),
                None => Ok(true),
            }
        })
    }

    /// Visit keys with the given prefix in ascending order. With
    /// `filter_expired`, each record is read to skip expired keys; without
    /// it the traversal never touches the WAL.
    pub fn ascend_keys(
        &self,
        prefix: &[u8],
        filter_expired: bool,
        mut visit: impl FnMut(&[u8]) -> CellarResult<bool>,
    ) -> CellarResult<()> {
        self.check_open()?;
        let wal = self.inner.wal.read();
        let now = self.now_nanos();
        self.inner.index.ascend(&mut |key, position| {
            if !prefix.is_empty() && !key.starts_with(prefix) {
                return Ok(true);
            }
            if filter_expired && read_live_value(&wal, position, now)?.is_none() {
                return Ok(true);
            }
            visit(key)
        })
    }

    /// Visit keys with the given prefix in descending order.
    pub fn descend_keys(
        &self,
        prefix: &[u8],
        filter_expired: bool,
        mut visit: impl FnMut(&[u8]) -> CellarResult<bool>,
    ) -> CellarResult<()> {
        self.check_open()?;
        let wal = self.inner.wal.read();
        let now = self.now_nanos();
        self.inner.index.descend(&mut |key, position| {
            if !prefix.is_empty() && !key.starts_with(prefix) {
                return Ok(true);
            }
            if filter_expired && read_live_value(&wal, position, now)?.is_none() {
                return Ok(true);
            }
            visit(key)
        })
    }

    /// Build a snapshot iterator. See [`IteratorOptions`] for prefix,
    /// direction, and error policy.
    pub fn iter(&self, options: IteratorOptions) -> CellarResult<CellarIterator> {
        self.check_open()?;
        let (wal, index_iter) = {
            let guard = self.inner.wal.read();
            (Arc::clone(&*guard), self.inner.index.iter(options.reverse))
        };
        Ok(CellarIterator::new(
            index_iter,
            wal,
            options,
            self.inner.clock.clone(),
        ))
    }

    // -------------------------------------------------------------------------
    // Batches, watch, merge, lifecycle
    // -------------------------------------------------------------------------

    /// Create a batch. See [`Batch`] for the commit contract.
    pub fn new_batch(&self, options: BatchOptions) -> CellarResult<Batch<'_>> {
        self.check_open()?;
        Ok(Batch::new(self, options))
    }

    /// The change-notification stream. Fails with `WatchDisabled` unless
    /// `Options::watch_queue_size > 0`.
    pub fn watch(&self) -> CellarResult<EventReceiver> {
        self.check_open()?;
        match &self.inner.watcher {
            Some(watcher) => Ok(EventReceiver {
                watcher: Arc::clone(watcher),
            }),
            None => Err(CellarError::WatchDisabled),
        }
    }

    /// Rewrite the store down to its live records and swap the result in.
    /// With `reopen`, the swapped WAL is additionally re-replayed from disk.
    pub fn merge(&self, reopen: bool) -> CellarResult<()> {
        merge::merge(self, reopen)
    }

    /// Close the store: waits for the in-flight writer, stops the auto-merge
    /// timer, closes the watch stream, syncs the WAL, and releases the
    /// directory lock. Idempotent.
    pub fn close(&self) -> CellarResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(scheduler) = self.inner.scheduler.lock().take() {
            scheduler.shutdown();
        }
        let _guard = self.inner.write_lock.lock();
        self.inner.wal.read().sync()?;
        if let Some(watcher) = &self.inner.watcher {
            watcher.close();
        }
        if let Some(lock_file) = self.inner.lock_file.lock().take() {
            lock_file.release()?;
        }
        info!(path = %self.inner.options.dir_path.display(), "database closed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Crate-internal plumbing
    // -------------------------------------------------------------------------

    pub(crate) fn check_open(&self) -> CellarResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(CellarError::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn options(&self) -> &Options {
        &self.inner.options
    }

    pub(crate) fn writer_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.write_lock.lock()
    }

    pub(crate) fn now_nanos(&self) -> u64 {
        nanos_of(&self.inner.clock)
    }

    pub(crate) fn expiry_from_ttl(&self, ttl: Duration) -> u64 {
        if ttl.is_zero() {
            0
        } else {
            self.now_nanos().saturating_add(ttl.as_nanos() as u64)
        }
    }

    pub(crate) fn last_batch_id(&self) -> u64 {
        self.inner.batch_seq.load(Ordering::SeqCst)
    }

    /// Append, sync, and apply one commit group. The caller holds the writer
    /// lock; the guard parameter is the proof.
    pub(crate) fn commit_pending(
        &self,
        pending: &[PendingWrite],
        sync: bool,
        _guard: &MutexGuard<'_, ()>,
    ) -> CellarResult<()> {
        let batch_id = self.inner.batch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let wal = self.inner.wal.read();

        let mut positions = Vec::with_capacity(pending.len());
        for write in pending {
            let encoded =
                encode_record(write.kind, batch_id, write.expire_at, &write.key, &write.value);
            positions.push(wal.append(&encoded)?);
        }
        wal.append(&Record::batch_end(batch_id).encode())?;
        if sync || self.inner.options.sync {
            wal.sync()?;
        }

        // Nothing becomes visible before this point; a failure above leaves
        // the index untouched and recovery ignores the unterminated group.
        for (write, position) in pending.iter().zip(positions) {
            match write.kind {
                RecordKind::Put => {
                    self.inner.index.put(&write.key, position);
                }
                RecordKind::Delete => {
                    self.inner.index.remove(&write.key);
                }
                RecordKind::BatchEnd => unreachable!("batch-end is never staged"),
            }
            if let Some(watcher) = &self.inner.watcher {
                let kind = match write.kind {
                    RecordKind::Put => EventKind::Put,
                    _ => EventKind::Delete,
                };
                watcher.push(Event {
                    kind,
                    key: write.key.clone(),
                    value: (write.kind == RecordKind::Put).then(|| write.value.clone()),
                    batch_id,
                });
            }
        }
        Ok(())
    }

    /// Consistent view for merge, taken under a brief writer-lock
    /// acquisition: index snapshot, last batch id, the WAL generation, and
    /// the append position separating the snapshot from its future tail.
    pub(crate) fn snapshot_state(
        &self,
    ) -> (Vec<(Vec<u8>, ChunkPosition)>, u64, Arc<Wal>, (u32, u64)) {
        let _guard = self.inner.write_lock.lock();
        let wal = Arc::clone(&*self.inner.wal.read());
        let tail_from = wal.append_position();
        (self.inner.index.snapshot(), self.last_batch_id(), wal, tail_from)
    }

    /// Publish a new WAL generation and index contents in one step. The
    /// caller holds the writer lock; in-flight readers drain before the
    /// swap because they pin the generation with the read half.
    pub(crate) fn publish_generation(
        &self,
        wal: Wal,
        entries: Vec<(Vec<u8>, ChunkPosition)>,
        _guard: &MutexGuard<'_, ()>,
    ) {
        let mut generation = self.inner.wal.write();
        *generation = Arc::new(wal);
        self.inner.index.replace_all(entries);
    }

    pub(crate) fn try_begin_merge(&self) -> bool {
        !self.inner.merging.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn end_merge(&self) {
        self.inner.merging.store(false, Ordering::SeqCst);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(scheduler) = self.scheduler.lock().take() {
                scheduler.shutdown();
            }
            if let Some(watcher) = &self.watcher {
                watcher.close();
            }
            let _ = self.wal.read().sync();
            if let Some(lock_file) = self.lock_file.lock().take() {
                let _ = lock_file.release();
            }
        }
    }
}

fn nanos_of(clock: &ClockFn) -> u64 {
    clock()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Read and decode the record an index entry points at. The index only ever
/// holds live puts; anything else is corruption.
fn read_indexed_record(wal: &Wal, position: ChunkPosition) -> CellarResult<Record> {
    let payload = wal.read(position)?;
    let offset = u64::from(position.block_number) * BLOCK_SIZE + position.chunk_offset;
    let record = Record::decode(&payload, offset)?;
    if record.kind != RecordKind::Put {
        return Err(CellarError::CorruptRecord {
            path: None,
            offset,
            reason: "index points at a non-put record".into(),
        });
    }
    Ok(record)
}

/// Value of a live, unexpired record; `None` when the entry should be
/// skipped during traversal.
fn read_live_value(wal: &Wal, position: ChunkPosition, now: u64) -> CellarResult<Option<Vec<u8>>> {
    let record = read_indexed_record(wal, position)?;
    if record.expire_at != 0 && record.expire_at <= now {
        return Ok(None);
    }
    Ok(Some(record.value))
}

/// Rebuild an index from the WAL: buffer records per batch id, apply a group
/// when its `BatchEnd` arrives, discard groups that never got one. Returns
/// the highest committed batch id.
pub(crate) fn replay_into(wal: &Wal, index: &KeyDir, now: u64) -> CellarResult<u64> {
    let mut pending: HashMap<u64, Vec<(Record, ChunkPosition)>> = HashMap::new();
    let mut max_batch_id = 0u64;

    let mut iter = wal.iter();
    while let Some((position, payload)) = iter.next_record()? {
        let offset = u64::from(position.block_number) * BLOCK_SIZE + position.chunk_offset;
        let record = Record::decode(&payload, offset)?;
        match record.kind {
            RecordKind::BatchEnd => {
                if let Some(group) = pending.remove(&record.batch_id) {
                    for (grouped, grouped_position) in group {
                        match grouped.kind {
                            RecordKind::Put => {
                                if grouped.expire_at != 0 && grouped.expire_at <= now {
                                    index.remove(&grouped.key);
                                } else {
                                    index.put(&grouped.key, grouped_position);
                                }
                            }
                            RecordKind::Delete => {
                                index.remove(&grouped.key);
                            }
                            RecordKind::BatchEnd => unreachable!("batch-end is never buffered"),
                        }
                    }
                }
                max_batch_id = max_batch_id.max(record.batch_id);
            }
            _ => pending
                .entry(record.batch_id)
                .or_default()
                .push((record, position)),
        }
    }

    if !pending.is_empty() {
        let discarded: usize = pending.values().map(Vec::len).sum();
        warn!(records = discarded, "discarding uncommitted records with no batch end");
    }
    Ok(max_batch_id)
}

/// Background thread that runs `merge(true)` on a cron schedule.
struct MergeScheduler {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl MergeScheduler {
    fn start(schedule: cron::Schedule, inner: Weak<Inner>) -> CellarResult<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("cellardb-auto-merge".into())
            .spawn(move || loop {
                let next = match schedule.upcoming(Utc).next() {
                    Some(next) => next,
                    None => break,
                };
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_millis(1));

                let (lock, ready) = &*shared;
                let mut stopped = lock.lock();
                if *stopped {
                    break;
                }
                let outcome = ready.wait_for(&mut stopped, wait);
                if *stopped {
                    break;
                }
                drop(stopped);
                if !outcome.timed_out() {
                    continue;
                }

                let inner = match inner.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                let db = Cellar { inner };
                match db.merge(true) {
                    Ok(()) => info!("auto-merge completed"),
                    Err(CellarError::MergeInProgress | CellarError::DatabaseClosed) => {}
                    Err(err) => warn!(%err, "auto-merge failed"),
                }
            })
            .map_err(CellarError::from)?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    fn shutdown(mut self) {
        let (lock, ready) = &*self.stop;
        *lock.lock() = true;
        ready.notify_all();
        if let Some(thread) = self.thread.take() {
            // The scheduler itself can hold the last handle; never join
            // from the thread being joined.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db() -> (Cellar, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        (db, dir)
    }

    #[test]
    fn test_put_get_delete() {
        let (db, _dir) = open_db();
        db.put(b"name", b"cellardb").unwrap();
        assert_eq!(db.get(b"name").unwrap(), b"cellardb");
        assert!(db.exists(b"name").unwrap());

        db.delete(b"name").unwrap();
        assert!(matches!(db.get(b"name"), Err(CellarError::KeyNotFound)));
        assert!(!db.exists(b"name").unwrap());

        // Deleting again is fine and changes nothing.
        db.delete(b"name").unwrap();
        assert!(matches!(db.get(b"name"), Err(CellarError::KeyNotFound)));
    }

    #[test]
    fn test_last_write_wins() {
        let (db, _dir) = open_db();
        for i in 0..10 {
            db.put(b"counter", format!("{}", i).as_bytes()).unwrap();
        }
        assert_eq!(db.get(b"counter").unwrap(), b"9");
    }

    #[test]
    fn test_empty_key_rejected() {
        let (db, _dir) = open_db();
        assert!(matches!(db.put(b"", b"v"), Err(CellarError::KeyIsEmpty)));
        assert!(matches!(db.get(b""), Err(CellarError::KeyIsEmpty)));
        assert!(matches!(db.delete(b""), Err(CellarError::KeyIsEmpty)));
    }

    #[test]
    fn test_ttl_surface() {
        let (db, _dir) = open_db();

        db.put(b"forever", b"v").unwrap();
        assert_eq!(db.ttl(b"forever").unwrap(), None);

        db.put_with_ttl(b"brief", b"v", Duration::from_secs(60)).unwrap();
        let remaining = db.ttl(b"brief").unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(55));

        db.expire(b"forever", Duration::from_secs(30)).unwrap();
        assert!(db.ttl(b"forever").unwrap().is_some());

        db.persist(b"forever").unwrap();
        assert_eq!(db.ttl(b"forever").unwrap(), None);

        assert!(matches!(
            db.ttl(b"missing"),
            Err(CellarError::KeyNotFound)
        ));
    }

    #[test]
    fn test_ttl_expiry_shrinks_index() {
        let (db, _dir) = open_db();
        db.put(b"keep", b"v").unwrap();
        db.put_with_ttl(b"gone", b"v", Duration::from_millis(30)).unwrap();
        assert_eq!(db.get(b"gone").unwrap(), b"v");
        assert_eq!(db.stats().unwrap().keys, 2);

        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(db.get(b"gone"), Err(CellarError::KeyNotFound)));
        assert_eq!(db.stats().unwrap().keys, 1);
    }

    #[test]
    fn test_injected_clock_drives_expiry() {
        use std::sync::atomic::AtomicU64 as Clock;
        let fake_now = Arc::new(Clock::new(1_000_000_000));
        let clock_source = Arc::clone(&fake_now);

        let dir = TempDir::new().unwrap();
        let mut options = Options::default_in(dir.path());
        options.clock = Some(Arc::new(move || {
            UNIX_EPOCH + Duration::from_nanos(clock_source.load(Ordering::SeqCst))
        }));
        let db = Cellar::open(options).unwrap();

        db.put_with_ttl(b"k", b"v", Duration::from_secs(10)).unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"v");

        // Jump the clock past the expiry; no sleeping involved.
        fake_now.fetch_add(11 * 1_000_000_000, Ordering::SeqCst);
        assert!(matches!(db.get(b"k"), Err(CellarError::KeyNotFound)));
    }

    #[test]
    fn test_recovery_restores_state() {
        let dir = TempDir::new().unwrap();
        {
            let db = Cellar::open(Options::default_in(dir.path())).unwrap();
            db.put(b"survive1", b"yes").unwrap();
            db.put(b"survive2", b"also").unwrap();
            db.put(b"doomed", b"temp").unwrap();
            db.delete(b"doomed").unwrap();
            db.close().unwrap();
        }
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        assert_eq!(db.get(b"survive1").unwrap(), b"yes");
        assert_eq!(db.get(b"survive2").unwrap(), b"also");
        assert!(matches!(db.get(b"doomed"), Err(CellarError::KeyNotFound)));
        assert_eq!(db.stats().unwrap().keys, 2);
    }

    #[test]
    fn test_batch_seq_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let seq_before;
        {
            let db = Cellar::open(Options::default_in(dir.path())).unwrap();
            for i in 0..5 {
                db.put(format!("k{}", i).as_bytes(), b"v").unwrap();
            }
            seq_before = db.last_batch_id();
            db.close().unwrap();
        }
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        assert_eq!(db.last_batch_id(), seq_before);
        db.put(b"one-more", b"v").unwrap();
        assert_eq!(db.last_batch_id(), seq_before + 1);
    }

    #[test]
    fn test_directory_lock_excludes_second_open() {
        let dir = TempDir::new().unwrap();
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        assert!(matches!(
            Cellar::open(Options::default_in(dir.path())),
            Err(CellarError::DatabaseIsUsing { .. })
        ));
        db.close().unwrap();
        // Released on close; a fresh open succeeds.
        let db = Cellar::open(Options::default_in(dir.path())).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let (db, _dir) = open_db();
        db.put(b"k", b"v").unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(db.get(b"k"), Err(CellarError::DatabaseClosed)));
        assert!(matches!(db.put(b"k", b"v"), Err(CellarError::DatabaseClosed)));
        assert!(matches!(
            db.new_batch(BatchOptions::default()),
            Err(CellarError::DatabaseClosed)
        ));
    }

    #[test]
    fn test_watch_disabled_by_default() {
        let (db, _dir) = open_db();
        assert!(matches!(db.watch(), Err(CellarError::WatchDisabled)));
    }

    #[test]
    fn test_watch_receives_commit_order() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default_in(dir.path());
        options.watch_queue_size = 64;
        let db = Cellar::open(options).unwrap();

        let receiver = db.watch().unwrap();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        db.delete(b"a").unwrap();

        let first = receiver.recv().unwrap();
        assert_eq!(first.kind, EventKind::Put);
        assert_eq!(first.key, b"a");
        assert_eq!(first.value.as_deref(), Some(&b"1"[..]));

        let second = receiver.recv().unwrap();
        assert_eq!(second.key, b"b");

        let third = receiver.recv().unwrap();
        assert_eq!(third.kind, EventKind::Delete);
        assert_eq!(third.key, b"a");
        assert_eq!(third.value, None);
        assert!(third.batch_id > second.batch_id);

        db.close().unwrap();
        assert_eq!(receiver.recv(), None);
    }

    #[test]
    fn test_traversal_order_and_ranges() {
        let (db, _dir) = open_db();
        for key in ["key13", "key11", "key35", "key27", "key41"] {
            db.put(key.as_bytes(), format!("value-{}", key).as_bytes())
                .unwrap();
        }

        let mut keys = Vec::new();
        db.ascend_keys(b"", true, |key| {
            keys.push(String::from_utf8(key.to_vec()).unwrap());
            Ok(true)
        })
        .unwrap();
        assert_eq!(keys, vec!["key11", "key13", "key27", "key35", "key41"]);

        let mut reversed = Vec::new();
        db.descend_keys(b"", true, |key| {
            reversed.push(String::from_utf8(key.to_vec()).unwrap());
            Ok(true)
        })
        .unwrap();
        let mut expected = keys.clone();
        expected.reverse();
        assert_eq!(reversed, expected);

        let mut ranged = Vec::new();
        db.ascend_range(b"key13", b"key41", |key, value| {
            assert!(value.starts_with(b"value-"));
            ranged.push(key.to_vec());
            Ok(true)
        })
        .unwrap();
        assert_eq!(
            ranged,
            vec![b"key13".to_vec(), b"key27".to_vec(), b"key35".to_vec()]
        );

        let mut from = Vec::new();
        db.ascend_greater_or_equal(b"key28", |key, _| {
            from.push(key.to_vec());
            Ok(true)
        })
        .unwrap();
        assert_eq!(from, vec![b"key35".to_vec(), b"key41".to_vec()]);
    }

    #[test]
    fn test_auto_merge_fires_on_schedule() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default_in(dir.path());
        // Every second, with the seconds field.
        options.auto_merge_cron_expr = "* * * * * *".into();
        let db = Cellar::open(options).unwrap();

        for i in 0..200 {
            db.put(format!("k{}", i).as_bytes(), &[b'v'; 256]).unwrap();
        }
        for i in 0..200 {
            db.delete(format!("k{}", i).as_bytes()).unwrap();
        }
        let before = db.stats().unwrap().disk_size;

        std::thread::sleep(Duration::from_millis(2_500));
        let after = db.stats().unwrap().disk_size;
        assert!(
            after < before / 10,
            "auto-merge should have reclaimed the dead store: {} -> {}",
            before,
            after
        );
        db.close().unwrap();
    }

    #[test]
    fn test_custom_comparator_orders_index() {
        let dir = TempDir::new().unwrap();
        let mut options = Options::default_in(dir.path());
        options.compare = Some(Arc::new(|a: &[u8], b: &[u8]| b.cmp(a)));
        let db = Cellar::open(options).unwrap();

        for key in ["a", "b", "c"] {
            db.put(key.as_bytes(), b"v").unwrap();
        }
        let mut keys = Vec::new();
        db.ascend(|key, _| {
            keys.push(key.to_vec());
            Ok(true)
        })
        .unwrap();
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }
}
