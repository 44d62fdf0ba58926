//! Atomic multi-key batches.
//!
//! A batch buffers writes in memory; nothing touches the WAL until commit.
//! Commit appends every pending record followed by a `BatchEnd` marker in one
//! writer-lock critical section, then applies the records to the index and
//! enqueues watch events in the same order. Recovery ignores any record group
//! that never reached its `BatchEnd`, which is what makes the group atomic
//! across a crash.
//!
//! Within an open batch, `get` is read-your-writes: a pending put or delete
//! shadows the committed state. Outside the batch nothing is visible until
//! commit.

use std::time::Duration;

use hashbrown::HashMap;

use crate::db::Cellar;
use crate::error::{CellarError, CellarResult};
use crate::options::BatchOptions;
use crate::record::{RecordKind, MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// A buffered write, kept in insertion order until commit.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub kind: RecordKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expire_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Open,
    Committed,
    RolledBack,
}

/// A commit-scoped group of writes with read-your-writes semantics.
///
/// Created by [`Cellar::new_batch`]. A batch is single-owner and must not be
/// used after `commit` or `rollback`.
pub struct Batch<'a> {
    db: &'a Cellar,
    options: BatchOptions,
    pending: Vec<PendingWrite>,
    // key -> slot in `pending`, so a later write to the same key replaces
    // the earlier one in place.
    slots: HashMap<Vec<u8>, usize>,
    state: BatchState,
    snapshot_seq: u64,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(db: &'a Cellar, options: BatchOptions) -> Self {
        Self {
            db,
            options,
            pending: Vec::new(),
            slots: HashMap::new(),
            state: BatchState::Open,
            snapshot_seq: db.last_batch_id(),
        }
    }

    /// Highest batch id committed when this batch was created.
    pub fn snapshot_seq(&self) -> u64 {
        self.snapshot_seq
    }

    fn ensure_open(&self) -> CellarResult<()> {
        match self.state {
            BatchState::Open => Ok(()),
            BatchState::Committed => Err(CellarError::BatchCommitted),
            BatchState::RolledBack => Err(CellarError::BatchRolledBack),
        }
    }

    fn ensure_writable(&self, key: &[u8], value: &[u8]) -> CellarResult<()> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(CellarError::BatchReadOnly);
        }
        if key.is_empty() {
            return Err(CellarError::KeyIsEmpty);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(CellarError::OversizedKey {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(CellarError::OversizedValue {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        Ok(())
    }

    fn stage(&mut self, write: PendingWrite) {
        match self.slots.get(&write.key) {
            Some(&slot) => self.pending[slot] = write,
            None => {
                self.slots.insert(write.key.clone(), self.pending.len());
                self.pending.push(write);
            }
        }
    }

    /// Buffer a put.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> CellarResult<()> {
        self.put_with_expiry(key, value, 0)
    }

    /// Buffer a put whose key expires after `ttl`.
    pub fn put_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> CellarResult<()> {
        let expire_at = self.db.expiry_from_ttl(ttl);
        self.put_with_expiry(key, value, expire_at)
    }

    fn put_with_expiry(&mut self, key: &[u8], value: &[u8], expire_at: u64) -> CellarResult<()> {
        self.db.check_open()?;
        self.ensure_writable(key, value)?;
        self.stage(PendingWrite {
            kind: RecordKind::Put,
            key: key.to_vec(),
            value: value.to_vec(),
            expire_at,
        });
        Ok(())
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: &[u8]) -> CellarResult<()> {
        self.db.check_open()?;
        self.ensure_writable(key, &[])?;
        self.stage(PendingWrite {
            kind: RecordKind::Delete,
            key: key.to_vec(),
            value: Vec::new(),
            expire_at: 0,
        });
        Ok(())
    }

    /// Read through the batch: pending writes shadow committed state.
    pub fn get(&self, key: &[u8]) -> CellarResult<Vec<u8>> {
        self.db.check_open()?;
        self.ensure_open()?;
        if key.is_empty() {
            return Err(CellarError::KeyIsEmpty);
        }

        if let Some(&slot) = self.slots.get(key) {
            let write = &self.pending[slot];
            return match write.kind {
                RecordKind::Delete => Err(CellarError::KeyNotFound),
                _ => {
                    if write.expire_at != 0 && write.expire_at <= self.db.now_nanos() {
                        Err(CellarError::KeyNotFound)
                    } else {
                        Ok(write.value.clone())
                    }
                }
            };
        }
        self.db.get(key)
    }

    /// Commit atomically. On failure before the index step the batch stays
    /// open and retryable; nothing becomes visible.
    pub fn commit(&mut self) -> CellarResult<()> {
        self.db.check_open()?;
        self.ensure_open()?;

        if self.pending.is_empty() {
            self.state = BatchState::Committed;
            return Ok(());
        }

        let guard = self.db.writer_lock();
        self.db
            .commit_pending(&self.pending, self.options.sync, &guard)?;
        drop(guard);

        self.pending.clear();
        self.slots.clear();
        self.state = BatchState::Committed;
        Ok(())
    }

    /// Discard all pending writes.
    pub fn rollback(&mut self) -> CellarResult<()> {
        self.db.check_open()?;
        self.ensure_open()?;
        self.pending.clear();
        self.slots.clear();
        self.state = BatchState::RolledBack;
        Ok(())
    }
}
