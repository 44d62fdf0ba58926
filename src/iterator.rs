//! Snapshot iterator over the store.
//!
//! Construction freezes a view: an index snapshot plus a handle to the WAL
//! generation it points into. Mutations and even a merge happening after
//! construction are invisible: the handle keeps the old segment files
//! readable until the iterator is dropped.
//!
//! Expired entries are skipped. Decode errors follow the
//! `continue_on_error` policy: either the bad record is logged and skipped
//! (the last error stays available through [`CellarIterator::err`]) or the
//! iterator becomes invalid on the spot.

use std::sync::Arc;

use tracing::warn;

use crate::error::{CellarError, CellarResult};
use crate::index::IndexIterator;
use crate::options::{ClockFn, IteratorOptions};
use crate::record::{Record, RecordKind};
use crate::wal::Wal;

/// One key-value entry yielded by an iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Cursor over a frozen view of the store. See [`crate::Cellar::iter`].
pub struct CellarIterator {
    index_iter: IndexIterator,
    wal: Arc<Wal>,
    options: IteratorOptions,
    clock: ClockFn,
    current: Option<Item>,
    err: Option<CellarError>,
    failed: bool,
}

impl CellarIterator {
    pub(crate) fn new(
        index_iter: IndexIterator,
        wal: Arc<Wal>,
        options: IteratorOptions,
        clock: ClockFn,
    ) -> Self {
        let mut iter = Self {
            index_iter,
            wal,
            options,
            clock,
            current: None,
            err: None,
            failed: false,
        };
        iter.settle();
        iter
    }

    fn now_nanos(&self) -> u64 {
        (self.clock)()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Walk the underlying cursor forward until it rests on a live, decodable,
    /// prefix-matching entry (or runs out).
    fn settle(&mut self) {
        let now = self.now_nanos();
        loop {
            if self.failed {
                self.current = None;
                return;
            }
            let (key, position) = match (self.index_iter.key(), self.index_iter.position()) {
                (Some(key), Some(position)) => (key.to_vec(), position),
                _ => {
                    self.current = None;
                    return;
                }
            };

            if !self.options.prefix.is_empty() && !key.starts_with(&self.options.prefix) {
                self.index_iter.next();
                continue;
            }

            let decoded = self
                .wal
                .read(position)
                .and_then(|payload| Record::decode(&payload, position.chunk_offset));
            match decoded {
                Ok(record) => {
                    if record.kind != RecordKind::Put
                        || (record.expire_at != 0 && record.expire_at <= now)
                    {
                        self.index_iter.next();
                        continue;
                    }
                    self.current = Some(Item {
                        key,
                        value: record.value,
                    });
                    return;
                }
                Err(err) => {
                    if self.options.continue_on_error {
                        warn!(%err, "skipping undecodable record during iteration");
                        self.err = Some(err);
                        self.index_iter.next();
                        continue;
                    }
                    self.err = Some(err);
                    self.failed = true;
                }
            }
        }
    }

    /// Reset to the first entry in traversal order. Clears a previous
    /// error state.
    pub fn rewind(&mut self) {
        self.err = None;
        self.failed = false;
        self.index_iter.rewind();
        self.settle();
    }

    /// Position at `key`, or the nearest entry after it in traversal order.
    pub fn seek(&mut self, key: &[u8]) {
        if self.failed {
            return;
        }
        self.index_iter.seek(key);
        self.settle();
    }

    /// Advance to the next entry.
    pub fn next(&mut self) {
        if self.failed {
            return;
        }
        self.index_iter.next();
        self.settle();
    }

    /// Whether the cursor rests on an entry.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The current entry, if any.
    pub fn item(&self) -> Option<&Item> {
        self.current.as_ref()
    }

    /// Last error observed during iteration. With `continue_on_error` this
    /// accumulates silently while iteration proceeds.
    pub fn err(&self) -> Option<&CellarError> {
        self.err.as_ref()
    }
}
