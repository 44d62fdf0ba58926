//! In-memory ordered index from key to WAL position.
//!
//! The keydir is the only thing consulted on the read path before the WAL:
//! every live key maps to the position of its most recent put. Deletes remove
//! the entry. Ordering defaults to bytewise comparison and can be replaced
//! through `Options::compare`; the comparator must be a total order.
//!
//! Range traversals use the closed-open convention `[start, end)`.
//!
//! Readers take the read lock and run concurrently; the single writer takes
//! the write lock only for the brief index-apply step of a commit. Iterators
//! copy the entries into a frozen snapshot at construction and are unaffected
//! by later mutation.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::CellarResult;
use crate::options::CompareFn;
use crate::wal::ChunkPosition;

/// Tree key carrying the injected comparator so `BTreeMap` can order by it.
#[derive(Clone)]
struct IndexKey {
    bytes: Vec<u8>,
    compare: Option<CompareFn>,
}

impl IndexKey {
    fn cmp_bytes(&self, other: &[u8]) -> Ordering {
        match &self.compare {
            Some(f) => f(&self.bytes, other),
            None => self.bytes.as_slice().cmp(other),
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_bytes(&other.bytes) == Ordering::Equal
    }
}
impl Eq for IndexKey {}
impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_bytes(&other.bytes)
    }
}

/// Handler invoked per entry during traversal. `Ok(false)` stops early;
/// an error stops and propagates to the caller.
pub(crate) type IndexVisit<'a> = dyn FnMut(&[u8], ChunkPosition) -> CellarResult<bool> + 'a;

/// Sorted key → position map behind a readers-writer lock.
pub(crate) struct KeyDir {
    tree: RwLock<BTreeMap<IndexKey, ChunkPosition>>,
    compare: Option<CompareFn>,
}

impl KeyDir {
    pub fn new(compare: Option<CompareFn>) -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            compare,
        }
    }

    fn key(&self, bytes: &[u8]) -> IndexKey {
        IndexKey {
            bytes: bytes.to_vec(),
            compare: self.compare.clone(),
        }
    }

    /// Insert or replace, returning the prior position if any. The caller
    /// uses the prior position to account for newly-stale bytes.
    pub fn put(&self, key: &[u8], position: ChunkPosition) -> Option<ChunkPosition> {
        self.tree.write().insert(self.key(key), position)
    }

    pub fn get(&self, key: &[u8]) -> Option<ChunkPosition> {
        self.tree.read().get(&self.key(key)).copied()
    }

    pub fn remove(&self, key: &[u8]) -> Option<ChunkPosition> {
        self.tree.write().remove(&self.key(key))
    }

    /// Remove only while the entry still points at `position`. Lazy TTL
    /// expiry uses this so it cannot clobber a concurrent rewrite of the key.
    pub fn remove_if_matches(&self, key: &[u8], position: ChunkPosition) -> bool {
        let mut tree = self.tree.write();
        let probe = self.key(key);
        if tree.get(&probe) == Some(&position) {
            tree.remove(&probe);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    /// Replace the whole mapping in one step. Merge publishes its rebuilt
    /// index through this.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (Vec<u8>, ChunkPosition)>) {
        let mut fresh = BTreeMap::new();
        for (key, position) in entries {
            fresh.insert(
                IndexKey {
                    bytes: key,
                    compare: self.compare.clone(),
                },
                position,
            );
        }
        *self.tree.write() = fresh;
    }

    pub fn ascend(&self, visit: &mut IndexVisit<'_>) -> CellarResult<()> {
        let tree = self.tree.read();
        for (key, position) in tree.iter() {
            if !visit(&key.bytes, *position)? {
                break;
            }
        }
        Ok(())
    }

    pub fn descend(&self, visit: &mut IndexVisit<'_>) -> CellarResult<()> {
        let tree = self.tree.read();
        for (key, position) in tree.iter().rev() {
            if !visit(&key.bytes, *position)? {
                break;
            }
        }
        Ok(())
    }

    /// Ascending traversal over `[start, end)`. An inverted range is empty.
    pub fn ascend_range(&self, start: &[u8], end: &[u8], visit: &mut IndexVisit<'_>) -> CellarResult<()> {
        if self.key(start) > self.key(end) {
            return Ok(());
        }
        let tree = self.tree.read();
        let range = (
            Bound::Included(self.key(start)),
            Bound::Excluded(self.key(end)),
        );
        for (key, position) in tree.range(range) {
            if !visit(&key.bytes, *position)? {
                break;
            }
        }
        Ok(())
    }

    /// Descending traversal over `[start, end)`. An inverted range is empty.
    pub fn descend_range(&self, start: &[u8], end: &[u8], visit: &mut IndexVisit<'_>) -> CellarResult<()> {
        if self.key(start) > self.key(end) {
            return Ok(());
        }
        let tree = self.tree.read();
        let range = (
            Bound::Included(self.key(start)),
            Bound::Excluded(self.key(end)),
        );
        for (key, position) in tree.range(range).rev() {
            if !visit(&key.bytes, *position)? {
                break;
            }
        }
        Ok(())
    }

    /// Ascending traversal starting at the first key >= `from`.
    pub fn ascend_from(&self, from: &[u8], visit: &mut IndexVisit<'_>) -> CellarResult<()> {
        let tree = self.tree.read();
        for (key, position) in tree.range(self.key(from)..) {
            if !visit(&key.bytes, *position)? {
                break;
            }
        }
        Ok(())
    }

    /// Descending traversal starting at the last key <= `from`.
    pub fn descend_from(&self, from: &[u8], visit: &mut IndexVisit<'_>) -> CellarResult<()> {
        let tree = self.tree.read();
        for (key, position) in tree.range(..=self.key(from)).rev() {
            if !visit(&key.bytes, *position)? {
                break;
            }
        }
        Ok(())
    }

    /// Frozen copy of every entry in ascending order.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, ChunkPosition)> {
        self.tree
            .read()
            .iter()
            .map(|(key, position)| (key.bytes.clone(), *position))
            .collect()
    }

    /// Snapshot iterator. Mutations after this call are invisible to it.
    pub fn iter(&self, reverse: bool) -> IndexIterator {
        let mut iter = IndexIterator {
            entries: self.snapshot(),
            compare: self.compare.clone(),
            reverse,
            cursor: None,
        };
        iter.rewind();
        iter
    }
}

/// Cursor over a frozen index snapshot.
pub(crate) struct IndexIterator {
    entries: Vec<(Vec<u8>, ChunkPosition)>,
    compare: Option<CompareFn>,
    reverse: bool,
    cursor: Option<usize>,
}

impl IndexIterator {
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        match &self.compare {
            Some(f) => f(a, b),
            None => a.cmp(b),
        }
    }

    /// Reset to the first entry in traversal order.
    pub fn rewind(&mut self) {
        self.cursor = if self.entries.is_empty() {
            None
        } else if self.reverse {
            Some(self.entries.len() - 1)
        } else {
            Some(0)
        };
    }

    /// Position at `key`, or the nearest entry after it in traversal order.
    pub fn seek(&mut self, key: &[u8]) {
        let first_ge = self
            .entries
            .partition_point(|(k, _)| self.cmp(k, key) == Ordering::Less);
        self.cursor = if self.reverse {
            // Last entry <= key.
            let first_gt = self
                .entries
                .partition_point(|(k, _)| self.cmp(k, key) != Ordering::Greater);
            first_gt.checked_sub(1)
        } else if first_ge < self.entries.len() {
            Some(first_ge)
        } else {
            None
        };
    }

    /// Advance one entry in traversal order.
    pub fn next(&mut self) {
        self.cursor = match self.cursor {
            Some(i) if self.reverse => i.checked_sub(1),
            Some(i) if i + 1 < self.entries.len() => Some(i + 1),
            _ => None,
        };
    }

    pub fn valid(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.cursor.map(|i| self.entries[i].0.as_slice())
    }

    pub fn position(&self) -> Option<ChunkPosition> {
        self.cursor.map(|i| self.entries[i].1)
    }
}
