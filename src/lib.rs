//! cellardb: an embeddable, log-structured key-value store.
//!
//! The WAL is the store: every write is appended to a segmented, CRC-framed
//! log, and an in-memory ordered index maps each live key to the position of
//! its most recent record. Reads are one index lookup plus one positional
//! read. Deletes append tombstones; space comes back when a merge rewrites
//! the live records into a fresh log and atomically swaps it in.
//!
//! # Features
//!
//! * Point lookups, prefix and range scans, forward and reverse iterators
//! * Atomic multi-key batches with read-your-writes
//! * Per-key TTL with lazy expiry
//! * Ordered, bounded, lossy change-notification stream
//! * Crash recovery that honors batch atomicity and trims torn tails
//! * Optional cron-scheduled auto-merge
//!
//! # Basic usage
//!
//! ```no_run
//! use cellardb::{Cellar, Options};
//!
//! let db = Cellar::open(Options::default_in("/tmp/cellardb-demo"))?;
//!
//! db.put(b"name", b"cellardb")?;
//! assert_eq!(db.get(b"name")?, b"cellardb");
//!
//! db.delete(b"name")?;
//! assert!(matches!(db.get(b"name"), Err(cellardb::CellarError::KeyNotFound)));
//!
//! db.close()?;
//! # Ok::<(), cellardb::CellarError>(())
//! ```

mod batch;
mod db;
mod error;
mod fsutil;
mod index;
mod iterator;
mod merge;
mod options;
mod record;
mod wal;
mod watch;

pub use batch::Batch;
pub use db::{Cellar, Stats};
pub use error::{CellarError, CellarResult};
pub use iterator::{CellarIterator, Item};
pub use options::{
    BatchOptions, ClockFn, CompareFn, IteratorOptions, Options, B, GB, KB, MB,
};
pub use record::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use wal::ChunkPosition;
pub use watch::{Event, EventKind, EventReceiver};
