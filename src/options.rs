//! Configuration for opening a store, creating batches, and building iterators.
//!
//! `Options::default()` matches the store's published defaults (1 GiB
//! segments, no fsync-per-write, watch and auto-merge disabled). Validation
//! runs once inside `Cellar::open` so every later code path can trust the
//! numbers.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{CellarError, CellarResult};

pub const B: u64 = 1;
pub const KB: u64 = 1024 * B;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

/// Custom key ordering for the index. Must be a total order.
pub type CompareFn = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Injected clock, consulted for TTL decisions. Defaults to the system clock.
pub type ClockFn = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// Options for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Directory where segment files, the lock file, and merge artifacts live.
    pub dir_path: PathBuf,

    /// Maximum size of each segment file in bytes.
    pub segment_size: u64,

    /// Fsync after every implicit-batch commit. Without it a machine crash can
    /// lose the most recent writes; a process crash alone loses nothing.
    pub sync: bool,

    /// Fsync after this many bytes have been appended since the last sync.
    /// 0 disables the threshold.
    pub bytes_per_sync: u32,

    /// Capacity of the watch event queue. 0 disables watch entirely.
    pub watch_queue_size: u64,

    /// Cron expression arming the auto-merge timer. Standard 5-field form, or
    /// 6-field with a leading seconds field. Empty disables auto-merge.
    pub auto_merge_cron_expr: String,

    /// Custom index ordering. `None` means bytewise comparison.
    pub compare: Option<CompareFn>,

    /// Clock used for TTL expiry. `None` means `SystemTime::now`.
    pub clock: Option<ClockFn>,
}

impl Options {
    /// Defaults rooted at the given directory.
    pub fn default_in(dir_path: impl Into<PathBuf>) -> Self {
        Self {
            dir_path: dir_path.into(),
            ..Self::default()
        }
    }

    /// Validate all option fields. Called by `Cellar::open`.
    pub fn validate(&self) -> CellarResult<()> {
        if self.dir_path.as_os_str().is_empty() {
            return Err(CellarError::InvalidOptions("dir_path is empty".into()));
        }
        if self.segment_size < MB {
            return Err(CellarError::InvalidOptions(format!(
                "segment_size must be >= 1MB, got {}",
                self.segment_size
            )));
        }
        if !self.auto_merge_cron_expr.is_empty() {
            // Parsed again by the scheduler; failing here keeps a bad
            // expression from surfacing hours later.
            normalize_cron_expr(&self.auto_merge_cron_expr)?;
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir_path: std::env::temp_dir().join("cellardb"),
            segment_size: GB,
            sync: false,
            bytes_per_sync: 0,
            watch_queue_size: 0,
            auto_merge_cron_expr: String::new(),
            compare: None,
            clock: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("dir_path", &self.dir_path)
            .field("segment_size", &self.segment_size)
            .field("sync", &self.sync)
            .field("bytes_per_sync", &self.bytes_per_sync)
            .field("watch_queue_size", &self.watch_queue_size)
            .field("auto_merge_cron_expr", &self.auto_merge_cron_expr)
            .field("compare", &self.compare.as_ref().map(|_| "custom"))
            .field("clock", &self.clock.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Options for creating a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Fsync on commit, same semantics as `Options::sync`.
    pub sync: bool,
    /// A read-only batch rejects writes but still sees a consistent view.
    pub read_only: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            sync: true,
            read_only: false,
        }
    }
}

/// Options for building an iterator.
#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    /// Only keys starting with this prefix are visited. Empty means all keys.
    pub prefix: Vec<u8>,

    /// Traverse in descending order.
    pub reverse: bool,

    /// When true, a record that fails to decode is logged and skipped, and the
    /// last error stays retrievable through `err()`. When false the iterator
    /// becomes invalid at the first error.
    pub continue_on_error: bool,
}

/// Accept the 5-field standard form by prepending a zero seconds field; the
/// parser itself wants seconds.
pub(crate) fn normalize_cron_expr(expr: &str) -> CellarResult<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expr.trim()),
        6 => expr.trim().to_string(),
        n => {
            return Err(CellarError::InvalidOptions(format!(
                "cron expression must have 5 or 6 fields, got {}: {:?}",
                n, expr
            )))
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        CellarError::InvalidOptions(format!("invalid cron expression {:?}: {}", expr, e))
    })
}
