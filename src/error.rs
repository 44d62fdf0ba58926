//! Error types for cellardb operations.
//!
//! Every fallible operation returns [`CellarResult`]. The taxonomy separates
//! normal outcomes (a missing key), caller mistakes (an empty key, a reused
//! batch), and store-level failures (I/O, corruption). Corruption errors carry
//! enough context to locate the bad bytes on disk.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for cellardb operations.
#[derive(Debug, Error)]
pub enum CellarError {
    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------
    /// Keys must be at least one byte long.
    #[error("key is empty")]
    KeyIsEmpty,

    /// Key exceeds the maximum key size.
    #[error("key too large: {size} bytes exceeds limit of {max} bytes")]
    OversizedKey { size: usize, max: usize },

    /// Value exceeds the maximum value size.
    #[error("value too large: {size} bytes exceeds limit of {max} bytes")]
    OversizedValue { size: usize, max: usize },

    /// Options failed validation during open.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    // -------------------------------------------------------------------------
    // Lookup outcomes
    // -------------------------------------------------------------------------
    /// The key is not present in the store.
    #[error("key not found in database")]
    KeyNotFound,

    /// The key exists on disk but its TTL has elapsed.
    #[error("key has expired")]
    KeyExpired,

    // -------------------------------------------------------------------------
    // Batch state
    // -------------------------------------------------------------------------
    /// Write attempted on a read-only batch.
    #[error("cannot write to a read-only batch")]
    BatchReadOnly,

    /// The batch was already committed and cannot be reused.
    #[error("batch is already committed")]
    BatchCommitted,

    /// The batch was already rolled back and cannot be reused.
    #[error("batch is already rolled back")]
    BatchRolledBack,

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------
    /// Watch was not enabled in the options.
    #[error("watch is disabled; set watch_queue_size > 0 to enable it")]
    WatchDisabled,

    /// Another process holds the directory lock.
    #[error("database directory is used by another process: {path}")]
    DatabaseIsUsing { path: PathBuf },

    /// Operation attempted after `close()`.
    #[error("database is closed")]
    DatabaseClosed,

    /// A merge is already running.
    #[error("merge is in progress, try again later")]
    MergeInProgress,

    // -------------------------------------------------------------------------
    // Storage
    // -------------------------------------------------------------------------
    /// A record on disk could not be decoded.
    #[error("corrupt record{} at offset {offset}: {reason}", path_ctx(.path))]
    CorruptRecord {
        path: Option<PathBuf>,
        offset: u64,
        reason: String,
    },

    /// Stored checksum does not match the computed one.
    #[error("checksum mismatch at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch {
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// A chunk position points beyond the current log.
    #[error("read out of range: segment {segment_id} offset {offset}")]
    ReadOutOfRange { segment_id: u32, offset: u64 },

    /// I/O operation failed.
    #[error("I/O error{}: {message} ({kind})", path_ctx(.path))]
    Io {
        path: Option<PathBuf>,
        kind: std::io::ErrorKind,
        message: String,
    },
}

fn path_ctx(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

impl From<std::io::Error> for CellarError {
    fn from(err: std::io::Error) -> Self {
        CellarError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl CellarError {
    /// Attach a file path to an I/O error for diagnostics.
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        CellarError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for cellardb operations.
pub type CellarResult<T> = Result<T, CellarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_display() {
        let err = CellarError::ChecksumMismatch {
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };
        let display = format!("{}", err);
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
        assert!(display.contains("1024"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CellarError = io_err.into();
        match err {
            CellarError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("expected Io error"),
        }
    }

    #[test]
    fn test_corrupt_record_with_path() {
        let err = CellarError::CorruptRecord {
            path: Some(PathBuf::from("/tmp/0000000001.seg")),
            offset: 99,
            reason: "unknown record kind: 7".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("0000000001.seg"));
        assert!(display.contains("unknown record kind"));
    }
}
