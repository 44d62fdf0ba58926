//! Filesystem primitives: durable sync, directory sync, positional reads, and
//! the directory lock file.
//!
//! Durability mapping per platform:
//! - Linux: `fdatasync()`, data without metadata, sufficient for an
//!   append-only log
//! - macOS/iOS: `fcntl(F_FULLFSYNC)`; plain `fsync` only reaches the disk's
//!   volatile cache on Apple platforms
//! - Windows: `FlushFileBuffers()`
//! - elsewhere: `File::sync_data`

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{CellarError, CellarResult};

/// Ensure file data is on persistent storage before returning.
///
/// May block for milliseconds on spinning media; callers must not hold the
/// index lock across it.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fdatasync operates on the open descriptor owned by `file`.
        let rc = unsafe { libc::fdatasync(fd) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fcntl(F_FULLFSYNC) operates on the open descriptor owned by `file`.
        let rc = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: FlushFileBuffers operates on the open handle owned by `file`.
        let rc = unsafe { FlushFileBuffers(handle as *mut _) };
        if rc != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    {
        file.sync_data()
    }
}

/// Sync a directory so renames and unlinks inside it survive a crash.
/// Windows cannot open directories as files; renames there are already
/// journaled by NTFS, so this is a no-op.
pub fn sync_dir(dir: &Path) -> CellarResult<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|e| CellarError::io(dir, e))?;
        durable_sync(&handle).map_err(|e| CellarError::io(dir, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes at `offset` without moving any shared
/// cursor, so concurrent readers never interleave.
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            read += n;
        }
        Ok(())
    }
}

/// Exclusive lock on a database directory, held for the life of the handle.
///
/// Uses `flock(LOCK_EX | LOCK_NB)` on Unix and an exclusive share mode on
/// Windows, so the lock evaporates with the process and a crash never wedges
/// the directory.
pub struct LockFile {
    path: PathBuf,
    // Held open: dropping the descriptor releases the OS lock.
    _file: File,
}

impl LockFile {
    /// Acquire the lock, failing with `DatabaseIsUsing` when another process
    /// holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> CellarResult<Self> {
        let path = path.into();
        let mut file = Self::open_exclusive(&path)?;

        let pid = std::process::id().to_string();
        let _ = file.set_len(0);
        let _ = file.write_all(pid.as_bytes());

        Ok(Self { path, _file: file })
    }

    #[cfg(unix)]
    fn open_exclusive(path: &Path) -> CellarResult<File> {
        use std::os::unix::io::AsRawFd;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| CellarError::io(path, e))?;
        // SAFETY: flock operates on the open descriptor owned by `file`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(CellarError::DatabaseIsUsing {
                    path: path.to_path_buf(),
                });
            }
            return Err(CellarError::io(path, err));
        }
        Ok(file)
    }

    #[cfg(not(unix))]
    fn open_exclusive(path: &Path) -> CellarResult<File> {
        // share_mode(0): any second opener is refused by the OS.
        use std::os::windows::fs::OpenOptionsExt;
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .share_mode(0)
            .open(path)
        {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(CellarError::DatabaseIsUsing {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => Err(CellarError::io(path, e)),
        }
    }

    /// Release the lock and remove the file. Merely dropping the handle
    /// releases the OS lock but leaves the file behind.
    pub fn release(self) -> CellarResult<()> {
        let path = self.path.clone();
        drop(self);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CellarError::io(&path, e)),
        }
    }
}
