//! Platform-specific durability and locking primitives
//!
//! `durable_sync` maps to the strongest data flush each platform offers;
//! `lock_file` takes the advisory whole-file lock that keeps two processes
//! from opening the same store as writers.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync() - syncs data but not metadata
/// - macOS/iOS: fcntl(F_FULLFSYNC) - bypasses the drive's volatile write cache
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// May block for a long time under heavy I/O; callers should not hold record
/// bucket locks across it when avoidable.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File reference and stays open for the call.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File reference and stays open for the call.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
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
        // SAFETY: handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Flush a file either durably (`hard`) or not at all.
///
/// Writes go straight to the OS through unbuffered `File`s, so a soft flush
/// has nothing left to do; only the hard path reaches the device.
pub fn flush(file: &File, hard: bool) -> io::Result<()> {
    if hard {
        durable_sync(file)
    } else {
        Ok(())
    }
}

/// Persist directory entries (renames, new files) of `dir`.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        durable_sync(&handle)
    }

    #[cfg(not(unix))]
    {
        // Directory handles cannot be synced on this platform; renames are
        // made durable by the filesystem journal.
        let _ = dir;
        Ok(())
    }
}

/// Lock mode for [`lock_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers may hold the lock
    Shared,
    /// One writer holds the lock
    Exclusive,
}

/// Take an advisory lock on `file`.
///
/// With `nonblocking`, returns `Ok(false)` instead of waiting when another
/// process holds a conflicting lock. The lock is released when the file is
/// closed.
pub fn lock_file(file: &File, mode: LockMode, nonblocking: bool) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let mut operation = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        if nonblocking {
            operation |= libc::LOCK_NB;
        }
        // SAFETY: fd comes from a live File reference.
        let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if nonblocking && err.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        Err(err)
    }

    #[cfg(not(unix))]
    {
        // Advisory locking is not wired up on this platform.
        let _ = (file, mode, nonblocking);
        Ok(true)
    }
}
