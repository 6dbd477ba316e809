//! Platform-specific file primitives
//!
//! Each platform has different guarantees for when data is actually written to persistent storage.
//! This module maps the operations the node store needs (durable sync, ranged flush,
//! pre-allocation and hole punching) to the strongest primitive available on each platform.

use std::fs::File;
use std::io;

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync() - syncs data but not metadata (faster than fsync)
/// - macOS/iOS: fcntl(F_FULLFSYNC) - bypasses disk cache, ensures data reaches physical media
/// - Windows: FlushFileBuffers() - flushes internal buffers and requests device flush
/// - Other: file.sync_data() - Rust stdlib fallback
///
/// The caller must not hold locks that could cause deadlocks during the sync operation.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fdatasync is a POSIX system call that operates on a valid file descriptor.
        // We obtain the fd from a valid File reference, so it is guaranteed to be open.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // Standard fsync() on macOS only flushes to the disk's volatile write cache.
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fcntl with F_FULLFSYNC is a macOS system call that operates on a valid fd.
        // We obtain the fd from a valid File reference, so it is guaranteed to be open.
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
        // SAFETY: FlushFileBuffers is a Windows API call on a valid file handle.
        // We obtain the handle from a valid File reference.
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

/// Flushes `[offset, offset + len)` and waits for the write-out to finish.
///
/// On Linux this is sync_file_range(WAIT_BEFORE | WRITE | WAIT_AFTER), which
/// does not flush the device cache or file metadata. Elsewhere it falls back
/// to a whole-file `durable_sync`.
pub fn sync_range(file: &File, offset: u64, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let flags = libc::SYNC_FILE_RANGE_WAIT_BEFORE
            | libc::SYNC_FILE_RANGE_WRITE
            | libc::SYNC_FILE_RANGE_WAIT_AFTER;
        sync_file_range(file, offset, len, flags)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (offset, len);
        durable_sync(file)
    }
}

/// Starts write-back of `[offset, offset + len)` without waiting for it.
///
/// A hint only; a no-op where the platform has no ranged write-back.
pub fn start_writeback(file: &File, offset: u64, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        sync_file_range(file, offset, len, libc::SYNC_FILE_RANGE_WRITE)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, offset, len);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn sync_file_range(file: &File, offset: u64, len: u64, flags: libc::c_uint) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    // SAFETY: sync_file_range only reads the descriptor and the integer range;
    // the fd comes from a valid File reference.
    let result = unsafe { libc::sync_file_range(fd, offset as libc::off64_t, len as libc::off64_t, flags) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Guarantees the file is physically backed up to `offset + len`.
///
/// Linux uses fallocate(mode 0), which extends the file size and fails with
/// ENOSPC when the disk is full. Filesystems without fallocate, and other
/// platforms, grow the file with `set_len` instead.
pub fn preallocate(file: &File, offset: u64, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fallocate operates on a valid descriptor obtained from a live File
        // and does not touch user memory.
        let result = unsafe { libc::fallocate(fd, 0, offset as libc::off_t, len as libc::off_t) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EOPNOTSUPP) {
            return Err(err);
        }
    }

    grow_to(file, offset + len)
}

/// Extends the file to `end` bytes unless it is already longer.
///
/// Serialized process-wide so a racing caller never shrinks the file.
fn grow_to(file: &File, end: u64) -> io::Result<()> {
    static GROW_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());
    let _guard = GROW_LOCK.lock();
    if file.metadata()?.len() < end {
        file.set_len(end)?;
    }
    Ok(())
}

/// Releases the storage behind `[offset, offset + len)` while keeping the file size.
///
/// Reads of the range return zeros afterwards. Platforms without hole punching
/// keep the bytes; the range is still never read again.
pub fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        let mode = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
        // SAFETY: fallocate operates on a valid descriptor obtained from a live File
        // and does not touch user memory.
        let result = unsafe { libc::fallocate(fd, mode, offset as libc::off_t, len as libc::off_t) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (file, offset, len);
        Ok(())
    }
}
