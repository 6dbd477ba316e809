//! Node store: the backing file, its header page and the append allocator
//!
//! Nodes are written once with positional I/O and never modified. Space is
//! handed out by bumping `high_tide` in the shared header, so concurrent
//! writers (threads or processes) get disjoint ranges without a lock. Reads
//! use `pread` and take `&self`; a reader never blocks a writer.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::config::{Durability, Options};
use crate::error::{BarError, BarResult};
use crate::format::{decode_tag, IndexNode, Node, PAGE_SIZE};
use crate::heads::{HeadManager, MagicState};
use crate::platform_durability;

/// Outcome of a traversal step that may have raced with vacuum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Finished against a snapshot that was still live
    Done(T),
    /// The snapshot was retired mid-traversal; restart from the volatile head
    Retry,
}

/// Open database file plus its mapped header
pub struct NodeStore {
    file: File,
    path: PathBuf,
    heads: HeadManager,
    /// Background durability upgrades that failed
    async_flush_failures: AtomicU64,
}

impl NodeStore {
    /// Create `path` if it does not exist, otherwise load it.
    ///
    /// The flag is true when this call created the file. Exclusive creation
    /// decides which of several racing openers initialises the header; the
    /// others wait for the identification string.
    pub fn open(path: &Path, options: &Options) -> BarResult<(Self, bool)> {
        match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
            Ok(file) => Self::create_or_discard(file, path).map(|store| (store, true)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Self::load(path, options).map(|store| (store, false))
            }
            Err(e) => Err(BarError::io_at(path, e, "Failed to create database file")),
        }
    }

    /// Run `create`, removing the file if it fails.
    ///
    /// A file left without its identification string would make every later
    /// opener wait out the creation timeout.
    fn create_or_discard(file: File, path: &Path) -> BarResult<Self> {
        Self::create(file, path).map_err(|err| {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove partially created file");
            }
            err
        })
    }

    fn create(file: File, path: &Path) -> BarResult<Self> {
        platform_durability::preallocate(&file, 0, PAGE_SIZE).map_err(|e| BarError::Allocation {
            offset: 0,
            size: PAGE_SIZE,
            message: e.to_string(),
        })?;
        let heads = HeadManager::map(&file, path)?;
        heads.reset_high_tide(PAGE_SIZE);

        let store = Self {
            file,
            path: path.to_path_buf(),
            heads,
            async_flush_failures: AtomicU64::new(0),
        };

        let root = store.write_node(&IndexNode::empty_head().encode(), Durability::Volatile)?;
        store.sync_all()?;
        store.heads.initialise(root, unix_now());
        store.heads.publish_magic();
        store.heads.flush()?;
        Ok(store)
    }

    fn load(path: &Path, options: &Options) -> BarResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BarError::io_at(path, e, "Failed to open database file"))?;
        let started = Instant::now();

        // The creator may not even have grown the file yet
        loop {
            let len = file
                .metadata()
                .map_err(|e| BarError::io_at(path, e, "Failed to stat database file"))?
                .len();
            if len >= PAGE_SIZE {
                break;
            }
            wait_for_creator(path, options, started)?;
        }

        let heads = HeadManager::map(&file, path)?;
        loop {
            match heads.magic_state() {
                MagicState::Ready => break,
                MagicState::Pending => wait_for_creator(path, options, started)?,
                MagicState::Foreign(found_bytes) => {
                    return Err(BarError::NoMagicFound { path: path.to_path_buf(), found_bytes });
                }
            }
        }

        let snapshot = heads.snapshot();
        if !snapshot.is_ordered() {
            return Err(BarError::corrupted(0, format!("header offsets out of order: {:?}", snapshot)));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            heads,
            async_flush_failures: AtomicU64::new(0),
        })
    }

    pub fn heads(&self) -> &HeadManager {
        &self.heads
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserve `size` bytes at the end of the node region.
    ///
    /// The range is backed by storage before it is returned. A failed
    /// pre-allocation leaves the reserved range unused.
    pub fn allocate(&self, size: u64) -> BarResult<u64> {
        let offset = self.heads.reserve(size);
        platform_durability::preallocate(&self.file, offset, size).map_err(|e| BarError::Allocation {
            offset,
            size,
            message: e.to_string(),
        })?;
        Ok(offset)
    }

    /// Allocate space for `bytes`, write them and return their offset.
    ///
    /// Async and Durable writes start write-back of the range right away so
    /// the later flush has less to wait for.
    pub fn write_node(&self, bytes: &[u8], durability: Durability) -> BarResult<u64> {
        let offset = self.allocate(bytes.len() as u64)?;
        write_all_at_offset(&self.file, bytes, offset)
            .map_err(|e| BarError::io_at(&self.path, e, "Failed to write node"))?;
        if durability >= Durability::Async {
            platform_durability::start_writeback(&self.file, offset, bytes.len() as u64)
                .map_err(|e| BarError::io_at(&self.path, e, "Failed to start write-back"))?;
        }
        Ok(offset)
    }

    /// Read and decode the node at `offset`
    pub fn read_node(&self, offset: u64) -> BarResult<Node> {
        let bytes = self.read_bytes(offset)?;
        Node::decode(&bytes, offset)
    }

    fn read_bytes(&self, offset: u64) -> BarResult<Vec<u8>> {
        if offset < PAGE_SIZE {
            return Err(BarError::corrupted(offset, "offset points into the header page"));
        }
        let mut tag = [0u8; 2];
        self.read_at(&mut tag, offset)?;
        let (_, len) = decode_tag(&tag, offset)?;
        let mut buf = vec![0u8; len];
        self.read_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> BarResult<()> {
        read_exact_at_offset(&self.file, buf, offset).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                BarError::corrupted(offset, "node extends past the end of the file")
            } else {
                BarError::io_at(&self.path, e, "Failed to read node")
            }
        })
    }

    /// Read a node on behalf of a traversal rooted at `snapshot`.
    ///
    /// `vacuum` is re-checked after the bytes are in hand: if the snapshot
    /// was retired meanwhile the bytes may come from a punched range, so the
    /// read is a retry whatever it returned.
    pub fn read_in_snapshot(&self, snapshot: u64, offset: u64) -> BarResult<Step<Node>> {
        let bytes = self.read_bytes(offset);
        if snapshot < self.heads.vacuum() {
            return Ok(Step::Retry);
        }
        Node::decode(&bytes?, offset).map(Step::Done)
    }

    /// fdatasync the whole file
    pub fn sync_all(&self) -> BarResult<()> {
        platform_durability::durable_sync(&self.file)
            .map_err(|e| BarError::io_at(&self.path, e, "Failed to sync database file"))
    }

    /// Flush the nodes written since the durable head, then mark `root` durable.
    ///
    /// Every node reachable from `root` but not from the durable snapshot was
    /// allocated after that snapshot was read, so it lies at or above the
    /// durable head. Cheaper than `sync_all` on Linux (no device cache flush);
    /// used for the best-effort tier.
    pub fn flush_up_to(&self, root: u64) -> BarResult<()> {
        let from = self.heads.durable();
        let high = self.heads.high_tide();
        platform_durability::sync_range(&self.file, from, high.saturating_sub(from))
            .map_err(|e| BarError::io_at(&self.path, e, "Failed to flush node range"))?;
        self.heads.advance_durable(root)
    }

    /// Hand `[offset, offset + len)` back to the filesystem
    pub fn release(&self, offset: u64, len: u64) -> BarResult<()> {
        match platform_durability::punch_hole(&self.file, offset, len) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Unsupported || is_not_supported(&e) => {
                tracing::debug!(offset, len, "hole punching unsupported, range left allocated");
                Ok(())
            }
            Err(e) => Err(BarError::io_at(&self.path, e, "Failed to release node range")),
        }
    }

    pub fn record_async_failure(&self) {
        self.async_flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn async_flush_failures(&self) -> u64 {
        self.async_flush_failures.load(Ordering::Relaxed)
    }
}

#[cfg(target_os = "linux")]
fn is_not_supported(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EOPNOTSUPP)
}

#[cfg(not(target_os = "linux"))]
fn is_not_supported(_err: &std::io::Error) -> bool {
    false
}

/// Sleep one poll interval, or fail once the creation timeout is spent
fn wait_for_creator(path: &Path, options: &Options, started: Instant) -> BarResult<()> {
    let waited = started.elapsed();
    if let Some(timeout) = options.creation_timeout {
        if waited >= timeout {
            return Err(BarError::CreationTimedOut { path: path.to_path_buf(), waited });
        }
    }
    thread::sleep(options.creation_poll_interval);
    Ok(())
}

/// Seconds since the unix epoch, as stored in `vac_time`
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reads exactly `buf.len()` bytes at `offset` without moving the cursor.
#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    file.read_exact_at(buf, offset)
}

/// Windows fallback: `seek_read` moves the cursor, but every access in this
/// crate is positional so the cursor is never relied upon.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "unexpected end of file during seek_read"));
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
