//! MVCC head manager over the memory-mapped header page
//!
//! The first page of the file is mapped `MAP_SHARED` so every thread and every
//! process with the file open sees the same header. Its fields are only ever
//! touched as 64-bit atomics:
//!
//! ```text
//!   [0..8]   magic:     "bardbv01", stored last during creation
//!   [8..16]  high_tide: first unused byte (append cursor)
//!   [16..24] low_tide:  first byte still guaranteed readable
//!   [24..32] volatile:  most recent snapshot root
//!   [32..40] durable:   most recent root known to be on stable storage
//!   [40..48] vacuum:    oldest root still live
//!   [48..56] vac_time:  unix seconds of the last vacuum cycle
//! ```
//!
//! Fields are host-endian; the file is meant to be shared between processes
//! on one machine. All offsets only move forward, except that the
//! consistency checker may roll `volatile` back to `durable` at open.

use std::fs::File;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{BarError, BarResult};
use crate::format::{FILE_IDENT, PAGE_SIZE};

const MAGIC: usize = 0;
const HIGH_TIDE: usize = 8;
const LOW_TIDE: usize = 16;
const VOLATILE: usize = 24;
const DURABLE: usize = 32;
const VACUUM: usize = 40;
const VAC_TIME: usize = 48;

/// State of the identification string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicState {
    /// All zero: a creator has not finished yet
    Pending,
    /// The file is a fully initialised BarDB file
    Ready,
    /// Something else wrote this file
    Foreign([u8; 8]),
}

/// Plain copy of the six header integers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadSnapshot {
    pub high_tide: u64,
    pub low_tide: u64,
    pub volatile: u64,
    pub durable: u64,
    pub vacuum: u64,
    pub vac_time: i64,
}

impl HeadSnapshot {
    /// `PAGE_SIZE <= low_tide <= vacuum <= durable <= volatile < high_tide`
    pub fn is_ordered(&self) -> bool {
        PAGE_SIZE <= self.low_tide
            && self.low_tide <= self.vacuum
            && self.vacuum <= self.durable
            && self.durable <= self.volatile
            && self.volatile < self.high_tide
    }
}

/// Handle to the shared header page.
///
/// Owns the mapping; the atomics it hands out live exactly as long as the
/// handle does.
pub struct HeadManager {
    map: MmapMut,
    base: NonNull<u8>,
}

// SAFETY: the mapped page is only accessed through AtomicU64/AtomicI64 views,
// which are safe to share between threads; the mapping itself is owned by the
// handle and never remapped.
unsafe impl Send for HeadManager {}
unsafe impl Sync for HeadManager {}

impl HeadManager {
    /// Map the header page of `file`.
    ///
    /// The file must already be at least one page long; mapping a page past
    /// the end of the file faults on first access.
    pub fn map(file: &File, path: &Path) -> BarResult<Self> {
        // SAFETY: MmapMut::map_mut is unsafe because mapped files can be modified
        // externally. This is sound here because:
        // 1. Other writers are BarDB processes that also only touch the page via atomics
        // 2. The caller has checked the file covers the whole page
        // 3. The mapping lifetime is tied to HeadManager, preventing use-after-unmap
        let mut map = unsafe {
            MmapOptions::new()
                .len(PAGE_SIZE as usize)
                .map_mut(file)
                .map_err(|e| BarError::io_at(path, e, "Failed to map header page"))?
        };
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| BarError::corrupted(0, "header mapping returned a null pointer"))?;
        Ok(Self { map, base })
    }

    fn field(&self, at: usize) -> &AtomicU64 {
        debug_assert!(at % 8 == 0 && at <= VAC_TIME);
        // SAFETY: the mapping is page aligned and PAGE_SIZE long, `at` is a multiple
        // of 8 inside it, and the memory is only ever accessed atomically.
        unsafe { &*(self.base.as_ptr().add(at) as *const AtomicU64) }
    }

    fn vac_time_field(&self) -> &AtomicI64 {
        // SAFETY: same invariants as `field`.
        unsafe { &*(self.base.as_ptr().add(VAC_TIME) as *const AtomicI64) }
    }

    /// Fill in a freshly created header. Does not publish the magic.
    pub fn initialise(&self, root: u64, vac_time: i64) {
        self.field(LOW_TIDE).store(PAGE_SIZE, Ordering::SeqCst);
        self.field(VOLATILE).store(root, Ordering::SeqCst);
        self.field(DURABLE).store(root, Ordering::SeqCst);
        self.field(VACUUM).store(root, Ordering::SeqCst);
        self.vac_time_field().store(vac_time, Ordering::SeqCst);
    }

    /// Set the append cursor of a new file before anything is allocated
    pub fn reset_high_tide(&self, at: u64) {
        self.field(HIGH_TIDE).store(at, Ordering::SeqCst);
    }

    pub fn magic_state(&self) -> MagicState {
        let bytes = self.field(MAGIC).load(Ordering::Acquire).to_ne_bytes();
        if bytes == FILE_IDENT {
            MagicState::Ready
        } else if bytes == [0u8; 8] {
            MagicState::Pending
        } else {
            MagicState::Foreign(bytes)
        }
    }

    /// Mark creation complete; must be the last header write of creation
    pub fn publish_magic(&self) {
        self.field(MAGIC).store(u64::from_ne_bytes(FILE_IDENT), Ordering::Release);
    }

    pub fn high_tide(&self) -> u64 { self.field(HIGH_TIDE).load(Ordering::SeqCst) }
    pub fn low_tide(&self) -> u64 { self.field(LOW_TIDE).load(Ordering::SeqCst) }
    pub fn volatile(&self) -> u64 { self.field(VOLATILE).load(Ordering::SeqCst) }
    pub fn durable(&self) -> u64 { self.field(DURABLE).load(Ordering::SeqCst) }
    pub fn vacuum(&self) -> u64 { self.field(VACUUM).load(Ordering::SeqCst) }
    pub fn vac_time(&self) -> i64 { self.vac_time_field().load(Ordering::SeqCst) }

    /// Copy every header field.
    ///
    /// Loaded smallest first: each field only grows, so a field read earlier
    /// never exceeds a larger one read later and a live writer cannot make an
    /// ordered header look disordered.
    pub fn snapshot(&self) -> HeadSnapshot {
        let low_tide = self.low_tide();
        let vacuum = self.vacuum();
        let durable = self.durable();
        let volatile = self.volatile();
        let high_tide = self.high_tide();
        HeadSnapshot { high_tide, low_tide, volatile, durable, vacuum, vac_time: self.vac_time() }
    }

    /// Atomically bump the append cursor, returning the start of the range
    pub fn reserve(&self, size: u64) -> u64 {
        self.field(HIGH_TIDE).fetch_add(size, Ordering::SeqCst)
    }

    /// Publish `new_root` if `volatile` still equals `expected`.
    ///
    /// A single attempt; the caller rebuilds against the new head on failure.
    pub fn install_volatile(&self, expected: u64, new_root: u64) -> bool {
        self.field(VOLATILE)
            .compare_exchange(expected, new_root, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move `volatile` from an inconsistent snapshot back down to `durable`
    pub fn rollback_volatile(&self, inconsistent: u64, durable: u64) -> bool {
        debug_assert!(durable <= inconsistent);
        self.field(VOLATILE)
            .compare_exchange(inconsistent, durable, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Raise `durable` to `target` unless it is already there, then msync the header.
    pub fn advance_durable(&self, target: u64) -> BarResult<()> {
        let durable = self.field(DURABLE);
        let mut current = durable.load(Ordering::SeqCst);
        loop {
            if current >= target {
                return Ok(());
            }
            match durable.compare_exchange(current, target, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return self.flush(),
                Err(actual) => current = actual,
            }
        }
    }

    /// One attempt to move `vacuum` from `expected` to `target`.
    ///
    /// Losing the race means another cycle already advanced it.
    pub fn advance_vacuum(&self, expected: u64, target: u64) -> bool {
        debug_assert!(expected <= target);
        self.field(VACUUM)
            .compare_exchange(expected, target, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Raise `low_tide` to `target`, returning the previous value if it moved.
    pub fn advance_low_tide(&self, target: u64) -> Option<u64> {
        let low = self.field(LOW_TIDE);
        let mut current = low.load(Ordering::SeqCst);
        loop {
            if current >= target {
                return None;
            }
            match low.compare_exchange(current, target, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(previous) => return Some(previous),
                Err(actual) => current = actual,
            }
        }
    }

    /// Claim the vacuum cycle that was scheduled against `observed`
    pub fn claim_vacuum(&self, observed: i64, now: i64) -> bool {
        self.vac_time_field()
            .compare_exchange(observed, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// msync the header page
    pub fn flush(&self) -> BarResult<()> {
        self.map.flush().map_err(|e| BarError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to msync header page: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mapped() -> (HeadManager, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(PAGE_SIZE).unwrap();
        let heads = HeadManager::map(file.as_file(), file.path()).unwrap();
        (heads, file)
    }

    #[test]
    fn test_magic_lifecycle() {
        let (heads, _file) = mapped();
        assert_eq!(heads.magic_state(), MagicState::Pending);
        heads.publish_magic();
        assert_eq!(heads.magic_state(), MagicState::Ready);
    }

    #[test]
    fn test_foreign_magic() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"SQLite f").unwrap();
        file.as_file().set_len(PAGE_SIZE).unwrap();
        let heads = HeadManager::map(file.as_file(), file.path()).unwrap();
        assert_eq!(heads.magic_state(), MagicState::Foreign(*b"SQLite f"));
    }

    #[test]
    fn test_initialise_is_ordered() {
        let (heads, _file) = mapped();
        heads.reset_high_tide(PAGE_SIZE);
        let root = heads.reserve(24);
        assert_eq!(root, PAGE_SIZE);
        heads.initialise(root, 1_700_000_000);
        let snap = heads.snapshot();
        assert!(snap.is_ordered(), "{:?}", snap);
        assert_eq!(snap.high_tide, PAGE_SIZE + 24);
        assert_eq!(snap.vac_time, 1_700_000_000);
    }

    #[test]
    fn test_install_volatile_is_single_cas() {
        let (heads, _file) = mapped();
        heads.initialise(PAGE_SIZE, 0);
        assert!(heads.install_volatile(PAGE_SIZE, 5000));
        assert!(!heads.install_volatile(PAGE_SIZE, 6000));
        assert_eq!(heads.volatile(), 5000);
    }

    #[test]
    fn test_advance_durable_only_increases() {
        let (heads, _file) = mapped();
        heads.initialise(PAGE_SIZE, 0);
        heads.advance_durable(8000).unwrap();
        heads.advance_durable(6000).unwrap();
        assert_eq!(heads.durable(), 8000);
    }

    #[test]
    fn test_advance_vacuum_and_low_tide() {
        let (heads, _file) = mapped();
        heads.initialise(PAGE_SIZE, 0);
        assert!(heads.advance_vacuum(PAGE_SIZE, 9000));
        assert!(!heads.advance_vacuum(PAGE_SIZE, 9500));
        assert_eq!(heads.vacuum(), 9000);

        assert_eq!(heads.advance_low_tide(6000), Some(PAGE_SIZE));
        assert_eq!(heads.advance_low_tide(5000), None);
        assert_eq!(heads.low_tide(), 6000);
    }

    #[test]
    fn test_claim_vacuum_once() {
        let (heads, _file) = mapped();
        heads.initialise(PAGE_SIZE, 100);
        assert!(heads.claim_vacuum(100, 200));
        assert!(!heads.claim_vacuum(100, 300));
        assert_eq!(heads.vac_time(), 200);
    }

    #[test]
    fn test_concurrent_reserve_hands_out_disjoint_ranges() {
        let (heads, _file) = mapped();
        heads.reset_high_tide(PAGE_SIZE);
        let heads = Arc::new(heads);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = Arc::clone(&heads);
                std::thread::spawn(move || (0..1000).map(|_| h.reserve(16)).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
        assert_eq!(heads.high_tide(), PAGE_SIZE + 8000 * 16);
    }

    #[test]
    fn test_snapshot_stays_ordered_under_commits() {
        use std::sync::atomic::AtomicBool;

        let (heads, _file) = mapped();
        heads.reset_high_tide(PAGE_SIZE);
        let root = heads.reserve(24);
        heads.initialise(root, 0);
        let heads = Arc::new(heads);
        let stop = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..3)
            .map(|_| {
                let h = Arc::clone(&heads);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let base = h.volatile();
                        let root = h.reserve(24);
                        h.install_volatile(base, root);
                    }
                })
            })
            .collect();

        for _ in 0..200_000 {
            let snap = heads.snapshot();
            assert!(snap.is_ordered(), "{:?}", snap);
        }
        stop.store(true, Ordering::Relaxed);
        for w in writers {
            w.join().unwrap();
        }
    }

    #[test]
    fn test_two_mappings_share_state() {
        let (heads, file) = mapped();
        let other = HeadManager::map(file.as_file(), file.path()).unwrap();
        heads.initialise(PAGE_SIZE, 0);
        assert!(heads.install_volatile(PAGE_SIZE, 7777));
        assert_eq!(other.volatile(), 7777);
    }
}
