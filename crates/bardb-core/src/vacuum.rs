//! Vacuum Daemon: background retirement of old snapshots
//!
//! Each cycle makes the volatile snapshot durable, promotes it to the vacuum
//! head, and releases every byte below the lowest node that snapshot can
//! still reach. Traversals of older snapshots notice the move (see
//! `NodeStore::read_in_snapshot`) and restart from the volatile head.
//!
//! Several processes may share one file. A cycle is claimed by CAS on
//! `vac_time`, and the wait between cycles is derived from the last vacuum
//! time and the process id, so instances drift apart instead of vacuuming in
//! lockstep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{BarError, BarResult};
use crate::format::Node;
use crate::store::{unix_now, NodeStore, Step};

/// Counters shared between the daemon and the database handle
#[derive(Debug, Default)]
pub struct VacuumStats {
    /// Cycles that advanced the vacuum head
    cycles: AtomicU64,
    /// Cycles that found nothing to do or lost a race
    skipped: AtomicU64,
    /// Bytes handed back to the filesystem
    bytes_reclaimed: AtomicU64,
}

impl VacuumStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    pub fn record(&self, outcome: &VacuumOutcome) {
        match outcome {
            VacuumOutcome::Skipped(_) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            VacuumOutcome::Reclaimed { released, .. } => {
                self.cycles.fetch_add(1, Ordering::Relaxed);
                self.bytes_reclaimed.fetch_add(*released, Ordering::Relaxed);
            }
        }
    }
}

/// Why a cycle did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another instance claimed this cycle first
    Claimed,
    /// No writes since the last cycle
    Idle,
    /// The vacuum head moved between reading and advancing it
    RaceLost,
}

/// Reachability statistics of one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentStats {
    /// Bytes of all nodes reachable from the snapshot
    pub live_bytes: u64,
    /// Bytes between low tide and high tide
    pub allocated_bytes: u64,
    /// Reachable nodes
    pub nodes: u64,
    /// Deepest reachable node, the root at depth 0
    pub max_depth: u32,
    /// Offset of the lowest reachable node
    pub lowest_offset: u64,
}

/// Result of one vacuum cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumOutcome {
    Skipped(SkipReason),
    Reclaimed {
        /// New vacuum head
        snapshot: u64,
        /// Low tide after the cycle
        low_tide: u64,
        /// Bytes released this cycle
        released: u64,
        stats: FragmentStats,
    },
}

/// Walk every node reachable from `snapshot`
pub fn fragment_stats(store: &NodeStore, snapshot: u64) -> BarResult<Step<FragmentStats>> {
    let heads = store.heads();
    let mut stats = FragmentStats {
        live_bytes: 0,
        allocated_bytes: heads.high_tide().saturating_sub(heads.low_tide()),
        nodes: 0,
        max_depth: 0,
        lowest_offset: snapshot,
    };

    let mut pending = vec![(snapshot, 0u32)];
    while let Some((at, depth)) = pending.pop() {
        let node = match store.read_in_snapshot(snapshot, at)? {
            Step::Done(node) => node,
            Step::Retry => return Ok(Step::Retry),
        };
        stats.live_bytes += node.encoded_len() as u64;
        stats.nodes += 1;
        stats.max_depth = stats.max_depth.max(depth);
        stats.lowest_offset = stats.lowest_offset.min(at);

        let children = match &node {
            Node::Branch(index) => index.children.as_slice(),
            Node::Bigdata(big) => big.fragments.as_slice(),
            Node::Data(_) => &[][..],
        };
        for &child in children {
            if child >= at {
                return Err(BarError::corrupted(child, format!("child offset is not below its parent at {}", at)));
            }
            pending.push((child, depth + 1));
        }
    }
    Ok(Step::Done(stats))
}

/// Run one vacuum cycle scheduled against the `vac_time` value `observed`
pub fn run_cycle(store: &NodeStore, observed: i64) -> BarResult<VacuumOutcome> {
    let heads = store.heads();
    if !heads.claim_vacuum(observed, unix_now()) {
        return Ok(VacuumOutcome::Skipped(SkipReason::Claimed));
    }

    let prior = heads.vacuum();
    let snapshot = heads.volatile();
    if prior == snapshot {
        return Ok(VacuumOutcome::Skipped(SkipReason::Idle));
    }

    // vacuum may never pass durable
    store.sync_all()?;
    heads.advance_durable(snapshot)?;
    if !heads.advance_vacuum(prior, snapshot) {
        return Ok(VacuumOutcome::Skipped(SkipReason::RaceLost));
    }

    let stats = match fragment_stats(store, snapshot)? {
        Step::Done(stats) => stats,
        // a later cycle already retired our snapshot and owns the reclaim
        Step::Retry => return Ok(VacuumOutcome::Skipped(SkipReason::RaceLost)),
    };

    let released = match heads.advance_low_tide(stats.lowest_offset) {
        Some(old_low) => {
            let len = stats.lowest_offset - old_low;
            store.release(old_low, len)?;
            len
        }
        None => 0,
    };

    Ok(VacuumOutcome::Reclaimed { snapshot, low_tide: heads.low_tide(), released, stats })
}

/// Time to sleep before the next cycle, None when vacuum is disabled.
///
/// The dwell is a CRC32C of `(vac_time, pid)` scaled into
/// `[0, 2^frequency)` seconds; time already spent since `vac_time` counts
/// towards it. Never less than one second.
pub fn vacuum_wait(vac_time: i64, now: i64, pid: u32, frequency: u8) -> Option<Duration> {
    if frequency == 0 {
        return None;
    }
    let mut seed = [0u8; 12];
    seed[..8].copy_from_slice(&vac_time.to_le_bytes());
    seed[8..].copy_from_slice(&pid.to_le_bytes());
    let dwell = (crc32c::crc32c(&seed) as u64) >> (32 - u32::from(frequency.min(32)));
    let elapsed = now.saturating_sub(vac_time).max(0) as u64;
    Some(Duration::from_secs(dwell.saturating_sub(elapsed).max(1)))
}

/// Stop flag the daemon sleeps on
struct Shutdown {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    fn new() -> Self {
        Self { stopped: Mutex::new(false), wake: Condvar::new() }
    }

    fn trigger(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.wake.notify_all();
    }

    /// Sleep for `timeout` or until triggered; true if triggered
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Handle to a running vacuum daemon.
/// Dropping this handle stops the thread and waits for it.
pub struct VacuumHandle {
    shutdown: Arc<Shutdown>,
    thread: Option<thread::JoinHandle<()>>,
}

impl VacuumHandle {
    /// Interrupt the daemon's wait and join it
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VacuumHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the vacuum daemon for `store`.
///
/// `frequency` must be non-zero; 0 means the caller should not start one.
pub fn start_vacuum(store: Arc<NodeStore>, frequency: u8, stats: Arc<VacuumStats>) -> BarResult<VacuumHandle> {
    let shutdown = Arc::new(Shutdown::new());
    let shutdown_clone = Arc::clone(&shutdown);
    let path = store.path().to_path_buf();

    let thread = thread::Builder::new()
        .name("bardb-vacuum".to_string())
        .spawn(move || vacuum_loop(&store, frequency, &stats, &shutdown_clone))
        .map_err(|e| BarError::Io {
            path: Some(path),
            kind: e.kind(),
            message: format!("Failed to spawn vacuum thread: {}", e),
        })?;

    Ok(VacuumHandle { shutdown, thread: Some(thread) })
}

fn vacuum_loop(store: &NodeStore, frequency: u8, stats: &VacuumStats, shutdown: &Shutdown) {
    let pid = std::process::id();
    loop {
        let observed = store.heads().vac_time();
        let Some(wait) = vacuum_wait(observed, unix_now(), pid, frequency) else { return };
        if shutdown.wait(wait) {
            return;
        }

        match run_cycle(store, observed) {
            Ok(outcome) => {
                stats.record(&outcome);
                debug!(?outcome, "vacuum cycle finished");
            }
            Err(e) => warn!(error = %e, "vacuum cycle failed"),
        }
    }
}
