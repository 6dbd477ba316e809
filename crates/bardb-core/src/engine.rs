//! BarDB handle: open, Get, Set, close
//!
//! BarDb ties the node store, the trie, the consistency checker and the
//! vacuum daemon together.
//!
//! **Read path**: lock-free walk from the volatile head
//! **Write path**: CoW rebuild + CAS on the volatile head, then the flush
//! the write's durability tier asks for
//! **Background**: vacuum daemon retires old snapshots on a randomized cadence

use std::path::Path;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::check::{CheckReport, ConsistencyChecker};
use crate::config::{Durability, Options, WriteOptions};
use crate::error::{BarError, BarResult};
use crate::heads::HeadSnapshot;
use crate::store::NodeStore;
use crate::trie;
use crate::vacuum::{run_cycle, start_vacuum, VacuumHandle, VacuumOutcome, VacuumStats};

/// An open BarDB file.
///
/// All public methods take `&self`; share the handle between threads with
/// an `Arc`. Several processes may open the same file at once.
pub struct BarDb {
    store: Arc<NodeStore>,
    /// Vacuum daemon (None when vacuum_frequency is 0 or after close)
    vacuum: Mutex<Option<VacuumHandle>>,
    stats: Arc<VacuumStats>,
    options: Options,
}

impl BarDb {
    /// Open or create a database file.
    ///
    /// A new file gets an empty Head and the identification string. An
    /// existing file is checked, and its volatile head is rolled back to the
    /// durable one if it is damaged. Starts the vacuum daemon unless
    /// `options.vacuum_frequency` is 0.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> BarResult<Self> {
        options.validate().map_err(|reason| BarError::InvalidConfig { reason })?;
        let path = path.as_ref();

        let (store, created) = NodeStore::open(path, &options)?;
        if created {
            info!(path = %path.display(), "created database");
        } else {
            let report = ConsistencyChecker::new(&store).make_consistent()?;
            if let Some(abandoned) = report.rolled_back_from {
                warn!(
                    path = %path.display(),
                    abandoned,
                    restored = report.snapshot,
                    "rolled back to the last durable snapshot"
                );
            }
            info!(path = %path.display(), nodes = report.nodes, keys = report.keys, "opened database");
        }

        let store = Arc::new(store);
        let stats = Arc::new(VacuumStats::new());
        let vacuum = if options.vacuum_frequency > 0 {
            Some(start_vacuum(Arc::clone(&store), options.vacuum_frequency, Arc::clone(&stats))?)
        } else {
            None
        };

        Ok(Self { store, vacuum: Mutex::new(vacuum), stats, options })
    }

    /// Get the value stored under `key`.
    ///
    /// A missing key is `Ok(None)`, never an error.
    pub fn get(&self, key: u32) -> BarResult<Option<Vec<u8>>> {
        trie::get(&self.store, key)
    }

    /// Store `value` under `key`.
    ///
    /// DURABILITY TIERS (`WriteOptions::durability`):
    /// 1. Volatile: visible to readers, no flush
    /// 2. Async: visible; a background thread flushes and advances the
    ///    durable head later. Its failure is logged and counted, not returned
    /// 3. Durable: fdatasync + header msync before returning
    pub fn set(&self, key: u32, value: &[u8], write: WriteOptions) -> BarResult<()> {
        let durability = write.durability();
        let root = trie::set(&self.store, key, value, durability)?;

        match durability {
            Durability::Volatile => {}
            Durability::Async => spawn_durability_upgrade(Arc::clone(&self.store), root),
            Durability::Durable => {
                self.store.sync_all()?;
                self.store.heads().advance_durable(root)?;
            }
        }
        Ok(())
    }

    /// Make everything written so far durable.
    ///
    /// Call after a batch of volatile writes: one fsync for the whole batch.
    pub fn sync(&self) -> BarResult<()> {
        let root = self.store.heads().volatile();
        self.store.sync_all()?;
        self.store.heads().advance_durable(root)
    }

    /// Copy of the header offsets
    pub fn heads(&self) -> HeadSnapshot {
        self.store.heads().snapshot()
    }

    /// Check the volatile snapshot without rolling anything back
    pub fn verify(&self) -> BarResult<CheckReport> {
        ConsistencyChecker::new(&self.store).verify()
    }

    /// Run one vacuum cycle now, on the calling thread
    pub fn vacuum_now(&self) -> BarResult<VacuumOutcome> {
        let outcome = run_cycle(&self.store, self.store.heads().vac_time())?;
        self.stats.record(&outcome);
        Ok(outcome)
    }

    pub fn vacuum_stats(&self) -> &VacuumStats {
        &self.stats
    }

    /// Background durability upgrades that failed since open
    pub fn async_flush_failures(&self) -> u64 {
        self.store.async_flush_failures()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// True while the vacuum daemon thread is alive
    pub fn vacuum_running(&self) -> bool {
        self.vacuum.lock().as_ref().map_or(false, |h| h.is_running())
    }

    /// Stop the vacuum daemon and release the file.
    ///
    /// Dropping the handle does the same; `close` just makes the point
    /// explicit.
    pub fn close(self) {
        self.stop_vacuum();
    }

    fn stop_vacuum(&self) {
        if let Some(handle) = self.vacuum.lock().take() {
            handle.shutdown();
        }
    }
}

impl Drop for BarDb {
    fn drop(&mut self) {
        self.stop_vacuum();
    }
}

/// Flush in the background and advance the durable head to `root`.
///
/// Not awaited and not cancellable.
fn spawn_durability_upgrade(store: Arc<NodeStore>, root: u64) {
    let worker = Arc::clone(&store);
    let spawned = thread::Builder::new()
        .name("bardb-flush".to_string())
        .spawn(move || {
            if let Err(e) = worker.flush_up_to(root) {
                worker.record_async_failure();
                warn!(root, error = %e, "background durability upgrade failed");
            }
        });

    if let Err(e) = spawned {
        store.record_async_failure();
        warn!(root, error = %e, "could not spawn background flush");
    }
}
