//! BarDB Core: embedded single-file transactional key-value store
//!
//! Maps 32-bit keys to byte values in one file shared by any number of
//! threads and processes, with per-write durability.
//!
//! # Architecture
//!
//! - **Format**: immutable, CRC32C-checked nodes appended after a header page
//! - **Trie**: copy-on-write radix trie; every Set publishes a new root
//! - **Heads**: volatile / durable / vacuum roots in a shared mmapped header,
//!   moved only by compare-and-swap
//! - **Check**: at open, a damaged volatile snapshot rolls back to the durable one
//! - **Vacuum**: background thread that retires old snapshots and punches
//!   holes where they lived
//!
//! ```no_run
//! use bardb_core::{BarDb, Options, WriteOptions};
//!
//! let db = BarDb::open("/tmp/example.bar", Options::default())?;
//! db.set(10, b"qtplatypus", WriteOptions::DURABLE)?;
//! assert_eq!(db.get(10)?, Some(b"qtplatypus".to_vec()));
//! db.close();
//! # Ok::<(), bardb_core::BarError>(())
//! ```

pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod heads;
pub mod platform_durability;
pub mod store;
pub mod trie;
pub mod vacuum;

// Re-export key types for convenience
pub use check::{CheckReport, ConsistencyChecker};
pub use config::{Durability, Options, WriteOptions};
pub use engine::BarDb;
pub use error::{BarError, BarResult};
pub use format::{MAX_VALUE_SIZE, PAGE_SIZE};
pub use heads::HeadSnapshot;
pub use store::{NodeStore, Step};
pub use vacuum::{FragmentStats, SkipReason, VacuumOutcome, VacuumStats};
