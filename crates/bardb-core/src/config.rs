//! Configuration for BarDB
//!
//! `Options` controls how a database file is opened and how often the vacuum
//! daemon runs. `WriteOptions` selects the durability tier of a single Set.

use std::time::Duration;

/// Largest accepted vacuum frequency exponent (2^32 seconds between cycles)
pub const MAX_VACUUM_FREQUENCY: u8 = 32;

/// Options used when opening a database file
#[derive(Debug, Clone)]
pub struct Options {
    /// Vacuum frequency exponent.
    ///
    /// 0 disables the vacuum daemon; otherwise there are at most
    /// 2^vacuum_frequency seconds between vacuum cycles.
    pub vacuum_frequency: u8,
    /// How often an opener re-checks a file another process is still creating
    pub creation_poll_interval: Duration,
    /// Give up waiting for another creator after this long (None waits forever)
    pub creation_timeout: Option<Duration>,
}

impl Options {
    /// Vacuum at least every ~68 minutes
    pub fn standard() -> Self {
        Self {
            vacuum_frequency: 12,
            creation_poll_interval: Duration::from_millis(100),
            creation_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Vacuum at least every ~64 seconds, for write-heavy workloads
    pub fn frequent() -> Self {
        Self {
            vacuum_frequency: 6,
            ..Self::standard()
        }
    }

    /// Never vacuum; the file only grows
    pub fn no_vacuum() -> Self {
        Self {
            vacuum_frequency: 0,
            ..Self::standard()
        }
    }

    /// Upper bound on the time between two vacuum cycles, None when disabled
    pub fn max_vacuum_interval(&self) -> Option<Duration> {
        if self.vacuum_frequency == 0 {
            return None;
        }
        Some(Duration::from_secs(1u64 << self.vacuum_frequency))
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.vacuum_frequency > MAX_VACUUM_FREQUENCY {
            return Err(format!("vacuum_frequency must be in [0, {}]", MAX_VACUUM_FREQUENCY));
        }
        if self.creation_poll_interval.is_zero() {
            return Err("creation_poll_interval must be > 0".into());
        }
        if let Some(timeout) = self.creation_timeout {
            if timeout < self.creation_poll_interval {
                return Err("creation_timeout must be >= creation_poll_interval".into());
            }
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self { Self::standard() }
}

/// Durability flags for a single Set.
///
/// `durable` takes precedence over `volatile`; with neither set the write is
/// made durable by a best-effort background flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Skip every flush; the write may be lost on power failure
    pub volatile: bool,
    /// Flush data and header before returning
    pub durable: bool,
}

impl WriteOptions {
    pub const VOLATILE: Self = Self { volatile: true, durable: false };
    pub const ASYNC: Self = Self { volatile: false, durable: false };
    pub const DURABLE: Self = Self { volatile: false, durable: true };

    /// Resolve the flags into a single tier
    pub fn durability(&self) -> Durability {
        if self.durable {
            Durability::Durable
        } else if self.volatile {
            Durability::Volatile
        } else {
            Durability::Async
        }
    }
}

/// Durability tier of a write, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Durability {
    /// No flush at all
    Volatile,
    /// Fire-and-forget range flush, then the durable head is advanced
    Async,
    /// fdatasync + header msync before Set returns
    Durable,
}
