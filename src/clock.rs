//! Time source for the Timer Authority
//!
//! All server-side time is read through [`Clock`] as milliseconds since the
//! Unix epoch. Production code uses [`SystemClock`]; tests drive a
//! [`ManualClock`] so timer behaviour is deterministic.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use web_time::{SystemTime, UNIX_EPOCH};

/// Epoch milliseconds, the unit of every timestamp in the wire format
pub type EpochMillis = u64;

/// A source of wall-clock time
pub trait Clock: Send + Sync {
    /// Returns the current time in milliseconds since the Unix epoch
    fn now_ms(&self) -> EpochMillis;
}

/// The operating system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> EpochMillis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// A clock that only moves when told to
///
/// Clones share the same underlying time, so a test can hand one clone to
/// the engine and advance another.
#[derive(Debug, Default, Clone)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    /// Creates a clock frozen at `start`
    pub fn new(start: EpochMillis) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    /// Moves the clock forward by `millis`
    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time
    pub fn set(&self, now: EpochMillis) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> EpochMillis {
        self.0.load(Ordering::SeqCst)
    }
}
