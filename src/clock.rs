//! Clock abstractions used by refill so time can be faked in tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" in Unix seconds.
///
/// Bucket timestamps are shared across processes through the store, so this must be
/// wall-clock time, not a process-local monotonic counter.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_secs(&self) -> i64;
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        i64::try_from(secs).unwrap_or(i64::MAX)
    }
}

/// Manually driven clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Start the clock at `now` Unix seconds.
    pub fn new(now: i64) -> Self {
        Self { now: Arc::new(AtomicI64::new(now)) }
    }

    /// Start the clock at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now_secs())
    }

    /// Move the clock forward (or backward, for negative values).
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
