//! Sliding-window event counters for the RPS control loop.
//!
//! A [`RateCounter`] counts events over a fixed trailing window (the run
//! keeps one 2-second and one 5-second counter). The window is divided into
//! buckets; each bucket remembers the time slot it was last written in and
//! is lazily reset when a new slot wraps onto it. Reads may race with
//! writes; the closed control loop tolerates slightly stale counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const BUCKETS: usize = 10;

struct Bucket {
    slot: AtomicU64,
    count: AtomicU64,
}

/// Thread-safe trailing-window event counter.
pub struct RateCounter {
    window: Duration,
    slot_len: Duration,
    start: Instant,
    buckets: Vec<Bucket>,
}

impl RateCounter {
    /// Create a counter over the given trailing window.
    pub fn new(window: Duration) -> Self {
        assert!(!window.is_zero(), "window must be non-zero");
        let buckets = (0..BUCKETS)
            .map(|_| Bucket {
                slot: AtomicU64::new(u64::MAX),
                count: AtomicU64::new(0),
            })
            .collect();
        RateCounter {
            window,
            slot_len: window / BUCKETS as u32,
            start: Instant::now(),
            buckets,
        }
    }

    /// Record one event.
    pub fn incr(&self) {
        self.incr_at(self.start.elapsed());
    }

    /// Events counted in the trailing window.
    pub fn rate(&self) -> u64 {
        self.rate_at(self.start.elapsed())
    }

    /// The window this counter covers.
    pub fn window(&self) -> Duration {
        self.window
    }

    fn slot(&self, elapsed: Duration) -> u64 {
        (elapsed.as_nanos() / self.slot_len.as_nanos().max(1)) as u64
    }

    fn incr_at(&self, elapsed: Duration) {
        let slot = self.slot(elapsed);
        let bucket = &self.buckets[(slot % BUCKETS as u64) as usize];
        if bucket.slot.load(Ordering::Acquire) != slot {
            // A racing writer may double-reset; at most one slot's worth of
            // events is lost, within the controller's noise tolerance.
            bucket.count.store(0, Ordering::Relaxed);
            bucket.slot.store(slot, Ordering::Release);
        }
        bucket.count.fetch_add(1, Ordering::Relaxed);
    }

    fn rate_at(&self, elapsed: Duration) -> u64 {
        let current = self.slot(elapsed);
        let oldest = current.saturating_sub(BUCKETS as u64 - 1);
        self.buckets
            .iter()
            .filter(|b| {
                let s = b.slot.load(Ordering::Acquire);
                s != u64::MAX && s >= oldest && s <= current
            })
            .map(|b| b.count.load(Ordering::Relaxed))
            .sum()
    }
}
