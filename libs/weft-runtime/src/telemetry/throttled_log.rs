//! Rate limiter for repetitive warnings on hot paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Admits at most one log line per interval and counts the ones it swallowed.
///
/// Lock-free: concurrent callers race on a compare-and-swap, exactly one wins
/// each interval.
pub struct ThrottledLog {
    origin: Instant,
    next_ms: AtomicU64,
    interval_ms: u64,
    suppressed: AtomicU64,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ThrottledLog {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            next_ms: AtomicU64::new(0),
            interval_ms: millis(interval),
            suppressed: AtomicU64::new(0),
        }
    }

    /// `Some(n)` when the caller may log now, `n` being the number of events
    /// dropped since the previous admitted one; `None` otherwise.
    pub fn admit(&self) -> Option<u64> {
        let now = millis(self.origin.elapsed());
        let next = self.next_ms.load(Ordering::Relaxed);
        if now >= next
            && self
                .next_ms
                .compare_exchange(
                    next,
                    now.saturating_add(self.interval_ms),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }
}
