//! Exact and approximate monotonic clocks.
//!
//! Times are milliseconds since the clock was created. The exact clock reads
//! `Instant::now()` on every call. The approximate clock is a cached value
//! refreshed by the sampler thread, so hot paths that only need coarse
//! precision (long timeouts, idle accounting) avoid a clock read per check.
//!
//! ## Adaptive Sampling
//!
//! ```text
//! approx read since last tick?   yes ──► interval = max(interval / 2, min)
//!                                no  ──► interval = min(interval * 2, max)
//! ```
//!
//! A busy process reading the approximate clock keeps it fresh to within the
//! minimum interval; an idle one backs off to the maximum.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time in milliseconds relative to the clock origin.
pub type Millis = u64;

/// Process clock shared by the scheduler and connection links.
#[derive(Debug)]
pub struct Clock {
    origin: Instant,
    approx: AtomicU64,
    approx_read: AtomicBool,
    interval_ms: AtomicU64,
    min_interval: Duration,
    max_interval: Duration,
}

impl Clock {
    /// Create a clock with the given sampler interval bounds.
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        let min_interval = min_interval.max(Duration::from_millis(1));
        let max_interval = max_interval.max(min_interval);
        Self {
            origin: Instant::now(),
            approx: AtomicU64::new(0),
            approx_read: AtomicBool::new(false),
            interval_ms: AtomicU64::new(duration_ms(max_interval)),
            min_interval,
            max_interval,
        }
    }

    /// Current time read from the OS monotonic clock.
    #[inline]
    pub fn exact_now(&self) -> Millis {
        duration_ms(self.origin.elapsed())
    }

    /// Cached current time, at most one sampler interval stale.
    ///
    /// Never behind the last value the sampler published, and never moves
    /// backward.
    #[inline]
    pub fn approx_now(&self) -> Millis {
        if !self.approx_read.load(Ordering::Relaxed) {
            self.approx_read.store(true, Ordering::Relaxed);
        }
        self.approx.load(Ordering::Acquire)
    }

    /// Convert a clock value back into an `Instant`.
    pub fn instant_at(&self, at: Millis) -> Instant {
        self.origin + Duration::from_millis(at)
    }

    /// Current sampler interval.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// Refresh the cached time and adapt the interval.
    ///
    /// Called by the sampler thread; returns how long to sleep before the
    /// next sample.
    pub fn sample(&self) -> Duration {
        let now = self.exact_now();
        self.approx.fetch_max(now, Ordering::AcqRel);

        let was_read = self.approx_read.swap(false, Ordering::Relaxed);
        let current = self.interval_ms.load(Ordering::Relaxed);
        let min = duration_ms(self.min_interval);
        let max = duration_ms(self.max_interval);

        let next = if was_read {
            (current / 2).max(min)
        } else {
            current.saturating_mul(2).min(max)
        };
        self.interval_ms.store(next, Ordering::Relaxed);

        Duration::from_millis(next)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(100))
    }
}

#[inline]
pub(crate) fn duration_ms(d: Duration) -> Millis {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Whole milliseconds in `d`, rounding any fractional part up.
#[inline]
pub(crate) fn duration_ms_ceil(d: Duration) -> Millis {
    u64::try_from(d.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}
