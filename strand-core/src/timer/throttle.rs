//! Backpressure on fired-timer dispatch.
//!
//! A burst of near-simultaneous short timers must not occupy every worker
//! thread. The coordinator takes a permit before handing a fired timer to
//! the pool; when `limit` permits are out it blocks until a callback
//! finishes. Priority timers bypass the throttle.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// How often a blocked coordinator rechecks the shutdown flag.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub(crate) struct DispatchThrottle {
    limit: usize,
    in_flight: Mutex<usize>,
    released: Condvar,
    peak: AtomicUsize,
    waits: AtomicU64,
}

impl DispatchThrottle {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            in_flight: Mutex::new(0),
            released: Condvar::new(),
            peak: AtomicUsize::new(0),
            waits: AtomicU64::new(0),
        })
    }

    /// Take a permit, blocking while the limit is reached.
    ///
    /// Returns `None` if `shutdown` is raised while waiting.
    pub(crate) fn acquire(self: &Arc<Self>, shutdown: &AtomicBool) -> Option<ThrottlePermit> {
        let mut in_flight = self.in_flight.lock();
        if *in_flight >= self.limit {
            self.waits.fetch_add(1, Ordering::Relaxed);
        }

        while *in_flight >= self.limit {
            if shutdown.load(Ordering::Acquire) {
                return None;
            }
            self.released.wait_for(&mut in_flight, SHUTDOWN_CHECK);
        }

        *in_flight += 1;
        self.peak.fetch_max(*in_flight, Ordering::Relaxed);

        Some(ThrottlePermit {
            throttle: Arc::clone(self),
        })
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub(crate) fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    fn release(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        self.released.notify_one();
    }
}

/// Permit for one in-flight timer callback; released on drop.
#[derive(Debug)]
pub(crate) struct ThrottlePermit {
    throttle: Arc<DispatchThrottle>,
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        self.throttle.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_permits_up_to_limit() {
        let throttle = DispatchThrottle::new(2);
        let shutdown = AtomicBool::new(false);

        let a = throttle.acquire(&shutdown).unwrap();
        let _b = throttle.acquire(&shutdown).unwrap();
        assert_eq!(throttle.in_flight(), 2);

        drop(a);
        assert_eq!(throttle.in_flight(), 1);
        assert_eq!(throttle.peak(), 2);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let throttle = DispatchThrottle::new(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let permit = throttle.acquire(&shutdown).unwrap();

        let t = Arc::clone(&throttle);
        let s = Arc::clone(&shutdown);
        let waiter = thread::spawn(move || t.acquire(&s).is_some());

        while throttle.waits() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(throttle.in_flight(), 1);
        drop(permit);

        assert!(waiter.join().unwrap());
        assert_eq!(throttle.waits(), 1);
        assert_eq!(throttle.peak(), 1);
    }

    #[test]
    fn test_shutdown_unblocks_acquire() {
        let throttle = DispatchThrottle::new(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let _permit = throttle.acquire(&shutdown).unwrap();

        let t = Arc::clone(&throttle);
        let s = Arc::clone(&shutdown);
        let waiter = thread::spawn(move || t.acquire(&s).is_none());

        shutdown.store(true, Ordering::Release);
        assert!(waiter.join().unwrap());
    }
}
