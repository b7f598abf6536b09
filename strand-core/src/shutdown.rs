//! Shutdown coordination.
//!
//! Two pieces:
//!
//! - [`ConnectionTracker`] counts live connections, gates new ones, and lets
//!   a shutting-down listener wait for the count to drain.
//! - [`ShutdownSignal`] is the process-wide "stop now" flag. Anything can
//!   trigger it (an operator, or a link that hit out-of-memory); hooks run
//!   once on the first trigger and waiters are released.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use strand_core::shutdown::{ShutdownReason, ShutdownSignal};
//!
//! let signal = ShutdownSignal::new();
//! signal.on_shutdown(|reason| tracing::warn!(?reason, "stopping"));
//!
//! // elsewhere
//! signal.trigger(ShutdownReason::Requested);
//!
//! // main thread
//! signal.wait();
//! ```

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

// ============================================================================
// Connection Tracking
// ============================================================================

/// Connection tracker for draining live links.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    active: AtomicU64,
    accepting: AtomicBool,
    drained: Mutex<()>,
    drained_cv: Condvar,
}

impl Default for TrackerInner {
    fn default() -> Self {
        Self {
            active: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            drained: Mutex::new(()),
            drained_cv: Condvar::new(),
        }
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, unless the tracker stopped accepting or
    /// `limit` connections are already live.
    pub fn try_increment(&self, limit: usize) -> Option<ConnectionGuard> {
        if !self.is_accepting() {
            return None;
        }

        let limit = limit as u64;
        let mut current = self.inner.active.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return None;
            }
            match self.inner.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ConnectionGuard {
                        tracker: self.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of live connections.
    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Stop admitting new connections.
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Wait for all connections to drain.
    ///
    /// Returns true if drained within timeout, false otherwise.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.drained.lock();

        while self.active_count() > 0 {
            if self.inner.drained_cv.wait_until(&mut guard, deadline).timed_out() {
                let remaining = self.active_count();
                if remaining > 0 {
                    warn!(active = remaining, "connection drain timed out");
                    return false;
                }
            }
        }

        info!("all connections drained");
        true
    }

    fn decrement(&self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.inner.drained.lock();
            self.inner.drained_cv.notify_all();
        }
    }
}

/// RAII guard for a tracked connection.
///
/// Automatically decrements the count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.decrement();
    }
}

// ============================================================================
// Shutdown Signal
// ============================================================================

/// Why the process is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Operator or embedding application asked for it.
    Requested,
    /// A link ran out of memory while dispatching.
    OutOfMemory,
    /// An unrecoverable internal failure.
    Fatal,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownReason::Requested => "requested",
            ShutdownReason::OutOfMemory => "out of memory",
            ShutdownReason::Fatal => "fatal error",
        })
    }
}

/// Shutdown hook, run once with the trigger reason.
pub type ShutdownHook = Box<dyn FnOnce(ShutdownReason) + Send>;

/// Cloneable process-wide shutdown flag.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    triggered: AtomicBool,
    reason: Mutex<Option<ShutdownReason>>,
    released: Condvar,
    hooks: Mutex<Vec<ShutdownHook>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown. Returns `true` for the first trigger; later calls
    /// are ignored.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        {
            let mut current = self.inner.reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            self.inner.triggered.store(true, Ordering::Release);
            self.inner.released.notify_all();
        }

        match reason {
            ShutdownReason::Requested => info!(%reason, "shutdown triggered"),
            _ => error!(%reason, "shutdown triggered"),
        }

        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks {
            hook(reason);
        }
        true
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Reason of the first trigger.
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.inner.reason.lock()
    }

    /// Register a hook. Runs immediately if shutdown already triggered.
    pub fn on_shutdown<F>(&self, hook: F)
    where
        F: FnOnce(ShutdownReason) + Send + 'static,
    {
        let reason = {
            let reason = self.inner.reason.lock();
            match *reason {
                Some(reason) => reason,
                None => {
                    self.inner.hooks.lock().push(Box::new(hook));
                    return;
                }
            }
        };
        hook(reason);
    }

    /// Block until triggered.
    pub fn wait(&self) -> ShutdownReason {
        let mut reason = self.inner.reason.lock();
        loop {
            if let Some(r) = *reason {
                return r;
            }
            self.inner.released.wait(&mut reason);
        }
    }

    /// Block until triggered or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ShutdownReason> {
        let deadline = Instant::now() + timeout;
        let mut reason = self.inner.reason.lock();
        loop {
            if let Some(r) = *reason {
                return Some(r);
            }
            if self.inner.released.wait_until(&mut reason, deadline).timed_out() {
                return *reason;
            }
        }
    }
}

impl fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("reason", &self.reason())
            .field("hooks", &self.inner.hooks.lock().len())
            .finish()
    }
}
