//! Scheduler service: heap, coordinator thread and clock sampler.

use super::clock::{Clock, Millis, duration_ms, duration_ms_ceil};
use super::heap::TimerHeap;
use super::throttle::DispatchThrottle;
use super::Timer;
use crate::config::millis;
use crate::error::{Error, Result};
use crate::worker::WorkerPool;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Deserialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the [`Scheduler`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delays at or above this use the approximate clock
    #[serde(with = "millis")]
    pub approx_threshold: Duration,
    /// Longest the coordinator sleeps when the heap is empty
    #[serde(with = "millis")]
    pub fallback_window: Duration,
    /// Fastest clock sampling interval
    #[serde(with = "millis")]
    pub min_sample_interval: Duration,
    /// Slowest clock sampling interval
    #[serde(with = "millis")]
    pub max_sample_interval: Duration,
    /// Maximum fired non-priority callbacks in flight at once
    pub dispatch_limit: usize,
    /// Name prefix for the background threads
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            approx_threshold: Duration::from_secs(2),
            fallback_window: Duration::from_secs(10),
            min_sample_interval: Duration::from_millis(1),
            max_sample_interval: Duration::from_millis(100),
            dispatch_limit: 64,
            thread_name: "strand-timer".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the in-flight dispatch limit.
    pub fn dispatch_limit(mut self, limit: usize) -> Self {
        self.dispatch_limit = limit;
        self
    }

    /// Set the empty-heap wake interval.
    pub fn fallback_window(mut self, window: Duration) -> Self {
        self.fallback_window = window;
        self
    }

    /// Set the approximate-clock delay threshold.
    pub fn approx_threshold(mut self, threshold: Duration) -> Self {
        self.approx_threshold = threshold;
        self
    }

    /// Set the clock sampler interval bounds.
    pub fn sample_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_sample_interval = min;
        self.max_sample_interval = max;
        self
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Scheduler counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    scheduled: AtomicU64,
    cancelled: AtomicU64,
    fired: AtomicU64,
    panicked: AtomicU64,
    dropped: AtomicU64,
}

impl SchedulerStats {
    /// Queue operations (including reschedules).
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Cancels that removed a queued timer.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Timers extracted and handed to the pool.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Callbacks that panicked.
    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Fired timers the pool refused or shutdown discarded.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Process-wide timer service.
///
/// Constructed once at startup with [`Scheduler::start`] and shared by
/// `Arc`. Dropping the last handle (or calling [`Scheduler::shutdown`])
/// stops both background threads.
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    config: SchedulerConfig,
    clock: Arc<Clock>,
    heap: Mutex<TimerHeap>,
    wakeup: Condvar,
    pool: Arc<dyn WorkerPool>,
    throttle: Arc<DispatchThrottle>,
    shutdown: AtomicBool,
    stats: SchedulerStats,
}

impl Scheduler {
    /// Start the scheduler threads.
    ///
    /// # Errors
    ///
    /// Returns an error if a background thread cannot be spawned.
    pub fn start(config: SchedulerConfig, pool: Arc<dyn WorkerPool>) -> Result<Arc<Self>> {
        let clock = Arc::new(Clock::new(
            config.min_sample_interval,
            config.max_sample_interval,
        ));
        clock.sample();

        let shared = Arc::new(Shared {
            throttle: DispatchThrottle::new(config.dispatch_limit),
            clock,
            heap: Mutex::new(TimerHeap::new()),
            wakeup: Condvar::new(),
            pool,
            shutdown: AtomicBool::new(false),
            stats: SchedulerStats::default(),
            config,
        });

        let sampler = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-clock", shared.config.thread_name))
                .spawn(move || sampler_loop(&shared))?
        };

        let coordinator = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-coord", shared.config.thread_name))
                .spawn(move || coordinator_loop(&shared))
        };
        let coordinator = match coordinator {
            Ok(handle) => handle,
            Err(e) => {
                shared.shutdown.store(true, Ordering::Release);
                sampler.thread().unpark();
                let _ = sampler.join();
                return Err(Error::Io(e));
            }
        };

        debug!(
            dispatch_limit = shared.config.dispatch_limit,
            "timer scheduler started"
        );

        Ok(Arc::new(Self {
            shared,
            threads: Mutex::new(vec![sampler, coordinator]),
        }))
    }

    /// Create and queue a timer that fires after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchedulerShutdown`] after shutdown.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> Result<Timer>
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        let timer = Timer::new(callback);
        self.queue(&timer, delay)?;
        Ok(timer)
    }

    /// Create and queue a timer that fires at clock time `at`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchedulerShutdown`] after shutdown.
    pub fn schedule_at<F>(&self, at: Millis, callback: F) -> Result<Timer>
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        let timer = Timer::new(callback);
        self.queue_at(&timer, at)?;
        Ok(timer)
    }

    /// Create and queue a priority timer that fires after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchedulerShutdown`] after shutdown.
    pub fn schedule_priority<F>(&self, delay: Duration, callback: F) -> Result<Timer>
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        let timer = Timer::builder().priority(true).build(callback);
        self.queue(&timer, delay)?;
        Ok(timer)
    }

    /// Queue (or move) `timer` to fire after `delay`.
    ///
    /// Long delays are measured from the approximate clock, short ones from
    /// the exact clock. The wake time is rounded up so the timer never fires
    /// before `delay` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchedulerShutdown`] after shutdown.
    pub fn queue(&self, timer: &Timer, delay: Duration) -> Result<()> {
        // Readings are floored to the millisecond and the approximate clock
        // trails the exact one by up to a sampler interval.
        let base = if delay >= self.shared.config.approx_threshold {
            self.shared
                .clock
                .approx_now()
                .saturating_add(duration_ms(self.shared.config.max_sample_interval))
        } else {
            self.shared.clock.exact_now()
        };
        let at = base.saturating_add(1).saturating_add(duration_ms_ceil(delay));
        self.queue_at(timer, at)
    }

    /// Queue (or move) `timer` to fire at clock time `at`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchedulerShutdown`] after shutdown, or
    /// [`Error::TimerBusy`] if another scheduler has the timer queued.
    pub fn queue_at(&self, timer: &Timer, at: Millis) -> Result<()> {
        let mut heap = self.shared.heap.lock();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::SchedulerShutdown);
        }

        let is_root = heap.insert(timer.clone(), at)?;
        self.shared.stats.scheduled.fetch_add(1, Ordering::Relaxed);
        if is_root {
            self.shared.wakeup.notify_one();
        }

        trace!(timer = timer.id(), owner = timer.owner(), at, "timer queued");
        Ok(())
    }

    /// Dequeue `timer`. Returns `true` if it was queued.
    ///
    /// Cancelling an unqueued or already-fired timer is a no-op.
    pub fn cancel(&self, timer: &Timer) -> bool {
        let removed = self.shared.heap.lock().remove(timer);
        if removed {
            self.shared.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            trace!(timer = timer.id(), owner = timer.owner(), "timer cancelled");
        }
        removed
    }

    /// Wake time of the earliest timer, or now + the fallback window.
    pub fn next_due(&self) -> Millis {
        let heap = self.shared.heap.lock();
        self.shared.next_due(&heap, self.shared.clock.exact_now())
    }

    /// Cheap cached current time.
    #[inline]
    pub fn current_approx_time(&self) -> Millis {
        self.shared.clock.approx_now()
    }

    /// Precise current time.
    #[inline]
    pub fn current_exact_time(&self) -> Millis {
        self.shared.clock.exact_now()
    }

    /// The clock both timers and links measure against.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.shared.clock
    }

    /// Number of queued timers.
    pub fn pending(&self) -> usize {
        self.shared.heap.lock().len()
    }

    /// Scheduler counters.
    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    /// Fired callbacks currently running or queued on the pool.
    pub fn in_flight(&self) -> usize {
        self.shared.throttle.in_flight()
    }

    /// Highest observed in-flight count.
    pub fn peak_in_flight(&self) -> usize {
        self.shared.throttle.peak()
    }

    /// Times the coordinator had to wait for a dispatch permit.
    pub fn throttled_waits(&self) -> u64 {
        self.shared.throttle.waits()
    }

    /// Configured in-flight limit.
    pub fn dispatch_limit(&self) -> usize {
        self.shared.throttle.limit()
    }

    /// Whether [`Scheduler::shutdown`] has run.
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the background threads and drop every queued timer.
    ///
    /// Idempotent. Timers already handed to the pool still run.
    pub fn shutdown(&self) {
        {
            let _heap = self.shared.heap.lock();
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            self.shared.wakeup.notify_all();
        }

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            handle.thread().unpark();
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("scheduler thread panicked during shutdown");
            }
        }

        let dropped = self.shared.heap.lock().drain();
        debug!(dropped = dropped.len(), "timer scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.shared.config)
            .field("pending", &self.pending())
            .field("in_flight", &self.in_flight())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Shared {
    fn next_due(&self, heap: &TimerHeap, now: Millis) -> Millis {
        heap.peek_wake()
            .unwrap_or_else(|| now.saturating_add(duration_ms(self.config.fallback_window)))
    }

    fn dispatch(self: &Arc<Self>, timer: Timer) {
        self.stats.fired.fetch_add(1, Ordering::Relaxed);

        let result = if timer.is_priority() {
            let shared = Arc::clone(self);
            self.pool
                .schedule_priority(Box::new(move || shared.run_callback(&timer)))
        } else {
            let Some(permit) = self.throttle.acquire(&self.shutdown) else {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            };
            let shared = Arc::clone(self);
            self.pool.schedule(Box::new(move || {
                let _permit = permit;
                shared.run_callback(&timer);
            }))
        };

        if let Err(e) = result {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "fired timer could not be dispatched");
        }
    }

    fn run_callback(&self, timer: &Timer) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| timer.fire())) {
            self.stats.panicked.fetch_add(1, Ordering::Relaxed);
            error!(
                timer = timer.id(),
                owner = timer.owner(),
                panic = %panic_message(payload.as_ref()),
                "timer callback panicked"
            );
        }
    }
}

fn coordinator_loop(shared: &Arc<Shared>) {
    let mut heap = shared.heap.lock();

    while !shared.shutdown.load(Ordering::Acquire) {
        let now = shared.clock.exact_now();

        if let Some(timer) = heap.pop_due(now) {
            MutexGuard::unlocked(&mut heap, || shared.dispatch(timer));
            continue;
        }

        let wait = shared.next_due(&heap, now).saturating_sub(now).max(1);
        shared.wakeup.wait_for(&mut heap, Duration::from_millis(wait));
    }
}

fn sampler_loop(shared: &Shared) {
    while !shared.shutdown.load(Ordering::Acquire) {
        let interval = shared.clock.sample();
        thread::park_timeout(interval);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
