//! Shared timer scheduler.
//!
//! Many logical timers (keepalive deadlines, comet suspend deadlines,
//! listener housekeeping) share one heap and two background threads:
//!
//! ```text
//!   schedule/cancel ──► ┌──────────────┐   due timers   ┌────────────┐
//!   (any thread)        │  TimerHeap   │ ─────────────► │ WorkerPool │
//!                       │ (one lock)   │  coordinator   │ callbacks  │
//!                       └──────────────┘                └────────────┘
//!                              ▲
//!                        clock sampler keeps approx_now() fresh
//! ```
//!
//! Callbacks never run under the heap lock, so a slow callback cannot block
//! other threads scheduling or cancelling timers.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strand_core::timer::{Scheduler, SchedulerConfig};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::start(SchedulerConfig::default(), pool)?;
//! let timer = scheduler.schedule(Duration::from_millis(250), |_| {
//!     println!("fired");
//! })?;
//!
//! // Changed our mind
//! scheduler.cancel(&timer);
//! ```

mod clock;
mod heap;
mod scheduler;
mod throttle;

pub use clock::{Clock, Millis};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub(crate) use clock::duration_ms;
pub(crate) use scheduler::panic_message;

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static TIMER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handle returned by the scheduling calls; clone it to cancel or reschedule.
pub type TimerHandle = Timer;

type Callback = Box<dyn Fn(&Timer) + Send + Sync>;

/// A reusable timer.
///
/// The same timer can be queued, fired, and queued again any number of
/// times. Queuing a timer that is already queued moves it; it is never
/// present in the heap twice. While queued, a timer belongs to one
/// scheduler; queuing it on another fails until it fires or is cancelled.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    id: u64,
    owner: Cow<'static, str>,
    priority: bool,
    /// Written only under the heap lock.
    wake_time: AtomicU64,
    /// Heap position; 0 = not queued. Read and written only under the heap lock.
    heap_index: AtomicUsize,
    /// ID of the heap holding the timer; 0 = none.
    queued_in: AtomicU64,
    callback: Callback,
}

impl Timer {
    /// Create an unqueued timer with the default owner label.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        TimerBuilder::new().build(callback)
    }

    /// Start building a timer with an owner label or priority flag.
    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }

    /// Unique timer ID.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Label of the component that owns this timer.
    #[inline]
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Priority timers bypass the dispatch throttle.
    #[inline]
    pub fn is_priority(&self) -> bool {
        self.inner.priority
    }

    /// Wake time of the most recent queuing.
    #[inline]
    pub fn wake_time(&self) -> Millis {
        self.inner.wake_time.load(Ordering::Relaxed)
    }

    /// Snapshot of whether the timer is queued.
    ///
    /// May be stale by the time the caller looks at it; use
    /// [`Scheduler::cancel`]'s return value for a definitive answer.
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.heap_index() != 0
    }

    /// Whether two handles refer to the same timer.
    #[inline]
    pub fn ptr_eq(&self, other: &Timer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    pub(crate) fn heap_index(&self) -> usize {
        self.inner.heap_index.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_heap_index(&self, index: usize) {
        self.inner.heap_index.store(index, Ordering::Relaxed);
    }

    /// Bind the timer to heap `heap`. Fails if another heap holds it.
    #[inline]
    pub(crate) fn claim(&self, heap: u64) -> bool {
        match self
            .inner
            .queued_in
            .compare_exchange(0, heap, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == heap,
        }
    }

    #[inline]
    pub(crate) fn queued_in(&self) -> u64 {
        self.inner.queued_in.load(Ordering::Acquire)
    }

    /// Called by the holding heap after the index is cleared.
    #[inline]
    pub(crate) fn release(&self) {
        self.inner.queued_in.store(0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_wake_time(&self, wake: Millis) {
        self.inner.wake_time.store(wake, Ordering::Relaxed);
    }

    pub(crate) fn fire(&self) {
        (self.inner.callback)(self);
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id())
            .field("owner", &self.owner())
            .field("priority", &self.is_priority())
            .field("wake_time", &self.wake_time())
            .field("queued", &self.is_queued())
            .finish()
    }
}

/// Builder for [`Timer`].
#[derive(Debug, Clone, Default)]
pub struct TimerBuilder {
    owner: Option<Cow<'static, str>>,
    priority: bool,
}

impl TimerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Label the owning component (shows up in logs).
    pub fn owner(mut self, owner: impl Into<Cow<'static, str>>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Mark the timer as priority.
    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Build the timer around `callback`.
    pub fn build<F>(self, callback: F) -> Timer
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        Timer {
            inner: Arc::new(TimerInner {
                id: TIMER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                owner: self.owner.unwrap_or(Cow::Borrowed("timer")),
                priority: self.priority,
                wake_time: AtomicU64::new(0),
                heap_index: AtomicUsize::new(0),
                queued_in: AtomicU64::new(0),
                callback: Box::new(callback),
            }),
        }
    }
}
