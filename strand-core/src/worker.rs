//! Worker Pool
//!
//! Bounded thread pool that runs blocking per-connection work and fired
//! timer callbacks. The engine only ever talks to the [`WorkerPool`] trait;
//! [`RuntimePool`] is the provided implementation, built on the blocking
//! thread pool of a Tokio runtime.
//!
//! ## Lanes
//!
//! ```text
//!  schedule(task)           ──► request lane  (max_threads blocking threads)
//!  schedule_priority(task)  ──► priority lane (priority_threads)
//! ```
//!
//! Priority timers use their own lane so they are never queued behind a
//! saturated request lane.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strand_core::worker::{RuntimePool, WorkerConfig, WorkerPool};
//!
//! let pool = RuntimePool::new(WorkerConfig::new().max_threads(64))?;
//! pool.schedule(Box::new(|| println!("running on a pool thread")))?;
//! ```

use crate::config::millis;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, warn};

/// Unit of work submitted to a pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Thread pool the engine submits work to.
pub trait WorkerPool: Send + Sync {
    /// Run `task` on a pool thread.
    fn schedule(&self, task: Task) -> Result<()>;

    /// Run `task` on a lane reserved for latency-sensitive work.
    fn schedule_priority(&self, task: Task) -> Result<()> {
        self.schedule(task)
    }
}

// ============================================================================
// Worker Configuration
// ============================================================================

/// Configuration for [`RuntimePool`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum blocking threads for request work (0 = 8 per CPU core)
    pub max_threads: usize,
    /// Threads reserved for priority work
    pub priority_threads: usize,
    /// Worker thread name prefix
    pub name_prefix: String,
    /// Stack size for worker threads (bytes)
    pub stack_size: Option<usize>,
    /// How long an idle thread lingers before exiting
    #[serde(with = "millis")]
    pub keep_alive: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_threads: 0,
            priority_threads: 4,
            name_prefix: "strand-worker".to_string(),
            stack_size: None,
            keep_alive: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of request threads.
    #[inline]
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    /// Set the number of priority threads.
    #[inline]
    pub fn priority_threads(mut self, n: usize) -> Self {
        self.priority_threads = n;
        self
    }

    /// Set the worker thread stack size.
    #[inline]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the worker thread name prefix.
    #[inline]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the idle thread keep-alive.
    #[inline]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Get the effective number of request threads.
    ///
    /// Returns `max_threads` if set, otherwise 8 per CPU core.
    #[inline]
    pub fn effective_threads(&self) -> usize {
        if self.max_threads > 0 {
            self.max_threads
        } else {
            num_cpus() * 8
        }
    }
}

/// Get the number of CPU cores.
#[inline]
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// Worker Statistics
// ============================================================================

/// Task counters for a pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl WorkerStats {
    /// Tasks accepted by the pool.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Tasks that ran to completion (including panicking ones).
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Tasks refused after shutdown.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Tasks currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Highest observed number of concurrently running tasks.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::Relaxed)
    }
}

/// Decrements the active count even if the task unwinds.
struct ActiveGuard<'a>(&'a WorkerStats);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a WorkerStats) -> Self {
        let active = stats.active.fetch_add(1, Ordering::Relaxed) + 1;
        stats.peak_active.fetch_max(active, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
        self.0.completed.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Runtime-backed Pool
// ============================================================================

/// Worker pool backed by Tokio blocking threads.
pub struct RuntimePool {
    config: WorkerConfig,
    request: Handle,
    priority: Handle,
    runtimes: Mutex<Option<(Runtime, Runtime)>>,
    closed: AtomicBool,
    stats: Arc<WorkerStats>,
}

impl RuntimePool {
    /// Start a pool with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying runtimes cannot be created.
    pub fn new(config: WorkerConfig) -> Result<Arc<Self>> {
        let request = build_runtime(
            &config,
            config.effective_threads(),
            format!("{}-req", config.name_prefix),
        )?;
        let priority = build_runtime(
            &config,
            config.priority_threads.max(1),
            format!("{}-pri", config.name_prefix),
        )?;

        debug!(
            max_threads = config.effective_threads(),
            priority_threads = config.priority_threads,
            "worker pool started"
        );

        Ok(Arc::new(Self {
            request: request.handle().clone(),
            priority: priority.handle().clone(),
            runtimes: Mutex::new(Some((request, priority))),
            closed: AtomicBool::new(false),
            stats: Arc::new(WorkerStats::default()),
            config,
        }))
    }

    /// Pool configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Pool statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Stop accepting tasks and wait up to `timeout` for running ones.
    pub fn shutdown(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some((request, priority)) = self.runtimes.lock().take() {
            request.shutdown_timeout(timeout);
            priority.shutdown_timeout(timeout);
        }
        debug!("worker pool shut down");
    }

    fn submit(&self, handle: &Handle, task: Task) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::PoolRejected("pool is shut down".to_string()));
        }

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::clone(&self.stats);
        handle.spawn_blocking(move || {
            let _active = ActiveGuard::enter(&stats);
            task();
        });
        Ok(())
    }
}

impl WorkerPool for RuntimePool {
    fn schedule(&self, task: Task) -> Result<()> {
        self.submit(&self.request, task)
    }

    fn schedule_priority(&self, task: Task) -> Result<()> {
        self.submit(&self.priority, task)
    }
}

impl Drop for RuntimePool {
    fn drop(&mut self) {
        if let Some((request, priority)) = self.runtimes.get_mut().take() {
            request.shutdown_background();
            priority.shutdown_background();
        }
    }
}

impl std::fmt::Debug for RuntimePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePool")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("active", &self.stats.active())
            .finish()
    }
}

fn build_runtime(config: &WorkerConfig, threads: usize, name: String) -> Result<Runtime> {
    let mut builder = Builder::new_current_thread();
    builder
        .max_blocking_threads(threads)
        .thread_name(name)
        .thread_keep_alive(config.keep_alive);
    if let Some(size) = config.stack_size {
        builder.thread_stack_size(size);
    }

    builder.build().map_err(|e| {
        warn!(error = %e, "failed to build worker runtime");
        Error::Io(e)
    })
}
