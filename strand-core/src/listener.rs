//! Listener: the collaborator that accepts sockets and hands them to links.
//!
//! A [`Listener`] bundles what every link needs from its environment: the
//! worker pool that runs link tasks, the shared timer scheduler, an
//! optional keepalive multiplexer, the protocol that creates handlers, the
//! idle buffer pool, and the lifecycle timeouts.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strand_core::listener::{Listener, ListenerConfig};
//! use std::net::TcpListener;
//!
//! let listener = Listener::builder(scheduler, pool, protocol)
//!     .config(ListenerConfig::default().keepalive_timeout(Duration::from_secs(5)))
//!     .multiplexer(multiplexer)
//!     .build()?;
//!
//! let accept_thread = listener.spawn(TcpListener::bind("0.0.0.0:8080")?)?;
//! shutdown.wait();
//! listener.shutdown();
//! ```

use crate::config::millis;
use crate::error::{Error, Result, is_disconnect_kind};
use crate::handler::Protocol;
use crate::link::{CloseReason, ConnectionLink};
use crate::multiplexer::KeepaliveMultiplexer;
use crate::shutdown::{ConnectionTracker, ShutdownSignal};
use crate::socket::{Socket, TcpSocket};
use crate::stats::LinkStats;
use crate::stream::{BufferPool, LinkBuffers};
use crate::timer::{Scheduler, Timer};
use crate::worker::WorkerPool;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Link lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Idle wait for the next request before closing.
    #[serde(with = "millis")]
    pub keepalive_timeout: Duration,
    /// Default deadline for comet suspensions.
    #[serde(with = "millis")]
    pub suspend_timeout: Duration,
    /// Idle wait between duplex reads.
    #[serde(with = "millis")]
    pub duplex_idle_timeout: Duration,
    /// Blocking read timeout while a handler runs.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    /// Slice length for blocking readiness waits; bounds how long a forced
    /// close takes to notice a blocked worker.
    #[serde(with = "millis")]
    pub poll_slice: Duration,
    /// Live connection limit.
    pub max_connections: usize,
    /// Sleep between non-blocking accept attempts when idle.
    #[serde(with = "millis")]
    pub accept_interval: Duration,
    #[serde(with = "millis")]
    pub housekeeping_interval: Duration,
    /// Idle buffer pairs kept for reuse.
    pub max_idle_buffers: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout: Duration::from_secs(15),
            suspend_timeout: Duration::from_secs(30),
            duplex_idle_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(30),
            poll_slice: Duration::from_millis(250),
            max_connections: 10_000,
            accept_interval: Duration::from_millis(10),
            housekeeping_interval: Duration::from_secs(30),
            max_idle_buffers: 256,
            read_buffer_size: 8 * 1024,
            write_buffer_size: 8 * 1024,
        }
    }
}

impl ListenerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    pub fn suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    pub fn duplex_idle_timeout(mut self, timeout: Duration) -> Self {
        self.duplex_idle_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn poll_slice(mut self, slice: Duration) -> Self {
        self.poll_slice = slice;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn max_idle_buffers(mut self, max: usize) -> Self {
        self.max_idle_buffers = max;
        self
    }

    pub fn buffer_sizes(mut self, read: usize, write: usize) -> Self {
        self.read_buffer_size = read;
        self.write_buffer_size = write;
        self
    }

    fn validate(&self) -> Result<()> {
        let zero = [
            ("keepalive_timeout", self.keepalive_timeout),
            ("suspend_timeout", self.suspend_timeout),
            ("poll_slice", self.poll_slice),
        ]
        .into_iter()
        .find(|(_, d)| d.is_zero());
        if let Some((name, _)) = zero {
            return Err(Error::Config(format!("listener.{name} must be > 0")));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("listener.max_connections must be > 0".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Listener`].
pub struct ListenerBuilder {
    config: ListenerConfig,
    scheduler: Arc<Scheduler>,
    pool: Arc<dyn WorkerPool>,
    protocol: Arc<dyn Protocol>,
    multiplexer: Option<Arc<dyn KeepaliveMultiplexer>>,
    shutdown: ShutdownSignal,
}

impl ListenerBuilder {
    pub fn config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    /// Park idle keepalive links on `multiplexer` instead of a worker.
    pub fn multiplexer(mut self, multiplexer: Arc<dyn KeepaliveMultiplexer>) -> Self {
        self.multiplexer = Some(multiplexer);
        self
    }

    /// Like [`multiplexer`](Self::multiplexer), accepting an optional one.
    pub fn maybe_multiplexer(mut self, multiplexer: Option<Arc<dyn KeepaliveMultiplexer>>) -> Self {
        self.multiplexer = multiplexer;
        self
    }

    /// Share a process-wide shutdown signal. The listener shuts down when
    /// it fires, and links trigger it on out-of-memory.
    pub fn shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = signal;
        self
    }

    /// Build the listener and start its housekeeping timer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid settings, or
    /// [`Error::SchedulerShutdown`] if the scheduler is stopped.
    pub fn build(self) -> Result<Arc<Listener>> {
        self.config.validate()?;

        let listener = Arc::new(Listener {
            buffers: BufferPool::new(
                self.config.max_idle_buffers,
                self.config.read_buffer_size,
                self.config.write_buffer_size,
            ),
            config: self.config,
            scheduler: self.scheduler,
            pool: self.pool,
            protocol: self.protocol,
            multiplexer: self.multiplexer,
            shutdown: self.shutdown,
            tracker: ConnectionTracker::new(),
            stats: LinkStats::new(),
            links: Mutex::new(HashMap::new()),
            housekeeping: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        listener.start_housekeeping()?;

        let weak = Arc::downgrade(&listener);
        listener.shutdown.on_shutdown(move |reason| {
            if let Some(listener) = weak.upgrade() {
                debug!(%reason, "shutdown signal reached listener");
                listener.shutdown();
            }
        });

        debug!(
            protocol = listener.protocol.name(),
            multiplexed = listener.multiplexer.is_some(),
            max_connections = listener.config.max_connections,
            "listener ready"
        );
        Ok(listener)
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Accepts connections and owns their links.
pub struct Listener {
    config: ListenerConfig,
    scheduler: Arc<Scheduler>,
    pool: Arc<dyn WorkerPool>,
    protocol: Arc<dyn Protocol>,
    multiplexer: Option<Arc<dyn KeepaliveMultiplexer>>,
    shutdown: ShutdownSignal,
    tracker: ConnectionTracker,
    stats: LinkStats,
    buffers: BufferPool,
    links: Mutex<HashMap<u64, Arc<ConnectionLink>>>,
    housekeeping: Mutex<Option<Timer>>,
    stopped: AtomicBool,
}

impl Listener {
    /// Start building a listener.
    pub fn builder(
        scheduler: Arc<Scheduler>,
        pool: Arc<dyn WorkerPool>,
        protocol: Arc<dyn Protocol>,
    ) -> ListenerBuilder {
        ListenerBuilder {
            config: ListenerConfig::default(),
            scheduler,
            pool,
            protocol,
            multiplexer: None,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Create a link for an accepted socket and start it.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once shutdown started.
    /// - [`Error::ConnectionLimit`] when `max_connections` links are live.
    /// - [`Error::PoolRejected`] if the worker pool refused the link.
    ///
    /// The socket is closed in every error case.
    pub fn accept(self: &Arc<Self>, socket: Box<dyn Socket>) -> Result<Arc<ConnectionLink>> {
        if self.is_shutting_down() {
            self.stats.record_reject();
            return Err(Error::ShuttingDown);
        }
        let Some(guard) = self.tracker.try_increment(self.config.max_connections) else {
            self.stats.record_reject();
            warn!(
                limit = self.config.max_connections,
                remote = ?socket.remote_addr(),
                "connection limit reached"
            );
            return Err(Error::ConnectionLimit(self.config.max_connections));
        };

        let handler = self.protocol.create_handler();
        let link = ConnectionLink::new(Arc::clone(self), socket, handler, guard);
        self.links.lock().insert(link.id(), Arc::clone(&link));
        self.stats.record_accept();

        // Shutdown may have snapshotted the registry before the insert.
        if self.is_shutting_down() {
            link.close();
        }

        link.start()?;
        Ok(link)
    }

    /// Accept loop over `listener` until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be switched to non-blocking
    /// mode. Per-connection accept failures are logged and skipped.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        info!(addr = ?listener.local_addr().ok(), "listener serving");

        while !self.is_shutting_down() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let socket = match TcpSocket::new(stream) {
                        Ok(socket) => socket,
                        Err(e) => {
                            debug!(%peer, error = %e, "failed to configure accepted socket");
                            continue;
                        }
                    };
                    if let Err(e) = self.accept(Box::new(socket)) {
                        debug!(%peer, error = %e, "connection rejected");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.accept_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_disconnect_kind(e.kind()) => {
                    trace!(error = %e, "peer left before accept");
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    thread::sleep(self.config.accept_interval);
                }
            }
        }

        info!("listener stopped accepting");
        Ok(())
    }

    /// Run [`serve`](Self::serve) on a dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(self: &Arc<Self>, listener: TcpListener) -> Result<JoinHandle<Result<()>>> {
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("strand-accept".to_string())
            .spawn(move || this.serve(listener))?;
        Ok(handle)
    }

    /// Stop accepting and force-close every live link.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tracker.stop_accepting();
        if let Some(timer) = self.housekeeping.lock().take() {
            self.scheduler.cancel(&timer);
        }

        let links: Vec<_> = self.links.lock().values().cloned().collect();
        info!(links = links.len(), "listener shutting down");
        for link in links {
            link.close_with(CloseReason::Shutdown);
        }
    }

    /// Wait for closed links to finish tearing down.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.tracker.drain(timeout)
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.shutdown.is_triggered()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.pool
    }

    pub fn multiplexer(&self) -> Option<&Arc<dyn KeepaliveMultiplexer>> {
        self.multiplexer.as_ref()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Live links.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Look up a live link.
    pub fn link(&self, id: u64) -> Option<Arc<ConnectionLink>> {
        self.links.lock().get(&id).cloned()
    }

    /// Called by a link during teardown.
    pub(crate) fn release(&self, link_id: u64, buffers: LinkBuffers) {
        self.links.lock().remove(&link_id);
        self.buffers.release(buffers);
    }

    fn start_housekeeping(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.housekeeping_interval;
        let timer = Timer::builder()
            .owner("listener-housekeeping")
            .build(move |timer| {
                let Some(listener) = weak.upgrade() else {
                    return;
                };
                listener.housekeeping();
                if !listener.is_shutting_down() {
                    if let Err(e) = listener.scheduler.queue(timer, interval) {
                        debug!(error = %e, "housekeeping not rescheduled");
                    }
                }
            });

        self.scheduler.queue(&timer, interval)?;
        *self.housekeeping.lock() = Some(timer);
        Ok(())
    }

    fn housekeeping(&self) {
        let trimmed = self.buffers.trim(self.buffers.max_idle() / 2);
        let stats = self.stats.snapshot();
        debug!(
            active = self.active_connections(),
            accepted = stats.accepted,
            closed = stats.closed,
            keepalive_timeouts = stats.keepalive_timeouts,
            protocol_violations = stats.protocol_violations,
            idle_buffers = self.buffers.idle_count(),
            trimmed_buffers = trimmed,
            timers = self.scheduler.pending(),
            "listener housekeeping"
        );
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("protocol", &self.protocol.name())
            .field("active", &self.active_connections())
            .field("multiplexed", &self.multiplexer.is_some())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
