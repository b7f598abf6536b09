//! Keepalive multiplexing.
//!
//! Without a multiplexer, a link waiting for its next request blocks a
//! worker for up to the keepalive timeout. With one, the link registers its
//! socket and returns the worker to the pool; the multiplexer watches all
//! idle sockets from a single thread and redispatches a link when its
//! socket becomes readable. The keepalive deadline stays with the timer
//! scheduler, and whichever side fires first wins the link through its
//! request-state CAS. Registrations whose link already left keepalive are
//! discarded lazily.
//!
//! ```text
//!   link ──register──► incoming ──► watch list ──poll()──► notify_readable
//!                                        │
//!                         prune links no longer in keepalive
//! ```

use crate::config::millis;
use crate::error::Result;
use crate::link::ConnectionLink;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Takes over keepalive waits from links.
pub trait KeepaliveMultiplexer: Send + Sync {
    /// Watch `link` for readability. Returning `false` declines, and the
    /// link waits on its own worker instead.
    fn register(&self, link: Arc<ConnectionLink>) -> bool;

    /// Number of links currently watched.
    fn watched(&self) -> usize {
        0
    }
}

/// Multiplexer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Start a multiplexer for the listener.
    pub enabled: bool,
    /// Upper bound on one `poll` call; also the pickup latency for new
    /// registrations.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Registrations beyond this are declined.
    pub max_watched: usize,
    pub thread_name: String,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(unix),
            poll_interval: Duration::from_millis(10),
            max_watched: 65_536,
            thread_name: "strand-mux".to_string(),
        }
    }
}

impl MultiplexerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_watched(mut self, max: usize) -> Self {
        self.max_watched = max;
        self
    }
}

/// Start the platform multiplexer if `config.enabled`.
///
/// # Errors
///
/// Returns an error if the multiplexer thread cannot be spawned.
pub fn from_config(config: &MultiplexerConfig) -> Result<Option<Arc<dyn KeepaliveMultiplexer>>> {
    if !config.enabled {
        return Ok(None);
    }
    platform_multiplexer(config)
}

#[cfg(unix)]
fn platform_multiplexer(
    config: &MultiplexerConfig,
) -> Result<Option<Arc<dyn KeepaliveMultiplexer>>> {
    let multiplexer: Arc<dyn KeepaliveMultiplexer> = PollMultiplexer::start(config.clone())?;
    Ok(Some(multiplexer))
}

#[cfg(not(unix))]
fn platform_multiplexer(
    _config: &MultiplexerConfig,
) -> Result<Option<Arc<dyn KeepaliveMultiplexer>>> {
    tracing::warn!("keepalive multiplexer not supported on this platform");
    Ok(None)
}

#[cfg(unix)]
pub use poll::PollMultiplexer;

#[cfg(unix)]
mod poll {
    use super::{KeepaliveMultiplexer, MultiplexerConfig};
    use crate::error::Result;
    use crate::link::ConnectionLink;
    use parking_lot::Mutex;
    use std::io;
    use std::os::fd::RawFd;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};
    use std::thread::{self, JoinHandle};
    use tracing::{debug, trace, warn};

    struct Watch {
        fd: RawFd,
        link: Weak<ConnectionLink>,
    }

    struct Shared {
        config: MultiplexerConfig,
        incoming: Mutex<Vec<Watch>>,
        watched: AtomicUsize,
        stop: AtomicBool,
        woken: AtomicU64,
        pruned: AtomicU64,
    }

    /// `poll(2)`-based multiplexer on one background thread.
    pub struct PollMultiplexer {
        shared: Arc<Shared>,
        thread: Mutex<Option<JoinHandle<()>>>,
    }

    impl PollMultiplexer {
        /// Start the polling thread.
        ///
        /// # Errors
        ///
        /// Returns an error if the thread cannot be spawned.
        pub fn start(config: MultiplexerConfig) -> Result<Arc<Self>> {
            let shared = Arc::new(Shared {
                config,
                incoming: Mutex::new(Vec::new()),
                watched: AtomicUsize::new(0),
                stop: AtomicBool::new(false),
                woken: AtomicU64::new(0),
                pruned: AtomicU64::new(0),
            });

            let handle = {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(shared.config.thread_name.clone())
                    .spawn(move || poll_loop(&shared))?
            };

            debug!(
                poll_interval_ms = shared.config.poll_interval.as_millis() as u64,
                "keepalive multiplexer started"
            );
            Ok(Arc::new(Self {
                shared,
                thread: Mutex::new(Some(handle)),
            }))
        }

        /// Links handed back to the pool after becoming readable.
        pub fn woken(&self) -> u64 {
            self.shared.woken.load(Ordering::Relaxed)
        }

        /// Registrations dropped because their link moved on.
        pub fn pruned(&self) -> u64 {
            self.shared.pruned.load(Ordering::Relaxed)
        }

        /// Stop the thread. Watched links are handed back to the pool.
        pub fn shutdown(&self) {
            if self.shared.stop.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Some(handle) = self.thread.lock().take() {
                handle.thread().unpark();
                let _ = handle.join();
            }
            debug!("keepalive multiplexer stopped");
        }
    }

    impl KeepaliveMultiplexer for PollMultiplexer {
        fn register(&self, link: Arc<ConnectionLink>) -> bool {
            if self.shared.stop.load(Ordering::Acquire) {
                return false;
            }
            let Some(fd) = link.raw_fd() else {
                return false;
            };
            if self.shared.watched.fetch_add(1, Ordering::AcqRel) >= self.shared.config.max_watched
            {
                self.shared.watched.fetch_sub(1, Ordering::AcqRel);
                return false;
            }

            self.shared.incoming.lock().push(Watch {
                fd,
                link: Arc::downgrade(&link),
            });
            if let Some(handle) = self.thread.lock().as_ref() {
                handle.thread().unpark();
            }
            true
        }

        fn watched(&self) -> usize {
            self.shared.watched.load(Ordering::Acquire)
        }
    }

    impl Drop for PollMultiplexer {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

    impl std::fmt::Debug for PollMultiplexer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PollMultiplexer")
                .field("watched", &self.watched())
                .field("woken", &self.woken())
                .field("pruned", &self.pruned())
                .finish()
        }
    }

    fn poll_loop(shared: &Shared) {
        let mut watches: Vec<Watch> = Vec::new();
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let timeout = shared.config.poll_interval.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;

        while !shared.stop.load(Ordering::Acquire) {
            watches.append(&mut shared.incoming.lock());

            let before = watches.len();
            watches.retain(|w| w.link.upgrade().is_some_and(|link| link.is_waiting_keepalive()));
            let pruned = before - watches.len();
            if pruned > 0 {
                shared.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
                shared.watched.fetch_sub(pruned, Ordering::AcqRel);
            }

            if watches.is_empty() {
                thread::park_timeout(shared.config.poll_interval);
                continue;
            }

            fds.clear();
            fds.extend(watches.iter().map(|w| libc::pollfd {
                fd: w.fd,
                events: libc::POLLIN,
                revents: 0,
            }));

            // SAFETY: `fds` is a live, exclusively borrowed buffer of
            // `fds.len()` initialized pollfd entries.
            let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    warn!(error = %err, "poll failed");
                    thread::park_timeout(shared.config.poll_interval);
                }
                continue;
            }
            if n == 0 {
                continue;
            }

            // Descending order keeps swap_remove from disturbing unvisited entries.
            for index in (0..fds.len()).rev() {
                if fds[index].revents == 0 {
                    continue;
                }
                let watch = watches.swap_remove(index);
                shared.watched.fetch_sub(1, Ordering::AcqRel);
                if let Some(link) = watch.link.upgrade() {
                    if link.notify_readable() {
                        shared.woken.fetch_add(1, Ordering::Relaxed);
                        trace!(link_id = link.id(), "keepalive link readable");
                    }
                }
            }
        }

        // Hand everything back; the links fall back to waiting on a worker.
        watches.append(&mut shared.incoming.lock());
        for watch in watches.drain(..) {
            if let Some(link) = watch.link.upgrade() {
                link.notify_readable();
            }
        }
        shared.watched.store(0, Ordering::Release);
    }
}
