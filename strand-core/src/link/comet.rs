//! Comet (long-poll) suspension.

use super::ConnectionLink;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// State of one suspended request, owned by the link while it waits.
#[derive(Debug)]
pub struct CometController {
    generation: u64,
    timeout: Option<Duration>,
    started: Instant,
}

impl CometController {
    pub(crate) fn new(generation: u64, timeout: Option<Duration>) -> Self {
        Self {
            generation,
            timeout,
            started: Instant::now(),
        }
    }

    /// Suspension cycle this controller belongs to.
    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deadline requested by the handler, if any.
    #[inline(always)]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time since the handler asked to suspend.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Cloneable waker for a suspended request.
///
/// Safe to call from any thread. A handle only wakes the suspension cycle
/// it was created for; once the request resumed or the link closed, waking
/// is a no-op.
#[derive(Clone)]
pub struct CometHandle {
    link: Weak<ConnectionLink>,
    link_id: u64,
    generation: u64,
}

impl CometHandle {
    pub(crate) fn new(link: &Arc<ConnectionLink>, generation: u64) -> Self {
        Self {
            link: Arc::downgrade(link),
            link_id: link.id(),
            generation,
        }
    }

    /// Wake the request. Returns `true` if this call caused (or queued) the
    /// resume.
    pub fn wake(&self) -> bool {
        match self.link.upgrade() {
            Some(link) => link.wake_comet(self.generation),
            None => false,
        }
    }

    #[inline(always)]
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Whether the suspension this handle belongs to is still current.
    pub fn is_current(&self) -> bool {
        self.link.upgrade().is_some_and(|link| {
            !link.is_closed() && link.comet_generation() == self.generation
        })
    }
}

impl fmt::Debug for CometHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CometHandle")
            .field("link_id", &self.link_id)
            .field("generation", &self.generation)
            .finish()
    }
}
