//! Cross-thread request state.
//!
//! A link can be asked to resume by a thread other than the one that
//! suspended it: a timer firing, the readiness multiplexer, or application
//! code completing a long-poll. The driving thread and such wakers race on a
//! single atomic cell; every transition is a compare-and-swap, so exactly one
//! side wins each race.
//!
//! ## Suspend vs. Wake
//!
//! ```text
//!  driving thread                       waker
//!  ──────────────                       ─────
//!  Request ─► AsyncStart
//!                 │ try_suspend            │ wake
//!                 ▼                        ▼
//!     AsyncStart ─► Suspend         AsyncStart ─► AsyncWake
//!     (parked; waker will           (wake recorded; driving thread
//!      see Suspend ─► Request        sees AsyncWake ─► Request and
//!      and schedule the resume)      resumes in place)
//! ```
//!
//! Whichever CAS lands first decides who owns the resume. There is never a
//! case where both believe they must resume, or neither does.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};

/// Request-level state of a link.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestState {
    /// Link created, not yet dispatched
    #[default]
    Init = 0,
    /// A thread is driving the link
    Request = 1,
    /// Idle between requests, waiting for data or deadline
    Keepalive = 2,
    /// Handler started an async request, not yet parked
    AsyncStart = 3,
    /// A wake arrived before the driving thread parked
    AsyncWake = 4,
    /// Parked; the next wake schedules a resume
    Suspend = 5,
    /// Torn down (absorbing)
    Destroy = 6,
}

impl RequestState {
    #[inline(always)]
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Request,
            2 => Self::Keepalive,
            3 => Self::AsyncStart,
            4 => Self::AsyncWake,
            5 => Self::Suspend,
            _ => Self::Destroy,
        }
    }

    /// Name for logging.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Request => "request",
            Self::Keepalive => "keepalive",
            Self::AsyncStart => "async-start",
            Self::AsyncWake => "async-wake",
            Self::Suspend => "suspend",
            Self::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the driving thread's attempt to park.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// Parked; release the thread. A later wake schedules the resume.
    Suspended,
    /// A wake raced in first; resume on this thread now.
    Woken,
}

/// Result of a wake attempt from another thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The waker won the link and must schedule the resume task.
    Resume,
    /// The wake was recorded; the driving thread resumes in place.
    Deferred,
    /// Nothing to wake (already running, already woken, or destroyed).
    Ignored,
}

/// Atomic request-state cell.
#[derive(Debug, Default)]
pub struct RequestStateCell {
    state: AtomicU8,
}

impl RequestStateCell {
    /// Create a cell in `Init`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state (snapshot).
    #[inline]
    pub fn get(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the link has been destroyed.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.get() == RequestState::Destroy
    }

    /// `Init → Request`: accept handed to a worker.
    ///
    /// # Errors
    ///
    /// Fails if the cell is not in `Init`.
    pub fn to_request(&self) -> Result<()> {
        self.transition(RequestState::Init, RequestState::Request)
    }

    /// `Request → Keepalive`: request done, waiting for the next one.
    ///
    /// # Errors
    ///
    /// Fails if the cell is not in `Request`.
    pub fn to_keepalive(&self) -> Result<()> {
        self.transition(RequestState::Request, RequestState::Keepalive)
    }

    /// `Request → AsyncStart`: handler began an async request.
    ///
    /// # Errors
    ///
    /// Fails if the cell is not in `Request`.
    pub fn to_async_start(&self) -> Result<()> {
        self.transition(RequestState::Request, RequestState::AsyncStart)
    }

    /// Try to park after an async start.
    ///
    /// `AsyncStart → Suspend` if no wake arrived; otherwise the pending
    /// `AsyncWake` is consumed (`→ Request`) and the caller must resume.
    ///
    /// # Errors
    ///
    /// Fails if the cell is in neither `AsyncStart` nor `AsyncWake`.
    pub fn try_suspend(&self) -> Result<SuspendOutcome> {
        loop {
            let current = self.get();
            let (next, outcome) = match current {
                RequestState::AsyncStart => (RequestState::Suspend, SuspendOutcome::Suspended),
                RequestState::AsyncWake => (RequestState::Request, SuspendOutcome::Woken),
                other => {
                    return Err(Error::InvalidRequestState {
                        from: other,
                        to: RequestState::Suspend,
                    });
                }
            };

            if self.cas(current, next) {
                return Ok(outcome);
            }
        }
    }

    /// Wake the link from another thread.
    ///
    /// - `Suspend → Request`: caller must schedule the resume.
    /// - `Keepalive → Request`: caller must schedule the dispatch.
    /// - `AsyncStart → AsyncWake`: the driving thread will pick it up.
    /// - anything else: ignored.
    pub fn wake(&self) -> WakeOutcome {
        loop {
            let current = self.get();
            let (next, outcome) = match current {
                RequestState::Suspend | RequestState::Keepalive => {
                    (RequestState::Request, WakeOutcome::Resume)
                }
                RequestState::AsyncStart => (RequestState::AsyncWake, WakeOutcome::Deferred),
                _ => return WakeOutcome::Ignored,
            };

            if self.cas(current, next) {
                return outcome;
            }
        }
    }

    /// Wake only if the link is parked in keepalive.
    ///
    /// Used by readiness notifications and keepalive deadlines, which must
    /// never disturb a comet suspension.
    pub fn wake_keepalive(&self) -> WakeOutcome {
        if self.cas(RequestState::Keepalive, RequestState::Request) {
            WakeOutcome::Resume
        } else {
            WakeOutcome::Ignored
        }
    }

    /// Wake only if the link is in an async phase.
    ///
    /// Used by comet wakers and suspend deadlines, which must never take over
    /// a keepalive wait.
    pub fn wake_async(&self) -> WakeOutcome {
        loop {
            let current = self.get();
            let (next, outcome) = match current {
                RequestState::Suspend => (RequestState::Request, WakeOutcome::Resume),
                RequestState::AsyncStart => (RequestState::AsyncWake, WakeOutcome::Deferred),
                _ => return WakeOutcome::Ignored,
            };

            if self.cas(current, next) {
                return outcome;
            }
        }
    }

    /// `AsyncWake → Request`: driving thread consumes a pending wake.
    ///
    /// Returns `false` if there was none.
    pub fn take_wake(&self) -> bool {
        self.cas(RequestState::AsyncWake, RequestState::Request)
    }

    /// `AsyncStart | AsyncWake → Request`: handler finished the async request
    /// on the driving thread without parking.
    pub fn complete_async(&self) -> bool {
        self.cas(RequestState::AsyncStart, RequestState::Request) || self.take_wake()
    }

    /// Move to `Destroy`. Returns the previous state, or `None` if it was
    /// already destroyed.
    pub fn destroy(&self) -> Option<RequestState> {
        let previous = RequestState::from_u8(
            self.state
                .swap(RequestState::Destroy as u8, Ordering::AcqRel),
        );
        (previous != RequestState::Destroy).then_some(previous)
    }

    fn transition(&self, from: RequestState, to: RequestState) -> Result<()> {
        if self.cas(from, to) {
            Ok(())
        } else {
            Err(Error::InvalidRequestState {
                from: self.get(),
                to,
            })
        }
    }

    #[inline]
    fn cas(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn in_async_start() -> RequestStateCell {
        let cell = RequestStateCell::new();
        cell.to_request().unwrap();
        cell.to_async_start().unwrap();
        cell
    }

    #[test]
    fn test_basic_cycle() {
        let cell = RequestStateCell::new();
        cell.to_request().unwrap();
        cell.to_keepalive().unwrap();
        assert_eq!(cell.wake(), WakeOutcome::Resume);
        assert_eq!(cell.get(), RequestState::Request);
    }

    #[test]
    fn test_double_request_rejected() {
        let cell = RequestStateCell::new();
        cell.to_request().unwrap();
        assert!(matches!(
            cell.to_request(),
            Err(Error::InvalidRequestState { from: RequestState::Request, .. })
        ));
    }

    #[test]
    fn test_suspend_then_wake() {
        let cell = in_async_start();
        assert_eq!(cell.try_suspend().unwrap(), SuspendOutcome::Suspended);
        assert_eq!(cell.get(), RequestState::Suspend);
        assert_eq!(cell.wake(), WakeOutcome::Resume);
        assert_eq!(cell.get(), RequestState::Request);
        assert_eq!(cell.wake(), WakeOutcome::Ignored);
    }

    #[test]
    fn test_wake_then_suspend() {
        let cell = in_async_start();
        assert_eq!(cell.wake(), WakeOutcome::Deferred);
        assert_eq!(cell.wake(), WakeOutcome::Ignored);
        assert_eq!(cell.try_suspend().unwrap(), SuspendOutcome::Woken);
        assert_eq!(cell.get(), RequestState::Request);
    }

    #[test]
    fn test_keepalive_wake_ignores_comet() {
        let cell = in_async_start();
        cell.try_suspend().unwrap();
        assert_eq!(cell.wake_keepalive(), WakeOutcome::Ignored);
        assert_eq!(cell.get(), RequestState::Suspend);
    }

    #[test]
    fn test_async_wake_ignores_keepalive() {
        let cell = RequestStateCell::new();
        cell.to_request().unwrap();
        cell.to_keepalive().unwrap();
        assert_eq!(cell.wake_async(), WakeOutcome::Ignored);
        assert_eq!(cell.get(), RequestState::Keepalive);
    }

    #[test]
    fn test_complete_async_without_parking() {
        let cell = in_async_start();
        assert!(cell.complete_async());
        assert_eq!(cell.get(), RequestState::Request);

        let cell = in_async_start();
        cell.wake();
        assert!(cell.complete_async());
        assert_eq!(cell.get(), RequestState::Request);
    }

    #[test]
    fn test_destroy_is_absorbing() {
        let cell = in_async_start();
        assert_eq!(cell.destroy(), Some(RequestState::AsyncStart));
        assert_eq!(cell.destroy(), None);
        assert_eq!(cell.wake(), WakeOutcome::Ignored);
        assert!(cell.try_suspend().is_err());
        assert!(cell.to_keepalive().is_err());
        assert!(cell.is_destroyed());
    }

    #[test]
    fn test_suspend_wake_race_has_one_owner() {
        for _ in 0..2_000 {
            let cell = Arc::new(in_async_start());
            let barrier = Arc::new(Barrier::new(2));

            let waker = {
                let cell = Arc::clone(&cell);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cell.wake()
                })
            };

            barrier.wait();
            let suspend = cell.try_suspend().unwrap();
            let wake = waker.join().unwrap();

            let driver_resumes = suspend == SuspendOutcome::Woken;
            let waker_resumes = wake == WakeOutcome::Resume;
            assert!(
                driver_resumes ^ waker_resumes,
                "suspend={suspend:?} wake={wake:?}"
            );
            assert_eq!(cell.get(), RequestState::Request);
        }
    }

    #[test]
    fn test_concurrent_wakers_single_winner() {
        for _ in 0..500 {
            let cell = Arc::new(in_async_start());
            cell.try_suspend().unwrap();

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let cell = Arc::clone(&cell);
                    thread::spawn(move || cell.wake())
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|o| *o == WakeOutcome::Resume)
                .count();
            assert_eq!(winners, 1);
        }
    }
}
