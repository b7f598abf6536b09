//! Connection Lifecycle State Machine
//!
//! The lifecycle state of a connection link, advanced only by the thread
//! currently driving the link. Transitions are looked up in a const table
//! indexed by `(state, event)`; a missing entry is a driving-thread bug and
//! is reported as a [`TransitionError`] instead of being silently ignored.
//!
//! ## State Machine
//!
//! ```text
//!   ┌──────┐ accept ┌───────────┐ dispatch ┌────────┐ keepalive ┌───────────┐
//!   │ Init │───────►│ Accepting │─────────►│ Active │──────────►│ Keepalive │
//!   └──────┘        └───────────┘          └───┬────┘◄──────────└───────────┘
//!                                              │  ▲     dispatch
//!                               suspend        │  │ dispatch
//!                     ┌────────────────────────┤  │
//!                     ▼                        │  │
//!             ┌──────────────┐  wake   ┌───────┴──┴──┐
//!             │ CometSuspend │────────►│ CometActive │──► Keepalive
//!             └──────────────┘◄────────└─────────────┘
//!                               suspend
//!                                              │ upgrade
//!                                              ▼
//!                               ┌────────┐ dispatch ┌──────────────┐
//!                               │ Duplex │─────────►│ DuplexActive │
//!                               └────────┘◄─────────└──────────────┘
//!                                          keepalive
//!
//!   any state ──close──► Closed ──destroy──► Destroyed
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strand_core::connection::{ConnectionFsm, ConnectionEvent};
//!
//! let mut fsm = ConnectionFsm::new();
//! fsm.handle_event(ConnectionEvent::Accept)?;
//! fsm.handle_event(ConnectionEvent::Dispatch)?;
//! fsm.to_keepalive(false)?;
//! ```

use std::time::{Duration, Instant};

// ============================================================================
// Connection State (Compact Representation)
// ============================================================================

/// Lifecycle state of a connection link.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Link constructed, no socket handed over yet
    #[default]
    Init = 0,
    /// Socket accepted, buffers and handler being set up
    Accepting = 1,
    /// Handler processing a request
    Active = 2,
    /// Idle between requests
    Keepalive = 3,
    /// Resumed from comet suspension, handler running
    CometActive = 4,
    /// Parked awaiting an external wake
    CometSuspend = 5,
    /// Upgraded to full-duplex, waiting for data
    Duplex = 6,
    /// Full-duplex streaming callback running
    DuplexActive = 7,
    /// Socket released
    Closed = 8,
    /// Link torn down; no further use
    Destroyed = 9,
}

impl ConnectionState {
    /// Number of states (for table sizing).
    pub const COUNT: usize = 10;

    /// Convert from u8, clamping unknown values to `Destroyed`.
    #[inline(always)]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Accepting,
            2 => Self::Active,
            3 => Self::Keepalive,
            4 => Self::CometActive,
            5 => Self::CometSuspend,
            6 => Self::Duplex,
            7 => Self::DuplexActive,
            8 => Self::Closed,
            _ => Self::Destroyed,
        }
    }

    /// Convert to u8.
    #[inline(always)]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Socket already released.
    #[inline(always)]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed | Self::Destroyed)
    }

    /// Handler code is running on the driving thread.
    #[inline(always)]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Accepting | Self::Active | Self::CometActive | Self::DuplexActive
        )
    }

    /// In a comet phase (suspended or resumed).
    #[inline(always)]
    pub const fn is_comet(self) -> bool {
        matches!(self, Self::CometActive | Self::CometSuspend)
    }

    /// Upgraded to full-duplex.
    #[inline(always)]
    pub const fn is_duplex(self) -> bool {
        matches!(self, Self::Duplex | Self::DuplexActive)
    }

    /// Waiting with no thread attached.
    #[inline(always)]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Keepalive | Self::CometSuspend | Self::Duplex)
    }

    /// Name for logging.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Accepting => "accepting",
            Self::Active => "active",
            Self::Keepalive => "keepalive",
            Self::CometActive => "comet-active",
            Self::CometSuspend => "comet-suspend",
            Self::Duplex => "duplex",
            Self::DuplexActive => "duplex-active",
            Self::Closed => "closed",
            Self::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Connection Events
// ============================================================================

/// Events that trigger state transitions.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// Socket handed over by the listener
    Accept = 0,
    /// Start running the handler (request, resume, or duplex read)
    Dispatch = 1,
    /// Request finished, socket may carry another
    Keepalive = 2,
    /// Handler asked to park the request
    Suspend = 3,
    /// External wake for a parked request
    Wake = 4,
    /// Handler asked for a protocol upgrade
    Upgrade = 5,
    /// Release the socket
    Close = 6,
    /// Tear down the link
    Destroy = 7,
}

impl ConnectionEvent {
    /// Number of events (for table sizing).
    pub const COUNT: usize = 8;

    /// Convert to u8.
    #[inline(always)]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Transition Table
// ============================================================================

/// Marker for an illegal `(state, event)` pair.
const INVALID: u8 = u8::MAX;

/// `TRANSITION_TABLE[state][event]` = next state, or `INVALID`.
const TRANSITION_TABLE: [[u8; ConnectionEvent::COUNT]; ConnectionState::COUNT] = {
    use ConnectionState as S;

    const fn s(state: S) -> u8 {
        state.as_u8()
    }
    const X: u8 = INVALID;
    const CLOSED: u8 = s(S::Closed);

    [
        // Events: Accept, Dispatch, Keepalive, Suspend, Wake, Upgrade, Close, Destroy
        // Init
        [s(S::Accepting), X, X, X, X, X, CLOSED, X],
        // Accepting
        [X, s(S::Active), X, X, X, X, CLOSED, X],
        // Active
        [X, X, s(S::Keepalive), s(S::CometSuspend), X, s(S::Duplex), CLOSED, X],
        // Keepalive
        [X, s(S::Active), X, X, X, X, CLOSED, X],
        // CometActive
        [X, s(S::Active), s(S::Keepalive), s(S::CometSuspend), X, X, CLOSED, X],
        // CometSuspend
        [X, X, X, X, s(S::CometActive), X, CLOSED, X],
        // Duplex
        [X, s(S::DuplexActive), X, X, X, X, CLOSED, X],
        // DuplexActive
        [X, X, s(S::Duplex), X, X, X, CLOSED, X],
        // Closed
        [X, X, X, X, X, X, CLOSED, s(S::Destroyed)],
        // Destroyed
        [X, X, X, X, X, X, s(S::Destroyed), s(S::Destroyed)],
    ]
};

/// Look up the successor of `state` under `event`.
#[inline]
pub fn next_state(state: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    let next = TRANSITION_TABLE[state.as_u8() as usize][event.as_u8() as usize];
    (next != INVALID).then(|| ConnectionState::from_u8(next))
}

// ============================================================================
// Transition Error
// ============================================================================

/// Illegal transition requested by the driving thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: ConnectionState,
    pub event: ConnectionEvent,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} is not valid in state {}", self.event, self.from)
    }
}

impl std::error::Error for TransitionError {}

// ============================================================================
// State Machine
// ============================================================================

/// Single-writer lifecycle state of one link.
#[derive(Debug)]
pub struct ConnectionFsm {
    state: ConnectionState,
    request_count: u32,
    changed_at: Instant,
}

impl ConnectionFsm {
    /// Create a state machine in `Init`.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Init,
            request_count: 0,
            changed_at: Instant::now(),
        }
    }

    /// Current state.
    #[inline(always)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of `Dispatch` transitions into `Active`.
    #[inline(always)]
    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    /// Time spent in the current state.
    #[inline]
    pub fn time_in_state(&self) -> Duration {
        self.changed_at.elapsed()
    }

    /// Apply `event`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the table has no entry for the pair.
    pub fn handle_event(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<ConnectionState, TransitionError> {
        let next = next_state(self.state, event).ok_or(TransitionError {
            from: self.state,
            event,
        })?;

        if next != self.state {
            if next == ConnectionState::Active {
                self.request_count = self.request_count.saturating_add(1);
            }
            self.state = next;
            self.changed_at = Instant::now();
        }

        Ok(next)
    }

    /// Finish a request: `Keepalive`, or `Closed` if keepalive was killed.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the current state cannot finish a
    /// request.
    pub fn to_keepalive(&mut self, killed: bool) -> Result<ConnectionState, TransitionError> {
        if next_state(self.state, ConnectionEvent::Keepalive).is_none() {
            return Err(TransitionError {
                from: self.state,
                event: ConnectionEvent::Keepalive,
            });
        }

        if killed {
            self.handle_event(ConnectionEvent::Close)
        } else {
            self.handle_event(ConnectionEvent::Keepalive)
        }
    }
}

impl Default for ConnectionFsm {
    fn default() -> Self {
        Self::new()
    }
}
