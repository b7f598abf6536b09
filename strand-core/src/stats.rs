//! Connection statistics.
//!
//! Counters are plain relaxed atomics; [`LinkStats::snapshot`] copies them
//! into a [`LinkStatsSnapshot`] for reporting and tests.

use crate::link::CloseReason;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-listener connection counters.
#[derive(Debug, Default)]
pub struct LinkStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    requests: AtomicU64,
    keepalives: AtomicU64,
    suspends: AtomicU64,
    wakes: AtomicU64,
    duplex_upgrades: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    closed: AtomicU64,
    peer_closed: AtomicU64,
    keepalive_timeouts: AtomicU64,
    suspend_timeouts: AtomicU64,
    timeouts: AtomicU64,
    client_disconnects: AtomicU64,
    protocol_violations: AtomicU64,
    handler_errors: AtomicU64,
    invalid_transitions: AtomicU64,
    io_errors: AtomicU64,
    shutdowns: AtomicU64,
    out_of_memory: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub requests: u64,
    pub keepalives: u64,
    pub suspends: u64,
    pub wakes: u64,
    pub duplex_upgrades: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub closed: u64,
    pub peer_closed: u64,
    pub keepalive_timeouts: u64,
    pub suspend_timeouts: u64,
    pub timeouts: u64,
    pub client_disconnects: u64,
    pub protocol_violations: u64,
    pub handler_errors: u64,
    pub invalid_transitions: u64,
    pub io_errors: u64,
    pub shutdowns: u64,
    pub out_of_memory: u64,
}

impl LinkStatsSnapshot {
    /// Links accepted but not yet closed.
    pub fn open(&self) -> u64 {
        self.accepted.saturating_sub(self.closed)
    }
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_keepalive(&self) {
        self.keepalives.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_suspend(&self) {
        self.suspends.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_wake(&self) {
        self.wakes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_duplex(&self) {
        self.duplex_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_bytes(&self, read: u64, written: u64) {
        if read > 0 {
            self.bytes_read.fetch_add(read, Ordering::Relaxed);
        }
        if written > 0 {
            self.bytes_written.fetch_add(written, Ordering::Relaxed);
        }
    }

    /// Count a close and the reason behind it. Called once per link.
    pub(crate) fn record_close(&self, reason: CloseReason) {
        self.closed.fetch_add(1, Ordering::Relaxed);

        let counter = match reason {
            CloseReason::Normal => return,
            CloseReason::PeerClosed => &self.peer_closed,
            CloseReason::KeepaliveTimeout => &self.keepalive_timeouts,
            CloseReason::SuspendTimeout => &self.suspend_timeouts,
            CloseReason::Timeout => &self.timeouts,
            CloseReason::ClientDisconnect => &self.client_disconnects,
            CloseReason::ProtocolViolation => &self.protocol_violations,
            CloseReason::HandlerError => &self.handler_errors,
            CloseReason::InvalidState => &self.invalid_transitions,
            CloseReason::IoError => &self.io_errors,
            CloseReason::Shutdown => &self.shutdowns,
            CloseReason::OutOfMemory => &self.out_of_memory,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn keepalive_timeouts(&self) -> u64 {
        self.keepalive_timeouts.load(Ordering::Relaxed)
    }

    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations.load(Ordering::Relaxed)
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LinkStatsSnapshot {
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            requests: load(&self.requests),
            keepalives: load(&self.keepalives),
            suspends: load(&self.suspends),
            wakes: load(&self.wakes),
            duplex_upgrades: load(&self.duplex_upgrades),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
            closed: load(&self.closed),
            peer_closed: load(&self.peer_closed),
            keepalive_timeouts: load(&self.keepalive_timeouts),
            suspend_timeouts: load(&self.suspend_timeouts),
            timeouts: load(&self.timeouts),
            client_disconnects: load(&self.client_disconnects),
            protocol_violations: load(&self.protocol_violations),
            handler_errors: load(&self.handler_errors),
            invalid_transitions: load(&self.invalid_transitions),
            io_errors: load(&self.io_errors),
            shutdowns: load(&self.shutdowns),
            out_of_memory: load(&self.out_of_memory),
        }
    }
}
