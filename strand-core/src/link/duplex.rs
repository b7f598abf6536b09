//! Duplex (full-duplex streaming) mode.

use std::time::{Duration, Instant};

/// Session state for a duplex link, passed to every
/// [`service_read`](crate::handler::ProtocolHandler::service_read) call.
#[derive(Debug)]
pub struct DuplexController {
    started: Instant,
    reads: u64,
    bytes_read: u64,
    closed: bool,
}

impl DuplexController {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            reads: 0,
            bytes_read: 0,
            closed: false,
        }
    }

    /// End the duplex session; the link closes after the current call.
    pub fn close(&mut self) {
        self.closed = true;
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Completed `service_read` calls.
    #[inline(always)]
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Bytes consumed since the upgrade.
    #[inline(always)]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn record_read(&mut self, bytes: u64) {
        self.reads += 1;
        self.bytes_read += bytes;
    }
}
