// Error types for the strand connection engine

use crate::connection::TransitionError;
use crate::link::CloseReason;
use crate::request_state::RequestState;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid connection transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("Invalid request-state transition from {from} to {to}")]
    InvalidRequestState { from: RequestState, to: RequestState },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Worker pool rejected task: {0}")]
    PoolRejected(String),

    #[error("Scheduler is shut down")]
    SchedulerShutdown,

    #[error("Timer {0} is queued in another scheduler")]
    TimerBusy(u64),

    #[error("Listener is shutting down")]
    ShuttingDown,

    #[error("Connection limit reached: {0}")]
    ConnectionLimit(usize),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a handler error from anything displayable.
    pub fn handler(msg: impl std::fmt::Display) -> Self {
        Error::Handler(msg.to_string())
    }

    /// Create a protocol violation error.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Error::ProtocolViolation(msg.to_string())
    }

    /// Check if the peer simply went away.
    ///
    /// These are expected under normal traffic and are logged at trace level.
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }

    /// Check if this error is a read/write deadline expiring.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Io(e) => matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock),
            _ => false,
        }
    }

    /// Check if this error signals memory exhaustion.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Error::OutOfMemory(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::OutOfMemory,
            _ => false,
        }
    }

    /// Map the error to the reason a connection closes because of it.
    pub fn close_reason(&self) -> CloseReason {
        if self.is_out_of_memory() {
            return CloseReason::OutOfMemory;
        }
        if self.is_client_disconnect() {
            return CloseReason::ClientDisconnect;
        }
        if self.is_timeout() {
            return CloseReason::Timeout;
        }

        match self {
            Error::ProtocolViolation(_) => CloseReason::ProtocolViolation,
            Error::Handler(_) | Error::HandlerPanic(_) => CloseReason::HandlerError,
            Error::InvalidTransition(_)
            | Error::InvalidRequestState { .. }
            | Error::TimerBusy(_) => CloseReason::InvalidState,
            Error::ShuttingDown | Error::SchedulerShutdown | Error::PoolRejected(_) => {
                CloseReason::Shutdown
            }
            _ => CloseReason::IoError,
        }
    }
}

/// Error kinds that mean the remote end closed or reset the connection.
pub(crate) fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        let err = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_client_disconnect());
        assert_eq!(err.close_reason(), CloseReason::ClientDisconnect);

        let err = Error::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_client_disconnect());
        assert_eq!(err.close_reason(), CloseReason::IoError);
    }

    #[test]
    fn test_timeout_classification() {
        let err = Error::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(err.is_timeout());
        assert_eq!(err.close_reason(), CloseReason::Timeout);
    }

    #[test]
    fn test_oom_classification() {
        assert!(Error::OutOfMemory("heap".into()).is_out_of_memory());
        let err = Error::from(io::Error::from(io::ErrorKind::OutOfMemory));
        assert_eq!(err.close_reason(), CloseReason::OutOfMemory);
    }

    #[test]
    fn test_protocol_violation() {
        let err = Error::protocol("no progress");
        assert_eq!(err.close_reason(), CloseReason::ProtocolViolation);
        assert_eq!(err.to_string(), "Protocol violation: no progress");
    }
}
