// Core library for the Strand connection engine
// This module contains the timer scheduler, connection state machines, and
// the per-connection orchestration that drives protocol handlers.

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod link;
pub mod listener;
pub mod logging;
pub mod multiplexer;
pub mod request_state;
pub mod shutdown;
pub mod socket;
pub mod stats;
pub mod stream;
pub mod timer;
pub mod worker;

// Re-export commonly used types
pub use config::EngineConfig;
pub use connection::{ConnectionEvent, ConnectionFsm, ConnectionState, TransitionError};
pub use error::{Error, Result};
pub use handler::{LinkContext, Protocol, ProtocolHandler};
pub use link::{CloseReason, CometHandle, ConnectionLink, DuplexController};
pub use listener::{Listener, ListenerBuilder, ListenerConfig};
pub use logging::{LogConfig, LogFormat, LogLevel, LogOutput};
pub use multiplexer::{KeepaliveMultiplexer, MultiplexerConfig};
pub use request_state::{RequestState, RequestStateCell, SuspendOutcome, WakeOutcome};
pub use shutdown::{ConnectionTracker, ShutdownReason, ShutdownSignal};
pub use socket::{Readiness, Socket, TcpSocket, TlsInfo};
pub use stats::{LinkStats, LinkStatsSnapshot};
pub use stream::{BufferPool, LinkStream};
pub use timer::{Scheduler, SchedulerConfig, Timer, TimerHandle};
pub use worker::{RuntimePool, WorkerConfig, WorkerPool};
