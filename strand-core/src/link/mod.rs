//! Connection link orchestration.
//!
//! A [`ConnectionLink`] owns one accepted socket and drives it through its
//! whole life: accept, request dispatch, keepalive waits, comet suspension,
//! duplex streaming and teardown. Work always runs as tasks on the worker
//! pool; a link never owns a thread while it is idle or suspended.
//!
//! ```text
//!                 ┌──────────── worker task ─────────────┐
//!   accept ──────►│ dispatch ─► post-request branch      │
//!                 │               ├─ duplex read loop    │──► teardown
//!                 │               ├─ suspend ─► park ────┼──┐
//!                 │               └─ keepalive           │  │ wake / deadline
//!                 │                   ├─ data ─► dispatch │  │ (RequestState CAS
//!                 │                   ├─ multiplexer park ┼──┤  picks one winner)
//!                 │                   └─ blocking wait    │  │
//!                 └──────────────────────────────────────┘  │
//!   resume task ◄───────────────────────────────────────────┘
//! ```
//!
//! Two state machines cooperate:
//!
//! - [`ConnectionFsm`] is written only by the task currently holding the
//!   link's driver lock.
//! - [`RequestStateCell`] is shared with wakers (comet handles, deadline
//!   timers, the keepalive multiplexer, forced closes) and only changes by
//!   CAS, so exactly one party takes ownership of a parked link.
//!
//! Teardown runs on every exit path, exactly once.

mod comet;
mod duplex;

pub use comet::{CometController, CometHandle};
pub use duplex::DuplexController;

use crate::connection::{ConnectionEvent, ConnectionFsm, ConnectionState, TransitionError};
use crate::error::{Error, Result};
use crate::handler::{LinkContext, ProtocolHandler, Upgrades};
use crate::listener::Listener;
use crate::request_state::{RequestState, RequestStateCell, SuspendOutcome, WakeOutcome};
use crate::shutdown::{ConnectionGuard, ShutdownReason};
use crate::socket::{Interrupter, Readiness, Socket};
use crate::stream::LinkStream;
use crate::timer::{Millis, Timer, duration_ms, panic_message};
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

#[cfg(unix)]
use std::os::fd::RawFd;

static LINK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const NO_REASON: u8 = u8::MAX;
const NO_GENERATION: u64 = u64::MAX;
/// Recheck interval for a deadline that fired while the link was running.
const DEADLINE_RETRY: Duration = Duration::from_millis(1);

// ============================================================================
// Close Reason
// ============================================================================

/// Why a link closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseReason {
    /// Handler or keepalive policy ended the connection.
    Normal = 0,
    /// Peer closed its side between requests.
    PeerClosed = 1,
    /// No new request within the keepalive timeout.
    KeepaliveTimeout = 2,
    /// Comet suspension hit its deadline.
    SuspendTimeout = 3,
    /// A read deadline or duplex idle timeout expired.
    Timeout = 4,
    /// Peer reset or aborted mid-request.
    ClientDisconnect = 5,
    /// Peer or handler broke the protocol contract.
    ProtocolViolation = 6,
    /// Handler returned an error or panicked.
    HandlerError = 7,
    /// Lifecycle state machine rejected a transition.
    InvalidState = 8,
    /// Any other I/O failure.
    IoError = 9,
    /// Listener or process shutdown.
    Shutdown = 10,
    /// Memory exhausted while dispatching.
    OutOfMemory = 11,
}

impl CloseReason {
    const ALL: [CloseReason; 12] = [
        Self::Normal,
        Self::PeerClosed,
        Self::KeepaliveTimeout,
        Self::SuspendTimeout,
        Self::Timeout,
        Self::ClientDisconnect,
        Self::ProtocolViolation,
        Self::HandlerError,
        Self::InvalidState,
        Self::IoError,
        Self::Shutdown,
        Self::OutOfMemory,
    ];

    #[inline]
    fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Whether this is an ordinary end of a connection rather than a fault.
    pub const fn is_expected(self) -> bool {
        matches!(
            self,
            Self::Normal
                | Self::PeerClosed
                | Self::KeepaliveTimeout
                | Self::ClientDisconnect
                | Self::Shutdown
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::PeerClosed => "peer_closed",
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::SuspendTimeout => "suspend_timeout",
            Self::Timeout => "timeout",
            Self::ClientDisconnect => "client_disconnect",
            Self::ProtocolViolation => "protocol_violation",
            Self::HandlerError => "handler_error",
            Self::InvalidState => "invalid_state",
            Self::IoError => "io_error",
            Self::Shutdown => "shutdown",
            Self::OutOfMemory => "out_of_memory",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Upgrade requested by the handler during the current call.
#[derive(Debug)]
pub(crate) enum Pending {
    None,
    Comet(CometController),
    Duplex,
}

/// How a worker task enters the link.
#[derive(Debug, Clone, Copy)]
enum Entry {
    Accept,
    Resume,
}

/// Next step of the driving loop.
#[derive(Debug)]
enum Step {
    Dispatch,
    After { keepalive: bool },
    Keepalive { killed: bool },
    KeepaliveWait,
    Suspend,
    Resume { timed_out: bool },
    Duplex,
    Park,
    Close(CloseReason),
}

enum Exit {
    Parked,
    Closed(CloseReason),
}

/// Everything only the driving task touches.
struct Driver {
    fsm: ConnectionFsm,
    stream: LinkStream,
    handler: Box<dyn ProtocolHandler>,
    pending: Pending,
    comet: Option<CometController>,
    deadline: Option<Timer>,
    keepalive_until: Millis,
    guard: Option<ConnectionGuard>,
}

// ============================================================================
// Connection Link
// ============================================================================

/// One accepted connection.
pub struct ConnectionLink {
    id: u64,
    listener: Arc<Listener>,
    request_state: RequestStateCell,
    /// Mirror of the FSM state for observers.
    state: AtomicU8,
    kill_keepalive: AtomicBool,
    closing: AtomicBool,
    close_request: AtomicU8,
    closed: AtomicBool,
    close_reason: AtomicU8,
    /// Bumped every time the driver arms or disarms a wait deadline.
    wait_generation: AtomicU64,
    /// Generation of the last deadline that won the wake.
    expired_generation: AtomicU64,
    comet_generation: AtomicU64,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    #[cfg(unix)]
    raw_fd: Option<RawFd>,
    interrupter: Option<Interrupter>,
    driver: Mutex<Driver>,
}

impl ConnectionLink {
    pub(crate) fn new(
        listener: Arc<Listener>,
        socket: Box<dyn Socket>,
        handler: Box<dyn ProtocolHandler>,
        guard: ConnectionGuard,
    ) -> Arc<Self> {
        let local_addr = socket.local_addr();
        let remote_addr = socket.remote_addr();
        #[cfg(unix)]
        let raw_fd = socket.raw_fd();
        let interrupter = socket.interrupter();
        let stream = LinkStream::new(socket, listener.buffers().acquire());

        Arc::new(Self {
            id: LINK_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            listener,
            request_state: RequestStateCell::new(),
            state: AtomicU8::new(ConnectionState::Init.as_u8()),
            kill_keepalive: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_request: AtomicU8::new(NO_REASON),
            closed: AtomicBool::new(false),
            close_reason: AtomicU8::new(NO_REASON),
            wait_generation: AtomicU64::new(0),
            expired_generation: AtomicU64::new(NO_GENERATION),
            comet_generation: AtomicU64::new(0),
            local_addr,
            remote_addr,
            #[cfg(unix)]
            raw_fd,
            interrupter,
            driver: Mutex::new(Driver {
                fsm: ConnectionFsm::new(),
                stream,
                handler,
                pending: Pending::None,
                comet: None,
                deadline: None,
                keepalive_until: 0,
                guard: Some(guard),
            }),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lifecycle state (snapshot).
    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Request state (snapshot).
    #[inline]
    pub fn request_state(&self) -> RequestState {
        self.request_state.get()
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Descriptor used for readiness multiplexing.
    #[cfg(unix)]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.raw_fd
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.listener.is_shutting_down()
    }

    /// Reason the link closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        CloseReason::from_u8(self.close_reason.load(Ordering::Acquire))
    }

    /// Whether the link is parked waiting for its next request.
    pub fn is_waiting_keepalive(&self) -> bool {
        self.request_state.get() == RequestState::Keepalive
    }

    /// Close the connection after the current request instead of keeping it
    /// alive.
    pub fn kill_keepalive(&self) {
        self.kill_keepalive.store(true, Ordering::Release);
    }

    pub(crate) fn request_cell(&self) -> &RequestStateCell {
        &self.request_state
    }

    pub(crate) fn next_comet_generation(&self) -> u64 {
        self.comet_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn comet_generation(&self) -> u64 {
        self.comet_generation.load(Ordering::Acquire)
    }

    // ========================================================================
    // Wakers (any thread)
    // ========================================================================

    /// Readiness notification for a link parked in keepalive.
    ///
    /// Returns `true` if this call took ownership and scheduled dispatch.
    pub fn notify_readable(self: &Arc<Self>) -> bool {
        match self.request_state.wake_keepalive() {
            WakeOutcome::Resume => self.schedule(Entry::Resume),
            _ => false,
        }
    }

    pub(crate) fn wake_comet(self: &Arc<Self>, generation: u64) -> bool {
        if self.comet_generation() != generation || self.is_closed() {
            return false;
        }
        match self.request_state.wake_async() {
            WakeOutcome::Resume => self.schedule(Entry::Resume),
            WakeOutcome::Deferred => true,
            WakeOutcome::Ignored => false,
        }
    }

    fn on_deadline(self: &Arc<Self>, timer: &Timer, generation: u64) {
        // Arm, disarm and park all happen under the driver lock, so holding
        // it pins the current wait.
        let Some(driver) = self.driver.try_lock() else {
            if self.wait_generation.load(Ordering::Acquire) == generation && !self.is_closed() {
                if let Err(e) = self.listener.scheduler().queue(timer, DEADLINE_RETRY) {
                    trace!(link_id = self.id, error = %e, "link deadline dropped");
                }
            }
            return;
        };
        // A later wait re-armed the deadline.
        if self.wait_generation.load(Ordering::Acquire) != generation {
            return;
        }

        let outcome = self.request_state.wake();
        trace!(link_id = self.id, ?outcome, "link deadline fired");
        if outcome == WakeOutcome::Resume {
            // Only a deadline that owns the resume counts as a timeout.
            self.expired_generation.store(generation, Ordering::Release);
            drop(driver);
            self.schedule(Entry::Resume);
        }
    }

    /// Force the link closed with [`CloseReason::Shutdown`].
    pub fn close(&self) {
        self.close_with(CloseReason::Shutdown);
    }

    /// Force the link closed from any thread.
    ///
    /// A parked link is torn down on the calling thread. A link that is
    /// running a handler has its blocking reads interrupted and closes as
    /// soon as the handler returns. Calling this repeatedly, or racing it
    /// with other closes, releases the socket exactly once.
    pub fn close_with(&self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        let _ = self.close_request.compare_exchange(
            NO_REASON,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.kill_keepalive.store(true, Ordering::Release);
        self.closing.store(true, Ordering::Release);

        match self.request_state.wake() {
            WakeOutcome::Resume => {
                let mut driver = self.driver.lock();
                self.teardown(&mut driver, self.requested_close());
            }
            _ => {
                if let Some(interrupter) = &self.interrupter {
                    interrupter.interrupt();
                }
            }
        }
    }

    // ========================================================================
    // Task Entry
    // ========================================================================

    /// Hand the accepted link to the worker pool.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.request_state.to_request() {
            self.force_teardown(CloseReason::Shutdown);
            return Err(e);
        }
        if self.schedule(Entry::Accept) {
            Ok(())
        } else {
            Err(Error::PoolRejected(format!("link {}", self.id)))
        }
    }

    fn schedule(self: &Arc<Self>, entry: Entry) -> bool {
        let link = Arc::clone(self);
        match self.listener.pool().schedule(Box::new(move || link.run(entry))) {
            Ok(()) => true,
            Err(e) => {
                warn!(link_id = self.id, ?entry, error = %e, "worker pool rejected link task");
                self.force_teardown(CloseReason::Shutdown);
                false
            }
        }
    }

    fn force_teardown(&self, reason: CloseReason) {
        let mut driver = self.driver.lock();
        self.teardown(&mut driver, reason);
    }

    fn run(self: &Arc<Self>, entry: Entry) {
        let mut driver = self.driver.lock();
        if self.is_closed() {
            return;
        }
        if self.closing.load(Ordering::Acquire) {
            let reason = self.requested_close();
            self.teardown(&mut driver, reason);
            return;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.drive(&mut driver, entry)));
        let reason = match result {
            Ok(Ok(Exit::Parked)) => return,
            Ok(Ok(Exit::Closed(reason))) => reason,
            Ok(Err(e)) => self.failure_reason(&e),
            Err(payload) => {
                error!(
                    link_id = self.id,
                    panic = %panic_message(payload.as_ref()),
                    "handler panicked"
                );
                CloseReason::HandlerError
            }
        };
        self.teardown(&mut driver, reason);
    }

    fn drive(self: &Arc<Self>, d: &mut Driver, entry: Entry) -> Result<Exit> {
        let mut step = match entry {
            Entry::Accept => self.accept(d)?,
            Entry::Resume => self.resume_parked(d)?,
        };

        loop {
            step = match step {
                Step::Dispatch => self.dispatch(d)?,
                Step::After { keepalive } => self.after_request(d, keepalive),
                Step::Keepalive { killed } => self.enter_keepalive(d, killed)?,
                Step::KeepaliveWait => self.wait_keepalive(d)?,
                Step::Suspend => self.suspend(d)?,
                Step::Resume { timed_out } => self.resume(d, timed_out)?,
                Step::Duplex => self.duplex(d)?,
                Step::Park => return Ok(Exit::Parked),
                Step::Close(reason) => return Ok(Exit::Closed(reason)),
            };
        }
    }

    // ========================================================================
    // Lifecycle Steps
    // ========================================================================

    fn accept(self: &Arc<Self>, d: &mut Driver) -> Result<Step> {
        self.transition(d, ConnectionEvent::Accept)?;
        d.stream
            .socket_mut()
            .set_read_timeout(Some(self.listener.config().read_timeout))?;
        self.call_handler(d, Upgrades::None, |handler, cx| handler.on_start_connection(cx))?;
        debug!(link_id = self.id, remote = ?self.remote_addr, "link accepted");
        Ok(Step::Dispatch)
    }

    fn dispatch(self: &Arc<Self>, d: &mut Driver) -> Result<Step> {
        self.transition(d, ConnectionEvent::Dispatch)?;
        self.listener.stats().record_request();
        d.pending = Pending::None;

        let keepalive =
            self.call_handler(d, Upgrades::Any, |handler, cx| handler.handle_request(cx))?;
        d.stream.flush()?;
        Ok(Step::After { keepalive })
    }

    fn after_request(&self, d: &mut Driver, keepalive: bool) -> Step {
        match std::mem::replace(&mut d.pending, Pending::None) {
            Pending::Duplex => Step::Duplex,
            Pending::Comet(controller) => {
                d.comet = Some(controller);
                Step::Suspend
            }
            Pending::None => Step::Keepalive {
                killed: !keepalive || self.kill_keepalive.load(Ordering::Acquire) || self.is_closing(),
            },
        }
    }

    fn enter_keepalive(&self, d: &mut Driver, killed: bool) -> Result<Step> {
        d.comet = None;
        let state = d.fsm.to_keepalive(killed)?;
        self.publish(state);
        if state.is_closed() {
            return Ok(Step::Close(self.requested_close_or(CloseReason::Normal)));
        }

        self.listener.stats().record_keepalive();
        d.keepalive_until = self
            .now()
            .saturating_add(duration_ms(self.listener.config().keepalive_timeout));
        Ok(Step::KeepaliveWait)
    }

    fn wait_keepalive(self: &Arc<Self>, d: &mut Driver) -> Result<Step> {
        match d.stream.poll_readable()? {
            Readiness::Ready => return Ok(Step::Dispatch),
            Readiness::Closed => return Ok(self.peer_closed()),
            Readiness::Pending => {}
        }

        let remaining = d.keepalive_until.saturating_sub(self.now());
        if remaining == 0 {
            return Ok(self.keepalive_expired());
        }

        if let Some(multiplexer) = self.listener.multiplexer() {
            self.request_state.to_keepalive()?;
            self.arm_deadline(d, Duration::from_millis(remaining))?;
            if multiplexer.register(Arc::clone(self)) {
                trace!(link_id = self.id, remaining_ms = remaining, "keepalive parked");
                return Ok(Step::Park);
            }
            // Declined: take the wait back unless a waker already owns it.
            if self.request_state.wake_keepalive() != WakeOutcome::Resume {
                return Ok(Step::Park);
            }
            self.disarm(d);
        }

        match self.wait_readable_until(&mut d.stream, d.keepalive_until)? {
            Readiness::Ready => Ok(Step::Dispatch),
            Readiness::Closed => Ok(self.peer_closed()),
            Readiness::Pending => Ok(self.keepalive_expired()),
        }
    }

    fn suspend(self: &Arc<Self>, d: &mut Driver) -> Result<Step> {
        if self.closing.load(Ordering::Acquire) {
            return Ok(Step::Close(self.requested_close()));
        }
        self.transition(d, ConnectionEvent::Suspend)?;

        let timeout = d
            .comet
            .as_ref()
            .and_then(CometController::timeout)
            .unwrap_or(self.listener.config().suspend_timeout);
        self.arm_deadline(d, timeout)?;
        self.listener.stats().record_suspend();

        match self.request_state.try_suspend()? {
            SuspendOutcome::Suspended => {
                trace!(link_id = self.id, timeout_ms = duration_ms(timeout), "link suspended");
                Ok(Step::Park)
            }
            SuspendOutcome::Woken => {
                let timed_out = self.timed_out();
                self.disarm(d);
                Ok(Step::Resume { timed_out })
            }
        }
    }

    fn resume_parked(&self, d: &mut Driver) -> Result<Step> {
        let timed_out = self.timed_out();
        self.disarm(d);

        match d.fsm.state() {
            ConnectionState::Keepalive if timed_out => Ok(self.keepalive_expired()),
            ConnectionState::Keepalive => Ok(Step::KeepaliveWait),
            ConnectionState::CometSuspend => Ok(Step::Resume { timed_out }),
            from => Err(TransitionError {
                from,
                event: ConnectionEvent::Wake,
            }
            .into()),
        }
    }

    fn resume(self: &Arc<Self>, d: &mut Driver, timed_out: bool) -> Result<Step> {
        self.transition(d, ConnectionEvent::Wake)?;
        let comet = d.comet.take();

        if timed_out {
            debug!(
                link_id = self.id,
                suspended_ms = comet.as_ref().map(|c| duration_ms(c.elapsed())),
                "suspend timed out"
            );
            self.call_handler(d, Upgrades::None, |handler, cx| handler.on_suspend_timeout(cx));
            if let Err(e) = d.stream.flush() {
                trace!(link_id = self.id, error = %e, "flush after suspend timeout failed");
            }
            return Ok(Step::Close(CloseReason::SuspendTimeout));
        }
        if self.closing.load(Ordering::Acquire) {
            return Ok(Step::Close(self.requested_close()));
        }

        self.listener.stats().record_wake();
        // CometActive has no upgrade edge; a resumed request may only re-suspend.
        let keepalive =
            self.call_handler(d, Upgrades::Comet, |handler, cx| handler.handle_resume(cx))?;
        d.stream.flush()?;
        Ok(Step::After { keepalive })
    }

    fn duplex(self: &Arc<Self>, d: &mut Driver) -> Result<Step> {
        self.transition(d, ConnectionEvent::Upgrade)?;
        self.listener.stats().record_duplex();
        debug!(link_id = self.id, "link upgraded to duplex");

        let idle = duration_ms(self.listener.config().duplex_idle_timeout);
        let mut duplex = DuplexController::new();
        loop {
            let until = self.now().saturating_add(idle);
            match self.wait_readable_until(&mut d.stream, until)? {
                Readiness::Ready => {}
                Readiness::Closed => return Ok(self.peer_closed()),
                Readiness::Pending => {
                    debug!(link_id = self.id, "duplex idle timeout");
                    return Ok(Step::Close(CloseReason::Timeout));
                }
            }

            self.transition(d, ConnectionEvent::Dispatch)?;
            let before = d.stream.bytes_read();
            self.call_handler(d, Upgrades::None, |handler, cx| {
                handler.service_read(cx, &mut duplex)
            })?;
            d.stream.flush()?;

            if duplex.is_closed() {
                return Ok(Step::Close(self.requested_close_or(CloseReason::Normal)));
            }
            let consumed = d.stream.bytes_read() - before;
            if consumed == 0 {
                warn!(
                    link_id = self.id,
                    reads = duplex.reads(),
                    "duplex read made no progress"
                );
                return Ok(Step::Close(CloseReason::ProtocolViolation));
            }
            duplex.record_read(consumed);
            self.transition(d, ConnectionEvent::Keepalive)?;
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    fn teardown(&self, d: &mut Driver, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_reason.store(reason as u8, Ordering::Release);
        self.disarm(d);
        d.comet = None;
        d.pending = Pending::None;

        let handler = &mut d.handler;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler.on_close_connection(reason))) {
            error!(
                link_id = self.id,
                panic = %panic_message(payload.as_ref()),
                "close hook panicked"
            );
        }

        if let Err(e) = d.stream.close() {
            trace!(link_id = self.id, error = %e, "error closing link stream");
        }
        match d.fsm.handle_event(ConnectionEvent::Close) {
            Ok(state) => self.publish(state),
            Err(e) => debug!(link_id = self.id, error = %e, "close from unexpected state"),
        }
        self.request_state.destroy();

        self.listener.release(self.id, d.stream.take_buffers());
        self.listener.stats().record_close(reason);
        d.guard.take();
        if let Ok(state) = d.fsm.handle_event(ConnectionEvent::Destroy) {
            self.publish(state);
        }

        if reason.is_expected() {
            debug!(link_id = self.id, %reason, requests = d.fsm.request_count(), "link closed");
        } else {
            warn!(link_id = self.id, %reason, requests = d.fsm.request_count(), "link closed");
        }
    }

    fn failure_reason(&self, err: &Error) -> CloseReason {
        if self.closing.load(Ordering::Acquire) && !err.is_out_of_memory() {
            debug!(link_id = self.id, error = %err, "link interrupted by close");
            return self.requested_close();
        }

        let reason = err.close_reason();
        match reason {
            CloseReason::ClientDisconnect => {
                trace!(link_id = self.id, error = %err, "client disconnected");
            }
            CloseReason::Timeout => debug!(link_id = self.id, error = %err, "link timed out"),
            CloseReason::OutOfMemory => {
                error!(link_id = self.id, error = %err, "out of memory, shutting down");
                self.listener.shutdown_signal().trigger(ShutdownReason::OutOfMemory);
            }
            CloseReason::InvalidState => {
                error!(link_id = self.id, error = %err, state = %self.state(), "invalid link transition");
            }
            _ => warn!(link_id = self.id, error = %err, "link failed"),
        }
        reason
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn call_handler<R>(
        self: &Arc<Self>,
        d: &mut Driver,
        upgrades: Upgrades,
        f: impl FnOnce(&mut dyn ProtocolHandler, &mut LinkContext<'_>) -> R,
    ) -> R {
        let Driver {
            stream,
            handler,
            pending,
            ..
        } = d;
        let (read, written) = (stream.bytes_read(), stream.bytes_written());

        let result = {
            let mut cx = LinkContext::new(self, stream, pending, upgrades);
            f(handler.as_mut(), &mut cx)
        };

        self.listener.stats().record_bytes(
            stream.bytes_read() - read,
            stream.bytes_written() - written,
        );
        result
    }

    fn transition(&self, d: &mut Driver, event: ConnectionEvent) -> Result<ConnectionState> {
        let state = d.fsm.handle_event(event)?;
        self.publish(state);
        Ok(state)
    }

    #[inline]
    fn publish(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
        trace!(link_id = self.id, %state, "link state");
    }

    fn arm_deadline(self: &Arc<Self>, d: &mut Driver, delay: Duration) -> Result<()> {
        let generation = self.wait_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let link = Arc::downgrade(self);
        let timer = Timer::builder().owner("link-deadline").build(move |timer| {
            if let Some(link) = link.upgrade() {
                link.on_deadline(timer, generation);
            }
        });

        self.listener.scheduler().queue(&timer, delay)?;
        if let Some(previous) = d.deadline.replace(timer) {
            self.listener.scheduler().cancel(&previous);
        }
        Ok(())
    }

    /// Cancel the current deadline. A callback already in flight sees a
    /// newer generation and does nothing.
    fn disarm(&self, d: &mut Driver) {
        if let Some(timer) = d.deadline.take() {
            self.listener.scheduler().cancel(&timer);
            self.wait_generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Whether the deadline of the current wait fired.
    fn timed_out(&self) -> bool {
        self.expired_generation.load(Ordering::Acquire)
            == self.wait_generation.load(Ordering::Acquire)
    }

    /// Block on the socket in slices until readable, closed, or `until`.
    ///
    /// Returns `Pending` when the deadline passes and `Closed` if the link
    /// is being closed.
    fn wait_readable_until(&self, stream: &mut LinkStream, until: Millis) -> Result<Readiness> {
        let slice = self.listener.config().poll_slice;
        loop {
            if self.is_closing() {
                return Ok(Readiness::Closed);
            }
            let remaining = until.saturating_sub(self.now());
            if remaining == 0 {
                return Ok(Readiness::Pending);
            }
            match stream.wait_readable(slice.min(Duration::from_millis(remaining)))? {
                Readiness::Pending => {}
                other => return Ok(other),
            }
        }
    }

    fn keepalive_expired(&self) -> Step {
        debug!(link_id = self.id, "keepalive timed out");
        Step::Close(CloseReason::KeepaliveTimeout)
    }

    fn peer_closed(&self) -> Step {
        Step::Close(self.requested_close_or(CloseReason::PeerClosed))
    }

    fn requested_close(&self) -> CloseReason {
        CloseReason::from_u8(self.close_request.load(Ordering::Acquire))
            .unwrap_or(CloseReason::Shutdown)
    }

    fn requested_close_or(&self, reason: CloseReason) -> CloseReason {
        if self.is_closing() {
            self.requested_close()
        } else {
            reason
        }
    }

    #[inline]
    fn now(&self) -> Millis {
        self.listener.scheduler().current_exact_time()
    }
}

impl fmt::Debug for ConnectionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLink")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("request_state", &self.request_state())
            .field("remote_addr", &self.remote_addr)
            .field("close_reason", &self.close_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_round_trip() {
        for reason in CloseReason::ALL {
            assert_eq!(CloseReason::from_u8(reason as u8), Some(reason));
        }
        assert_eq!(CloseReason::from_u8(NO_REASON), None);
    }

    #[test]
    fn test_close_reason_expected() {
        assert!(CloseReason::KeepaliveTimeout.is_expected());
        assert!(CloseReason::ClientDisconnect.is_expected());
        assert!(!CloseReason::ProtocolViolation.is_expected());
        assert!(!CloseReason::OutOfMemory.is_expected());
        assert_eq!(CloseReason::SuspendTimeout.to_string(), "suspend_timeout");
    }
}
