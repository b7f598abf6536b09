//! Protocol handler contract.
//!
//! A [`Protocol`] creates one [`ProtocolHandler`] per accepted link. The
//! link calls the handler at each lifecycle point, always from the single
//! worker currently driving the link, and passes a [`LinkContext`] that
//! exposes the connection's stream and the upgrade requests.
//!
//! ```text
//!   on_start_connection
//!          │
//!          ▼
//!   handle_request ──(start_comet)──► suspended ──wake──► handle_resume
//!          │    │                         │                   │
//!          │    └──(start_duplex)──► service_read (loop)       │
//!          │                              │                   │
//!          └──── keepalive / close ◄──────┴───────────────────┘
//!                         │
//!                         ▼
//!                 on_close_connection
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strand_core::handler::{LinkContext, ProtocolHandler};
//! use std::io::{BufRead, Write};
//!
//! struct Echo;
//!
//! impl ProtocolHandler for Echo {
//!     fn handle_request(&mut self, cx: &mut LinkContext<'_>) -> strand_core::Result<bool> {
//!         let mut line = String::new();
//!         if cx.stream().read_line(&mut line)? == 0 {
//!             return Ok(false);
//!         }
//!         cx.stream().write_all(line.as_bytes())?;
//!         Ok(true)
//!     }
//! }
//! ```

use crate::error::{Error, Result};
use crate::link::{CloseReason, CometController, CometHandle, ConnectionLink, DuplexController, Pending};
use crate::socket::TlsInfo;
use crate::stream::LinkStream;
use crate::timer::Scheduler;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Per-connection protocol logic.
pub trait ProtocolHandler: Send {
    /// Called once after accept, before the first request.
    fn on_start_connection(&mut self, cx: &mut LinkContext<'_>) -> Result<()> {
        let _ = cx;
        Ok(())
    }

    /// Handle one request. Returns whether the connection may be kept alive.
    fn handle_request(&mut self, cx: &mut LinkContext<'_>) -> Result<bool>;

    /// Continue a suspended (comet) request after a wake.
    ///
    /// May suspend again with [`LinkContext::start_comet`]. A resumed request
    /// cannot switch to duplex mode; [`LinkContext::start_duplex`] fails here.
    fn handle_resume(&mut self, cx: &mut LinkContext<'_>) -> Result<bool> {
        let _ = cx;
        Ok(false)
    }

    /// A suspended request hit its deadline. The link closes afterwards.
    fn on_suspend_timeout(&mut self, cx: &mut LinkContext<'_>) {
        let _ = cx;
    }

    /// Consume input on a duplex link.
    ///
    /// Each call must consume at least one byte or close the controller;
    /// otherwise the link is closed as a protocol violation.
    fn service_read(
        &mut self,
        cx: &mut LinkContext<'_>,
        duplex: &mut DuplexController,
    ) -> Result<()> {
        let _ = (cx, duplex);
        Err(Error::protocol("handler does not support duplex mode"))
    }

    /// Called once when the link closes, on every exit path.
    fn on_close_connection(&mut self, reason: CloseReason) {
        let _ = reason;
    }
}

/// Factory for per-link handlers.
pub trait Protocol: Send + Sync {
    fn create_handler(&self) -> Box<dyn ProtocolHandler>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "protocol"
    }
}

impl<F> Protocol for F
where
    F: Fn() -> Box<dyn ProtocolHandler> + Send + Sync,
{
    fn create_handler(&self) -> Box<dyn ProtocolHandler> {
        self()
    }
}

/// Mode switches a hook may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upgrades {
    None,
    Comet,
    Any,
}

impl Upgrades {
    fn allows(self, what: Upgrade) -> bool {
        match self {
            Self::None => false,
            Self::Comet => what == Upgrade::Comet,
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upgrade {
    Comet,
    Duplex,
}

impl Upgrade {
    fn as_str(self) -> &'static str {
        match self {
            Self::Comet => "comet",
            Self::Duplex => "duplex",
        }
    }
}

/// Handler's view of the link for the duration of one call.
pub struct LinkContext<'a> {
    link: &'a Arc<ConnectionLink>,
    stream: &'a mut LinkStream,
    pending: &'a mut Pending,
    upgrades: Upgrades,
}

impl<'a> LinkContext<'a> {
    pub(crate) fn new(
        link: &'a Arc<ConnectionLink>,
        stream: &'a mut LinkStream,
        pending: &'a mut Pending,
        upgrades: Upgrades,
    ) -> Self {
        Self {
            link,
            stream,
            pending,
            upgrades,
        }
    }

    #[inline(always)]
    pub fn link_id(&self) -> u64 {
        self.link.id()
    }

    pub fn link(&self) -> &Arc<ConnectionLink> {
        self.link
    }

    /// Buffered stream for reading the request and writing the response.
    ///
    /// Output is flushed by the link after the handler returns.
    #[inline(always)]
    pub fn stream(&mut self) -> &mut LinkStream {
        self.stream
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.socket().local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.socket().remote_addr()
    }

    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.stream.socket().tls_info()
    }

    /// Shared timer scheduler, for handler-owned timers.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.link.listener().scheduler()
    }

    /// Close the connection after the current request.
    pub fn kill_keepalive(&self) {
        self.link.kill_keepalive();
    }

    /// Whether the link or its listener is closing.
    pub fn is_closing(&self) -> bool {
        self.link.is_closing()
    }

    /// Suspend the current request once the handler returns.
    ///
    /// The link releases its worker until [`CometHandle::wake`] is called or
    /// `timeout` (default: the listener's suspend timeout) passes. A wake
    /// that arrives before the handler returns is not lost; the request
    /// resumes immediately instead of suspending.
    ///
    /// # Errors
    ///
    /// Fails if an upgrade was already requested in this call, or if called
    /// from a hook that cannot suspend.
    pub fn start_comet(&mut self, timeout: Option<Duration>) -> Result<CometHandle> {
        self.check_upgrade(Upgrade::Comet)?;
        self.link.request_cell().to_async_start()?;

        let generation = self.link.next_comet_generation();
        *self.pending = Pending::Comet(CometController::new(generation, timeout));
        Ok(CometHandle::new(self.link, generation))
    }

    /// Switch to duplex mode once the handler returns.
    ///
    /// # Errors
    ///
    /// Fails if an upgrade was already requested in this call, or if called
    /// from a hook that cannot upgrade (anything but `handle_request`).
    pub fn start_duplex(&mut self) -> Result<()> {
        self.check_upgrade(Upgrade::Duplex)?;
        *self.pending = Pending::Duplex;
        Ok(())
    }

    fn check_upgrade(&self, what: Upgrade) -> Result<()> {
        if !self.upgrades.allows(what) {
            return Err(Error::protocol(format!(
                "{} upgrade not allowed here",
                what.as_str()
            )));
        }
        if !matches!(self.pending, Pending::None) {
            return Err(Error::protocol(format!(
                "{} upgrade requested twice in one call",
                what.as_str()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for LinkContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkContext")
            .field("link_id", &self.link.id())
            .field("stream", &self.stream)
            .field("upgrades", &self.upgrades)
            .finish()
    }
}
