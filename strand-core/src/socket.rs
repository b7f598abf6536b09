//! Socket abstraction used by connection links.
//!
//! Links never talk to `TcpStream` directly. Anything that can do blocking
//! reads and writes, answer a readiness probe, and close itself can be
//! driven by a link; [`TcpSocket`] covers plain TCP.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strand_core::socket::{Readiness, Socket, TcpSocket};
//! use std::time::Duration;
//!
//! let mut socket = TcpSocket::new(stream)?;
//! match socket.wait_readable(Duration::from_millis(500))? {
//!     Readiness::Ready => { /* read */ }
//!     Readiness::Pending => { /* still idle */ }
//!     Readiness::Closed => { /* peer went away */ }
//! }
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

/// Result of a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one byte can be read without blocking.
    Ready,
    /// Nothing to read yet.
    Pending,
    /// The peer closed its side.
    Closed,
}

/// Metadata for TLS-wrapped sockets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol: Option<String>,
    pub cipher: Option<String>,
    pub server_name: Option<String>,
}

/// Cross-thread handle that unblocks a socket's pending reads.
///
/// Forced closes use this to kick a worker out of a blocking read before
/// the link tears itself down.
#[derive(Clone)]
pub struct Interrupter {
    inner: Arc<dyn Fn() + Send + Sync>,
}

impl Interrupter {
    /// Wrap a closure that interrupts the socket.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Interrupt any blocked read. Safe to call more than once.
    pub fn interrupt(&self) {
        (self.inner)()
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Interrupter")
    }
}

/// A connection endpoint a link can drive.
pub trait Socket: Read + Write + Send {
    /// Set the timeout for blocking reads. `None` blocks indefinitely.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Non-blocking readiness probe.
    fn poll_readable(&mut self) -> io::Result<Readiness>;

    /// Block until readable, closed, or `timeout` elapses.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<Readiness>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// TLS metadata, if the socket is encrypted.
    fn tls_info(&self) -> Option<&TlsInfo> {
        None
    }

    /// Descriptor for readiness multiplexing.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Handle for interrupting blocked reads from another thread.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }

    /// Close the socket. Calling it again is a no-op.
    fn close(&mut self) -> io::Result<()>;
}

// ============================================================================
// TCP
// ============================================================================

/// [`Socket`] over a blocking `std::net::TcpStream`.
#[derive(Debug)]
pub struct TcpSocket {
    stream: TcpStream,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    read_timeout: Option<Duration>,
    closed: bool,
}

impl TcpSocket {
    /// Wrap an accepted stream, forcing it into blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            local: stream.local_addr().ok(),
            remote: stream.peer_addr().ok(),
            read_timeout: stream.read_timeout()?,
            stream,
            closed: false,
        })
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    /// Whether [`Socket::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn peek_state(&self) -> io::Result<Readiness> {
        let mut byte = [0u8; 1];
        match self.stream.peek(&mut byte) {
            Ok(0) => Ok(Readiness::Closed),
            Ok(_) => Ok(Readiness::Ready),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(Readiness::Pending)
            }
            Err(e) if crate::error::is_disconnect_kind(e.kind()) => Ok(Readiness::Closed),
            Err(e) => Err(e),
        }
    }
}

impl Read for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Socket for TcpSocket {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        // A zero timeout is rejected by the OS.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.stream.set_read_timeout(timeout)?;
        self.read_timeout = timeout;
        Ok(())
    }

    fn poll_readable(&mut self) -> io::Result<Readiness> {
        self.stream.set_nonblocking(true)?;
        let state = self.peek_state();
        self.stream.set_nonblocking(false)?;
        state
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<Readiness> {
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let state = self.peek_state();
        self.stream.set_read_timeout(self.read_timeout)?;
        state
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        (!self.closed).then(|| self.stream.as_raw_fd())
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let stream = self.stream.try_clone().ok()?;
        Some(Interrupter::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                trace!(remote = ?self.remote, "socket already disconnected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TcpSocket::new(server).unwrap(), client)
    }

    #[test]
    fn test_poll_pending_then_ready() {
        let (mut socket, mut client) = pair();
        assert_eq!(socket.poll_readable().unwrap(), Readiness::Pending);

        client.write_all(b"x").unwrap();
        assert_eq!(
            socket.wait_readable(Duration::from_secs(2)).unwrap(),
            Readiness::Ready
        );

        // Probing must not consume data.
        let mut buf = [0u8; 1];
        socket.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn test_wait_times_out() {
        let (mut socket, _client) = pair();
        assert_eq!(
            socket.wait_readable(Duration::from_millis(20)).unwrap(),
            Readiness::Pending
        );
    }

    #[test]
    fn test_peer_close_detected() {
        let (mut socket, client) = pair();
        drop(client);
        assert_eq!(
            socket.wait_readable(Duration::from_secs(2)).unwrap(),
            Readiness::Closed
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut socket, _client) = pair();
        socket.close().unwrap();
        socket.close().unwrap();
        assert!(socket.is_closed());
    }

    #[test]
    fn test_interrupter_unblocks_read() {
        let (mut socket, _client) = pair();
        let interrupter = socket.interrupter().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            socket.read(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(20));
        interrupter.interrupt();

        let n = handle.join().unwrap().unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_addresses() {
        let (socket, client) = pair();
        assert_eq!(socket.remote_addr(), client.local_addr().ok());
        assert!(socket.local_addr().is_some());
        assert!(socket.tls_info().is_none());
    }
}
