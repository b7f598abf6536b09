//! End-to-end connection lifecycle tests over loopback TCP.

use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use strand_core::link::ConnectionLink;
use strand_core::multiplexer::{self, MultiplexerConfig};
use strand_core::shutdown::ShutdownReason;
use strand_core::socket::Interrupter;
use strand_core::{
    CloseReason, CometHandle, ConnectionState, DuplexController, Error, LinkContext, Listener,
    ListenerConfig, Protocol, ProtocolHandler, Readiness, RuntimePool, Scheduler,
    SchedulerConfig, Socket, TcpSocket, WorkerConfig, WorkerPool,
};

// =============================================================================
// Test Protocol
// =============================================================================

/// Shared record of what the handlers saw.
#[derive(Default)]
struct Journal {
    closes: Mutex<Vec<CloseReason>>,
    resumes: AtomicUsize,
    suspend_timeouts: AtomicUsize,
    comet: Mutex<Option<CometHandle>>,
}

impl Journal {
    fn closes(&self) -> Vec<CloseReason> {
        self.closes.lock().clone()
    }

    fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    fn suspend_timeouts(&self) -> usize {
        self.suspend_timeouts.load(Ordering::SeqCst)
    }
}

/// Line protocol: echoes lines, with a few command words.
struct LineHandler {
    journal: Arc<Journal>,
    upgrade_on_resume: bool,
}

impl ProtocolHandler for LineHandler {
    fn handle_request(&mut self, cx: &mut LinkContext<'_>) -> strand_core::Result<bool> {
        let mut line = String::new();
        if cx.stream().read_line(&mut line)? == 0 {
            return Ok(false);
        }

        match line.trim_end() {
            "wait" => {
                let handle = cx.start_comet(Some(Duration::from_secs(5)))?;
                *self.journal.comet.lock() = Some(handle);
            }
            "wait-short" => {
                cx.start_comet(Some(Duration::from_millis(150)))?;
            }
            "wait-race" => {
                let handle = cx.start_comet(Some(Duration::from_millis(20)))?;
                *self.journal.comet.lock() = Some(handle);
            }
            "early" => {
                let handle = cx.start_comet(None)?;
                assert!(handle.wake());
            }
            "early-upgrade" => {
                self.upgrade_on_resume = true;
                let handle = cx.start_comet(None)?;
                assert!(handle.wake());
            }
            "upgrade" => {
                cx.start_duplex()?;
                cx.stream().write_all(b"ok\n")?;
            }
            "quit" => {
                cx.stream().write_all(b"bye\n")?;
                return Ok(false);
            }
            "oom" => return Err(Error::OutOfMemory("test allocation".into())),
            "panic" => panic!("handler blew up"),
            other => {
                cx.stream().write_all(other.as_bytes())?;
                cx.stream().write_all(b"\n")?;
            }
        }
        Ok(true)
    }

    fn handle_resume(&mut self, cx: &mut LinkContext<'_>) -> strand_core::Result<bool> {
        self.journal.resumes.fetch_add(1, Ordering::SeqCst);
        if std::mem::take(&mut self.upgrade_on_resume) {
            match cx.start_duplex() {
                Ok(()) => cx.stream().write_all(b"duplex\n")?,
                Err(_) => cx.stream().write_all(b"refused\n")?,
            }
        }
        cx.stream().write_all(b"resumed\n")?;
        Ok(true)
    }

    fn on_suspend_timeout(&mut self, cx: &mut LinkContext<'_>) {
        self.journal.suspend_timeouts.fetch_add(1, Ordering::SeqCst);
        let _ = cx.stream().write_all(b"timeout\n");
    }

    fn service_read(
        &mut self,
        cx: &mut LinkContext<'_>,
        duplex: &mut DuplexController,
    ) -> strand_core::Result<()> {
        let chunk = cx.stream().fill_buf()?.to_vec();
        // A leading '!' stalls without consuming.
        if chunk.starts_with(b"!") {
            return Ok(());
        }
        cx.stream().consume(chunk.len());
        cx.stream().write_all(&chunk)?;
        if chunk.windows(3).any(|w| w == b"bye") {
            duplex.close();
        }
        Ok(())
    }

    fn on_close_connection(&mut self, reason: CloseReason) {
        self.journal.closes.lock().push(reason);
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Engine {
    listener: Arc<Listener>,
    scheduler: Arc<Scheduler>,
    pool: Arc<RuntimePool>,
    journal: Arc<Journal>,
    tcp: TcpListener,
    addr: SocketAddr,
}

impl Engine {
    fn start(config: ListenerConfig, multiplexed: bool) -> Self {
        let pool = RuntimePool::new(WorkerConfig::new().max_threads(32)).unwrap();
        let scheduler =
            Scheduler::start(SchedulerConfig::default(), pool.clone() as Arc<dyn WorkerPool>)
                .unwrap();

        let journal = Arc::new(Journal::default());
        let handler_journal = Arc::clone(&journal);
        let protocol: Arc<dyn Protocol> = Arc::new(move || -> Box<dyn ProtocolHandler> {
            Box::new(LineHandler {
                journal: Arc::clone(&handler_journal),
                upgrade_on_resume: false,
            })
        });

        let mux = if multiplexed {
            multiplexer::from_config(&MultiplexerConfig::default()).unwrap()
        } else {
            None
        };

        let listener = Listener::builder(
            Arc::clone(&scheduler),
            pool.clone() as Arc<dyn WorkerPool>,
            protocol,
        )
        .config(config)
        .maybe_multiplexer(mux)
        .build()
        .unwrap();

        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp.local_addr().unwrap();
        Self {
            listener,
            scheduler,
            pool,
            journal,
            tcp,
            addr,
        }
    }

    fn connect(&self) -> (Client, Arc<ConnectionLink>) {
        self.connect_with(|socket| Box::new(socket))
    }

    fn connect_with(&self, wrap: impl FnOnce(TcpSocket) -> Box<dyn Socket>) -> (Client, Arc<ConnectionLink>) {
        let client = TcpStream::connect(self.addr).unwrap();
        let (server, _) = self.tcp.accept().unwrap();
        let socket = wrap(TcpSocket::new(server).unwrap());
        let link = self.listener.accept(socket).unwrap();
        (Client::new(client), link)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.listener.shutdown();
        self.listener.drain(Duration::from_secs(2));
        self.scheduler.shutdown();
        self.pool.shutdown(Duration::from_secs(1));
    }
}

fn config() -> ListenerConfig {
    ListenerConfig::default().poll_slice(Duration::from_millis(50))
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn new(stream: TcpStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let writer = stream.try_clone().unwrap();
        Self {
            reader: BufReader::new(stream),
            writer,
        }
    }

    fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
    }

    /// Next line without its newline; empty at EOF.
    fn recv_line(&mut self) -> String {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(_) => line.trim_end().to_string(),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => String::new(),
            Err(e) => panic!("client read failed: {e}"),
        }
    }
}

fn wait_until(f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

// =============================================================================
// Request / Keepalive
// =============================================================================

#[test]
fn test_echo_over_keepalive() {
    let engine = Engine::start(config(), false);
    let (mut client, link) = engine.connect();

    for word in ["one", "two", "three"] {
        client.send(word);
        assert_eq!(client.recv_line(), word);
    }
    assert!(wait_until(|| link.state() == ConnectionState::Keepalive));

    client.send("quit");
    assert_eq!(client.recv_line(), "bye");
    assert_eq!(client.recv_line(), "");

    assert!(wait_until(|| engine.listener.stats().closed() == 1));
    assert_eq!(link.close_reason(), Some(CloseReason::Normal));
    assert_eq!(engine.journal.closes(), vec![CloseReason::Normal]);

    let stats = engine.listener.stats().snapshot();
    assert_eq!(stats.requests, 4);
    assert_eq!(stats.keepalives, 3);
    assert_eq!(stats.open(), 0);
}

#[test]
fn test_keepalive_timeout_closes_once() {
    let engine = Engine::start(config().keepalive_timeout(Duration::from_millis(200)), false);
    let (mut client, link) = engine.connect();

    client.send("hello");
    assert_eq!(client.recv_line(), "hello");

    let idle_from = Instant::now();
    assert_eq!(client.recv_line(), "");
    assert!(idle_from.elapsed() >= Duration::from_millis(150));

    assert!(wait_until(|| engine.listener.stats().closed() == 1));
    assert_eq!(link.close_reason(), Some(CloseReason::KeepaliveTimeout));
    assert_eq!(engine.listener.stats().keepalive_timeouts(), 1);
    assert_eq!(engine.journal.closes(), vec![CloseReason::KeepaliveTimeout]);
    assert_eq!(engine.listener.active_connections(), 0);
}

#[cfg(unix)]
#[test]
fn test_multiplexed_keepalive_timeout_closes_once() {
    let engine = Engine::start(config().keepalive_timeout(Duration::from_millis(200)), true);
    assert!(engine.listener.multiplexer().is_some());
    let (mut client, link) = engine.connect();

    client.send("hello");
    assert_eq!(client.recv_line(), "hello");
    assert_eq!(client.recv_line(), "");

    assert!(wait_until(|| engine.listener.stats().closed() == 1));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(link.close_reason(), Some(CloseReason::KeepaliveTimeout));
    assert_eq!(engine.listener.stats().keepalive_timeouts(), 1);
    assert_eq!(engine.journal.closes(), vec![CloseReason::KeepaliveTimeout]);
}

#[cfg(unix)]
#[test]
fn test_multiplexed_keepalive_redispatches() {
    let engine = Engine::start(config(), true);
    let (mut client, link) = engine.connect();

    client.send("first");
    assert_eq!(client.recv_line(), "first");

    // Let the link park on the multiplexer before the next request.
    assert!(wait_until(|| link.is_waiting_keepalive()));
    thread::sleep(Duration::from_millis(50));

    client.send("second");
    assert_eq!(client.recv_line(), "second");
    assert!(!link.is_closed());
    assert!(engine.journal.closes().is_empty());
}

#[test]
fn test_peer_close_during_keepalive() {
    let engine = Engine::start(config(), false);
    let (mut client, link) = engine.connect();

    client.send("hello");
    assert_eq!(client.recv_line(), "hello");
    drop(client);

    assert!(wait_until(|| link.is_closed()));
    assert_eq!(link.close_reason(), Some(CloseReason::PeerClosed));
}

// =============================================================================
// Comet
// =============================================================================

#[test]
fn test_comet_wake_resumes_once() {
    let engine = Engine::start(config(), false);
    let (mut client, link) = engine.connect();

    client.send("wait");
    assert!(wait_until(|| engine.journal.comet.lock().is_some()));
    let handle = engine.journal.comet.lock().clone().unwrap();
    assert_eq!(handle.link_id(), link.id());

    thread::sleep(Duration::from_millis(50));
    assert!(handle.wake());
    assert_eq!(client.recv_line(), "resumed");

    // Back to keepalive; the same handle no longer wakes anything.
    client.send("ping");
    assert_eq!(client.recv_line(), "ping");
    assert!(!handle.wake());

    assert_eq!(engine.journal.resumes(), 1);
    assert_eq!(engine.journal.suspend_timeouts(), 0);
    assert!(!link.is_closed());
}

#[test]
fn test_comet_wake_racing_deadline_has_one_winner() {
    let engine = Engine::start(config(), false);
    let rounds = 40;

    for round in 0..rounds {
        let (mut client, link) = engine.connect();
        client.send("wait-race");
        assert!(wait_until(|| engine.journal.comet.lock().is_some()));
        let handle = engine.journal.comet.lock().take().unwrap();

        // Land the wake around the 20ms deadline.
        thread::sleep(Duration::from_millis(15 + round % 10));
        let woke = handle.wake();

        let reply = client.recv_line();
        if woke {
            assert_eq!(reply, "resumed", "round {round}: wake won but the link timed out");
            client.send("quit");
            assert_eq!(client.recv_line(), "bye");
            assert!(wait_until(|| link.is_closed()));
            assert_eq!(link.close_reason(), Some(CloseReason::Normal));
        } else {
            assert_eq!(reply, "timeout", "round {round}: deadline won but the link resumed");
            assert!(wait_until(|| link.is_closed()));
            assert_eq!(link.close_reason(), Some(CloseReason::SuspendTimeout));
        }
    }

    assert_eq!(
        engine.journal.resumes() + engine.journal.suspend_timeouts(),
        rounds as usize
    );
}

#[test]
fn test_comet_wake_before_suspend_is_not_lost() {
    let engine = Engine::start(config(), false);
    let (mut client, link) = engine.connect();

    client.send("early");
    assert_eq!(client.recv_line(), "resumed");
    assert_eq!(engine.journal.resumes(), 1);
    assert_eq!(engine.journal.suspend_timeouts(), 0);
    assert!(!link.is_closed());
}

#[test]
fn test_resumed_request_cannot_switch_to_duplex() {
    let engine = Engine::start(config(), false);
    let (mut client, link) = engine.connect();

    client.send("early-upgrade");
    assert_eq!(client.recv_line(), "refused");
    assert_eq!(client.recv_line(), "resumed");

    // Still a request/response link.
    client.send("ping");
    assert_eq!(client.recv_line(), "ping");
    assert!(!link.is_closed());

    client.send("quit");
    assert_eq!(client.recv_line(), "bye");
    assert!(wait_until(|| link.is_closed()));
    assert_eq!(link.close_reason(), Some(CloseReason::Normal));
    assert_eq!(engine.journal.closes(), vec![CloseReason::Normal]);
    assert_eq!(engine.listener.stats().snapshot().duplex_upgrades, 0);
}

#[test]
fn test_comet_suspend_timeout() {
    let engine = Engine::start(config(), false);
    let (mut client, link) = engine.connect();

    client.send("wait-short");
    assert_eq!(client.recv_line(), "timeout");
    assert_eq!(client.recv_line(), "");

    assert!(wait_until(|| engine.listener.stats().closed() == 1));
    assert_eq!(link.close_reason(), Some(CloseReason::SuspendTimeout));
    assert_eq!(engine.journal.suspend_timeouts(), 1);
    assert_eq!(engine.journal.resumes(), 0);
    assert_eq!(engine.journal.closes(), vec![CloseReason::SuspendTimeout]);
}

// =============================================================================
// Duplex
// =============================================================================

#[test]
fn test_duplex_echo_until_closed() {
    let engine = Engine::start(config(), false);
    let (mut client, link) = engine.connect();

    client.send("upgrade");
    assert_eq!(client.recv_line(), "ok");

    client.send("abc");
    assert_eq!(client.recv_line(), "abc");
    client.send("bye");
    assert_eq!(client.recv_line(), "bye");

    assert!(wait_until(|| link.is_closed()));
    assert_eq!(link.close_reason(), Some(CloseReason::Normal));
    assert_eq!(engine.listener.stats().snapshot().duplex_upgrades, 1);
}

#[test]
fn test_duplex_zero_progress_is_violation() {
    let engine = Engine::start(config(), false);
    let (mut client, link) = engine.connect();

    client.send("upgrade");
    assert_eq!(client.recv_line(), "ok");
    client.send_raw(b"!stall");
    assert_eq!(client.recv_line(), "");

    assert!(wait_until(|| engine.listener.stats().closed() == 1));
    assert_eq!(link.close_reason(), Some(CloseReason::ProtocolViolation));
    assert_eq!(engine.listener.stats().protocol_violations(), 1);
    assert_eq!(engine.journal.closes(), vec![CloseReason::ProtocolViolation]);
}

#[test]
fn test_duplex_idle_timeout() {
    let engine = Engine::start(config().duplex_idle_timeout(Duration::from_millis(150)), false);
    let (mut client, link) = engine.connect();

    client.send("upgrade");
    assert_eq!(client.recv_line(), "ok");
    assert_eq!(client.recv_line(), "");

    assert!(wait_until(|| link.is_closed()));
    assert_eq!(link.close_reason(), Some(CloseReason::Timeout));
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_handler_panic_closes_link() {
    let engine = Engine::start(config(), false);
    let (mut client, link) = engine.connect();

    client.send("panic");
    assert_eq!(client.recv_line(), "");

    assert!(wait_until(|| link.is_closed()));
    assert_eq!(link.close_reason(), Some(CloseReason::HandlerError));
    assert_eq!(engine.journal.closes(), vec![CloseReason::HandlerError]);
}

#[test]
fn test_out_of_memory_triggers_shutdown() {
    let engine = Engine::start(config(), false);
    let (mut other, other_link) = engine.connect();
    other.send("warm");
    assert_eq!(other.recv_line(), "warm");

    let (mut client, link) = engine.connect();
    client.send("oom");
    assert_eq!(client.recv_line(), "");

    assert!(wait_until(|| link.is_closed() && other_link.is_closed()));
    assert_eq!(link.close_reason(), Some(CloseReason::OutOfMemory));
    assert_eq!(other_link.close_reason(), Some(CloseReason::Shutdown));
    assert_eq!(
        engine.listener.shutdown_signal().reason(),
        Some(ShutdownReason::OutOfMemory)
    );
    assert!(engine.listener.is_shutting_down());
}

// =============================================================================
// Forced Close
// =============================================================================

/// Socket wrapper counting `close` calls.
struct CountingSocket {
    inner: TcpSocket,
    closes: Arc<AtomicUsize>,
}

impl Read for CountingSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for CountingSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Socket for CountingSocket {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    fn poll_readable(&mut self) -> io::Result<Readiness> {
        self.inner.poll_readable()
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<Readiness> {
        self.inner.wait_readable(timeout)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.inner.raw_fd()
    }

    fn interrupter(&self) -> Option<Interrupter> {
        self.inner.interrupter()
    }

    fn close(&mut self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

fn race_close(link: &Arc<ConnectionLink>) {
    const RACERS: usize = 8;
    let barrier = Barrier::new(RACERS);
    thread::scope(|s| {
        for i in 0..RACERS {
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                if i % 2 == 0 {
                    link.close();
                } else {
                    link.close_with(CloseReason::Shutdown);
                }
            });
        }
    });
}

#[test]
fn test_racing_close_of_suspended_link() {
    let engine = Engine::start(config(), false);
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let (mut client, link) = engine.connect_with(move |inner| {
        Box::new(CountingSocket {
            inner,
            closes: counter,
        })
    });

    client.send("wait");
    assert!(wait_until(|| link.state() == ConnectionState::CometSuspend));

    race_close(&link);

    assert!(wait_until(|| link.is_closed()));
    assert_eq!(client.recv_line(), "");
    assert!(wait_until(|| engine.listener.active_connections() == 0));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(link.close_reason(), Some(CloseReason::Shutdown));
    assert_eq!(engine.journal.closes(), vec![CloseReason::Shutdown]);
    assert_eq!(engine.journal.resumes(), 0);
}

#[test]
fn test_racing_close_of_waiting_link() {
    let engine = Engine::start(config(), false);
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let (mut client, link) = engine.connect_with(move |inner| {
        Box::new(CountingSocket {
            inner,
            closes: counter,
        })
    });

    client.send("hello");
    assert_eq!(client.recv_line(), "hello");
    assert!(wait_until(|| link.state() == ConnectionState::Keepalive));

    race_close(&link);

    assert!(wait_until(|| link.is_closed()));
    assert!(wait_until(|| engine.listener.active_connections() == 0));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(link.close_reason(), Some(CloseReason::Shutdown));
    assert_eq!(engine.journal.closes(), vec![CloseReason::Shutdown]);
}

// =============================================================================
// Listener
// =============================================================================

#[test]
fn test_connection_limit() {
    let engine = Engine::start(config().max_connections(1), false);
    let (mut client, _link) = engine.connect();

    let extra = TcpStream::connect(engine.addr).unwrap();
    let (server, _) = engine.tcp.accept().unwrap();
    let result = engine
        .listener
        .accept(Box::new(TcpSocket::new(server).unwrap()));
    assert!(matches!(result, Err(Error::ConnectionLimit(1))));
    drop(extra);

    client.send("quit");
    assert_eq!(client.recv_line(), "bye");
    assert!(wait_until(|| engine.listener.active_connections() == 0));

    let (mut again, _) = engine.connect();
    again.send("ping");
    assert_eq!(again.recv_line(), "ping");
    assert_eq!(engine.listener.stats().snapshot().rejected, 1);
}

#[test]
fn test_shutdown_closes_all_links() {
    let engine = Engine::start(config(), false);
    let (mut a, link_a) = engine.connect();
    let (mut b, link_b) = engine.connect();
    a.send("wait");
    b.send("hello");
    assert_eq!(b.recv_line(), "hello");
    assert!(wait_until(|| link_a.state() == ConnectionState::CometSuspend));

    engine.listener.shutdown();
    assert!(engine.listener.drain(Duration::from_secs(3)));

    assert_eq!(a.recv_line(), "");
    assert_eq!(b.recv_line(), "");
    assert_eq!(link_a.close_reason(), Some(CloseReason::Shutdown));
    assert_eq!(link_b.close_reason(), Some(CloseReason::Shutdown));

    let late = TcpStream::connect(engine.addr).unwrap();
    let (server, _) = engine.tcp.accept().unwrap();
    let result = engine
        .listener
        .accept(Box::new(TcpSocket::new(server).unwrap()));
    assert!(matches!(result, Err(Error::ShuttingDown)));
    drop(late);
}

#[test]
fn test_serve_accept_loop() {
    let engine = Engine::start(config(), false);
    let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = tcp.local_addr().unwrap();
    let accept_thread = engine.listener.spawn(tcp).unwrap();

    let mut client = Client::new(TcpStream::connect(addr).unwrap());
    client.send("served");
    assert_eq!(client.recv_line(), "served");

    engine.listener.shutdown();
    assert!(accept_thread.join().unwrap().is_ok());
    assert_eq!(client.recv_line(), "");
}
