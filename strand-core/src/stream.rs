//! Buffered link streams and the idle buffer pool.
//!
//! Each link reads and writes through a [`LinkStream`], which owns a pair
//! of `BytesMut` buffers and counts bytes moved in each direction. Handlers
//! use it through `Read`, `BufRead` and `Write`; the link uses the counters
//! to detect forward progress.
//!
//! When a link closes its buffers go back to the listener's
//! [`BufferPool`], so steady-state traffic does not allocate per connection.
//!
//! ## Buffer Lifecycle
//!
//! ```text
//!   accept ──► BufferPool::acquire ──► LinkStream ──► close
//!                   ▲                                  │
//!                   └──── release (if pool has room) ◄─┘
//! ```

use crate::socket::{Readiness, Socket};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Buffer Pool
// ============================================================================

/// Read/write buffer pair owned by one link at a time.
#[derive(Debug)]
pub struct LinkBuffers {
    read: BytesMut,
    write: BytesMut,
}

impl LinkBuffers {
    fn with_capacity(read: usize, write: usize) -> Self {
        Self {
            read: BytesMut::with_capacity(read),
            write: BytesMut::with_capacity(write),
        }
    }

    fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
    }
}

/// Statistics for buffer pool operations.
#[derive(Debug, Default)]
pub struct PoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
    returns: AtomicU64,
    discards: AtomicU64,
}

impl PoolStats {
    /// Buffers handed out from the pool.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Buffers allocated because the pool was empty.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Buffers returned to the pool.
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Buffers dropped because the pool was full.
    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    /// Hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            (hits / total) * 100.0
        }
    }
}

/// Pool of idle buffer pairs shared by a listener's links.
pub struct BufferPool {
    idle: Mutex<Vec<LinkBuffers>>,
    max_idle: usize,
    read_capacity: usize,
    write_capacity: usize,
    stats: PoolStats,
}

impl BufferPool {
    /// Create a pool keeping at most `max_idle` pairs.
    pub fn new(max_idle: usize, read_capacity: usize, write_capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
            read_capacity: read_capacity.max(1),
            write_capacity: write_capacity.max(1),
            stats: PoolStats::default(),
        }
    }

    /// Take a pair from the pool, allocating if it is empty.
    pub fn acquire(&self) -> LinkBuffers {
        if let Some(buffers) = self.idle.lock().pop() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return buffers;
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        LinkBuffers::with_capacity(self.read_capacity, self.write_capacity)
    }

    /// Return a pair. Returns `false` if the pool was full and the pair was
    /// dropped.
    pub fn release(&self, mut buffers: LinkBuffers) -> bool {
        buffers.clear();
        // Buffers that were grown for a large message are not worth keeping.
        if buffers.read.capacity() > self.read_capacity * 4
            || buffers.write.capacity() > self.write_capacity * 4
        {
            self.stats.discards.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // Reclaim space given up by `advance`.
        buffers.read.reserve(self.read_capacity);
        buffers.write.reserve(self.write_capacity);

        let mut idle = self.idle.lock();
        if idle.len() >= self.max_idle {
            self.stats.discards.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        idle.push(buffers);
        self.stats.returns.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drop idle pairs until at most `keep` remain. Returns how many were
    /// dropped.
    pub fn trim(&self, keep: usize) -> usize {
        let mut idle = self.idle.lock();
        let excess = idle.len().saturating_sub(keep);
        idle.truncate(keep);
        excess
    }

    /// Number of idle pairs.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Maximum number of idle pairs kept.
    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .field("read_capacity", &self.read_capacity)
            .field("write_capacity", &self.write_capacity)
            .finish()
    }
}

// ============================================================================
// Link Stream
// ============================================================================

/// Buffered, byte-counting stream over a [`Socket`].
pub struct LinkStream {
    socket: Box<dyn Socket>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    read_capacity: usize,
    write_capacity: usize,
    bytes_read: u64,
    bytes_written: u64,
}

impl LinkStream {
    /// Wrap `socket` using `buffers` for buffering.
    pub fn new(socket: Box<dyn Socket>, buffers: LinkBuffers) -> Self {
        let read_capacity = buffers.read.capacity().max(1);
        let write_capacity = buffers.write.capacity().max(1);
        Self {
            socket,
            read_buf: buffers.read,
            write_buf: buffers.write,
            read_capacity,
            write_capacity,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Bytes consumed by the reader so far.
    #[inline(always)]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes accepted for writing so far.
    #[inline(always)]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes buffered but not yet consumed.
    #[inline(always)]
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    pub fn socket(&self) -> &dyn Socket {
        self.socket.as_ref()
    }

    pub fn socket_mut(&mut self) -> &mut dyn Socket {
        self.socket.as_mut()
    }

    /// Non-blocking probe, counting buffered bytes as readable.
    pub fn poll_readable(&mut self) -> io::Result<Readiness> {
        if !self.read_buf.is_empty() {
            return Ok(Readiness::Ready);
        }
        self.socket.poll_readable()
    }

    /// Blocking probe, counting buffered bytes as readable.
    pub fn wait_readable(&mut self, timeout: std::time::Duration) -> io::Result<Readiness> {
        if !self.read_buf.is_empty() {
            return Ok(Readiness::Ready);
        }
        self.socket.wait_readable(timeout)
    }

    /// Flush pending output and close the socket.
    ///
    /// Both steps are attempted; the first error is returned.
    pub fn close(&mut self) -> io::Result<()> {
        let flushed = self.flush();
        let closed = self.socket.close();
        flushed.and(closed)
    }

    /// Detach the buffers for return to the pool. The stream stays usable
    /// but unbuffered-sized afterwards.
    pub fn take_buffers(&mut self) -> LinkBuffers {
        LinkBuffers {
            read: std::mem::take(&mut self.read_buf),
            write: std::mem::take(&mut self.write_buf),
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.socket.write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Read for LinkStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        // Large reads skip the buffer entirely.
        if self.read_buf.is_empty() && out.len() >= self.read_capacity {
            let n = self.socket.read(out)?;
            self.bytes_read += n as u64;
            return Ok(n);
        }

        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for LinkStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.read_buf.is_empty() {
            self.read_buf.resize(self.read_capacity, 0);
            match self.socket.read(&mut self.read_buf[..]) {
                Ok(n) => self.read_buf.truncate(n),
                Err(e) => {
                    self.read_buf.clear();
                    return Err(e);
                }
            }
        }
        Ok(&self.read_buf[..])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.read_buf.len());
        self.read_buf.advance(amt);
        self.bytes_read += amt as u64;
    }
}

impl Write for LinkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.write_buf.len() + buf.len() > self.write_capacity {
            self.flush_buffer()?;
        }

        if buf.len() >= self.write_capacity {
            let n = self.socket.write(buf)?;
            self.bytes_written += n as u64;
            return Ok(n);
        }

        self.write_buf.extend_from_slice(buf);
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.socket.flush()
    }
}

impl fmt::Debug for LinkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkStream")
            .field("remote", &self.socket.remote_addr())
            .field("buffered", &self.read_buf.len())
            .field("pending_write", &self.write_buf.len())
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}
