use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use rustls::{ClientConnection, StreamOwned};
use tracing::trace;

use super::tls::TlsContext;
use crate::error::{Error, Result};

/// Absolute point in time after which an operation gives up. `Deadline::none`
/// never expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    /// A deadline `timeout` from now. A zero timeout means no deadline.
    pub fn after(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self(None)
        } else {
            Self(Some(Instant::now() + timeout))
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Time left before expiry, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    /// The earlier of the two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) | (None, Some(a)) => Deadline(Some(a)),
            (None, None) => Deadline(None),
        }
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::Tls(s) => &s.sock,
        }
    }
}

/// A blocking socket whose reads and writes are bounded by both a per-attempt
/// socket timeout and a total deadline.
pub struct Socket {
    stream: Stream,
    last_used: Instant,
    stop_on_interrupt: bool,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("peer", &self.stream.tcp().peer_addr().ok())
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl Socket {
    /// Connects to `addr`. With a TLS context, the handshake is completed
    /// before returning, validating the server against `tls_name`.
    pub fn connect(
        addr: SocketAddr,
        tls: Option<(&TlsContext, &str)>,
        deadline: Deadline,
        stop_on_interrupt: bool,
    ) -> Result<Self> {
        let tcp = match deadline.remaining() {
            Some(left) if left.is_zero() => return Err(Error::timeout()),
            Some(left) => TcpStream::connect_timeout(&addr, left),
            None => TcpStream::connect(addr),
        }
        .map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::timeout(),
            _ => Error::connection(format!("Failed to connect to {}: {}", addr, e)),
        })?;
        tcp.set_nodelay(true)?;

        let stream = match tls {
            None => Stream::Plain(tcp),
            Some((ctx, tls_name)) => {
                let mut conn = ctx.connection(tls_name)?;
                let mut tcp = tcp;
                while conn.is_handshaking() {
                    set_timeout(&tcp, deadline, true)?;
                    set_timeout(&tcp, deadline, false)?;
                    conn.complete_io(&mut tcp)?;
                }
                Stream::Tls(Box::new(StreamOwned::new(conn, tcp)))
            }
        };

        trace!(%addr, "connected");
        Ok(Self {
            stream,
            last_used: Instant::now(),
            stop_on_interrupt,
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.tcp().peer_addr()?)
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Reads exactly `buf.len()` bytes.
    pub fn read_exact(
        &mut self,
        buf: &mut [u8],
        socket_timeout: Duration,
        deadline: Deadline,
    ) -> Result<()> {
        let mut pos = 0;
        self.read_tracked(buf, &mut pos, socket_timeout, deadline)
    }

    /// Fills `buf[*pos..]`, advancing `pos` as bytes arrive so that a caller
    /// can tell how much of a response was consumed before a failure.
    pub fn read_tracked(
        &mut self,
        buf: &mut [u8],
        pos: &mut usize,
        socket_timeout: Duration,
        deadline: Deadline,
    ) -> Result<()> {
        let deadline = deadline.min(Deadline::after(socket_timeout));
        while *pos < buf.len() {
            if deadline.is_expired() {
                Err(Error::timeout())?
            }
            set_timeout(self.stream.tcp(), deadline, true)?;
            let res = match &mut self.stream {
                Stream::Plain(s) => s.read(&mut buf[*pos..]),
                Stream::Tls(s) => s.read(&mut buf[*pos..]),
            };
            match res {
                // requested length is never zero, so this is a closed peer
                Ok(0) => Err(Error::connection("Bad file descriptor"))?,
                Ok(n) => *pos += n,
                Err(e) => self.transient(e)?,
            }
        }
        self.last_used = Instant::now();
        Ok(())
    }

    /// Writes all of `buf`.
    pub fn write_all(
        &mut self,
        buf: &[u8],
        socket_timeout: Duration,
        deadline: Deadline,
    ) -> Result<()> {
        let deadline = deadline.min(Deadline::after(socket_timeout));
        let mut pos = 0;
        while pos < buf.len() {
            if deadline.is_expired() {
                Err(Error::timeout())?
            }
            set_timeout(self.stream.tcp(), deadline, false)?;
            let res = match &mut self.stream {
                Stream::Plain(s) => s.write(&buf[pos..]),
                Stream::Tls(s) => s.write(&buf[pos..]).and_then(|n| s.flush().map(|_| n)),
            };
            match res {
                Ok(0) => Err(Error::connection("Bad file descriptor"))?,
                Ok(n) => pos += n,
                Err(e) => self.transient(e)?,
            }
        }
        self.last_used = Instant::now();
        Ok(())
    }

    /// Swallows errors that only mean "try again", surfacing the rest.
    fn transient(&self, e: io::Error) -> Result<()> {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Ok(()),
            io::ErrorKind::Interrupted if !self.stop_on_interrupt => Ok(()),
            _ => Err(Error::connection(format!("Socket error: {}", e))),
        }
    }

    pub fn is_idle(&self, max_idle: Duration) -> bool {
        !max_idle.is_zero() && self.last_used.elapsed() > max_idle
    }

    /// Liveness check of a pooled socket. Plain sockets are peeked without
    /// blocking: pending bytes or a closed peer mean the socket is unusable.
    /// TLS sockets can't be peeked through the session, so only the idle
    /// limit applies.
    pub fn validate(&self, max_idle: Duration) -> bool {
        if self.is_idle(max_idle) {
            return false;
        }
        match &self.stream {
            Stream::Tls(_) => true,
            Stream::Plain(tcp) => {
                if tcp.set_nonblocking(true).is_err() {
                    return false;
                }
                let mut byte = [0u8; 1];
                let alive = matches!(
                    tcp.peek(&mut byte),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock
                );
                alive && tcp.set_nonblocking(false).is_ok()
            }
        }
    }

    /// Switches the socket to short blocking reads used when draining an
    /// abandoned response.
    pub fn set_drain_timeout(&self, timeout: Duration) -> Result<()> {
        self.stream.tcp().set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn close(self) {
        let _ = self.stream.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

fn set_timeout(tcp: &TcpStream, deadline: Deadline, read: bool) -> io::Result<()> {
    // std rejects a zero timeout, the caller has already checked expiry
    let timeout = deadline
        .remaining()
        .map(|left| left.max(Duration::from_millis(1)));
    if read {
        tcp.set_read_timeout(timeout)
    } else {
        tcp.set_write_timeout(timeout)
    }
}
