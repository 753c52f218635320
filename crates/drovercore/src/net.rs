//! Non-blocking sockets and the poll set.
//!
//! Every device socket is a non-blocking `mio` TCP stream. The reactor
//! owns one [`SocketSet`]; clients own their streams and register them
//! with a token the reactor chose. Tokens are never reused across
//! connects, so a late event for a closed socket cannot alias a new one.

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Outcome of starting a connect.
pub enum ConnectStart {
    /// The three-way handshake already finished (loopback fast path).
    Connected(TcpStream),
    /// Connect is in flight; completion arrives as a writable event.
    InProgress(TcpStream),
}

/// Outcome of a single read or write attempt. Hard errors come back as
/// `io::Error` through the surrounding `Result`.
#[derive(Debug, PartialEq, Eq)]
pub enum IoOutcome {
    /// This many bytes moved. Short writes are legal.
    Done(usize),
    /// Nothing can move right now; try again later.
    WouldBlock,
    /// The peer closed the connection.
    Closed,
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut fallback = None;
    for addr in (host, port).to_socket_addrs()? {
        if addr.is_ipv4() {
            return Ok(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback.ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
    })
}

/// Resolve `host:port` and start a non-blocking connect.
pub fn open(host: &str, port: u16) -> io::Result<ConnectStart> {
    let addr = resolve(host, port)?;
    let stream = TcpStream::connect(addr)?;
    // peer_addr succeeds only once the handshake is done
    match stream.peer_addr() {
        Ok(_) => Ok(ConnectStart::Connected(stream)),
        Err(_) => Ok(ConnectStart::InProgress(stream)),
    }
}

/// Check whether a pending connect finished. `Ok(true)` means connected,
/// `Ok(false)` means still in flight, `Err` means the connect failed.
pub fn connect_finished(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e)
            if e.kind() == io::ErrorKind::NotConnected
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

pub fn read_some(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<IoOutcome> {
    match stream.read(buf) {
        Ok(0) => Ok(IoOutcome::Closed),
        Ok(n) => Ok(IoOutcome::Done(n)),
        Err(e) if retriable(&e) => Ok(IoOutcome::WouldBlock),
        Err(e) => Err(e),
    }
}

pub fn write_some(stream: &mut TcpStream, buf: &[u8]) -> io::Result<IoOutcome> {
    match stream.write(buf) {
        Ok(0) => Ok(IoOutcome::WouldBlock),
        Ok(n) => Ok(IoOutcome::Done(n)),
        Err(e) if retriable(&e) => Ok(IoOutcome::WouldBlock),
        Err(e) => Err(e),
    }
}

fn retriable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// One readiness event, already decoded from the OS flags.
#[derive(Debug, Clone, Copy)]
pub struct SocketEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// The socket errored or both directions are gone; the owner should
    /// stop tracking it. Reported once.
    pub discard: bool,
}

/// The reactor's poll set. Owns no sockets, only the OS poll handle;
/// correlation of tokens to clients is the caller's business.
pub struct SocketSet {
    poll: Poll,
    events: Events,
}

impl SocketSet {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
        })
    }

    /// Track a stream under `token`, watching both directions. A pending
    /// connect reports completion through its first writable event.
    pub fn register(&self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(stream, token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn deregister(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.poll.registry().deregister(stream)
    }

    /// Wait up to `timeout` and decode whatever became ready.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<Vec<SocketEvent>> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        let mut out = Vec::with_capacity(self.events.iter().count());
        for ev in self.events.iter() {
            out.push(SocketEvent {
                token: ev.token(),
                readable: ev.is_readable(),
                writable: ev.is_writable(),
                discard: ev.is_error() || (ev.is_read_closed() && ev.is_write_closed()),
            });
        }
        Ok(out)
    }
}
