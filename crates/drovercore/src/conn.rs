//! The shared I/O side of a client: socket handle plus input buffer.
//!
//! A client is split across two locks. The `Core` (state machine, active
//! job, Lua VM) lives behind the client's main mutex, which an HTTP query
//! holds for its whole duration. Everything here sits behind its own
//! short-hold mutex so the reactor can keep draining device output into
//! the buffer while a query is in flight. Lock order is always
//! core -> conn, never the reverse.
//!
//! Socket events observed by the reactor (connect completion, hangup) are
//! flagged here and applied to the state machine at the next tick; the
//! reactor must never block on a busy client's core lock.

use crate::buffer::InputBuffer;
use crate::client::State;
use crate::net::{self, IoOutcome};
use mio::net::TcpStream;
use parking_lot::Mutex;
use regex::bytes::Regex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Failure of a buffer/socket operation inside a running action.
#[derive(Debug, Error)]
pub(crate) enum LinkError {
    #[error("not connected")]
    NotConnected,
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

#[derive(Default)]
pub(crate) struct Conn {
    pub stream: Option<TcpStream>,
    pub inbuf: InputBuffer,
    /// Writable event seen while connecting; connect may have finished.
    pub saw_connected: bool,
    /// Socket errored or the peer went away.
    pub saw_hup: bool,
}

/// The part of a client shared with its running action: name, pacing,
/// observable state, and the connection itself.
pub(crate) struct Shared {
    pub name: String,
    pub io_yield_ms: u64,
    state: AtomicU8,
    time_in_state_ms: AtomicU64,
    conn: Mutex<Conn>,
}

impl Shared {
    pub fn new(name: String, io_yield_ms: u64) -> Self {
        Self {
            name,
            io_yield_ms,
            state: AtomicU8::new(State::Disconnected as u8),
            time_in_state_ms: AtomicU64::new(0),
            conn: Mutex::new(Conn::default()),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Store a new state and reset the time-in-state clock. Only the
    /// state machine (holding the core lock) calls this.
    pub fn store_state(&self, st: State) {
        self.state.store(st as u8, Ordering::Release);
        self.time_in_state_ms.store(0, Ordering::Release);
    }

    pub fn time_in_state_ms(&self) -> u64 {
        self.time_in_state_ms.load(Ordering::Acquire)
    }

    pub fn add_time_in_state(&self, dt_ms: u64) {
        self.time_in_state_ms.fetch_add(dt_ms, Ordering::AcqRel);
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().stream.is_some()
    }

    pub fn install_stream(&self, stream: TcpStream) {
        let mut conn = self.conn.lock();
        conn.stream = Some(stream);
        conn.saw_connected = false;
        conn.saw_hup = false;
    }

    /// Drop socket, buffer and pending event flags.
    pub fn reset_conn(&self) {
        let mut conn = self.conn.lock();
        conn.stream = None;
        conn.inbuf.clear();
        conn.saw_connected = false;
        conn.saw_hup = false;
    }

    pub fn clear_input(&self) {
        self.conn.lock().inbuf.clear();
    }

    pub fn avail_input(&self) -> usize {
        self.conn.lock().inbuf.available()
    }

    /// Consume `n` buffered bytes (clamped to what is available).
    pub fn advance_input(&self, n: usize) -> usize {
        let mut conn = self.conn.lock();
        let k = n.min(conn.inbuf.available());
        conn.inbuf.advance(k);
        k
    }

    pub fn skip_all(&self) -> usize {
        let mut conn = self.conn.lock();
        let n = conn.inbuf.available();
        conn.inbuf.advance(n);
        n
    }

    /// Copy up to `dst.len()` buffered bytes out. Returns 0 when nothing
    /// is buffered yet; errors only when the link is gone.
    pub fn read_input(&self, dst: &mut [u8]) -> Result<usize, LinkError> {
        let mut conn = self.conn.lock();
        if conn.stream.is_none() {
            return Err(LinkError::NotConnected);
        }
        let window = conn.inbuf.peek();
        let n = window.len().min(dst.len());
        dst[..n].copy_from_slice(&window[..n]);
        conn.inbuf.advance(n);
        Ok(n)
    }

    /// Try `re` against the start of the buffered bytes; on success the
    /// match is consumed and its length returned. Never waits.
    pub fn match_input(&self, re: &Regex) -> Option<usize> {
        let mut conn = self.conn.lock();
        let matched = re.find(conn.inbuf.peek()).map(|m| m.end())?;
        trace!(
            client = %self.name,
            matched,
            remainder = conn.inbuf.available() - matched,
            "regex matched input"
        );
        conn.inbuf.advance(matched);
        Some(matched)
    }

    /// Lossy preview of the buffered bytes for error messages.
    pub fn preview_input(&self) -> String {
        let conn = self.conn.lock();
        String::from_utf8_lossy(&conn.inbuf.peek()[..conn.inbuf.available().min(64)]).into_owned()
    }

    /// Write as much of `buf` as the socket accepts right now. Returns 0
    /// when the socket would block.
    pub fn send_some(&self, buf: &[u8]) -> Result<usize, LinkError> {
        let mut conn = self.conn.lock();
        let Some(stream) = conn.stream.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        match net::write_some(stream, buf) {
            Ok(IoOutcome::Done(n)) => Ok(n),
            Ok(IoOutcome::WouldBlock) => Ok(0),
            Ok(IoOutcome::Closed) => {
                conn.stream = None;
                conn.saw_hup = true;
                Err(LinkError::NotConnected)
            }
            Err(e) => {
                warn!(client = %self.name, error = %e, "socket write error");
                conn.stream = None;
                conn.saw_hup = true;
                Err(LinkError::Socket(e))
            }
        }
    }

    /// Reactor path: drain everything the socket has into the buffer.
    pub fn drain_socket(&self) {
        let mut conn = self.conn.lock();
        let mut tmp = [0u8; 1024];
        loop {
            let res = match conn.stream.as_mut() {
                Some(stream) => net::read_some(stream, &mut tmp),
                None => break,
            };
            match res {
                Ok(IoOutcome::Done(n)) => {
                    trace!(
                        client = %self.name,
                        bytes = n,
                        data = %String::from_utf8_lossy(&tmp[..n]),
                        "device output"
                    );
                    conn.inbuf.append(&tmp[..n]);
                }
                Ok(IoOutcome::WouldBlock) => break,
                Ok(IoOutcome::Closed) => {
                    debug!(client = %self.name, "peer closed connection");
                    conn.stream = None;
                    conn.saw_hup = true;
                    break;
                }
                Err(e) => {
                    warn!(client = %self.name, error = %e, "socket read error");
                    conn.stream = None;
                    conn.saw_hup = true;
                    break;
                }
            }
        }
    }

    /// Reactor path: flag a writable event (connect may have completed).
    pub fn note_writable(&self) {
        self.conn.lock().saw_connected = true;
    }

    /// Reactor path: flag an error/hangup event and drop the stream.
    pub fn note_discard(&self) {
        let mut conn = self.conn.lock();
        conn.stream = None;
        conn.saw_hup = true;
    }

    /// Consume pending event flags: `(saw_connected, saw_hup)`.
    pub fn take_events(&self) -> (bool, bool) {
        let mut conn = self.conn.lock();
        let out = (conn.saw_connected, conn.saw_hup);
        conn.saw_connected = false;
        conn.saw_hup = false;
        out
    }

    /// Check a pending connect. `Ok(true)` once the handshake finished.
    pub fn check_connect_finished(&self) -> Result<bool, LinkError> {
        let conn = self.conn.lock();
        let Some(stream) = conn.stream.as_ref() else {
            return Err(LinkError::NotConnected);
        };
        net::connect_finished(stream).map_err(LinkError::Socket)
    }

    /// Test hook: put bytes into the buffer as if the socket produced them.
    #[cfg(test)]
    pub fn push_input(&self, bytes: &[u8]) {
        self.conn.lock().inbuf.append(bytes);
    }
}
