//! The single-threaded event loop.
//!
//! One iteration: poll the socket set (timeout = the smallest wake any
//! client asked for, capped by `idle_wait_time`), hand each event to the
//! owning client, then reconnect and tick every client. The token -> client
//! map lives here and is touched by no other thread.

use crate::client::State;
use crate::engine::Engine;
use crate::net::SocketSet;
use mio::Token;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub(crate) fn run(engine: Arc<Engine>) -> io::Result<()> {
    let mut set = SocketSet::new()?;
    let clients = engine.clients();

    let mut by_token: HashMap<Token, usize> = HashMap::new();
    let mut tokens: Vec<Option<Token>> = vec![None; clients.len()];
    // tokens are never reused, so a stale event cannot hit a new socket
    let mut next_token = 0usize;

    let mut last = Instant::now();
    let mut timeout_ms = engine.idle_wait_ms();
    info!(clients = clients.len(), "reactor running");

    while !engine.should_quit() {
        for ev in set.poll(Duration::from_millis(timeout_ms))? {
            let Some(&idx) = by_token.get(&ev.token) else {
                continue;
            };
            let client = &clients[idx];
            if ev.writable {
                client.note_writable();
            }
            if ev.readable {
                client.drain_socket();
            }
            if ev.discard {
                client.note_discard();
                by_token.remove(&ev.token);
                tokens[idx] = None;
            }
        }

        let now = Instant::now();
        let dt_ms = now.duration_since(last).as_millis() as u64;
        last = now;

        let mut next = engine.idle_wait_ms();
        for (idx, client) in clients.iter().enumerate() {
            if client.state() == State::Disconnected {
                if let Some(stale) = tokens[idx].take() {
                    by_token.remove(&stale);
                }
                let token = Token(next_token);
                next_token += 1;
                if client.connect(&set, token) {
                    by_token.insert(token, idx);
                    tokens[idx] = Some(token);
                }
            }
            next = next.min(client.tick(now, dt_ms));
        }
        timeout_ms = next.clamp(1, engine.idle_wait_ms());
    }

    info!("reactor stopped");
    Ok(())
}
