//! drovercore - the device client engine of the drover supervisor.
//!
//! Drover keeps one persistent TCP connection per configured device,
//! logs in, and exposes each device's named operations to an HTTP
//! control plane. This crate is the engine in the middle:
//!
//! - a non-blocking socket layer and poll set ([`net`])
//! - per-client input buffering ([`buffer`])
//! - a cooperative single-step job driver ([`coro`])
//! - the action DSL interpreter ([`action`])
//! - the embedded Lua scripting host (`script`)
//! - the client state machine and per-client locking (`client`)
//! - the single-threaded reactor (`reactor`)
//! - the request bridge HTTP workers call into ([`Engine::query`])
//!
//! The HTTP server itself lives in the `droverd` binary; this crate never
//! touches a listening socket.

pub mod action;
pub mod buffer;
mod client;
mod conn;
pub mod coro;
mod device;
mod engine;
pub mod error;
pub mod net;
mod reactor;
mod script;

pub use client::State;
pub use engine::{ClientStatus, Engine};
pub use error::{EngineError, QueryError};
pub use script::ActionResult;
