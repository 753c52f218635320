//! Per-device client: lifecycle state machine, jobs, and the query path.
//!
//! Each client owns one socket, one input buffer, at most one running job
//! (a suspended action), and, for scripted device types, one Lua VM. Two
//! locks split the client:
//!
//! - the **core lock** (`Mutex<Core>`) serializes everything that drives
//!   the client: state transitions, job steps, the VM. An HTTP query
//!   holds it for the whole request, which is exactly how per-client
//!   operations stay strictly ordered. The reactor only `try_lock`s it,
//!   so a busy client never stalls the loop.
//! - the **conn lock** (inside [`Shared`]) guards the socket and buffer,
//!   so the reactor keeps feeding input while a query holds the core.
//!
//! State entry effects follow the compute-then-apply discipline: every
//! transition happens with the core lock already held, so entry effects
//! mutate directly and chained transitions (CONNECTED starts the login,
//! AUTHED falls through to IDLE) are plain nested calls.

use crate::conn::Shared;
use crate::coro::{Coro, CoroCtx, Step};
use crate::device::{ClientConfig, DeviceTemplate};
use crate::error::{EngineError, QueryError};
use crate::net::{self, ConnectStart, SocketSet};
use crate::script::{ActionResult, ScriptVm};
use mio::Token;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How long a client lingers in ERROR before reconnecting.
pub(crate) const ERROR_LINGER_MS: u64 = 3000;

/// Minimum sleep between caller-side drive steps.
const DRIVE_FLOOR_MS: u64 = 10;

/// Client lifecycle states. The ordering is observable: the HTTP layer
/// rejects queries while `state < Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    Error = 0,
    Disconnected,
    Connecting,
    /// Connected but not yet authenticated.
    Connected,
    Authing,
    Authed,
    /// Authenticated, nothing running.
    Idle,
    /// An action is running right now.
    InProcess,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Error => "ERROR",
            State::Disconnected => "DISCONNECTED",
            State::Connecting => "CONNECTING",
            State::Connected => "CONNECTED",
            State::Authing => "AUTHING",
            State::Authed => "AUTHED",
            State::Idle => "IDLE",
            State::InProcess => "INPROCESS",
        }
    }

    pub(crate) fn from_u8(v: u8) -> State {
        match v {
            0 => State::Error,
            1 => State::Disconnected,
            2 => State::Connecting,
            3 => State::Connected,
            4 => State::Authing,
            5 => State::Authed,
            6 => State::Idle,
            _ => State::InProcess,
        }
    }
}

/// What a finished job hands back to whoever started it.
struct JobOutcome {
    result: ActionResult,
    failed: bool,
}

/// The one running action of a client, plus where its completion goes.
struct Job {
    coro: Coro<JobOutcome>,
    end_state: State,
    fail_state: State,
    /// When the job asked to be resumed next.
    due: Instant,
    /// One-shot slot awaited by a synchronous caller; `None` for
    /// reactor-driven jobs (login, heartbeat), whose results are logged.
    result_tx: Option<oneshot::Sender<ActionResult>>,
}

/// Everything behind the client's core lock.
struct Core {
    job: Option<Job>,
    vm: Option<ScriptVm>,
    heartbeat_left_ms: u64,
}

pub(crate) struct Client {
    cfg: ClientConfig,
    dev: Arc<DeviceTemplate>,
    shared: Arc<Shared>,
    ctx: CoroCtx,
    core: Mutex<Core>,
}

impl Client {
    pub fn new(cfg: ClientConfig, dev: Arc<DeviceTemplate>) -> Result<Self, EngineError> {
        let shared = Arc::new(Shared::new(cfg.name.clone(), dev.io_yield_ms));
        let ctx = CoroCtx::new();
        let vm = match &dev.script {
            Some(path) => Some(
                ScriptVm::load(path, Arc::clone(&shared), ctx.clone(), &cfg.raw).map_err(
                    |message| EngineError::Script {
                        path: path.clone(),
                        message,
                    },
                )?,
            ),
            None => None,
        };
        Ok(Self {
            cfg,
            dev,
            shared,
            ctx,
            core: Mutex::new(Core {
                job: None,
                vm,
                heartbeat_left_ms: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn host(&self) -> &str {
        &self.cfg.host
    }

    pub fn port(&self) -> u16 {
        self.cfg.port
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn time_in_state_ms(&self) -> u64 {
        self.shared.time_in_state_ms()
    }

    /// Actions callable over HTTP: DSL actions plus script exports, minus
    /// `_`-prefixed names.
    fn is_exported(&self, core: &Core, action: &str) -> bool {
        if action.starts_with('_') {
            return false;
        }
        self.dev.actions.contains_key(action)
            || core
                .vm
                .as_ref()
                .is_some_and(|vm| vm.exports().contains(action))
    }

    // ---- state machine ----------------------------------------------

    fn set_state(&self, core: &mut Core, st: State) {
        let prev = self.shared.state();
        if prev == st {
            return;
        }
        info!(
            client = %self.cfg.name,
            from = prev.name(),
            to = st.name(),
            after_ms = self.shared.time_in_state_ms(),
            "state change"
        );
        self.shared.store_state(st);

        match st {
            State::Error => {
                // abort whatever was running; the socket stays until the
                // DISCONNECTED entry closes it
                core.job = None;
            }
            State::Disconnected => {
                core.job = None;
                self.shared.reset_conn();
            }
            State::Connecting => {}
            State::Connected => {
                self.shared.clear_input();
                if self.shared.is_connected() {
                    self.authenticate(core);
                } else {
                    self.set_state(core, State::Error);
                }
            }
            State::Authing => {}
            State::Authed => {
                self.set_state(core, State::Idle);
            }
            State::Idle => {
                core.heartbeat_left_ms = self.dev.heartbeat_ms;
            }
            State::InProcess => {}
        }
    }

    fn authenticate(&self, core: &mut Core) {
        if self
            .start_action(core, "_login", None, State::Authing, State::Authed, State::Error, None)
            .is_err()
        {
            warn!(
                client = %self.cfg.name,
                devicetype = %self.dev.name,
                "no _login action defined"
            );
            self.set_state(core, State::Error);
        }
    }

    fn heartbeat(&self, core: &mut Core) {
        if self
            .start_action(
                core,
                "heartbeat",
                None,
                State::InProcess,
                State::Idle,
                State::Error,
                None,
            )
            .is_err()
        {
            // no heartbeat defined; check again a full interval later
            debug!(client = %self.cfg.name, "no heartbeat action defined");
            core.heartbeat_left_ms = self.dev.heartbeat_ms;
        }
    }

    // ---- jobs -------------------------------------------------------

    /// Start `name` as the client's job and advance it one step. The DSL
    /// table is consulted first, then the script's globals.
    fn start_action(
        &self,
        core: &mut Core,
        name: &str,
        params: Option<&Value>,
        begin: State,
        end: State,
        fail: State,
        result_tx: Option<oneshot::Sender<ActionResult>>,
    ) -> Result<(), QueryError> {
        debug_assert!(core.job.is_none());

        let fut: Pin<Box<dyn Future<Output = JobOutcome> + Send>> =
            if let Some(act) = self.dev.actions.get(name) {
                let act = Arc::clone(act);
                let sh = Arc::clone(&self.shared);
                let ctx = self.ctx.clone();
                Box::pin(async move {
                    match act.run(&sh, &ctx).await {
                        Ok(_consumed) => JobOutcome {
                            result: ActionResult::default(),
                            failed: false,
                        },
                        Err(e) => JobOutcome {
                            result: ActionResult::from_error(e.to_string()),
                            failed: true,
                        },
                    }
                })
            } else if let Some(vm) = core.vm.as_ref().filter(|vm| vm.has_function(name)) {
                let fut = vm
                    .call(name, params)
                    .map_err(|_| QueryError::UnknownAction(name.to_string()))?;
                Box::pin(async move {
                    let result = fut.await;
                    let failed = result.error;
                    JobOutcome { result, failed }
                })
            } else {
                return Err(QueryError::UnknownAction(name.to_string()));
            };

        debug!(client = %self.cfg.name, action = name, "action starting");
        core.job = Some(Job {
            coro: Coro::spawn(&self.ctx, fut),
            end_state: end,
            fail_state: fail,
            due: Instant::now(),
            result_tx,
        });
        self.set_state(core, begin);
        self.advance_job(core, Instant::now());
        Ok(())
    }

    /// Advance the running job if it is due. Returns the suggested next
    /// wake in ms (`u64::MAX` when nothing constrains it).
    fn advance_job(&self, core: &mut Core, now: Instant) -> u64 {
        let outcome = {
            let Some(job) = core.job.as_mut() else {
                return u64::MAX;
            };
            if now < job.due {
                return (job.due - now).as_millis().max(1) as u64;
            }
            let jitter = (now - job.due).as_millis() as u64;
            match job.coro.resume(jitter) {
                Step::Yielded(ms) => {
                    job.due = now + Duration::from_millis(ms);
                    return ms.max(1);
                }
                Step::Done(outcome) => outcome,
            }
        };

        if let Some(job) = core.job.take() {
            match job.result_tx {
                Some(tx) => {
                    let _ = tx.send(outcome.result);
                }
                None if outcome.result.nret > 0 => {
                    info!(
                        client = %self.cfg.name,
                        status = outcome.result.status,
                        "action result ignored: {}",
                        outcome.result.text
                    );
                }
                None => {}
            }
            let st = if outcome.failed {
                job.fail_state
            } else {
                job.end_state
            };
            self.set_state(core, st);
        }
        self.dev.io_yield_ms
    }

    /// Caller-side drive loop: step the job, sleeping at least 10 ms
    /// between steps (bounded below by the job's requested sleep).
    fn drive_to_completion(&self, core: &mut MutexGuard<'_, Core>) {
        while core.job.is_some() {
            let next = self.advance_job(core, Instant::now());
            if core.job.is_some() {
                std::thread::sleep(Duration::from_millis(next.max(DRIVE_FLOOR_MS)));
            }
        }
    }

    // ---- reactor entry points ---------------------------------------

    /// Attempt a new connect; only meaningful in DISCONNECTED. Returns
    /// true when a socket was registered under `token`.
    pub fn connect(&self, set: &SocketSet, token: Token) -> bool {
        let Some(mut core) = self.core.try_lock() else {
            return false;
        };
        if self.shared.state() != State::Disconnected {
            return false;
        }
        info!(
            client = %self.cfg.name,
            host = %self.cfg.host,
            port = self.cfg.port,
            "connecting"
        );
        self.shared.clear_input();
        match net::open(&self.cfg.host, self.cfg.port) {
            Ok(start) => {
                let (mut stream, immediate) = match start {
                    ConnectStart::Connected(s) => (s, true),
                    ConnectStart::InProgress(s) => (s, false),
                };
                if let Err(e) = set.register(&mut stream, token) {
                    warn!(client = %self.cfg.name, error = %e, "socket registration failed");
                    self.set_state(&mut core, State::Error);
                    return false;
                }
                self.shared.install_stream(stream);
                let st = if immediate {
                    State::Connected
                } else {
                    State::Connecting
                };
                self.set_state(&mut core, st);
                true
            }
            Err(e) => {
                warn!(client = %self.cfg.name, error = %e, "connect failed");
                self.set_state(&mut core, State::Error);
                false
            }
        }
    }

    /// Writable event: a pending connect may have finished. Applied
    /// immediately when possible so the CONNECTED entry's buffer clear
    /// runs before any bytes from the same poll batch are drained.
    pub fn note_writable(&self) {
        if self.shared.state() != State::Connecting {
            return;
        }
        match self.core.try_lock() {
            Some(mut core) => self.delayed_connected(&mut core),
            None => self.shared.note_writable(),
        }
    }

    pub fn note_discard(&self) {
        self.shared.note_discard();
    }

    pub fn drain_socket(&self) {
        self.shared.drain_socket();
    }

    /// Apply socket events the reactor flagged since the last tick.
    fn apply_conn_events(&self, core: &mut Core) {
        let (saw_connected, saw_hup) = self.shared.take_events();
        if saw_hup {
            let state = self.shared.state();
            if state > State::Disconnected {
                // lost the peer (or the connect failed); linger in ERROR
                // so a dead host is not hammered with reconnects
                self.set_state(core, State::Error);
            }
            return;
        }
        if saw_connected && self.shared.state() == State::Connecting {
            self.delayed_connected(core);
        }
    }

    fn delayed_connected(&self, core: &mut Core) {
        match self.shared.check_connect_finished() {
            Ok(true) => self.set_state(core, State::Connected),
            Ok(false) => {}
            Err(e) => {
                warn!(client = %self.cfg.name, error = %e, "connect failed");
                self.set_state(core, State::Error);
            }
        }
    }

    /// One reactor tick. Skips entirely when another thread is driving
    /// the client. Returns the suggested next wake in ms.
    pub fn tick(&self, now: Instant, dt_ms: u64) -> u64 {
        let Some(mut core) = self.core.try_lock() else {
            return self.dev.io_yield_ms;
        };

        self.apply_conn_events(&mut core);
        let mut next = self.advance_job(&mut core, now);

        if self.shared.state() == State::Idle && self.dev.heartbeat_ms > 0 && core.job.is_none() {
            if core.heartbeat_left_ms > dt_ms {
                core.heartbeat_left_ms -= dt_ms;
                next = next.min(core.heartbeat_left_ms);
            } else {
                core.heartbeat_left_ms = 0;
                self.heartbeat(&mut core);
                next = next.min(self.dev.io_yield_ms);
            }
        }

        self.shared.add_time_in_state(dt_ms);

        if self.shared.state() == State::Error {
            let lingered = self.shared.time_in_state_ms();
            if lingered > ERROR_LINGER_MS {
                self.set_state(&mut core, State::Disconnected);
                next = next.min(1);
            } else {
                next = next.min(ERROR_LINGER_MS - lingered);
            }
        }

        next
    }

    // ---- request bridge ---------------------------------------------

    /// Run an exported action to completion on the caller's thread. Called
    /// concurrently from many HTTP workers; the core lock serializes them.
    pub fn query(&self, action: &str, params: Option<&Value>) -> Result<ActionResult, QueryError> {
        if self.shared.state() < State::Idle {
            return Err(QueryError::NotReady);
        }
        let mut core = self.core.lock();

        // a heartbeat may be mid-flight; finish it before taking over
        self.drive_to_completion(&mut core);

        if !self.is_exported(&core, action) {
            return Err(QueryError::UnknownAction(action.to_string()));
        }

        let (tx, mut rx) = oneshot::channel();
        self.start_action(
            &mut core,
            action,
            params,
            State::InProcess,
            State::Idle,
            State::Error,
            Some(tx),
        )?;
        self.drive_to_completion(&mut core);

        rx.try_recv().map_err(|_| QueryError::Aborted)
    }
}
