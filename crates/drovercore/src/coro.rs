//! Cooperative single-step job driver.
//!
//! Rust has no stackful coroutines, so jobs are `async` futures polled one
//! suspension at a time by whoever owns the client: the reactor tick or a
//! blocking HTTP query loop. The integer channel of the protocol is kept:
//! a suspending step publishes "resume me in N ms" through the shared
//! [`YieldCell`], and the next `resume` delivers back how many milliseconds
//! late it is (the jitter), so a step can compensate for scheduling slop.
//!
//! Cancellation is dropping the [`Coro`]; destructors of everything owned
//! by the future run normally.

use futures::task::noop_waker_ref;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Default sleep request when a suspension point does not say otherwise.
const DEFAULT_WAIT_MS: u64 = 10;

/// The integer pass-through channel between a job and its driver.
///
/// `yield_val` flows job -> driver (requested sleep in ms), `resume_arg`
/// flows driver -> job (jitter in ms). The value is sticky: a suspension
/// that does not update it repeats the previous request.
#[derive(Debug)]
struct YieldCell {
    resume_arg: AtomicU64,
    yield_val: AtomicU64,
}

impl Default for YieldCell {
    fn default() -> Self {
        Self {
            resume_arg: AtomicU64::new(0),
            yield_val: AtomicU64::new(DEFAULT_WAIT_MS),
        }
    }
}

/// Job-side handle to the yield channel. Cheap to clone; one per client.
#[derive(Debug, Clone, Default)]
pub struct CoroCtx {
    cell: Arc<YieldCell>,
}

impl CoroCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// The argument passed to the most recent `resume`: how late the job
    /// was woken relative to its requested sleep.
    pub fn jitter(&self) -> u64 {
        self.cell.resume_arg.load(Ordering::Acquire)
    }

    /// Suspend once, asking to be resumed in `ms` milliseconds. Evaluates
    /// to the jitter reported by the resuming driver.
    pub fn sleep(&self, ms: u64) -> Sleep {
        Sleep {
            cell: Arc::clone(&self.cell),
            ms,
            suspended: false,
        }
    }
}

/// Future returned by [`CoroCtx::sleep`]. Suspends exactly once.
#[derive(Debug)]
pub struct Sleep {
    cell: Arc<YieldCell>,
    ms: u64,
    suspended: bool,
}

impl Future for Sleep {
    type Output = u64;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<u64> {
        let this = self.get_mut();
        if this.suspended {
            Poll::Ready(this.cell.resume_arg.load(Ordering::Acquire))
        } else {
            this.suspended = true;
            this.cell.yield_val.store(this.ms, Ordering::Release);
            Poll::Pending
        }
    }
}

/// Result of one [`Coro::resume`] step.
#[derive(Debug)]
pub enum Step<T> {
    /// The job suspended and asks to sleep this many milliseconds.
    Yielded(u64),
    /// The job body completed with this value.
    Done(T),
}

/// A suspended job: a boxed future plus its yield channel.
pub struct Coro<T> {
    fut: Pin<Box<dyn Future<Output = T> + Send + 'static>>,
    cell: Arc<YieldCell>,
}

impl<T> Coro<T> {
    /// Wrap `fut` so it can be driven through `ctx`'s yield channel. The
    /// future does not run until the first `resume` (futures are lazy, so
    /// the argument-copy handshake of a stackful spawn is unnecessary).
    pub fn spawn<F>(ctx: &CoroCtx, fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            fut: Box::pin(fut),
            cell: Arc::clone(&ctx.cell),
        }
    }

    /// Run the job until its next suspension point or completion,
    /// delivering `jitter` to the suspension it wakes from.
    pub fn resume(&mut self, jitter: u64) -> Step<T> {
        self.cell.resume_arg.store(jitter, Ordering::Release);
        let mut cx = Context::from_waker(noop_waker_ref());
        match self.fut.as_mut().poll(&mut cx) {
            Poll::Ready(v) => Step::Done(v),
            Poll::Pending => Step::Yielded(self.cell.yield_val.load(Ordering::Acquire)),
        }
    }
}

impl<T> std::fmt::Debug for Coro<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coro").finish_non_exhaustive()
    }
}
