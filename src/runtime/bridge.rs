//! Blocking bridge: run a blocking call on the blocker pool from a coroutine.
//!
//! The first poll packages the function, the coroutine's waker and a shared
//! completion slot into a job and submits it, then the coroutine suspends.
//! The worker runs the function, stores the result and wakes the waker. Task
//! wakers post into the owning thread's mailbox, so the coroutine always
//! resumes on the pool thread that suspended it, never on the worker.
//!
//! A thread that is shutting down accepts no new blocking calls; the calling
//! coroutine stays suspended until the thread drops it.

use super::blocker::BlockerJob;
use super::context::ThreadState;
use super::current;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use tracing::debug;

/// A bridged call that did not return a value.
pub enum BlockingError {
    /// The function panicked; carries the panic payload.
    Panicked(Box<dyn Any + Send + 'static>),
}

impl BlockingError {
    /// Panic message, when the payload is a string.
    pub fn message(&self) -> Option<&str> {
        match self {
            BlockingError::Panicked(payload) => payload
                .downcast_ref::<&'static str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str)),
        }
    }

    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            BlockingError::Panicked(payload) => payload,
        }
    }
}

impl fmt::Debug for BlockingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Panicked")
            .field(&self.message().unwrap_or("<non-string payload>"))
            .finish()
    }
}

impl fmt::Display for BlockingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "blocking call panicked: {msg}"),
            None => write!(f, "blocking call panicked"),
        }
    }
}

impl std::error::Error for BlockingError {}

struct CompletionState<T> {
    result: Option<thread::Result<T>>,
    waker: Option<Waker>,
}

/// Result slot shared by the suspended coroutine and the job.
struct Completion<T> {
    state: Mutex<CompletionState<T>>,
}

struct BlockingJob<F, T> {
    func: Option<F>,
    result: Option<thread::Result<T>>,
    completion: Arc<Completion<T>>,
}

impl<F, T> BlockerJob for BlockingJob<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    fn run(&mut self) {
        if let Some(func) = self.func.take() {
            self.result = Some(panic::catch_unwind(AssertUnwindSafe(func)));
        }
    }

    fn done(mut self: Box<Self>) {
        // Store first, wake second: the coroutine never resumes to an empty slot.
        let waker = {
            let mut state = self.completion.state.lock();
            state.result = self.result.take();
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

enum CallState<F, T> {
    Pending(F),
    Submitted(Arc<Completion<T>>),
    Finished,
}

/// Future returned by [`try_run_blocking`].
pub struct TryRunBlocking<F, T> {
    state: CallState<F, T>,
}

// Neither `F` nor the completion is ever pinned.
impl<F, T> Unpin for TryRunBlocking<F, T> {}

impl<F, T> Future for TryRunBlocking<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    type Output = Result<T, BlockingError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match std::mem::replace(&mut this.state, CallState::Finished) {
            CallState::Pending(func) => {
                let ctx = current::current()
                    .unwrap_or_else(|| panic!("run_blocking called outside of a pool thread"));

                if ctx.state() == ThreadState::ShuttingDown {
                    // Never submitted and never woken: the coroutine is
                    // abandoned when the thread stops.
                    debug!(thread = ctx.thread_id(), "Blocking call refused during shutdown");
                    this.state = CallState::Pending(func);
                    return Poll::Pending;
                }

                let completion = Arc::new(Completion {
                    state: Mutex::new(CompletionState {
                        result: None,
                        waker: Some(cx.waker().clone()),
                    }),
                });
                let job = Box::new(BlockingJob {
                    func: Some(func),
                    result: None,
                    completion: Arc::clone(&completion),
                });

                assert!(
                    ctx.pool().blockers().submit(job).is_ok(),
                    "run_blocking called while the blocker pool is not running"
                );
                ctx.blocking_started();
                this.state = CallState::Submitted(completion);
                Poll::Pending
            }
            CallState::Submitted(completion) => {
                let result = {
                    let mut state = completion.state.lock();
                    let result = state.result.take();
                    if result.is_none() {
                        state.waker = Some(cx.waker().clone());
                    }
                    result
                };

                match result {
                    Some(result) => {
                        if let Some(ctx) = current::current() {
                            ctx.blocking_finished();
                        }
                        Poll::Ready(result.map_err(BlockingError::Panicked))
                    }
                    None => {
                        this.state = CallState::Submitted(completion);
                        Poll::Pending
                    }
                }
            }
            CallState::Finished => panic!("blocking call polled after completion"),
        }
    }
}

impl<F, T> Drop for TryRunBlocking<F, T> {
    fn drop(&mut self) {
        // Abandoned while the job is still out; the job itself runs on.
        if let CallState::Submitted(_) = self.state {
            if let Some(ctx) = current::current() {
                ctx.blocking_finished();
            }
        }
    }
}

/// Run `func` on the blocker pool, suspending the calling coroutine until it
/// returns. A panic inside `func` is returned as [`BlockingError::Panicked`].
///
/// # Panics
///
/// The returned future panics on first poll when not polled on a pool
/// thread, or when the pool's blocker threads have already been stopped.
pub fn try_run_blocking<F, T>(func: F) -> TryRunBlocking<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    TryRunBlocking {
        state: CallState::Pending(func),
    }
}

/// Run `func` on the blocker pool and return its value.
///
/// A panic inside `func` is resumed in the calling coroutine once it wakes up.
pub async fn run_blocking<F, T>(func: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match try_run_blocking(func).await {
        Ok(value) => value,
        Err(err) => panic::resume_unwind(err.into_panic()),
    }
}
