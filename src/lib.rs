//! coropool: the execution substrate of a storage engine.
//!
//! A fixed pool of OS threads, each running its own event loop and
//! cooperative coroutine scheduler, plus a small pool of worker threads for
//! calls that cannot be made non-blocking.
//!
//! - [`ThreadPool`] starts the event-loop threads, delivers the initial
//!   message, routes SIGINT/SIGTERM to a registered interrupt message and
//!   runs until [`PoolHandle::shutdown`].
//! - [`spawn`] starts a coroutine on the current pool thread; coroutines talk
//!   to other threads by [`PoolHandle::send`]ing messages.
//! - [`run_blocking`] moves a blocking call onto a worker thread and
//!   suspends the calling coroutine until it returns.

pub mod config;
pub mod runtime;

pub use runtime::{
    current_pool, current_thread_id, run_blocking, sleep, spawn, try_run_blocking, yield_now,
    BlockingError, HubError, Message, PoolError, PoolHandle, PoolOptions, ThreadMessage,
    ThreadPool, MAX_THREADS,
};
