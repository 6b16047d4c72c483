//! Execution substrate: event-loop threads, coroutines and the blocking bridge.
//!
//! Layout:
//! - `pool`: `ThreadPool` lifecycle, shutdown and interrupt registration
//! - `context`: one `ThreadContext` and event loop per pool thread
//! - `hub`: mailboxes and the pool-wide routing table
//! - `coro`: per-thread executor, `spawn`, `yield_now`, `sleep`
//! - `timer`: per-thread one-shot and periodic timers
//! - `blocker`: plain worker threads for blocking jobs
//! - `bridge`: `run_blocking`, from a coroutine to the blocker pool and back
//! - `signals`: SIGINT/SIGTERM listener and SIGSEGV crash report

mod blocker;
mod bridge;
mod context;
mod coro;
mod current;
mod hub;
mod interrupt;
mod pool;
mod signals;
mod timer;

pub use blocker::{BlockerJob, BlockerPool};
pub use bridge::{run_blocking, try_run_blocking, BlockingError, TryRunBlocking};
pub use context::{ThreadContext, ThreadState};
pub use coro::{sleep, spawn, yield_now, Sleep, YieldNow};
pub use current::{current_pool, current_thread_id, with_current_context};
pub use hub::{HubError, Message, ThreadMessage};
pub use pool::{
    PoolError, PoolHandle, PoolOptions, ThreadPool, DEFAULT_BLOCKER_THREADS, INITIAL_THREAD,
    MAX_THREADS,
};
pub use timer::{add_timer, cancel_timer, TimerToken};
