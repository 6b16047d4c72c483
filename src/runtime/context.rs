//! Per-thread execution context and its event loop.
//!
//! Each pool thread owns one [`ThreadContext`]: its mailbox on the message
//! hub, its coroutine executor, its timers and its local shutdown state. The
//! event loop (a `mio::Poll`) sleeps until one of two self-wake channels
//! fires or a timer is due, then hands control to [`ThreadContext::pump`].
//!
//! ## Wake channels
//!
//! - `HUB_TOKEN`: a `mio::Waker`, poked when the mailbox goes non-empty.
//! - `SHUTDOWN_TOKEN`: a pipe, written by [`LocalShutdown::initiate`].
//!
//! ## Lifecycle
//!
//! `Starting -> Running -> ShuttingDown -> Stopped`. The loop exits after the
//! first pump cycle following a shutdown request, or once the thread's last
//! in-flight blocking call has returned. While shutting down, messages are
//! dropped and new blocking calls are refused.

use super::coro::Executor;
use super::current;
use super::hub::{Envelope, Mailbox};
use super::pool::{fatal, PoolHandle};
use super::timer::{TimerHandler, TimerToken};
use mio::event::Event;
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const HUB_TOKEN: Token = Token(0);
const SHUTDOWN_TOKEN: Token = Token(1);

/// Coroutine polls per pump cycle before the loop checks for events again.
const PUMP_BUDGET: usize = 256;

const EVENTS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Shutdown flag of one pool thread, shareable with the pool.
pub(crate) struct LocalShutdown {
    requested: Mutex<bool>,
    notify: pipe::Sender,
}

impl LocalShutdown {
    /// Set the flag and wake the thread's event loop. Callable from any
    /// thread; only the first call writes to the pipe.
    pub fn initiate(&self) {
        let mut requested = self.requested.lock();
        if *requested {
            return;
        }
        *requested = true;

        match (&self.notify).write(&[1]) {
            Ok(_) => {}
            // A full pipe already holds a wake-up.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "Failed to notify pool thread of shutdown"),
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.lock()
    }
}

#[derive(Debug, Default)]
struct ThreadStats {
    messages: Cell<u64>,
    wakeups: Cell<u64>,
    polls: Cell<u64>,
    timers: Cell<u64>,
    blocking_calls: Cell<u64>,
}

fn bump(counter: &Cell<u64>, by: u64) {
    counter.set(counter.get() + by);
}

/// Everything one pool thread owns.
pub struct ThreadContext {
    thread_id: usize,
    pool: PoolHandle,
    mailbox: Arc<Mailbox>,
    shutdown: Arc<LocalShutdown>,
    shutdown_rx: RefCell<pipe::Receiver>,
    executor: Executor,
    timers: TimerHandler,
    state: Cell<ThreadState>,
    blocking_in_flight: Cell<usize>,
    stats: ThreadStats,
    stats_timer: Cell<Option<TimerToken>>,
}

impl ThreadContext {
    pub(crate) fn new(thread_id: usize, pool: PoolHandle, registry: &Registry) -> io::Result<Self> {
        let mailbox = Arc::new(Mailbox::new(registry, HUB_TOKEN)?);

        let (notify, mut shutdown_rx) = pipe::new()?;
        registry.register(&mut shutdown_rx, SHUTDOWN_TOKEN, Interest::READABLE)?;

        Ok(Self {
            thread_id,
            pool,
            executor: Executor::new(Arc::clone(&mailbox)),
            mailbox,
            shutdown: Arc::new(LocalShutdown {
                requested: Mutex::new(false),
                notify,
            }),
            shutdown_rx: RefCell::new(shutdown_rx),
            timers: TimerHandler::new(),
            state: Cell::new(ThreadState::Starting),
            blocking_in_flight: Cell::new(0),
            stats: ThreadStats::default(),
            stats_timer: Cell::new(None),
        })
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.executor
    }

    pub(crate) fn timers(&self) -> &TimerHandler {
        &self.timers
    }

    pub(crate) fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub(crate) fn local_shutdown(&self) -> &Arc<LocalShutdown> {
        &self.shutdown
    }

    pub(crate) fn blocking_started(&self) {
        self.blocking_in_flight.set(self.blocking_in_flight.get() + 1);
        bump(&self.stats.blocking_calls, 1);
    }

    pub(crate) fn blocking_finished(&self) {
        self.blocking_in_flight
            .set(self.blocking_in_flight.get().saturating_sub(1));
    }

    /// Number of bridged calls from this thread still running on the blocker pool.
    pub fn blocking_in_flight(&self) -> usize {
        self.blocking_in_flight.get()
    }

    /// Drain the mailbox, fire due timers and poll runnable coroutines.
    /// Never blocks.
    ///
    /// Once the thread is shutting down, messages are dropped unrun; task
    /// wake-ups are still delivered so in-flight blocking calls can land.
    pub fn pump(&self) {
        let mut dropped = 0;
        for envelope in self.mailbox.take_all() {
            match envelope {
                Envelope::Message(_) if self.state.get() == ThreadState::ShuttingDown => {
                    dropped += 1;
                }
                Envelope::Message(message) => {
                    bump(&self.stats.messages, 1);
                    message.on_thread_switch();
                }
                Envelope::Wake(task) => {
                    bump(&self.stats.wakeups, 1);
                    self.executor.schedule(task);
                }
            }
        }
        if dropped > 0 {
            debug!(thread = self.thread_id, dropped, "Messages dropped during shutdown");
        }

        let fired = self.timers.fire_due(Instant::now());
        bump(&self.stats.timers, fired as u64);

        let polled = self.executor.run_ready(PUMP_BUDGET);
        bump(&self.stats.polls, polled as u64);
    }

    /// True once shutdown was requested and no blocking call issued from
    /// this thread is still out on the blocker pool.
    ///
    /// Queued messages and runnable coroutines do not hold the thread: they
    /// are abandoned when the loop exits. New blocking calls are refused once
    /// the thread is shutting down, so the wait is bounded.
    pub fn should_shut_down(&self) -> bool {
        if !self.shutdown.is_requested() {
            return false;
        }
        if self.state.get() == ThreadState::Running {
            self.enter_shutting_down();
        }
        self.blocking_in_flight.get() == 0
    }

    /// Request this thread to stop. Callable from any thread through
    /// [`PoolHandle`]; on the thread itself it takes effect after the
    /// current pump cycle.
    pub fn initiate_shut_down(&self) {
        self.shutdown.initiate();
    }

    /// Readiness on one of the thread's own wake channels.
    pub fn on_event(&self, event: &Event) {
        match event.token() {
            HUB_TOKEN => trace!(thread = self.thread_id, "Mailbox wake-up"),
            SHUTDOWN_TOKEN => {
                self.drain_shutdown_pipe();
                if event.is_error() || event.is_read_closed() {
                    warn!(thread = self.thread_id, "Shutdown channel closed");
                }
                if self.shutdown.is_requested() && self.state.get() == ThreadState::Running {
                    self.enter_shutting_down();
                }
            }
            token => warn!(thread = self.thread_id, ?token, "Unexpected event"),
        }
    }

    /// How long the loop may sleep in `poll`.
    fn next_timeout(&self) -> Option<Duration> {
        if self.executor.has_ready() || !self.mailbox.is_empty() {
            return Some(Duration::ZERO);
        }
        self.timers.next_timeout(Instant::now())
    }

    fn enter_shutting_down(&self) {
        self.state.set(ThreadState::ShuttingDown);
        debug!(
            thread = self.thread_id,
            coroutines = self.executor.len(),
            blocking = self.blocking_in_flight.get(),
            "Pool thread shutting down"
        );
    }

    fn drain_shutdown_pipe(&self) {
        let mut buf = [0u8; 64];
        let mut rx = self.shutdown_rx.borrow_mut();
        loop {
            match rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(thread = self.thread_id, error = %e, "Shutdown pipe read failed");
                    break;
                }
            }
        }
    }

    fn start_stats_timer(&self, interval: Duration) {
        let token = self.timers.add(
            interval,
            Some(interval),
            Box::new(|| {
                current::with_current_context(ThreadContext::log_stats);
            }),
        );
        self.stats_timer.set(Some(token));
    }

    fn log_stats(&self) {
        debug!(
            thread = self.thread_id,
            messages = self.stats.messages.get(),
            wakeups = self.stats.wakeups.get(),
            polls = self.stats.polls.get(),
            timers = self.stats.timers.get(),
            blocking_calls = self.stats.blocking_calls.get(),
            coroutines = self.executor.len(),
            armed_timers = self.timers.len(),
            "Pool thread stats"
        );
    }

    fn finish(&self) {
        if let Some(token) = self.stats_timer.take() {
            self.timers.cancel(token);
        }
        let dropped = self.mailbox.close();
        self.state.set(ThreadState::Stopped);
        info!(
            thread = self.thread_id,
            messages = self.stats.messages.get(),
            polls = self.stats.polls.get(),
            blocking_calls = self.stats.blocking_calls.get(),
            abandoned_coroutines = self.executor.len(),
            dropped,
            "Pool thread stopped"
        );
    }
}

/// Body of every pool thread.
///
/// Builds the context, publishes it (thread-local registry, hub, pool),
/// waits until every sibling is ready, then runs the event loop.
pub(crate) fn thread_main(thread_id: usize, pool: PoolHandle, ready: Arc<Barrier>) {
    let mut poll = Poll::new().unwrap_or_else(|e| fatal("create event queue", &e));
    let ctx = ThreadContext::new(thread_id, pool.clone(), poll.registry())
        .unwrap_or_else(|e| fatal("create pool thread context", &e));
    let ctx = Rc::new(ctx);

    let guard = current::enter(Rc::clone(&ctx));
    pool.attach(thread_id, Arc::clone(ctx.mailbox()), Arc::clone(ctx.local_shutdown()));
    if let Some(interval) = pool.stats_interval() {
        ctx.start_stats_timer(interval);
    }

    ready.wait();
    ctx.state.set(ThreadState::Running);
    debug!(thread = thread_id, "Pool thread running");

    if let Err(e) = event_loop(&mut poll, &ctx) {
        fatal("poll event queue", &e);
    }

    ctx.finish();
    drop(guard);
}

fn event_loop(poll: &mut Poll, ctx: &ThreadContext) -> io::Result<()> {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    loop {
        ctx.pump();
        if ctx.should_shut_down() {
            return Ok(());
        }

        match poll.poll(&mut events, ctx.next_timeout()) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            ctx.on_event(event);
        }
    }
}
