//! Thread pool lifecycle.
//!
//! [`ThreadPool::run`] is the whole life of the pool: install signal
//! handling, spawn one OS thread per event loop, deliver the initial message
//! once every loop can receive it, block until [`PoolHandle::shutdown`], then
//! stop every thread and the blocker pool.

use super::blocker::BlockerPool;
use super::context::{thread_main, LocalShutdown};
use super::current;
use super::hub::{HubError, Mailbox, Message, MessageHub};
use super::interrupt::InterruptSlot;
use super::signals::SignalGuard;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io;
use std::sync::{Arc, Barrier, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on pool threads.
pub const MAX_THREADS: usize = 128;

/// Worker threads reserved for blocking calls.
pub const DEFAULT_BLOCKER_THREADS: usize = 2;

/// Thread that receives the initial message, and interrupts registered from
/// outside the pool.
pub const INITIAL_THREAD: usize = 0;

/// Log and abort. Used for environment failures the pool cannot run without.
pub(crate) fn fatal(what: &str, err: &dyn fmt::Display) -> ! {
    error!(error = %err, "Fatal: failed to {what}");
    std::process::abort()
}

/// Pool construction settings.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub n_threads: usize,
    pub blocker_threads: usize,
    /// Period of the per-thread stats log, `None` to disable.
    pub stats_interval: Option<Duration>,
    /// Route SIGINT/SIGTERM to the interrupt message and install the
    /// SIGSEGV crash handler while `run` is active.
    pub handle_signals: bool,
}

impl PoolOptions {
    pub fn new(n_threads: usize) -> Self {
        Self {
            n_threads,
            blocker_threads: DEFAULT_BLOCKER_THREADS,
            stats_interval: None,
            handle_signals: true,
        }
    }
}

/// Pool construction errors.
#[derive(Debug)]
pub enum PoolError {
    ThreadCount(usize),
    BlockerThreads(usize),
    BlockerSpawn(io::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::ThreadCount(n) => {
                write!(f, "thread count {n} is outside 1..={MAX_THREADS}")
            }
            PoolError::BlockerThreads(n) => write!(f, "blocker thread count {n} must be at least 1"),
            PoolError::BlockerSpawn(e) => write!(f, "failed to start blocker threads: {e}"),
        }
    }
}

impl std::error::Error for PoolError {}

pub(crate) struct PoolShared {
    hub: MessageHub,
    locals: Vec<OnceLock<Arc<LocalShutdown>>>,
    blockers: BlockerPool,
    interrupt: InterruptSlot,
    shutdown_requested: Mutex<bool>,
    shutdown_cond: Condvar,
    stats_interval: Option<Duration>,
}

/// Cloneable, thread-safe handle to a pool.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("n_threads", &self.n_threads())
            .finish_non_exhaustive()
    }
}

impl PoolHandle {
    pub fn n_threads(&self) -> usize {
        self.shared.hub.n_threads()
    }

    /// Deliver `message` to `thread_id`'s next pump cycle.
    pub fn send(&self, thread_id: usize, message: Message) -> Result<(), HubError> {
        self.shared.hub.send(thread_id, message)
    }

    /// Wake the thread blocked in [`ThreadPool::run`]. Any thread may call
    /// this, any number of times; only the first call has an effect.
    pub fn shutdown(&self) {
        let mut requested = self.shared.shutdown_requested.lock();
        if *requested {
            return;
        }
        *requested = true;
        self.shared.shutdown_cond.notify_one();
        info!("Thread pool shutdown requested");
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shared.shutdown_requested.lock()
    }

    /// Register the message delivered on the next SIGINT/SIGTERM and return
    /// the one it replaces.
    ///
    /// Delivery consumes the registration: a second signal before the next
    /// call finds nothing to deliver and is dropped. When called on a pool
    /// thread of this pool the message goes to that thread, otherwise to
    /// [`INITIAL_THREAD`].
    pub fn set_interrupt_message(&self, message: Option<Message>) -> Option<Message> {
        let thread_id = current::with_current_context(|ctx| {
            ctx.pool().same_pool(self).then(|| ctx.thread_id())
        })
        .flatten()
        .unwrap_or(INITIAL_THREAD);
        self.shared.interrupt.replace(thread_id, message)
    }

    /// Whether an interrupt message is registered and not yet delivered.
    pub fn interrupt_pending(&self) -> bool {
        self.shared.interrupt.is_set()
    }

    /// Consume the interrupt registration and post it through the hub.
    ///
    /// A target thread that is not up yet gets the registration back, so a
    /// signal during startup does not lose the message.
    pub(crate) fn deliver_interrupt(&self) {
        let Some((thread_id, message)) = self.shared.interrupt.take() else {
            debug!("Interrupt received with no message registered; dropped");
            return;
        };
        match self.shared.hub.try_send(thread_id, message) {
            Ok(()) => {}
            Err((HubError::NotReady(_), message)) => {
                if self.shared.interrupt.restore(thread_id, message).is_some() {
                    debug!(thread = thread_id, "Interrupt superseded while thread was starting");
                } else {
                    warn!(thread = thread_id, "Interrupt arrived before thread was ready; kept registered");
                }
            }
            Err((e, _)) => {
                warn!(thread = thread_id, error = %e, "Interrupt message not delivered");
            }
        }
    }

    pub(crate) fn blockers(&self) -> &BlockerPool {
        &self.shared.blockers
    }

    pub(crate) fn stats_interval(&self) -> Option<Duration> {
        self.shared.stats_interval
    }

    pub(crate) fn attach(
        &self,
        thread_id: usize,
        mailbox: Arc<Mailbox>,
        shutdown: Arc<LocalShutdown>,
    ) {
        self.shared.hub.attach(thread_id, mailbox);
        if let Some(slot) = self.shared.locals.get(thread_id) {
            if slot.set(shutdown).is_err() {
                warn!(thread = thread_id, "Shutdown handle attached twice");
            }
        }
    }

    fn same_pool(&self, other: &PoolHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn wait_for_shutdown(&self) {
        let mut requested = self.shared.shutdown_requested.lock();
        while !*requested {
            self.shared.shutdown_cond.wait(&mut requested);
        }
    }

    fn initiate_local_shutdowns(&self) {
        for local in self.shared.locals.iter().filter_map(OnceLock::get) {
            local.initiate();
        }
    }
}

/// A fixed set of event-loop threads plus the blocker pool.
pub struct ThreadPool {
    handle: PoolHandle,
    handle_signals: bool,
}

impl ThreadPool {
    /// Pool with `n_threads` event-loop threads and default options.
    pub fn new(n_threads: usize) -> Result<Self, PoolError> {
        Self::with_options(PoolOptions::new(n_threads))
    }

    /// Validate `options` and start the blocker pool. Event-loop threads are
    /// only started by [`ThreadPool::run`].
    pub fn with_options(options: PoolOptions) -> Result<Self, PoolError> {
        if options.n_threads == 0 || options.n_threads > MAX_THREADS {
            return Err(PoolError::ThreadCount(options.n_threads));
        }
        if options.blocker_threads == 0 {
            return Err(PoolError::BlockerThreads(0));
        }

        let blockers = BlockerPool::new(options.blocker_threads).map_err(PoolError::BlockerSpawn)?;
        let shared = PoolShared {
            hub: MessageHub::new(options.n_threads),
            locals: (0..options.n_threads).map(|_| OnceLock::new()).collect(),
            blockers,
            interrupt: InterruptSlot::new(),
            shutdown_requested: Mutex::new(false),
            shutdown_cond: Condvar::new(),
            stats_interval: options.stats_interval.filter(|i| !i.is_zero()),
        };

        Ok(Self {
            handle: PoolHandle {
                shared: Arc::new(shared),
            },
            handle_signals: options.handle_signals,
        })
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn n_threads(&self) -> usize {
        self.handle.n_threads()
    }

    /// Register the interrupt message before the pool runs.
    pub fn set_interrupt_message(&self, message: Option<Message>) -> Option<Message> {
        self.handle.set_interrupt_message(message)
    }

    /// Run the pool until [`PoolHandle::shutdown`] is called.
    ///
    /// `initial_message` goes to [`INITIAL_THREAD`] once every event loop is
    /// ready to receive. Failing to install signal handling or to spawn a
    /// thread aborts the process.
    pub fn run(self, initial_message: Message) {
        let n_threads = self.n_threads();
        info!(threads = n_threads, blockers = self.handle.blockers().size(), "Starting thread pool");

        let signals = self.handle_signals.then(|| {
            SignalGuard::install(self.handle()).unwrap_or_else(|e| fatal("install signal handlers", &e))
        });

        let ready = Arc::new(Barrier::new(n_threads + 1));
        let mut threads = Vec::with_capacity(n_threads);
        for thread_id in 0..n_threads {
            let handle = self.handle();
            let ready = Arc::clone(&ready);
            let spawned = thread::Builder::new()
                .name(format!("pool-{thread_id}"))
                .spawn(move || thread_main(thread_id, handle, ready));
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(e) => fatal("spawn pool thread", &e),
            }
        }

        ready.wait();
        debug!(threads = n_threads, "All event queues ready");
        if let Err(e) = self.handle.send(INITIAL_THREAD, initial_message) {
            error!(error = %e, "Initial message not delivered");
        }

        self.handle.wait_for_shutdown();
        self.handle.initiate_local_shutdowns();

        for (thread_id, thread) in threads.into_iter().enumerate() {
            if thread.join().is_err() {
                error!(thread = thread_id, "Pool thread panicked");
            }
        }

        drop(signals);
        self.handle.blockers().shutdown();
        info!("Thread pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        add_timer, cancel_timer, current_pool, current_thread_id, run_blocking, sleep, spawn,
        try_run_blocking, yield_now,
    };
    use std::collections::HashSet;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quiet_pool(n_threads: usize) -> ThreadPool {
        let mut options = PoolOptions::new(n_threads);
        options.handle_signals = false;
        ThreadPool::with_options(options).unwrap()
    }

    fn shutdown_now() -> Message {
        Box::new(|| current_pool().unwrap().shutdown())
    }

    /// Run `pool` on a helper thread, request shutdown after `delay` and
    /// report whether `run` returned within a few seconds.
    fn stops_after_shutdown(pool: ThreadPool, initial_message: Message, delay: Duration) -> bool {
        let handle = pool.handle();
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let runner = thread::spawn(move || {
            pool.run(initial_message);
            let _ = done_tx.send(());
        });

        thread::sleep(delay);
        handle.shutdown();
        let stopped = done_rx.recv_timeout(Duration::from_secs(3)).is_ok();
        if stopped {
            runner.join().unwrap();
        }
        stopped
    }

    #[test]
    fn test_thread_count_validation() {
        assert!(matches!(ThreadPool::new(0), Err(PoolError::ThreadCount(0))));
        assert!(matches!(
            ThreadPool::new(MAX_THREADS + 1),
            Err(PoolError::ThreadCount(_))
        ));

        let mut options = PoolOptions::new(1);
        options.blocker_threads = 0;
        assert!(matches!(
            ThreadPool::with_options(options),
            Err(PoolError::BlockerThreads(0))
        ));
    }

    #[test]
    fn test_start_and_immediate_shutdown() {
        for n in [1, 2, 4, 8] {
            let pool = quiet_pool(n);
            assert_eq!(pool.n_threads(), n);
            pool.run(shutdown_now());
        }
    }

    #[test]
    fn test_shutdown_before_run() {
        let pool = quiet_pool(2);
        pool.handle().shutdown();
        pool.handle().shutdown();
        pool.run(Box::new(|| {}));
    }

    #[test]
    fn test_initial_message_after_all_threads_ready() {
        let pool = quiet_pool(4);
        let handle = pool.handle();
        let observed = Arc::new(Mutex::new(None));

        let o = Arc::clone(&observed);
        pool.run(Box::new(move || {
            // Every mailbox accepts a message only once its loop is up.
            let pool = current_pool().unwrap();
            let all_ready = (0..pool.n_threads()).all(|id| pool.send(id, Box::new(|| {})).is_ok());
            *o.lock() = Some((current_thread_id(), all_ready));
            pool.shutdown();
        }));

        assert_eq!(*observed.lock(), Some((Some(INITIAL_THREAD), true)));
        assert!(handle.is_shutting_down());
    }

    #[test]
    fn test_concurrent_shutdown_returns_once() {
        let pool = quiet_pool(3);
        let handle = pool.handle();
        let callers: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || handle.shutdown())
            })
            .collect();

        pool.run(Box::new(|| {}));
        for caller in callers {
            caller.join().unwrap();
        }
        assert!(handle.is_shutting_down());
    }

    #[test]
    fn test_ping_fifo_between_two_threads() {
        let pool = quiet_pool(2);
        let received = Arc::new(Mutex::new(Vec::new()));

        let r = Arc::clone(&received);
        pool.run(Box::new(move || {
            let pool = current_pool().unwrap();
            for word in ["ping", "one", "two", "three"] {
                let r = Arc::clone(&r);
                pool.send(
                    1,
                    Box::new(move || {
                        let mut seen = r.lock();
                        seen.push(word);
                        if seen.len() == 4 {
                            current_pool().unwrap().shutdown();
                        }
                    }),
                )
                .unwrap();
            }
        }));

        assert_eq!(*received.lock(), vec!["ping", "one", "two", "three"]);
    }

    #[test]
    fn test_send_to_unknown_thread() {
        let pool = quiet_pool(1);
        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        pool.run(Box::new(move || {
            let pool = current_pool().unwrap();
            *r.lock() = Some(pool.send(5, Box::new(|| {})));
            pool.shutdown();
        }));
        assert_eq!(*result.lock(), Some(Err(HubError::UnknownThread(5))));
    }

    #[test]
    fn test_run_blocking_returns_value_on_same_thread() {
        let pool = quiet_pool(2);
        let outcome = Arc::new(Mutex::new(None));

        let o = Arc::clone(&outcome);
        pool.run(Box::new(move || {
            spawn(async move {
                let before = thread::current().id();
                let worker = run_blocking(|| thread::current().id()).await;
                let value = run_blocking(|| 6 * 7).await;
                let after = thread::current().id();
                *o.lock() = Some((value, before == after, worker != before));
                current_pool().unwrap().shutdown();
            });
        }));

        assert_eq!(*outcome.lock(), Some((42, true, true)));
    }

    #[test]
    fn test_many_blocking_calls_on_one_thread() {
        const CALLS: usize = 16;
        let pool = quiet_pool(1);
        let results = Arc::new(Mutex::new(Vec::new()));

        let r = Arc::clone(&results);
        pool.run(Box::new(move || {
            let finished = std::rc::Rc::new(std::cell::Cell::new(0));
            for i in 0..CALLS {
                let r = Arc::clone(&r);
                let finished = std::rc::Rc::clone(&finished);
                spawn(async move {
                    let value = run_blocking(move || {
                        thread::sleep(Duration::from_millis(5));
                        i * 10
                    })
                    .await;
                    r.lock().push((i, value));
                    finished.set(finished.get() + 1);
                    if finished.get() == CALLS {
                        current_pool().unwrap().shutdown();
                    }
                });
            }
        }));

        let results = results.lock();
        assert_eq!(results.len(), CALLS);
        let ids: HashSet<usize> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(ids.len(), CALLS);
        assert!(results.iter().all(|(i, v)| *v == i * 10));
    }

    #[test]
    fn test_host_thread_stays_live_while_blocked() {
        let pool = quiet_pool(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        pool.run(Box::new(move || {
            let (tx, rx) = crossbeam::channel::bounded::<u32>(1);

            let o1 = Arc::clone(&o);
            spawn(async move {
                // Only returns once the sibling coroutine below has run.
                let value = run_blocking(move || rx.recv().unwrap()).await;
                o1.lock().push(format!("blocked got {value}"));
                current_pool().unwrap().shutdown();
            });

            let o2 = Arc::clone(&o);
            spawn(async move {
                yield_now().await;
                o2.lock().push("sibling ran".to_string());
                tx.send(9).unwrap();
            });
        }));

        assert_eq!(*order.lock(), vec!["sibling ran", "blocked got 9"]);
    }

    #[test]
    fn test_sleep_and_periodic_timer() {
        let pool = quiet_pool(1);
        let ticks = Arc::new(AtomicUsize::new(0));
        let slept = Arc::new(Mutex::new(None));

        let t = Arc::clone(&ticks);
        let s = Arc::clone(&slept);
        pool.run(Box::new(move || {
            let token = add_timer(Duration::from_millis(1), Some(Duration::from_millis(2)), move || {
                t.fetch_add(1, Ordering::SeqCst);
            });
            spawn(async move {
                let start = std::time::Instant::now();
                sleep(Duration::from_millis(30)).await;
                *s.lock() = Some(start.elapsed());
                assert!(cancel_timer(token));
                current_pool().unwrap().shutdown();
            });
        }));

        assert!(slept.lock().unwrap() >= Duration::from_millis(30));
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_blocking_panic_reaches_call_site() {
        let pool = quiet_pool(1);
        let message = Arc::new(Mutex::new(None));

        let m = Arc::clone(&message);
        pool.run(Box::new(move || {
            spawn(async move {
                let err = try_run_blocking(|| -> u8 { panic!("bad sector") })
                    .await
                    .unwrap_err();
                *m.lock() = err.message().map(str::to_string);
                current_pool().unwrap().shutdown();
            });
        }));

        assert_eq!(message.lock().as_deref(), Some("bad sector"));
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_blocking_call() {
        let pool = quiet_pool(1);
        let completed = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&completed);
        pool.run(Box::new(move || {
            spawn(async move {
                current_pool().unwrap().shutdown();
                run_blocking(|| thread::sleep(Duration::from_millis(50))).await;
                c.fetch_add(1, Ordering::SeqCst);
            });
        }));

        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_stops_yielding_loop() {
        let pool = quiet_pool(1);
        let spun = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&spun);
        let stopped = stops_after_shutdown(
            pool,
            Box::new(move || {
                spawn(async move {
                    loop {
                        s.fetch_add(1, Ordering::Relaxed);
                        yield_now().await;
                    }
                });
            }),
            Duration::from_millis(50),
        );

        assert!(stopped);
        assert!(spun.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_shutdown_stops_self_sending_message() {
        fn resend(hits: Arc<AtomicUsize>) {
            hits.fetch_add(1, Ordering::Relaxed);
            let pool = current_pool().unwrap();
            let again = Arc::clone(&hits);
            let _ = pool.send(INITIAL_THREAD, Box::new(move || resend(again)));
        }

        let pool = quiet_pool(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let stopped = stops_after_shutdown(
            pool,
            Box::new(move || resend(h)),
            Duration::from_millis(50),
        );

        assert!(stopped);
        assert!(hits.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_shutdown_stops_repeated_blocking_calls() {
        let pool = quiet_pool(2);
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let stopped = stops_after_shutdown(
            pool,
            Box::new(move || {
                spawn(async move {
                    loop {
                        run_blocking(|| thread::sleep(Duration::from_millis(2))).await;
                        c.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }),
            Duration::from_millis(50),
        );

        assert!(stopped);
        assert!(calls.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_messages_dropped_once_shutting_down() {
        let pool = quiet_pool(1);
        let late = Arc::new(AtomicUsize::new(0));
        let sent = Arc::new(AtomicUsize::new(0));

        let l = Arc::clone(&late);
        let s = Arc::clone(&sent);
        pool.run(Box::new(move || {
            spawn(async {
                current_pool().unwrap().shutdown();
                // Keeps the thread in its shutting-down phase.
                run_blocking(|| thread::sleep(Duration::from_millis(300))).await;
            });
            spawn(async move {
                sleep(Duration::from_millis(50)).await;
                let accepted = current_pool()
                    .unwrap()
                    .send(INITIAL_THREAD, Box::new(move || {
                        l.fetch_add(1, Ordering::SeqCst);
                    }))
                    .is_ok();
                if accepted {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            });
        }));

        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_blocking_after_blockers_stopped_panics() {
        struct NoopWaker;

        impl std::task::Wake for NoopWaker {
            fn wake(self: Arc<Self>) {}
        }

        let pool = quiet_pool(1);
        let message = Arc::new(Mutex::new(None));

        let m = Arc::clone(&message);
        pool.run(Box::new(move || {
            let pool = current_pool().unwrap();
            pool.blockers().shutdown();

            let waker = std::task::Waker::from(Arc::new(NoopWaker));
            let mut cx = std::task::Context::from_waker(&waker);
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut call = try_run_blocking(|| 1u8);
                let _ = std::pin::Pin::new(&mut call).poll(&mut cx);
            }));
            *m.lock() = caught.err().and_then(|payload| {
                payload
                    .downcast_ref::<&'static str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
            });
            pool.shutdown();
        }));

        assert_eq!(
            message.lock().as_deref(),
            Some("run_blocking called while the blocker pool is not running")
        );
    }

    #[test]
    fn test_interrupt_before_threads_ready_is_kept() {
        let pool = quiet_pool(1);
        let handle = pool.handle();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        pool.set_interrupt_message(Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            current_pool().unwrap().shutdown();
        })));

        // No mailbox is attached yet: delivery must not lose the message.
        handle.deliver_interrupt();
        assert!(handle.interrupt_pending());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let h2 = handle.clone();
        pool.run(Box::new(move || h2.deliver_interrupt()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_two_interrupts_deliver_once() {
        let pool = quiet_pool(2);
        let handle = pool.handle();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        pool.run(Box::new(move || {
            let pool = current_pool().unwrap();
            let h = Arc::clone(&h);
            let previous = pool.set_interrupt_message(Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })));
            assert!(previous.is_none());

            pool.deliver_interrupt();
            pool.deliver_interrupt();
            // Queued behind the interrupt on this thread's mailbox.
            let pool2 = pool.clone();
            pool.send(INITIAL_THREAD, Box::new(move || pool2.shutdown()))
                .unwrap();
        }));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!handle.interrupt_pending());
    }

    #[test]
    fn test_interrupt_goes_to_registering_thread() {
        let pool = quiet_pool(3);
        let seen_on = Arc::new(Mutex::new(None));

        let s = Arc::clone(&seen_on);
        pool.run(Box::new(move || {
            let pool = current_pool().unwrap();
            pool.send(
                2,
                Box::new(move || {
                    let pool = current_pool().unwrap();
                    pool.set_interrupt_message(Some(Box::new(move || {
                        *s.lock() = current_thread_id();
                        current_pool().unwrap().shutdown();
                    })));
                    pool.deliver_interrupt();
                }),
            )
            .unwrap();
        }));

        assert_eq!(*seen_on.lock(), Some(2));
    }

    #[test]
    fn test_sigint_delivers_interrupt_message() {
        let _serial = crate::runtime::signals::SIGNAL_TESTS.lock();
        let pool = ThreadPool::new(1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        pool.set_interrupt_message(Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            current_pool().unwrap().shutdown();
        })));
        pool.run(Box::new(|| {
            signal_hook::low_level::raise(signal_hook::consts::SIGINT).unwrap();
        }));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
