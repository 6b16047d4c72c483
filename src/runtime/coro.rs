//! Cooperative coroutines for pool threads.
//!
//! A coroutine is a `!Send` future owned by the [`Executor`] of the pool
//! thread that spawned it. It runs only inside that thread's pump cycle and
//! gives up the thread only at an `.await` that returns `Pending`.
//!
//! Wakers never poll inline. Waking a task posts a wake envelope into the
//! owning thread's mailbox, so a task woken from a worker thread (or any
//! other thread) is always resumed by its own scheduler.

use super::current;
use super::hub::{Envelope, Mailbox};
use super::timer::{self, TimerToken};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};
use tracing::trace;

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

struct TaskWaker {
    mailbox: Arc<Mailbox>,
    task: usize,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.mailbox.post(Envelope::Wake(self.task)).is_err() {
            trace!(task = self.task, "Wake-up for stopped thread dropped");
        }
    }
}

struct Task {
    /// `None` while the task is being polled.
    future: Option<LocalFuture>,
    waker: Waker,
    queued: bool,
}

/// Single-threaded scheduler owned by one pool thread.
pub(crate) struct Executor {
    tasks: RefCell<Slab<Task>>,
    ready: RefCell<VecDeque<usize>>,
    mailbox: Arc<Mailbox>,
}

impl Executor {
    pub fn new(mailbox: Arc<Mailbox>) -> Self {
        Self {
            tasks: RefCell::new(Slab::new()),
            ready: RefCell::new(VecDeque::new()),
            mailbox,
        }
    }

    pub fn spawn<F>(&self, future: F) -> usize
    where
        F: Future<Output = ()> + 'static,
    {
        let mut tasks = self.tasks.borrow_mut();
        let entry = tasks.vacant_entry();
        let id = entry.key();
        let waker = Waker::from(Arc::new(TaskWaker {
            mailbox: Arc::clone(&self.mailbox),
            task: id,
        }));
        entry.insert(Task {
            future: Some(Box::pin(future)),
            waker,
            queued: true,
        });
        self.ready.borrow_mut().push_back(id);
        id
    }

    /// Make task `id` runnable. Unknown ids (tasks that already finished)
    /// are ignored.
    pub fn schedule(&self, id: usize) {
        let mut tasks = self.tasks.borrow_mut();
        if let Some(task) = tasks.get_mut(id) {
            if !task.queued {
                task.queued = true;
                self.ready.borrow_mut().push_back(id);
            }
        }
    }

    /// Poll up to `budget` runnable tasks. Returns the number polled.
    pub fn run_ready(&self, budget: usize) -> usize {
        let mut polled = 0;
        while polled < budget {
            let Some(id) = self.ready.borrow_mut().pop_front() else {
                break;
            };

            let taken = {
                let mut tasks = self.tasks.borrow_mut();
                tasks.get_mut(id).and_then(|task| {
                    task.queued = false;
                    task.future.take().map(|f| (f, task.waker.clone()))
                })
            };
            let Some((mut future, waker)) = taken else {
                continue;
            };

            polled += 1;
            let mut cx = Context::from_waker(&waker);
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    self.tasks.borrow_mut().remove(id);
                }
                Poll::Pending => {
                    if let Some(task) = self.tasks.borrow_mut().get_mut(id) {
                        task.future = Some(future);
                    }
                }
            }
        }
        polled
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.borrow().is_empty()
    }

    /// Number of live coroutines, suspended or runnable.
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }
}

/// Start a coroutine on the current pool thread.
///
/// # Panics
///
/// Panics when called outside of a pool thread.
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    let ctx = current::current().unwrap_or_else(|| panic!("spawn called outside of a pool thread"));
    ctx.executor().spawn(future);
}

/// Let the other runnable coroutines on this thread go first.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Suspend the current coroutine for `duration`.
///
/// Backed by the pool thread's timer handler; must be awaited on a pool
/// thread.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: timer::deadline_after(Instant::now(), duration),
        timer: None,
        shared: Rc::new(SleepShared::default()),
    }
}

#[derive(Default)]
struct SleepShared {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

pub struct Sleep {
    deadline: Instant,
    timer: Option<TimerToken>,
    shared: Rc<SleepShared>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.shared.fired.get() || Instant::now() >= self.deadline {
            return Poll::Ready(());
        }
        *self.shared.waker.borrow_mut() = Some(cx.waker().clone());

        if self.timer.is_none() {
            let shared = Rc::clone(&self.shared);
            let after = self.deadline.saturating_duration_since(Instant::now());
            let ctx = current::current()
                .unwrap_or_else(|| panic!("sleep awaited outside of a pool thread"));
            let token = ctx.timers().add(
                after,
                None,
                Box::new(move || {
                    shared.fired.set(true);
                    if let Some(waker) = shared.waker.borrow_mut().take() {
                        waker.wake();
                    }
                }),
            );
            self.timer = Some(token);
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(token) = self.timer.take() {
            if !self.shared.fired.get() {
                if let Some(ctx) = current::current() {
                    ctx.timers().cancel(token);
                }
            }
        }
    }
}
