//! Thread-scoped registry of the running pool thread.
//!
//! A pool thread enters its context once, before its event loop starts, and
//! leaves it when the loop has stopped. Pool handle, thread id and context
//! are all reached through the one registered [`ThreadContext`], so they are
//! always set and cleared together. Threads that never enter (worker
//! threads, the thread calling `run`) see `None` everywhere.

use super::context::ThreadContext;
use super::pool::PoolHandle;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

thread_local! {
    static CURRENT: RefCell<Option<Rc<ThreadContext>>> = const { RefCell::new(None) };
}

/// Clears the registration when dropped.
pub(crate) struct EnterGuard {
    _not_send: PhantomData<Rc<()>>,
}

/// Register `ctx` as the context of the calling thread.
///
/// # Panics
///
/// Panics if the thread already has a context.
pub(crate) fn enter(ctx: Rc<ThreadContext>) -> EnterGuard {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        assert!(current.is_none(), "pool thread entered twice");
        *current = Some(ctx);
    });
    EnterGuard {
        _not_send: PhantomData,
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        // Dropped outside the borrow: the context's destructor drops
        // coroutines, which may look themselves up here.
        let ctx = CURRENT.with(|current| current.borrow_mut().take());
        drop(ctx);
    }
}

pub(crate) fn current() -> Option<Rc<ThreadContext>> {
    CURRENT
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

/// Id of the pool thread we are on.
pub fn current_thread_id() -> Option<usize> {
    current().map(|ctx| ctx.thread_id())
}

/// Handle to the pool that started the thread we are on.
pub fn current_pool() -> Option<PoolHandle> {
    current().map(|ctx| ctx.pool().clone())
}

/// Run `f` with the context of the pool thread we are on.
pub fn with_current_context<R>(f: impl FnOnce(&ThreadContext) -> R) -> Option<R> {
    current().map(|ctx| f(&ctx))
}
