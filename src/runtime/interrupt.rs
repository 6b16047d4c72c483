//! Single-slot mailbox for the interrupt message.
//!
//! The slot is an atomic pointer: registering swaps a new message in,
//! delivery swaps null in. Neither side takes a lock, so the listener that
//! reacts to SIGINT/SIGTERM can consume it without contending with the
//! thread that registered it.

use super::hub::Message;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Pending {
    /// Thread the message is delivered to.
    thread_id: usize,
    message: Message,
}

pub(crate) struct InterruptSlot {
    pending: AtomicPtr<Pending>,
}

impl InterruptSlot {
    pub const fn new() -> Self {
        Self {
            pending: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Install `message` for delivery to `thread_id`, returning whatever was
    /// registered before. `None` clears the slot.
    pub fn replace(&self, thread_id: usize, message: Option<Message>) -> Option<Message> {
        let new = match message {
            Some(message) => Box::into_raw(Box::new(Pending { thread_id, message })),
            None => ptr::null_mut(),
        };
        let old = self.pending.swap(new, Ordering::AcqRel);
        // SAFETY: every non-null pointer in the slot came from Box::into_raw
        // and the swap hands ownership to exactly one caller.
        unsafe { reclaim(old) }.map(|pending| pending.message)
    }

    /// Take the pending message, leaving the slot empty.
    pub fn take(&self) -> Option<(usize, Message)> {
        let old = self.pending.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: see `replace`.
        unsafe { reclaim(old) }.map(|pending| (pending.thread_id, pending.message))
    }

    /// Put `message` back unless a new one was registered meanwhile.
    /// Returns the message when the slot was taken.
    pub fn restore(&self, thread_id: usize, message: Message) -> Option<Message> {
        let new = Box::into_raw(Box::new(Pending { thread_id, message }));
        match self
            .pending
            .compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => None,
            // SAFETY: `new` was never published.
            Err(_) => unsafe { reclaim(new) }.map(|pending| pending.message),
        }
    }

    pub fn is_set(&self) -> bool {
        !self.pending.load(Ordering::Acquire).is_null()
    }
}

impl Drop for InterruptSlot {
    fn drop(&mut self) {
        drop(self.take());
    }
}

unsafe fn reclaim(ptr: *mut Pending) -> Option<Box<Pending>> {
    if ptr.is_null() {
        None
    } else {
        Some(Box::from_raw(ptr))
    }
}
