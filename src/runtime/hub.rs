//! Inter-thread message delivery.
//!
//! Every pool thread owns one [`Mailbox`], registered with its event loop
//! through a `mio::Waker`. The [`MessageHub`] is the pool-wide table of
//! mailboxes, indexed by thread id. Anything posted to a mailbox is handed to
//! the receiving thread on its next pump cycle, in the order it was posted.

use mio::{Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// A unit of work delivered to a pool thread.
///
/// `on_thread_switch` runs on the receiving thread, inside its pump cycle.
/// It must not block; spawn a coroutine and use the blocking bridge instead.
pub trait ThreadMessage: Send {
    fn on_thread_switch(self: Box<Self>);
}

impl<F> ThreadMessage for F
where
    F: FnOnce() + Send + 'static,
{
    fn on_thread_switch(self: Box<Self>) {
        (*self)()
    }
}

/// Boxed message as carried through the hub.
pub type Message = Box<dyn ThreadMessage>;

/// What a mailbox carries: application messages and coroutine wake-ups.
pub(crate) enum Envelope {
    Message(Message),
    /// Reschedule the task with this slab index on the receiving thread.
    Wake(usize),
}

/// Delivery errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// No such thread in this pool.
    UnknownThread(usize),
    /// The thread exists but its event queue is not up yet.
    NotReady(usize),
    /// The receiving thread has stopped; the message was dropped.
    Closed,
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::UnknownThread(id) => write!(f, "no pool thread with id {id}"),
            HubError::NotReady(id) => write!(f, "pool thread {id} is not ready to receive"),
            HubError::Closed => write!(f, "receiving thread has stopped"),
        }
    }
}

impl std::error::Error for HubError {}

struct Queue {
    items: VecDeque<Envelope>,
    closed: bool,
}

/// Receiving endpoint of one pool thread.
pub(crate) struct Mailbox {
    queue: Mutex<Queue>,
    waker: Waker,
}

impl Mailbox {
    /// Create a mailbox whose wake-ups show up as `token` on `registry`.
    pub fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Ok(Self {
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                closed: false,
            }),
            waker: Waker::new(registry, token)?,
        })
    }

    /// Append an envelope and wake the owning event loop.
    ///
    /// The loop is only woken on the empty -> non-empty transition; a
    /// non-empty queue already has a wake-up pending or is being drained.
    pub fn post(&self, envelope: Envelope) -> Result<(), HubError> {
        self.push(envelope).map_err(|_| HubError::Closed)
    }

    /// Like [`Mailbox::post`], but a closed mailbox hands the envelope back.
    fn push(&self, envelope: Envelope) -> Result<(), Envelope> {
        let was_empty = {
            let mut queue = self.queue.lock();
            if queue.closed {
                return Err(envelope);
            }
            let was_empty = queue.items.is_empty();
            queue.items.push_back(envelope);
            was_empty
        };

        if was_empty {
            if let Err(e) = self.waker.wake() {
                warn!(error = %e, "Failed to wake event loop");
            }
        }
        Ok(())
    }

    /// Take everything posted so far, oldest first.
    pub fn take_all(&self) -> VecDeque<Envelope> {
        std::mem::take(&mut self.queue.lock().items)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().items.is_empty()
    }

    /// Refuse further posts. Returns how many undelivered envelopes were dropped.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut queue = self.queue.lock();
            queue.closed = true;
            std::mem::take(&mut queue.items)
        };
        dropped.len()
    }
}

/// Pool-wide routing table from thread id to mailbox.
pub(crate) struct MessageHub {
    endpoints: Vec<OnceLock<Arc<Mailbox>>>,
}

impl MessageHub {
    pub(crate) fn new(n_threads: usize) -> Self {
        Self {
            endpoints: (0..n_threads).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Publish the mailbox of `thread_id`. Called once by the thread itself.
    pub(crate) fn attach(&self, thread_id: usize, mailbox: Arc<Mailbox>) {
        if let Some(slot) = self.endpoints.get(thread_id) {
            if slot.set(mailbox).is_err() {
                warn!(thread = thread_id, "Mailbox attached twice");
            }
        }
    }

    /// Deliver `message` to the pump cycle of `thread_id`.
    pub fn send(&self, thread_id: usize, message: Message) -> Result<(), HubError> {
        self.post(thread_id, Envelope::Message(message))
    }

    pub(crate) fn post(&self, thread_id: usize, envelope: Envelope) -> Result<(), HubError> {
        self.route(thread_id, envelope).map_err(|(err, _)| err)
    }

    /// Deliver `message`, handing it back with the error when it could not
    /// be queued.
    pub(crate) fn try_send(&self, thread_id: usize, message: Message) -> Result<(), (HubError, Message)> {
        self.route(thread_id, Envelope::Message(message))
            .map_err(|(err, envelope)| match envelope {
                Envelope::Message(message) => (err, message),
                Envelope::Wake(_) => unreachable!("routed a message, got a wake-up back"),
            })
    }

    fn route(&self, thread_id: usize, envelope: Envelope) -> Result<(), (HubError, Envelope)> {
        let Some(slot) = self.endpoints.get(thread_id) else {
            return Err((HubError::UnknownThread(thread_id), envelope));
        };
        let Some(mailbox) = slot.get() else {
            return Err((HubError::NotReady(thread_id), envelope));
        };
        mailbox
            .push(envelope)
            .map_err(|envelope| (HubError::Closed, envelope))
    }

    /// Number of thread slots, ready or not.
    pub fn n_threads(&self) -> usize {
        self.endpoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use parking_lot::Mutex;

    fn mailbox(poll: &Poll) -> Arc<Mailbox> {
        Arc::new(Mailbox::new(poll.registry(), Token(0)).unwrap())
    }

    fn run_all(mailbox: &Mailbox) {
        for envelope in mailbox.take_all() {
            if let Envelope::Message(message) = envelope {
                message.on_thread_switch();
            }
        }
    }

    #[test]
    fn test_delivery_is_fifo() {
        let poll = Poll::new().unwrap();
        let hub = MessageHub::new(1);
        hub.attach(0, mailbox(&poll));

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            hub.send(0, Box::new(move || seen.lock().push(i))).unwrap();
        }

        let slot = hub.endpoints[0].get().unwrap();
        run_all(slot);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert!(slot.is_empty());
    }

    #[test]
    fn test_post_wakes_poll() {
        let mut poll = Poll::new().unwrap();
        let mut events = mio::Events::with_capacity(4);
        let mailbox = mailbox(&poll);

        mailbox.post(Envelope::Wake(3)).unwrap();
        poll.poll(&mut events, Some(std::time::Duration::from_secs(5)))
            .unwrap();
        assert!(events.iter().any(|e| e.token() == Token(0)));
    }

    #[test]
    fn test_unknown_and_unready_threads() {
        let hub = MessageHub::new(2);
        let err = hub.send(7, Box::new(|| {})).unwrap_err();
        assert_eq!(err, HubError::UnknownThread(7));

        let err = hub.send(1, Box::new(|| {})).unwrap_err();
        assert_eq!(err, HubError::NotReady(1));
    }

    #[test]
    fn test_try_send_hands_message_back() {
        let hub = MessageHub::new(1);
        let hits = Arc::new(Mutex::new(0));

        let h = Arc::clone(&hits);
        let (err, message) = match hub.try_send(0, Box::new(move || *h.lock() += 1)) {
            Err(returned) => returned,
            Ok(()) => panic!("delivered to a thread with no mailbox"),
        };
        assert_eq!(err, HubError::NotReady(0));

        message.on_thread_switch();
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_closed_mailbox_rejects() {
        let poll = Poll::new().unwrap();
        let mailbox = mailbox(&poll);
        mailbox.post(Envelope::Wake(0)).unwrap();
        mailbox.post(Envelope::Wake(1)).unwrap();

        assert_eq!(mailbox.close(), 2);
        assert!(matches!(
            mailbox.post(Envelope::Wake(2)),
            Err(HubError::Closed)
        ));
    }
}
