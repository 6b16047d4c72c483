//! Per-thread timers.
//!
//! Timers live on one pool thread and fire from its pump cycle. The event
//! loop uses [`TimerHandler::next_timeout`] as its poll timeout, so a thread
//! with nothing else to do sleeps until the earliest deadline.

use super::current;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Shortest accepted period for a repeating timer.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Farthest deadline handed out; longer delays are clamped to it.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `from + after`, clamped instead of overflowing.
pub(crate) fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after.min(FAR_FUTURE))
        .or_else(|| from.checked_add(Duration::from_secs(24 * 60 * 60)))
        .unwrap_or(from)
}

/// Identifies a registered timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct Timer {
    interval: Option<Duration>,
    callback: Box<dyn FnMut()>,
}

#[derive(Default)]
struct TimerState {
    next_id: u64,
    queue: BTreeMap<(Instant, u64), Timer>,
    /// Deadline of every live timer, including one whose callback is running.
    index: HashMap<u64, Instant>,
}

#[derive(Default)]
pub(crate) struct TimerHandler {
    state: RefCell<TimerState>,
}

impl TimerHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` to run after `after`, then every `interval` if given.
    pub fn add(
        &self,
        after: Duration,
        interval: Option<Duration>,
        callback: Box<dyn FnMut()>,
    ) -> TimerToken {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;

        let deadline = deadline_after(Instant::now(), after);
        let interval = interval.map(|i| i.max(MIN_INTERVAL));
        state.queue.insert((deadline, id), Timer { interval, callback });
        state.index.insert(id, deadline);
        TimerToken(id)
    }

    /// Cancel a timer. Returns false if it already fired (one-shot) or was
    /// cancelled before. Safe to call from inside the timer's own callback.
    pub fn cancel(&self, token: TimerToken) -> bool {
        let mut state = self.state.borrow_mut();
        match state.index.remove(&token.0) {
            Some(deadline) => {
                state.queue.remove(&(deadline, token.0));
                true
            }
            None => false,
        }
    }

    /// Run every callback whose deadline is at or before `now`.
    ///
    /// No borrow is held while a callback runs, so callbacks may add or
    /// cancel timers. Returns the number of callbacks run.
    pub fn fire_due(&self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            let due = {
                let mut state = self.state.borrow_mut();
                match state.queue.first_key_value() {
                    Some((&(deadline, _), _)) if deadline <= now => state.queue.pop_first(),
                    _ => None,
                }
            };
            let Some(((deadline, id), mut timer)) = due else {
                break;
            };

            (timer.callback)();
            fired += 1;

            let mut state = self.state.borrow_mut();
            match timer.interval {
                Some(interval) if state.index.contains_key(&id) => {
                    let next = deadline_after(deadline, interval).max(deadline_after(now, MIN_INTERVAL));
                    state.index.insert(id, next);
                    state.queue.insert((next, id), timer);
                }
                _ => {
                    state.index.remove(&id);
                }
            }
        }
        fired
    }

    /// Time until the earliest deadline, `None` if no timers are armed.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.state
            .borrow()
            .queue
            .first_key_value()
            .map(|(&(deadline, _), _)| deadline.saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.state.borrow().index.len()
    }
}

/// Register a timer on the current pool thread.
///
/// The callback runs inside that thread's pump cycle, first after `after`
/// and then every `interval` when one is given.
///
/// # Panics
///
/// Panics when called outside of a pool thread.
pub fn add_timer<F>(after: Duration, interval: Option<Duration>, callback: F) -> TimerToken
where
    F: FnMut() + 'static,
{
    let ctx =
        current::current().unwrap_or_else(|| panic!("add_timer called outside of a pool thread"));
    ctx.timers().add(after, interval, Box::new(callback))
}

/// Cancel a timer registered on the current pool thread.
pub fn cancel_timer(token: TimerToken) -> bool {
    current::current().is_some_and(|ctx| ctx.timers().cancel(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counter() -> (Rc<Cell<u32>>, Box<dyn FnMut()>) {
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        (count, Box::new(move || c.set(c.get() + 1)))
    }

    #[test]
    fn test_one_shot_fires_once() {
        let timers = TimerHandler::new();
        let (count, cb) = counter();
        timers.add(Duration::ZERO, None, cb);

        let later = Instant::now() + Duration::from_millis(5);
        assert_eq!(timers.fire_due(later), 1);
        assert_eq!(timers.fire_due(later + Duration::from_secs(1)), 0);
        assert_eq!(count.get(), 1);
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn test_not_due_yet() {
        let timers = TimerHandler::new();
        let (count, cb) = counter();
        timers.add(Duration::from_secs(60), None, cb);

        assert_eq!(timers.fire_due(Instant::now()), 0);
        assert_eq!(count.get(), 0);
        let timeout = timers.next_timeout(Instant::now()).unwrap();
        assert!(timeout > Duration::from_secs(50));
    }

    #[test]
    fn test_periodic_rearms() {
        let timers = TimerHandler::new();
        let (count, cb) = counter();
        let token = timers.add(Duration::ZERO, Some(Duration::from_millis(10)), cb);

        let start = Instant::now();
        timers.fire_due(start + Duration::from_millis(1));
        timers.fire_due(start + Duration::from_millis(50));
        assert_eq!(count.get(), 2);
        assert_eq!(timers.len(), 1);

        assert!(timers.cancel(token));
        assert!(!timers.cancel(token));
        assert_eq!(timers.next_timeout(Instant::now()), None);
    }

    #[test]
    fn test_cancel_from_own_callback() {
        let timers = Rc::new(TimerHandler::new());
        let token_cell: Rc<Cell<Option<TimerToken>>> = Rc::new(Cell::new(None));

        let t = Rc::clone(&timers);
        let tc = Rc::clone(&token_cell);
        let token = timers.add(
            Duration::ZERO,
            Some(Duration::from_millis(1)),
            Box::new(move || {
                if let Some(token) = tc.get() {
                    t.cancel(token);
                }
            }),
        );
        token_cell.set(Some(token));

        timers.fire_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn test_huge_delays_are_clamped() {
        let timers = TimerHandler::new();
        let (count, cb) = counter();
        let token = timers.add(Duration::MAX, Some(Duration::MAX), cb);

        assert_eq!(timers.fire_due(Instant::now() + Duration::from_secs(3600)), 0);
        assert_eq!(count.get(), 0);
        assert!(timers.next_timeout(Instant::now()).unwrap() > Duration::from_secs(3600));
        assert!(timers.cancel(token));

        let now = Instant::now();
        assert!(deadline_after(now, Duration::MAX) > now);
    }

    #[test]
    fn test_fire_order_follows_deadline() {
        let timers = TimerHandler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (tag, delay) in [(2, 20), (0, 0), (1, 10)] {
            let order = Rc::clone(&order);
            timers.add(
                Duration::from_millis(delay),
                None,
                Box::new(move || order.borrow_mut().push(tag)),
            );
        }

        timers.fire_due(Instant::now() + Duration::from_millis(100));
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }
}
