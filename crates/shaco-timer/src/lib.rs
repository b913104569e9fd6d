//! Monotonic clock and expiry-driven timer.
//!
//! Grounded on spec.md §2's "Timer: Monotonic 'now'; expiry-driven messages
//! to handles" and the excluded-boundary note in §1 (the timer wheel's own
//! internals are out of scope; only its message-producing contract matters
//! to the messaging core). Expiries are implemented as a min-heap keyed by
//! deadline rather than a literal hashed wheel — for the tens-to-low-
//! hundreds of outstanding timers a service runtime like this carries, a
//! `BinaryHeap` gives the same "next expiry in O(log n)" behavior the wheel
//! is built for, without needing tick-bucket bookkeeping the spec never
//! actually exercises.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use shaco_handle::Handle;
use shaco_message::{Dispatcher, Session, TYPE_TIMEOUT};

/// Opaque handle to a scheduled timer, returned by [`Timer::add`] so callers
/// can cancel before expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Entry {
    deadline: Instant,
    seq: u64,
    id: TimerId,
    dest: Handle,
    session: Session,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so the heap is a min-heap on deadline; ties break by
        // insertion order (seq), giving stable expiry order for same-tick
        // timers the way a wheel's bucket list would.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Process-wide timer. `trigger` fires every timer whose deadline has
/// passed, enqueueing a `TYPE_TIMEOUT` message to its destination handle.
pub struct Timer {
    started: Instant,
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    cancelled: std::collections::HashSet<u64>,
    default_timeout: Duration,
}

impl Timer {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            heap: BinaryHeap::new(),
            next_seq: 0,
            cancelled: std::collections::HashSet::new(),
            default_timeout,
        }
    }

    /// Milliseconds since the timer was created — the "monotonic now" the
    /// rest of the runtime reads instead of the wall clock.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Schedules a timeout message to `dest` after `delay`, echoing
    /// `session` so the recipient can correlate it with the request that
    /// armed the timer.
    pub fn add(&mut self, dest: Handle, session: Session, delay: Duration) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = TimerId(seq);
        self.heap.push(Entry {
            deadline: Instant::now() + delay,
            seq,
            id,
            dest,
            session,
        });
        id
    }

    /// Cancels a pending timer. A no-op if it already fired or never
    /// existed.
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id.0);
    }

    /// Duration the main loop should block on I/O before the next timer is
    /// due, capped at `default_timeout` when nothing is scheduled (spec.md
    /// §4.6 step 1: `timeout = timer.max_timeout()`).
    pub fn max_timeout(&self) -> Duration {
        match self.heap.peek() {
            Some(entry) => entry.deadline.saturating_duration_since(Instant::now()),
            None => self.default_timeout,
        }
    }

    /// Pops every expired timer and pushes its `TYPE_TIMEOUT` message onto
    /// the dispatcher. Returns the number of messages enqueued.
    pub fn trigger(&mut self, dispatcher: &mut Dispatcher) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            if self.cancelled.remove(&entry.id.0) {
                continue;
            }
            dispatcher.push(
                Handle::NONE,
                entry.dest,
                entry.session,
                shaco_message::MessageKind::User(TYPE_TIMEOUT, bytes::Bytes::new()),
            );
            fired += 1;
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn expired_timer_enqueues_timeout_message() {
        let mut timer = Timer::new(Duration::from_millis(100));
        let mut dispatcher = Dispatcher::new(16);
        let dest = Handle::new(0, 5);
        timer.add(dest, 42, Duration::from_millis(1));
        sleep(Duration::from_millis(5));
        let fired = timer.trigger(&mut dispatcher);
        assert_eq!(fired, 1);
        assert!(!dispatcher.is_empty());
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut timer = Timer::new(Duration::from_millis(100));
        let mut dispatcher = Dispatcher::new(16);
        let id = timer.add(Handle::new(0, 1), 0, Duration::from_millis(1));
        timer.cancel(id);
        sleep(Duration::from_millis(5));
        assert_eq!(timer.trigger(&mut dispatcher), 0);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn max_timeout_shrinks_as_deadline_nears() {
        let mut timer = Timer::new(Duration::from_secs(1));
        timer.add(Handle::new(0, 1), 0, Duration::from_millis(10));
        assert!(timer.max_timeout() <= Duration::from_millis(10));
    }

    #[test]
    fn max_timeout_uses_default_when_idle() {
        let timer = Timer::new(Duration::from_millis(250));
        assert_eq!(timer.max_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut timer = Timer::new(Duration::from_millis(100));
        let mut dispatcher = Dispatcher::new(16);
        let late = Handle::new(0, 2);
        let early = Handle::new(0, 1);
        timer.add(late, 1, Duration::from_millis(10));
        timer.add(early, 2, Duration::from_millis(1));
        sleep(Duration::from_millis(20));
        assert_eq!(timer.trigger(&mut dispatcher), 2);
    }
}
