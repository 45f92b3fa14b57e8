//! The daemon's timer wheel.
//!
//! Timers are identified by `(function, integer key)`; enqueueing an already
//! queued timer is a no-op, dequeueing is logarithmic (lazy: a generation
//! counter invalidates stale heap entries). Timers fire in non-decreasing
//! deadline order with ties broken first-in first-out.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerFn {
    /// Drive one link session's internal deadlines.
    LinkPoll,
    /// Drive the reliable-flood engine's deadlines.
    RelPoll,
    /// Priority-flood garbage collection.
    PrioGc,
}

pub type TimerKey = (TimerFn, u64);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    at: Instant,
    seq: u64,
    key: TimerKey,
    generation: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<TimerKey, u64>,
    next_seq: u64,
    next_generation: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` to fire at `at`. No-op if the key is already queued.
    pub fn enqueue(&mut self, key: TimerKey, at: Instant) {
        if self.live.contains_key(&key) {
            return;
        }
        self.next_generation += 1;
        self.next_seq += 1;
        self.live.insert(key, self.next_generation);
        self.heap.push(Reverse(Entry {
            at,
            seq: self.next_seq,
            key,
            generation: self.next_generation,
        }));
    }

    /// Replace any queued deadline for `key` with `at`.
    pub fn requeue(&mut self, key: TimerKey, at: Instant) {
        self.dequeue(key);
        self.enqueue(key, at);
    }

    /// Cancel a queued timer. Stale heap entries die lazily.
    pub fn dequeue(&mut self, key: TimerKey) {
        self.live.remove(&key);
    }

    pub fn is_queued(&self, key: TimerKey) -> bool {
        self.live.contains_key(&key)
    }

    fn skim_stale(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            match self.live.get(&entry.key) {
                Some(&generation) if generation == entry.generation => return,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// The deadline of the earliest live timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.skim_stale();
        self.heap.peek().map(|Reverse(e)| e.at)
    }

    /// Pop the earliest live timer that is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKey> {
        self.skim_stale();
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.at <= now => {
                let Reverse(entry) = self.heap.pop().expect("peeked");
                self.live.remove(&entry.key);
                Some(entry.key)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_in_order_with_fifo_ties() {
        let t0 = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.enqueue((TimerFn::LinkPoll, 2), t0 + Duration::from_millis(5));
        wheel.enqueue((TimerFn::LinkPoll, 1), t0 + Duration::from_millis(5));
        wheel.enqueue((TimerFn::PrioGc, 0), t0 + Duration::from_millis(1));

        let now = t0 + Duration::from_millis(10);
        assert_eq!(wheel.pop_due(now), Some((TimerFn::PrioGc, 0)));
        assert_eq!(wheel.pop_due(now), Some((TimerFn::LinkPoll, 2)));
        assert_eq!(wheel.pop_due(now), Some((TimerFn::LinkPoll, 1)));
        assert_eq!(wheel.pop_due(now), None);
    }

    #[test]
    fn duplicate_enqueue_is_a_noop_and_dequeue_cancels() {
        let t0 = Instant::now();
        let mut wheel = TimerWheel::new();
        let key = (TimerFn::RelPoll, 7);
        wheel.enqueue(key, t0 + Duration::from_millis(1));
        wheel.enqueue(key, t0 + Duration::from_millis(50));
        assert_eq!(wheel.next_deadline(), Some(t0 + Duration::from_millis(1)));

        wheel.dequeue(key);
        assert_eq!(wheel.next_deadline(), None);
        assert_eq!(wheel.pop_due(t0 + Duration::from_secs(1)), None);
    }

    #[test]
    fn requeue_moves_the_deadline() {
        let t0 = Instant::now();
        let mut wheel = TimerWheel::new();
        let key = (TimerFn::LinkPoll, 3);
        wheel.enqueue(key, t0 + Duration::from_millis(40));
        wheel.requeue(key, t0 + Duration::from_millis(2));
        assert_eq!(wheel.pop_due(t0 + Duration::from_millis(5)), Some(key));
    }
}
