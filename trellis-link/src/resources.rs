//! Fair-queue of dissemination engines waiting for window slots and bucket
//! tokens on a link.
//!
//! The C ancestor kept a linked list of function pointers; the closed set of
//! dissemination algorithms makes this a two-entry round-robin over an enum,
//! with the actual send callback inverted out to the caller.

use std::collections::VecDeque;

/// The dissemination engines that can request link resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DissemId {
    PriorityFlood,
    ReliableFlood,
}

#[derive(Debug, Default)]
pub struct ResourceQueue {
    queue: VecDeque<DissemId>,
    queued: [bool; 2],
    /// Set when a callback was starved by an empty bucket; the next refill
    /// should resume the assignment loop.
    pub needed_tokens: bool,
}

impl ResourceQueue {
    fn slot(dissem: DissemId) -> usize {
        match dissem {
            DissemId::PriorityFlood => 0,
            DissemId::ReliableFlood => 1,
        }
    }

    /// Register intent to send; duplicate registrations are no-ops.
    pub fn request(&mut self, dissem: DissemId) {
        let slot = Self::slot(dissem);
        if !self.queued[slot] {
            self.queued[slot] = true;
            self.queue.push_back(dissem);
        }
    }

    /// Pop the next engine to offer a slot to.
    pub fn pop(&mut self) -> Option<DissemId> {
        let dissem = self.queue.pop_front()?;
        self.queued[Self::slot(dissem)] = false;
        Some(dissem)
    }

    /// Re-queue an engine that reported more pending work.
    pub fn requeue(&mut self, dissem: DissemId) {
        self.request(dissem);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_without_duplicates() {
        let mut rq = ResourceQueue::default();
        rq.request(DissemId::ReliableFlood);
        rq.request(DissemId::PriorityFlood);
        rq.request(DissemId::ReliableFlood);

        assert_eq!(rq.pop(), Some(DissemId::ReliableFlood));
        rq.requeue(DissemId::ReliableFlood);
        assert_eq!(rq.pop(), Some(DissemId::PriorityFlood));
        assert_eq!(rq.pop(), Some(DissemId::ReliableFlood));
        assert_eq!(rq.pop(), None);
    }
}
