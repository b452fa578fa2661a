//! The priority queue at the heart of the simulator.
//!
//! A binary min-heap ordered by `(time, event id)`. Event ids are
//! assigned at scheduling time and strictly increase, so ties at the
//! same virtual time resolve in scheduling order and the dispatch
//! sequence is a pure function of the schedule calls.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

use crate::event::{EventId, EventIdGen, EventType};
use crate::time::VirtualTime;

/// An event waiting in the queue.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub time: VirtualTime,
    pub id: EventId,
    pub event: EventType,
}

// BinaryHeap is a max-heap; reverse the ordering to pop earliest first.
impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for ScheduledEvent {}

/// Time-ordered event queue with cancellation.
///
/// Cancellation is lazy: cancelled ids go into a set and the event is
/// discarded when it reaches the top of the heap.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BinaryHeap<ScheduledEvent>,
    ids: EventIdGen,
    cancelled: BTreeSet<EventId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            queue: BinaryHeap::new(),
            ids: EventIdGen::new(),
            cancelled: BTreeSet::new(),
        }
    }

    /// Enqueue `event` at absolute `time`. Returns the id, which can
    /// later be passed to [`Scheduler::cancel`].
    pub fn schedule(&mut self, time: VirtualTime, event: EventType) -> EventId {
        let id = self.ids.next_id();
        self.queue.push(ScheduledEvent { time, id, event });
        id
    }

    /// Mark an event so it will be skipped at dispatch. Cancelling an
    /// already-dispatched or unknown id is a no-op.
    pub fn cancel(&mut self, id: EventId) {
        self.cancelled.insert(id);
    }

    /// Remove and return the earliest live event.
    pub fn pop(&mut self) -> Option<ScheduledEvent> {
        while let Some(ev) = self.queue.pop() {
            if self.cancelled.remove(&ev.id) {
                continue;
            }
            return Some(ev);
        }
        None
    }

    /// Time of the earliest live event without removing it.
    pub fn peek_time(&mut self) -> Option<VirtualTime> {
        while let Some(ev) = self.queue.peek() {
            if self.cancelled.contains(&ev.id) {
                let id = ev.id;
                self.queue.pop();
                self.cancelled.remove(&id);
                continue;
            }
            return Some(ev.time);
        }
        None
    }

    pub fn is_empty(&mut self) -> bool {
        self.peek_time().is_none()
    }

    /// Queued events, including not-yet-skipped cancelled ones.
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingId;

    fn join(id: u64) -> EventType {
        EventType::NodeJoin {
            id: RingId::new(id),
            bootstrap: None,
        }
    }

    #[test]
    fn test_pop_in_time_order() {
        let mut s = Scheduler::new();
        s.schedule(VirtualTime::new(30), join(3));
        s.schedule(VirtualTime::new(10), join(1));
        s.schedule(VirtualTime::new(20), join(2));

        let order: Vec<u64> = std::iter::from_fn(|| s.pop())
            .map(|ev| ev.time.ticks())
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn test_ties_break_by_schedule_order() {
        let mut s = Scheduler::new();
        let t = VirtualTime::new(5);
        let a = s.schedule(t, join(1));
        let b = s.schedule(t, join(2));
        let c = s.schedule(t, join(3));

        assert_eq!(s.pop().map(|e| e.id), Some(a));
        assert_eq!(s.pop().map(|e| e.id), Some(b));
        assert_eq!(s.pop().map(|e| e.id), Some(c));
    }

    #[test]
    fn test_cancel_skips_event() {
        let mut s = Scheduler::new();
        s.schedule(VirtualTime::new(1), join(1));
        let doomed = s.schedule(VirtualTime::new(2), join(2));
        s.schedule(VirtualTime::new(3), join(3));
        s.cancel(doomed);

        let times: Vec<u64> = std::iter::from_fn(|| s.pop())
            .map(|ev| ev.time.ticks())
            .collect();
        assert_eq!(times, vec![1, 3]);
    }

    #[test]
    fn test_cancel_unknown_id_is_noop() {
        let mut s = Scheduler::new();
        let id = s.schedule(VirtualTime::new(1), join(1));
        assert!(s.pop().is_some());
        s.cancel(id);
        assert!(s.is_empty());
    }

    #[test]
    fn test_peek_time() {
        let mut s = Scheduler::new();
        assert_eq!(s.peek_time(), None);
        let early = s.schedule(VirtualTime::new(4), join(1));
        s.schedule(VirtualTime::new(9), join(2));
        assert_eq!(s.peek_time(), Some(VirtualTime::new(4)));
        s.cancel(early);
        assert_eq!(s.peek_time(), Some(VirtualTime::new(9)));
    }
}
