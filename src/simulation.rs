//! The simulation loop.
//!
//! A [`Simulation`] owns the scheduler and the clock. Each step pops
//! the earliest event, jumps the clock to its timestamp and hands it to
//! the [`EventHandler`] together with a [`SimulationContext`] through
//! which the handler schedules follow-up events. Nothing here touches
//! wall-clock time or threads; given the same handler and the same
//! initial schedule, two runs are identical.

use crate::event::{EventId, EventType};
use crate::scheduler::Scheduler;
use crate::time::VirtualTime;

/// Scheduling surface handed to the handler during dispatch.
pub struct SimulationContext<'a> {
    scheduler: &'a mut Scheduler,
    now: VirtualTime,
}

impl<'a> SimulationContext<'a> {
    /// The timestamp of the event being handled.
    #[inline]
    pub fn now(&self) -> VirtualTime {
        self.now
    }

    /// Schedule at an absolute time. Times in the past are clamped to
    /// `now`; the causal order of the run is never rewritten.
    pub fn schedule_at(&mut self, time: VirtualTime, event: EventType) -> EventId {
        let time = time.max(self.now);
        self.scheduler.schedule(time, event)
    }

    /// Schedule `delay` ticks from now. Saturates at the end of time.
    pub fn schedule_after(&mut self, delay: u64, event: EventType) -> EventId {
        let time = self.now.plus(delay).unwrap_or(VirtualTime::new(u64::MAX));
        self.scheduler.schedule(time, event)
    }

    /// Cancel a previously scheduled event.
    pub fn cancel(&mut self, id: EventId) {
        self.scheduler.cancel(id);
    }
}

/// Implemented by the model driven by the simulation.
pub trait EventHandler {
    fn handle(&mut self, event: EventType, ctx: &mut SimulationContext<'_>);
}

/// The discrete-event engine: a clock and a queue.
#[derive(Debug, Default)]
pub struct Simulation {
    scheduler: Scheduler,
    current_time: VirtualTime,
    events_processed: u64,
}

impl Simulation {
    pub fn new() -> Self {
        Simulation {
            scheduler: Scheduler::new(),
            current_time: VirtualTime::ZERO,
            events_processed: 0,
        }
    }

    #[inline]
    pub fn now(&self) -> VirtualTime {
        self.current_time
    }

    #[inline]
    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Seed the schedule before (or between) runs.
    pub fn schedule_at(&mut self, time: VirtualTime, event: EventType) -> EventId {
        self.scheduler.schedule(time.max(self.current_time), event)
    }

    /// Dispatch one event. Returns `false` when the queue is empty.
    pub fn step(&mut self, handler: &mut impl EventHandler) -> bool {
        let Some(ev) = self.scheduler.pop() else {
            return false;
        };
        debug_assert!(!ev.time.is_before(self.current_time));
        self.current_time = ev.time;
        self.events_processed += 1;

        let mut ctx = SimulationContext {
            scheduler: &mut self.scheduler,
            now: self.current_time,
        };
        handler.handle(ev.event, &mut ctx);
        true
    }

    /// Run until the queue drains or the next event would land after
    /// `until`. The clock finishes at the last dispatched event.
    pub fn run_until(&mut self, handler: &mut impl EventHandler, until: VirtualTime) {
        while let Some(next) = self.scheduler.peek_time() {
            if until.is_before(next) {
                break;
            }
            self.step(handler);
        }
    }

    /// Drain the queue completely, bounded by `max_events` as a guard
    /// against runaway feedback (a stabilizer rescheduling itself, say).
    pub fn run_to_completion(&mut self, handler: &mut impl EventHandler, max_events: u64) {
        let budget_end = self.events_processed + max_events;
        while self.events_processed < budget_end && self.step(handler) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingId;

    /// Records dispatch order and optionally schedules a follow-up.
    struct Recorder {
        seen: Vec<(u64, u64)>,
        chain: bool,
    }

    impl EventHandler for Recorder {
        fn handle(&mut self, event: EventType, ctx: &mut SimulationContext<'_>) {
            if let EventType::NodeJoin { id, .. } = event {
                self.seen.push((ctx.now().ticks(), id.raw()));
                if self.chain && id.raw() < 3 {
                    ctx.schedule_after(
                        10,
                        EventType::NodeJoin {
                            id: RingId::new(id.raw() + 1),
                            bootstrap: None,
                        },
                    );
                }
            }
        }
    }

    fn join(id: u64) -> EventType {
        EventType::NodeJoin {
            id: RingId::new(id),
            bootstrap: None,
        }
    }

    #[test]
    fn test_clock_advances_to_event_times() {
        let mut sim = Simulation::new();
        let mut h = Recorder {
            seen: Vec::new(),
            chain: false,
        };
        sim.schedule_at(VirtualTime::new(7), join(1));
        sim.schedule_at(VirtualTime::new(3), join(2));
        sim.run_to_completion(&mut h, 100);

        assert_eq!(h.seen, vec![(3, 2), (7, 1)]);
        assert_eq!(sim.now(), VirtualTime::new(7));
        assert_eq!(sim.events_processed(), 2);
    }

    #[test]
    fn test_handler_scheduled_events_run() {
        let mut sim = Simulation::new();
        let mut h = Recorder {
            seen: Vec::new(),
            chain: true,
        };
        sim.schedule_at(VirtualTime::new(0), join(1));
        sim.run_to_completion(&mut h, 100);

        assert_eq!(h.seen, vec![(0, 1), (10, 2), (20, 3)]);
    }

    #[test]
    fn test_run_until_stops_at_horizon() {
        let mut sim = Simulation::new();
        let mut h = Recorder {
            seen: Vec::new(),
            chain: false,
        };
        sim.schedule_at(VirtualTime::new(5), join(1));
        sim.schedule_at(VirtualTime::new(15), join(2));
        sim.run_until(&mut h, VirtualTime::new(10));

        assert_eq!(h.seen, vec![(5, 1)]);
        // The later event is still queued.
        sim.run_until(&mut h, VirtualTime::new(20));
        assert_eq!(h.seen.len(), 2);
    }

    #[test]
    fn test_max_events_bounds_the_run() {
        let mut sim = Simulation::new();
        let mut h = Recorder {
            seen: Vec::new(),
            chain: false,
        };
        for i in 0..10 {
            sim.schedule_at(VirtualTime::new(i), join(i));
        }
        sim.run_to_completion(&mut h, 4);
        assert_eq!(h.seen.len(), 4);
    }
}
