// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    mem,
    sync::{Mutex, PoisonError},
};

use common::{SystemConfig, Time, TimeS};

/// Identifier of an event type registered on [crate::Timing].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventTypeId(pub(crate) usize);

/// An event awaiting execution.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    /// Absolute tick to execute at.
    pub time: Time,
    /// Order the event was inserted into the heap in; breaks ties
    /// between events scheduled for the same tick.
    pub fifo_order: u64,
    /// Opaque data passed to the callback.
    pub user_data: u64,
    /// Kind of event to execute.
    pub kind: EventTypeId,
}

impl Event {
    fn key(&self) -> (Time, u64) {
        (self.time, self.fifo_order)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed, BinaryHeap is a max-heap and we want the earliest
        // event at the front.
        other.key().cmp(&self.key())
    }
}

/// Settings a timer needs to convert CPU work into ticks.
#[derive(Copy, Clone, Debug)]
struct TickScaling {
    use_custom_cpu_ticks: bool,
    custom_cpu_ticks: u64,
    cpu_clock_percentage: u32,
    empty_queue_slice_length: TimeS,
}

/// A timer for a single CPU core.
/// Keeps track of how many ticks the core has executed, how long
/// it may run before control returns to the scheduler, and which
/// events are due on its timeline.
pub struct EventTimer {
    scaling: TickScaling,

    /// Ticks executed up to the end of the last slice.
    executed_ticks: Time,
    /// Length of the current slice.
    slice_length: TimeS,
    /// Ticks left in the current slice.
    downcount: TimeS,
    /// Ticks that were skipped by idling in the current slice.
    idled_cycles: TimeS,
    /// Set while events are being dispatched in [EventTimer::begin_advance];
    /// the slice is accounted for already at that point.
    is_timer_sane: bool,

    event_fifo_id: u64,
    event_queue: BinaryHeap<Event>,
    /// Events scheduled onto this timer while another core was active.
    /// Only moved into [event_queue] on the next advance.
    ts_queue: Mutex<VecDeque<Event>>,
}

impl EventTimer {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            scaling: TickScaling {
                use_custom_cpu_ticks: config.use_custom_cpu_ticks,
                custom_cpu_ticks: config.custom_cpu_ticks,
                cpu_clock_percentage: config.cpu_clock_percentage,
                empty_queue_slice_length: config.empty_queue_slice_length,
            },
            executed_ticks: 0,
            slice_length: config.initial_slice_length,
            downcount: config.initial_downcount,
            idled_cycles: 0,
            is_timer_sane: false,
            event_fifo_id: 0,
            event_queue: BinaryHeap::new(),
            ts_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Current time of this timer. Ticks consumed in the running slice
    /// are included.
    pub fn ticks(&self) -> Time {
        let mut ticks = self.executed_ticks;
        if !self.is_timer_sane {
            ticks = ticks.saturating_add_signed(self.slice_length - self.downcount);
        }
        ticks
    }

    /// Consume ticks from the current slice. Called by the CPU core
    /// as it executes.
    pub fn add_ticks(&mut self, ticks: u64) {
        let ticks = if self.scaling.use_custom_cpu_ticks {
            self.scaling.custom_cpu_ticks
        } else {
            ticks
        };
        let percentage = self.scaling.cpu_clock_percentage.max(1) as u128;
        let scaled = (ticks as u128 * 100 / percentage).min(TimeS::MAX as u128) as TimeS;
        self.downcount = self.downcount.saturating_sub(scaled);
    }

    /// Ticks skipped by idling since the last advance.
    pub fn idle_ticks(&self) -> Time {
        self.idled_cycles as Time
    }

    /// Ticks left in the current slice. Might be negative if the
    /// CPU overshot its slice.
    pub fn downcount(&self) -> TimeS {
        self.downcount
    }

    /// Length of the current slice.
    pub fn slice_length(&self) -> TimeS {
        self.slice_length
    }

    /// Amount of events waiting on the heap. Events in the cross-core
    /// queue are not counted until they are moved.
    pub fn queued_events(&self) -> usize {
        self.event_queue.len()
    }

    /// The next event due on this timer, if any.
    pub fn next_event(&self) -> Option<&Event> {
        self.event_queue.peek()
    }

    /// Shorten the current slice so control returns to the scheduler
    /// after at most `cycles` more ticks.
    pub fn force_exception_check(&mut self, cycles: TimeS) {
        let cycles = cycles.max(0);
        if self.downcount > cycles {
            self.slice_length -= self.downcount - cycles;
            self.downcount = cycles;
        }
    }

    /// Move all events from the cross-core queue onto the heap,
    /// assigning insertion order in the order they were queued.
    pub fn move_events(&mut self) {
        let queue = self
            .ts_queue
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for mut event in queue.drain(..) {
            event.fifo_order = self.event_fifo_id;
            self.event_fifo_id += 1;
            self.event_queue.push(event);
        }
    }

    /// Distance to the next event, or the configured default if
    /// no event is queued.
    pub fn max_slice_length(&self) -> TimeS {
        match self.event_queue.peek() {
            Some(next) => {
                let until = next.time as TimeS - self.executed_ticks as TimeS;
                assert!(
                    until > 0,
                    "Event due at {} is not in the future of {}",
                    next.time,
                    self.executed_ticks
                );
                until
            }
            None => self.scaling.empty_queue_slice_length,
        }
    }

    /// Start a new slice of at most `max_slice_length` ticks,
    /// cut short if an event is due earlier.
    pub fn set_next_slice(&mut self, max_slice_length: TimeS) {
        self.slice_length = match self.event_queue.peek() {
            Some(next) => (next.time as TimeS - self.executed_ticks as TimeS).min(max_slice_length),
            None => max_slice_length,
        };
        self.downcount = self.slice_length;
    }

    /// Skip the rest of the slice without executing anything.
    pub fn idle(&mut self) {
        self.idled_cycles += self.downcount;
        self.downcount = 0;
    }

    /// Put an event onto this timer's heap. Only valid while this timer
    /// is the active one.
    pub(crate) fn schedule_local(&mut self, cycles_into_future: TimeS, kind: EventTypeId, user_data: u64) {
        let time = self.ticks().saturating_add_signed(cycles_into_future);
        // If this event needs to be handled before the slice ends, end it early
        if !self.is_timer_sane {
            self.force_exception_check(cycles_into_future);
        }

        self.event_queue.push(Event {
            time,
            fifo_order: self.event_fifo_id,
            user_data,
            kind,
        });
        self.event_fifo_id += 1;
    }

    /// Queue an event for this timer while another timer is active.
    /// It only becomes visible on the next advance.
    pub(crate) fn schedule_cross_core(&self, cycles_into_future: TimeS, kind: EventTypeId, user_data: u64) {
        let event = Event {
            time: self.ticks().saturating_add_signed(cycles_into_future),
            fifo_order: 0,
            user_data,
            kind,
        };
        self.ts_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }

    /// Remove all events matching the predicate from the heap.
    /// Events still in the cross-core queue are not affected.
    pub(crate) fn remove_matching(&mut self, mut pred: impl FnMut(&Event) -> bool) -> usize {
        let mut events = mem::take(&mut self.event_queue).into_vec();
        let before = events.len();
        events.retain(|e| !pred(e));
        let removed = before - events.len();
        // Removing random items breaks the heap, so it needs to be rebuilt
        self.event_queue = BinaryHeap::from(events);
        removed
    }

    /// Account for the finished slice and mark the timer as sane.
    /// Events can then be taken with [pop_due] until it returns None,
    /// after which [end_advance] must be called.
    pub(crate) fn begin_advance(&mut self) {
        self.move_events();

        let cycles_executed = self.slice_length - self.downcount;
        self.idled_cycles = 0;
        self.executed_ticks = self.executed_ticks.saturating_add_signed(cycles_executed);
        self.slice_length = 0;
        self.downcount = 0;

        self.is_timer_sane = true;
    }

    /// Take the next event that is due, together with how late it is.
    pub(crate) fn pop_due(&mut self) -> Option<(Event, TimeS)> {
        if self.event_queue.peek()?.time > self.executed_ticks {
            return None;
        }
        let event = self.event_queue.pop()?;
        Some((event, (self.executed_ticks - event.time) as TimeS))
    }

    pub(crate) fn end_advance(&mut self) {
        self.is_timer_sane = false;
    }

    /// Remove and return all events in execution order.
    #[cfg(test)]
    pub(crate) fn drain_sorted(&mut self) -> Vec<Event> {
        let mut out = Vec::with_capacity(self.event_queue.len());
        while let Some(evt) = self.event_queue.pop() {
            out.push(evt);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: EventTypeId = EventTypeId(0);
    const B: EventTypeId = EventTypeId(1);

    fn timer(slice: TimeS) -> EventTimer {
        EventTimer::new(&SystemConfig {
            initial_slice_length: slice,
            initial_downcount: slice,
            empty_queue_slice_length: 20_000,
            ..SystemConfig::default()
        })
    }

    fn advance(timer: &mut EventTimer) -> Vec<(Event, TimeS)> {
        timer.begin_advance();
        let mut fired = Vec::new();
        while let Some(evt) = timer.pop_due() {
            fired.push(evt);
        }
        timer.end_advance();
        fired
    }

    #[test]
    fn ticks_include_running_slice() {
        let mut t = timer(1000);
        assert_eq!(0, t.ticks());
        t.add_ticks(300);
        assert_eq!(300, t.ticks());
        advance(&mut t);
        assert_eq!(300, t.ticks());
        assert_eq!(0, t.downcount());
    }

    #[test]
    fn same_tick_fires_in_order() {
        let mut t = timer(1000);
        t.schedule_local(500, A, 1);
        t.schedule_local(500, B, 2);
        t.add_ticks(1000);
        let fired = advance(&mut t);

        assert_eq!(2, fired.len());
        assert_eq!(A, fired[0].0.kind);
        assert_eq!(B, fired[1].0.kind);
        assert!(fired.iter().all(|(_, late)| *late == 500));
    }

    #[test]
    fn schedule_mid_slice_truncates() {
        let mut t = timer(1000);
        t.add_ticks(100);
        t.schedule_local(200, A, 0);
        assert_eq!(200, t.downcount());
        assert_eq!(300, t.slice_length());
        // Time as seen from outside did not change
        assert_eq!(100, t.ticks());

        t.add_ticks(200);
        let fired = advance(&mut t);
        assert_eq!(1, fired.len());
        assert_eq!(0, fired[0].1);
        assert_eq!(300, t.ticks());
    }

    #[test]
    fn force_exception_check_never_extends() {
        let mut t = timer(1000);
        t.force_exception_check(5000);
        assert_eq!(1000, t.downcount());
        t.force_exception_check(-10);
        assert_eq!(0, t.downcount());
        assert_eq!(0, t.slice_length());
    }

    #[test]
    fn heap_order_after_removal() {
        let mut t = timer(0);
        for (i, at) in [50, 10, 30, 10, 70, 20, 30].into_iter().enumerate() {
            let kind = if i % 2 == 0 { A } else { B };
            t.schedule_local(at, kind, i as u64);
        }
        assert_eq!(3, t.remove_matching(|e| e.kind == B));
        t.schedule_local(40, B, 100);
        t.schedule_local(10, B, 101);
        assert_eq!(1, t.remove_matching(|e| e.user_data == 100));

        let order = t.drain_sorted();
        for pair in order.windows(2) {
            assert!(pair[0].key() <= pair[1].key());
        }
        let times = order.iter().map(|e| e.time).collect::<Vec<_>>();
        assert_eq!(vec![30, 30, 50, 70], times[1..].to_vec());
        assert_eq!(101, order[0].user_data);
    }

    #[test]
    fn cross_core_events_wait_for_advance() {
        let mut t = timer(1000);
        t.schedule_cross_core(10, A, 1);
        t.schedule_cross_core(10, B, 2);
        assert_eq!(0, t.queued_events());

        t.begin_advance();
        assert_eq!(2, t.queued_events());
        t.end_advance();

        let order = t.drain_sorted();
        assert_eq!(vec![0, 1], order.iter().map(|e| e.fifo_order).collect::<Vec<_>>());
        assert_eq!(A, order[0].kind);
    }

    #[test]
    fn idle_moves_downcount() {
        let mut t = timer(1000);
        t.add_ticks(400);
        t.idle();
        assert_eq!(600, t.idle_ticks());
        assert_eq!(1000, t.ticks());
        advance(&mut t);
        assert_eq!(0, t.idle_ticks());
        assert_eq!(1000, t.ticks());
    }

    #[test]
    fn next_slice_is_cut_at_next_event() {
        let mut t = timer(0);
        t.set_next_slice(1000);
        assert_eq!(1000, t.downcount());
        assert_eq!(20_000, t.max_slice_length());

        t.schedule_local(250, A, 0);
        advance(&mut t);
        assert_eq!(250, t.max_slice_length());
        t.set_next_slice(1000);
        assert_eq!(250, t.slice_length());
        assert_eq!(250, t.downcount());
    }

    #[test]
    #[should_panic]
    fn max_slice_panics_on_overdue_event() {
        let mut t = timer(0);
        t.begin_advance();
        t.schedule_local(0, A, 0);
        t.end_advance();
        t.max_slice_length();
    }

    #[test]
    fn clock_percentage_scales_ticks() {
        let mut t = EventTimer::new(&SystemConfig {
            cpu_clock_percentage: 50,
            initial_slice_length: 1000,
            initial_downcount: 1000,
            ..SystemConfig::default()
        });
        t.add_ticks(100);
        assert_eq!(800, t.downcount());

        let mut t = EventTimer::new(&SystemConfig {
            use_custom_cpu_ticks: true,
            custom_cpu_ticks: 77,
            initial_slice_length: 1000,
            initial_downcount: 1000,
            ..SystemConfig::default()
        });
        t.add_ticks(5);
        assert_eq!(77, t.ticks());
    }

    #[test]
    fn huge_tick_counts_saturate() {
        let mut t = EventTimer::new(&SystemConfig {
            cpu_clock_percentage: 50,
            initial_slice_length: 1000,
            initial_downcount: 1000,
            ..SystemConfig::default()
        });
        t.add_ticks(u64::MAX);
        assert_eq!(1000 - TimeS::MAX, t.downcount());
        assert_eq!(TimeS::MAX as Time, t.ticks());
    }

    #[test]
    fn ticks_are_monotonic() {
        let mut t = timer(100);
        let mut last = t.ticks();
        for step in 0..50 {
            match step % 3 {
                0 => t.add_ticks(step * 7),
                1 => t.idle(),
                _ => {
                    advance(&mut t);
                    t.set_next_slice(150);
                }
            }
            assert!(t.ticks() >= last);
            last = t.ticks();
        }
    }
}
