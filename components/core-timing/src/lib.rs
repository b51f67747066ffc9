// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

//! Discrete-event timing for the emulated ARM11 cores.
//! Every core has its own [EventTimer]; [Timing] coordinates them
//! and dispatches event callbacks.

mod timer;

use std::{collections::HashMap, rc::Rc};

use arrayvec::ArrayVec;
use common::{common::time, SystemConfig, Time, TimeS};
pub use timer::{Event, EventTimer, EventTypeId};

/// Maximum amount of cores (and therefore timers) the system can have.
pub const MAX_CORES: usize = 2;

/// Callback of an event. Receives the host, the event's user data,
/// and how many ticks late the event is being handled.
pub type TimedCallback<S> = Rc<dyn Fn(&mut S, u64, TimeS)>;

/// Trait for the object owning the [Timing]; it is passed to
/// event callbacks.
pub trait TimingHost: Sized + 'static {
    fn timing(&mut self) -> &mut Timing<Self>;
}

/// A registered kind of event.
struct EventType<S> {
    name: String,
    callback: TimedCallback<S>,
}

/// Coordinator of all timers. Generic over the host that
/// event callbacks get access to.
pub struct Timing<S> {
    timers: ArrayVec<EventTimer, MAX_CORES>,
    current: usize,
    event_types: Vec<EventType<S>>,
    by_name: HashMap<String, EventTypeId>,
}

impl<S> Timing<S> {
    /// Create timers for all cores the configuration provisions.
    pub fn new(config: &SystemConfig) -> Self {
        let timers = (0..config.core_count())
            .map(|_| EventTimer::new(config))
            .collect();
        Self {
            timers,
            current: 0,
            event_types: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register an event type. Registering a name a second time keeps
    /// the first registration and returns it.
    pub fn register_event(
        &mut self,
        name: &str,
        callback: impl Fn(&mut S, u64, TimeS) + 'static,
    ) -> EventTypeId {
        if let Some(id) = self.by_name.get(name) {
            log::warn!("Event type '{name}' registered twice, keeping the first registration");
            return *id;
        }

        let id = EventTypeId(self.event_types.len());
        self.event_types.push(EventType {
            name: name.to_string(),
            callback: Rc::new(callback),
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Look up a registered event type.
    pub fn event_type(&self, name: &str) -> Option<EventTypeId> {
        self.by_name.get(name).copied()
    }

    /// Name an event type was registered with.
    pub fn event_name(&self, kind: EventTypeId) -> &str {
        &self.event_types[kind.0].name
    }

    /// Schedule an event on the given core's timer, or the current
    /// one if `core_id` is None.
    /// Events for a timer that is not the current one are queued and
    /// only appear on its heap once it advances.
    pub fn schedule_event(
        &mut self,
        cycles_into_future: TimeS,
        kind: EventTypeId,
        user_data: u64,
        core_id: Option<usize>,
    ) {
        assert!(kind.0 < self.event_types.len(), "Unknown event type {kind:?}");
        let core_id = core_id.unwrap_or(self.current);
        assert!(core_id < self.timers.len(), "No timer for core {core_id}");

        if core_id == self.current {
            self.timers[core_id].schedule_local(cycles_into_future, kind, user_data);
        } else {
            self.timers[core_id].schedule_cross_core(cycles_into_future, kind, user_data);
        }
    }

    /// Remove all events of the given kind with the given user data
    /// from every timer.
    /// Note that this does not reach events still queued for another core.
    pub fn unschedule_event(&mut self, kind: EventTypeId, user_data: u64) {
        for timer in &mut self.timers {
            timer.remove_matching(|e| e.kind == kind && e.user_data == user_data);
        }
    }

    /// Remove all events of the given kind from every timer.
    pub fn remove_event(&mut self, kind: EventTypeId) {
        for timer in &mut self.timers {
            timer.remove_matching(|e| e.kind == kind);
        }
    }

    /// Make the given core's timer the target of unqualified scheduling.
    pub fn set_current_timer(&mut self, core_id: usize) {
        assert!(core_id < self.timers.len(), "No timer for core {core_id}");
        self.current = core_id;
    }

    pub fn current_timer_id(&self) -> usize {
        self.current
    }

    /// Current time of the current timer.
    pub fn ticks(&self) -> Time {
        self.timers[self.current].ticks()
    }

    /// Time of the timer that is furthest ahead.
    pub fn global_ticks(&self) -> Time {
        self.timers.iter().map(EventTimer::ticks).max().unwrap_or(0)
    }

    /// Global time, in microseconds.
    pub fn global_time_us(&self) -> u64 {
        time::ticks_to_us(self.global_ticks())
    }

    pub fn timer(&self, core_id: usize) -> &EventTimer {
        &self.timers[core_id]
    }

    pub fn timer_mut(&mut self, core_id: usize) -> &mut EventTimer {
        &mut self.timers[core_id]
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Tear down: make sure nothing is left behind in any cross-core queue.
    pub fn shutdown(&mut self) {
        for (id, timer) in self.timers.iter_mut().enumerate() {
            timer.move_events();
            log::debug!(
                "Timer {id} shut down at {} ticks with {} events pending",
                timer.ticks(),
                timer.queued_events()
            );
        }
    }

    /// Replace all timers with fresh ones, dropping every pending event.
    /// Event types stay registered.
    pub fn reset(&mut self, config: &SystemConfig) {
        self.timers = (0..config.core_count())
            .map(|_| EventTimer::new(config))
            .collect();
        self.current = 0;
    }
}

impl<S: TimingHost> Timing<S> {
    /// Advance the given core's timer, running all events that are due.
    /// Callbacks get the host and may schedule further events; any
    /// that are due immediately run in this same advance.
    /// Callers are expected to make `core_id` the current timer first.
    pub fn advance(host: &mut S, core_id: usize) {
        host.timing().timers[core_id].begin_advance();
        while let Some((event, late)) = host.timing().timers[core_id].pop_due() {
            let timing = host.timing();
            let callback = Rc::clone(&timing.event_types[event.kind.0].callback);
            log::trace!(
                "Core {core_id}: '{}' ({:#X}) fired {late} ticks late",
                timing.event_types[event.kind.0].name,
                event.user_data
            );
            callback(host, event.user_data, late);
        }
        host.timing().timers[core_id].end_advance();
    }
}
