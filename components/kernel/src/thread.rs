// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use crate::mutex::MutexId;

/// Highest priority a thread can have. Lower is more important.
pub const THREAD_PRIO_HIGHEST: u32 = 0;
/// Lowest priority a thread can have.
pub const THREAD_PRIO_LOWEST: u32 = 63;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Currently executing on its core.
    Running,
    /// Runnable, waiting for its core to pick it.
    Ready,
    /// Blocked on a synchronization object.
    WaitSynch,
    /// Exited; kept around so its id stays valid.
    Dead,
}

/// A guest thread.
#[derive(Debug)]
pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    /// Priority the thread was given.
    pub nominal_priority: u32,
    /// Priority the thread runs with, including donations.
    pub current_priority: u32,
    pub status: ThreadStatus,
    /// Core the thread is scheduled on.
    pub core_id: usize,

    /// Used to order ready threads of the same priority.
    pub(crate) ready_since: u64,
    /// Object the thread is blocked on.
    pub(crate) wait_object: Option<MutexId>,
    pub(crate) held_mutexes: BTreeSet<MutexId>,
    pub(crate) pending_mutexes: BTreeSet<MutexId>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, name: String, priority: u32, core_id: usize) -> Self {
        Self {
            id,
            name,
            nominal_priority: priority,
            current_priority: priority,
            status: ThreadStatus::Ready,
            core_id,
            ready_since: 0,
            wait_object: None,
            held_mutexes: BTreeSet::new(),
            pending_mutexes: BTreeSet::new(),
        }
    }

    /// Mutexes this thread currently owns.
    pub fn held_mutexes(&self) -> impl Iterator<Item = MutexId> + '_ {
        self.held_mutexes.iter().copied()
    }

    /// Mutexes this thread is blocked on.
    pub fn pending_mutexes(&self) -> impl Iterator<Item = MutexId> + '_ {
        self.pending_mutexes.iter().copied()
    }

    pub fn wait_object(&self) -> Option<MutexId> {
        self.wait_object
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.status, ThreadStatus::Running | ThreadStatus::Ready)
    }
}

/// Cooperative thread scheduler of a single core.
#[derive(Debug)]
pub struct ThreadManager {
    core_id: usize,
    current: Option<ThreadId>,
}

impl ThreadManager {
    pub(crate) fn new(core_id: usize) -> Self {
        Self {
            core_id,
            current: None,
        }
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }

    /// The thread this core is executing, if any.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current
    }

    /// Pick the thread to run next.
    /// A running thread keeps the core unless a ready thread with a strictly
    /// better priority exists; otherwise the best ready thread is taken,
    /// the one that became ready first among equals.
    pub(crate) fn reschedule(
        &mut self,
        threads: &mut BTreeMap<ThreadId, Thread>,
        ready_counter: &mut u64,
    ) {
        let running = self
            .current
            .filter(|id| threads.get(id).map_or(false, |t| t.status == ThreadStatus::Running));
        let bound = running
            .and_then(|id| threads.get(&id))
            .map(|t| t.current_priority);

        let next = threads
            .values()
            .filter(|t| t.core_id == self.core_id && t.status == ThreadStatus::Ready)
            .filter(|t| bound.map_or(true, |prio| t.current_priority < prio))
            .min_by_key(|t| (t.current_priority, t.ready_since))
            .map(|t| t.id);

        match (running, next) {
            (_, Some(next)) => {
                if let Some(prev) = running.and_then(|id| threads.get_mut(&id)) {
                    prev.status = ThreadStatus::Ready;
                    prev.ready_since = *ready_counter;
                    *ready_counter += 1;
                }
                if let Some(next) = threads.get_mut(&next) {
                    next.status = ThreadStatus::Running;
                }
                log::trace!(
                    "Core {}: switching from {:?} to thread {next}",
                    self.core_id,
                    running
                );
                self.current = Some(next);
            }
            (Some(_), None) => (),
            (None, None) => {
                if self.current.is_some() {
                    log::trace!("Core {}: no thread to run", self.core_id);
                }
                self.current = None;
            }
        }
    }
}
