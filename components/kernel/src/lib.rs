// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

//! Guest kernel objects: threads, their per-core schedulers, and
//! priority-inheriting mutexes.
//! Objects live in arenas owned by [KernelSystem] and refer to each other
//! by id only.

use std::collections::BTreeMap;

pub use errors::{KernelError, ResultCode};
pub use mutex::{Mutex, MutexId, WaitResult};
pub use thread::{Thread, ThreadId, ThreadManager, ThreadStatus, THREAD_PRIO_HIGHEST, THREAD_PRIO_LOWEST};
pub use wait_queue::WaitQueue;

pub mod errors;
pub mod mutex;
pub mod thread;
pub mod wait_queue;

pub struct KernelSystem {
    pub(crate) threads: BTreeMap<ThreadId, Thread>,
    pub(crate) mutexes: BTreeMap<MutexId, Mutex>,
    thread_managers: Vec<ThreadManager>,
    running_core: usize,

    next_thread_id: u32,
    pub(crate) next_object_id: u32,
    /// Stamps threads becoming ready, for FIFO order among equal priorities.
    ready_counter: u64,
    reschedule_pending: bool,
}

impl KernelSystem {
    pub fn new(core_count: usize) -> Self {
        assert!(core_count > 0, "Kernel needs at least one core");
        Self {
            threads: BTreeMap::new(),
            mutexes: BTreeMap::new(),
            thread_managers: (0..core_count).map(ThreadManager::new).collect(),
            running_core: 0,
            next_thread_id: 1,
            next_object_id: 1,
            ready_counter: 0,
            reschedule_pending: false,
        }
    }

    pub fn core_count(&self) -> usize {
        self.thread_managers.len()
    }

    pub fn set_running_core(&mut self, core_id: usize) {
        assert!(core_id < self.core_count(), "Core {core_id} does not exist");
        self.running_core = core_id;
    }

    pub fn running_core(&self) -> usize {
        self.running_core
    }

    pub fn thread_manager(&self, core_id: usize) -> &ThreadManager {
        &self.thread_managers[core_id]
    }

    /// The thread executing on the running core.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.thread_managers[self.running_core].current_thread()
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn create_thread(
        &mut self,
        name: impl Into<String>,
        priority: u32,
        core_id: usize,
    ) -> Result<ThreadId, KernelError> {
        if priority > THREAD_PRIO_LOWEST {
            return Err(KernelError::OutOfRange);
        }
        if core_id >= self.core_count() {
            return Err(KernelError::OutOfRange);
        }

        let id = ThreadId(self.next_thread_id);
        self.next_thread_id += 1;
        let mut thread = Thread::new(id, name.into(), priority, core_id);
        thread.ready_since = self.next_ready_stamp();
        log::debug!("Created thread {id} '{}' on core {core_id} with priority {priority}", thread.name);
        self.threads.insert(id, thread);
        self.prepare_reschedule();
        Ok(id)
    }

    /// Change the nominal priority of a thread. Donations on top of it
    /// stay in effect.
    pub fn set_thread_priority(&mut self, id: ThreadId, priority: u32) -> Result<(), KernelError> {
        if priority > THREAD_PRIO_LOWEST {
            return Err(KernelError::OutOfRange);
        }
        let thread = self.threads.get_mut(&id).ok_or(KernelError::InvalidHandle)?;
        thread.nominal_priority = priority;
        self.update_thread_priority(id);
        self.prepare_reschedule();
        Ok(())
    }

    /// Terminate a thread. Everything it holds is released and it stops
    /// waiting on anything.
    pub fn exit_thread(&mut self, id: ThreadId) -> Result<(), KernelError> {
        match self.threads.get(&id) {
            Some(t) if t.status != ThreadStatus::Dead => (),
            _ => return Err(KernelError::InvalidHandle),
        }

        self.release_thread_mutexes(id);
        let pending: Vec<_> = self
            .threads
            .get(&id)
            .map(|t| t.pending_mutexes().collect())
            .unwrap_or_default();
        for mutex in pending {
            self.remove_waiting_thread(mutex, id);
        }

        if let Some(t) = self.threads.get_mut(&id) {
            t.status = ThreadStatus::Dead;
            t.wait_object = None;
            log::debug!("Thread {id} '{}' exited", t.name);
        }
        self.prepare_reschedule();
        Ok(())
    }

    /// Run the thread scheduler of the given core.
    pub fn reschedule(&mut self, core_id: usize) {
        let manager = &mut self.thread_managers[core_id];
        manager.reschedule(&mut self.threads, &mut self.ready_counter);
    }

    /// Run the thread scheduler of every core.
    pub fn reschedule_all(&mut self) {
        for core in 0..self.core_count() {
            self.reschedule(core);
        }
    }

    /// Request that threads get rescheduled once the current slice ends.
    /// The running CPU is not interrupted: the execution scheduler takes
    /// the request after the core returns from its slice.
    pub fn prepare_reschedule(&mut self) {
        self.reschedule_pending = true;
    }

    /// Take a pending reschedule request.
    pub fn take_reschedule_request(&mut self) -> bool {
        std::mem::take(&mut self.reschedule_pending)
    }

    /// Recompute the effective priority of a thread from its nominal
    /// priority and the mutexes it holds. Changes propagate into the
    /// mutexes it waits on.
    pub(crate) fn update_thread_priority(&mut self, id: ThreadId) {
        let Some(thread) = self.threads.get(&id) else {
            return;
        };
        let best = thread
            .held_mutexes()
            .filter_map(|m| self.mutexes.get(&m))
            .map(|m| m.priority())
            .fold(thread.nominal_priority, u32::min);
        if best == thread.current_priority {
            return;
        }

        let pending: Vec<_> = thread.pending_mutexes().collect();
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.current_priority = best;
        }
        for mutex in pending {
            self.update_mutex_priority(mutex);
        }
    }

    /// Make a thread that was waiting runnable again.
    pub(crate) fn resume_from_wait(&mut self, id: ThreadId) {
        let stamp = self.next_ready_stamp();
        if let Some(thread) = self.threads.get_mut(&id) {
            if thread.status == ThreadStatus::WaitSynch {
                thread.status = ThreadStatus::Ready;
                thread.ready_since = stamp;
            }
        }
        self.prepare_reschedule();
    }

    fn next_ready_stamp(&mut self) -> u64 {
        let stamp = self.ready_counter;
        self.ready_counter += 1;
        stamp
    }
}
