// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use std::{fmt, mem};

use crate::{
    errors::KernelError,
    thread::{ThreadId, ThreadStatus, THREAD_PRIO_LOWEST},
    wait_queue::WaitQueue,
    KernelSystem,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutexId(pub u32);

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A re-entrant kernel mutex. While held, its holder runs with at least
/// the priority of the best thread waiting on it.
#[derive(Debug)]
pub struct Mutex {
    name: String,
    /// Times the holder acquired it without releasing.
    lock_count: u32,
    holder: Option<ThreadId>,
    /// Priority donated to the holder.
    priority: u32,
    waiters: WaitQueue,
    /// Open handles to this mutex.
    refs: u32,
}

impl Mutex {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn holder(&self) -> Option<ThreadId> {
        self.holder
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }
}

/// Outcome of a thread waiting on a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The mutex was acquired immediately.
    Acquired,
    /// The thread was put to sleep until the mutex is handed to it.
    Blocked,
}

impl KernelSystem {
    /// Create a mutex. If `initial_locked` is set, it is acquired by
    /// the thread currently running on the running core.
    pub fn create_mutex(
        &mut self,
        initial_locked: bool,
        name: impl Into<String>,
    ) -> Result<MutexId, KernelError> {
        let id = MutexId(self.next_object_id);
        self.next_object_id += 1;
        self.mutexes.insert(
            id,
            Mutex {
                name: name.into(),
                lock_count: 0,
                holder: None,
                priority: THREAD_PRIO_LOWEST,
                waiters: WaitQueue::default(),
                refs: 1,
            },
        );
        log::debug!("Created mutex {id} '{}'", self.mutexes[&id].name);

        if initial_locked {
            let Some(thread) = self.current_thread() else {
                panic!("Mutex {id} created locked without a running thread");
            };
            self.acquire_mutex(id, thread)?;
        }
        Ok(id)
    }

    pub fn mutex(&self, id: MutexId) -> Option<&Mutex> {
        self.mutexes.get(&id)
    }

    /// If the given thread would have to wait to acquire the mutex.
    /// False for a mutex that does not exist.
    pub fn should_wait(&self, id: MutexId, thread: ThreadId) -> bool {
        self.mutexes
            .get(&id)
            .is_some_and(|m| m.lock_count > 0 && m.holder != Some(thread))
    }

    /// Acquire the mutex for the thread. The thread must be able to
    /// acquire it without waiting.
    pub fn acquire_mutex(&mut self, id: MutexId, thread: ThreadId) -> Result<(), KernelError> {
        let mutex = self.mutexes.get(&id).ok_or(KernelError::InvalidHandle)?;
        let acquirer = self.threads.get(&thread).ok_or(KernelError::InvalidHandle)?;
        assert!(
            !self.should_wait(id, thread),
            "Thread {thread} acquired mutex {id} which is unavailable to it"
        );

        if mutex.lock_count == 0 {
            let thread_prio = acquirer.current_priority;
            if let Some(mutex) = self.mutexes.get_mut(&id) {
                mutex.priority = thread_prio;
                mutex.holder = Some(thread);
            }
            if let Some(t) = self.threads.get_mut(&thread) {
                t.held_mutexes.insert(id);
            }
            self.update_thread_priority(thread);
            self.prepare_reschedule();
        }

        if let Some(mutex) = self.mutexes.get_mut(&id) {
            mutex.lock_count += 1;
        }
        Ok(())
    }

    /// Release one level of the mutex on behalf of the thread.
    pub fn release_mutex(&mut self, id: MutexId, thread: ThreadId) -> Result<(), KernelError> {
        let mutex = self.mutexes.get_mut(&id).ok_or(KernelError::InvalidHandle)?;

        if mutex.holder != Some(thread) {
            if let Some(holder) = mutex.holder {
                log::error!(
                    "Tried to release mutex {id} (owned by thread id {holder}) from a different thread id {thread}"
                );
            }
            return Err(KernelError::WrongLockingThread);
        }

        // Held with a zero count; guests still get a code for it
        if mutex.lock_count == 0 {
            return Err(KernelError::InvalidResultValue);
        }

        mutex.lock_count -= 1;
        if mutex.lock_count == 0 {
            if let Some(t) = self.threads.get_mut(&thread) {
                t.held_mutexes.remove(&id);
            }
            self.update_thread_priority(thread);
            if let Some(mutex) = self.mutexes.get_mut(&id) {
                mutex.holder = None;
            }
            self.wakeup_all_waiting_threads(id);
            self.destroy_if_unused(id);
            self.prepare_reschedule();
        }
        Ok(())
    }

    /// Wait on the mutex: acquire it if possible, otherwise block the
    /// thread until it is handed over.
    pub fn wait_synchronization(
        &mut self,
        thread: ThreadId,
        id: MutexId,
    ) -> Result<WaitResult, KernelError> {
        if self.open_mutex(id).is_none() {
            return Err(KernelError::InvalidHandle);
        }
        match self.threads.get(&thread) {
            Some(t) if t.status != ThreadStatus::Dead => (),
            _ => return Err(KernelError::InvalidHandle),
        }

        if !self.should_wait(id, thread) {
            self.acquire_mutex(id, thread)?;
            return Ok(WaitResult::Acquired);
        }

        if let Some(t) = self.threads.get_mut(&thread) {
            t.status = ThreadStatus::WaitSynch;
            t.wait_object = Some(id);
        }
        self.add_waiting_thread(id, thread);
        self.prepare_reschedule();
        Ok(WaitResult::Blocked)
    }

    /// Open another handle to the mutex.
    pub fn duplicate_mutex(&mut self, id: MutexId) -> Result<(), KernelError> {
        let mutex = self.open_mutex_mut(id).ok_or(KernelError::InvalidHandle)?;
        mutex.refs += 1;
        Ok(())
    }

    /// Close a handle to the mutex. Once the last handle is closed, the
    /// mutex lives on until its holder and all waiters are done with it.
    pub fn close_mutex(&mut self, id: MutexId) -> Result<(), KernelError> {
        let mutex = self.open_mutex_mut(id).ok_or(KernelError::InvalidHandle)?;
        mutex.refs -= 1;
        self.destroy_if_unused(id);
        Ok(())
    }

    /// A mutex the guest still has a handle to.
    fn open_mutex(&self, id: MutexId) -> Option<&Mutex> {
        self.mutexes.get(&id).filter(|m| m.refs > 0)
    }

    fn open_mutex_mut(&mut self, id: MutexId) -> Option<&mut Mutex> {
        self.mutexes.get_mut(&id).filter(|m| m.refs > 0)
    }

    /// Free the mutex if no handle, holder or waiter refers to it anymore.
    fn destroy_if_unused(&mut self, id: MutexId) {
        let unused = self
            .mutexes
            .get(&id)
            .is_some_and(|m| m.refs == 0 && m.holder.is_none() && m.waiters.is_empty());
        if unused {
            if let Some(mutex) = self.mutexes.remove(&id) {
                log::debug!("Destroyed mutex {id} '{}'", mutex.name);
            }
        }
    }

    /// Forcefully release every mutex held by a thread, for when it
    /// terminates while still holding them.
    pub fn release_thread_mutexes(&mut self, thread: ThreadId) {
        let held = match self.threads.get_mut(&thread) {
            Some(t) => mem::take(&mut t.held_mutexes),
            None => return,
        };

        for id in held {
            if let Some(mutex) = self.mutexes.get_mut(&id) {
                mutex.lock_count = 0;
                mutex.holder = None;
            }
            self.wakeup_all_waiting_threads(id);
            self.destroy_if_unused(id);
        }
        self.update_thread_priority(thread);
    }

    pub(crate) fn add_waiting_thread(&mut self, id: MutexId, thread: ThreadId) {
        if let Some(mutex) = self.mutexes.get_mut(&id) {
            mutex.waiters.add(thread);
        }
        if let Some(t) = self.threads.get_mut(&thread) {
            t.pending_mutexes.insert(id);
        }
        self.update_mutex_priority(id);
    }

    pub(crate) fn remove_waiting_thread(&mut self, id: MutexId, thread: ThreadId) {
        if let Some(mutex) = self.mutexes.get_mut(&id) {
            mutex.waiters.remove(thread);
        }
        if let Some(t) = self.threads.get_mut(&thread) {
            t.pending_mutexes.remove(&id);
        }
        self.update_mutex_priority(id);
        self.destroy_if_unused(id);
    }

    /// Recompute the priority the mutex donates to its holder from
    /// the best waiter.
    pub(crate) fn update_mutex_priority(&mut self, id: MutexId) {
        let Some(mutex) = self.mutexes.get(&id) else {
            return;
        };
        let Some(holder) = mutex.holder else {
            return;
        };

        let best_priority = mutex
            .waiters
            .iter()
            .filter_map(|t| self.threads.get(&t))
            .map(|t| t.current_priority)
            .fold(THREAD_PRIO_LOWEST, u32::min);

        if best_priority != mutex.priority {
            if let Some(mutex) = self.mutexes.get_mut(&id) {
                mutex.priority = best_priority;
            }
            self.update_thread_priority(holder);
        }
    }

    /// Hand the mutex to waiting threads for as long as one of them
    /// can take it, best priority first.
    fn wakeup_all_waiting_threads(&mut self, id: MutexId) {
        while let Some(thread) = self.highest_priority_ready_waiter(id) {
            if self.acquire_mutex(id, thread).is_err() {
                break;
            }
            self.remove_waiting_thread(id, thread);
            if let Some(t) = self.threads.get_mut(&thread) {
                t.wait_object = None;
            }
            self.resume_from_wait(thread);
        }
    }

    fn highest_priority_ready_waiter(&self, id: MutexId) -> Option<ThreadId> {
        let mutex = self.mutexes.get(&id)?;
        mutex
            .waiters
            .iter()
            .filter_map(|t| self.threads.get(&t))
            .filter(|t| t.status == ThreadStatus::WaitSynch && !self.should_wait(id, t.id))
            // min_by_key keeps the first of equal elements: earliest waiter wins ties
            .min_by_key(|t| t.current_priority)
            .map(|t| t.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Kernel with a single core and threads of the given priorities.
    fn kernel(priorities: &[u32]) -> (KernelSystem, Vec<ThreadId>) {
        let mut kernel = KernelSystem::new(1);
        let threads = priorities
            .iter()
            .enumerate()
            .map(|(i, prio)| kernel.create_thread(format!("t{i}"), *prio, 0).unwrap())
            .collect();
        (kernel, threads)
    }

    #[test]
    fn reentrant_lock_needs_matching_releases() {
        let (mut k, t) = kernel(&[30]);
        let m = k.create_mutex(false, "m").unwrap();
        for _ in 0..3 {
            assert_eq!(Ok(WaitResult::Acquired), k.wait_synchronization(t[0], m));
            assert_eq!(Some(t[0]), k.mutex(m).unwrap().holder());
        }
        assert_eq!(3, k.mutex(m).unwrap().lock_count());

        for remaining in (0..3).rev() {
            assert_eq!(Ok(()), k.release_mutex(m, t[0]));
            assert_eq!(remaining, k.mutex(m).unwrap().lock_count());
        }
        assert_eq!(None, k.mutex(m).unwrap().holder());
        assert_eq!(0, k.thread(t[0]).unwrap().held_mutexes().count());
        assert_eq!(Err(KernelError::WrongLockingThread), k.release_mutex(m, t[0]));
    }

    #[test]
    fn should_wait_only_for_others() {
        let (mut k, t) = kernel(&[30, 30]);
        let m = k.create_mutex(false, "m").unwrap();
        assert!(!k.should_wait(m, t[0]));
        assert!(!k.should_wait(m, t[1]));
        k.acquire_mutex(m, t[0]).unwrap();
        assert!(!k.should_wait(m, t[0]));
        assert!(k.should_wait(m, t[1]));
    }

    #[test]
    #[should_panic]
    fn acquire_unavailable_panics() {
        let (mut k, t) = kernel(&[30, 30]);
        let m = k.create_mutex(false, "m").unwrap();
        k.acquire_mutex(m, t[0]).unwrap();
        k.acquire_mutex(m, t[1]).unwrap();
    }

    #[test]
    fn donation_and_revert() {
        let (mut k, t) = kernel(&[30, 10]);
        let m = k.create_mutex(false, "m").unwrap();
        assert_eq!(Ok(WaitResult::Acquired), k.wait_synchronization(t[0], m));
        assert_eq!(30, k.mutex(m).unwrap().priority());

        assert_eq!(Ok(WaitResult::Blocked), k.wait_synchronization(t[1], m));
        assert_eq!(10, k.thread(t[0]).unwrap().current_priority);
        assert_eq!(10, k.mutex(m).unwrap().priority());
        assert_eq!(vec![m], k.thread(t[1]).unwrap().pending_mutexes().collect::<Vec<_>>());

        assert_eq!(Ok(()), k.release_mutex(m, t[0]));
        assert_eq!(30, k.thread(t[0]).unwrap().current_priority);

        // The waiter got the mutex handed over and is runnable again
        assert_eq!(Some(t[1]), k.mutex(m).unwrap().holder());
        assert_eq!(ThreadStatus::Ready, k.thread(t[1]).unwrap().status);
        assert_eq!(0, k.thread(t[1]).unwrap().pending_mutexes().count());
        assert_eq!(vec![m], k.thread(t[1]).unwrap().held_mutexes().collect::<Vec<_>>());
    }

    #[test]
    fn wrong_thread_release_changes_nothing() {
        let (mut k, t) = kernel(&[30, 20]);
        let m = k.create_mutex(false, "m").unwrap();
        k.acquire_mutex(m, t[0]).unwrap();
        k.acquire_mutex(m, t[0]).unwrap();

        assert_eq!(Err(KernelError::WrongLockingThread), k.release_mutex(m, t[1]));
        assert_eq!(2, k.mutex(m).unwrap().lock_count());
        assert_eq!(Some(t[0]), k.mutex(m).unwrap().holder());
        assert_eq!(
            Err(KernelError::InvalidHandle),
            k.release_mutex(MutexId(999), t[0])
        );
    }

    #[test]
    fn donation_cascades_through_nested_locks() {
        // t0 holds a, t1 holds b and waits on a, t2 waits on b
        let (mut k, t) = kernel(&[40, 30, 5]);
        let a = k.create_mutex(false, "a").unwrap();
        let b = k.create_mutex(false, "b").unwrap();
        k.wait_synchronization(t[0], a).unwrap();
        k.wait_synchronization(t[1], b).unwrap();
        assert_eq!(Ok(WaitResult::Blocked), k.wait_synchronization(t[1], a));
        assert_eq!(30, k.thread(t[0]).unwrap().current_priority);

        assert_eq!(Ok(WaitResult::Blocked), k.wait_synchronization(t[2], b));
        assert_eq!(5, k.thread(t[1]).unwrap().current_priority);
        assert_eq!(5, k.thread(t[0]).unwrap().current_priority);

        // t0 lets go of a: t1 takes it and keeps the donation from t2
        k.release_mutex(a, t[0]).unwrap();
        assert_eq!(40, k.thread(t[0]).unwrap().current_priority);
        assert_eq!(Some(t[1]), k.mutex(a).unwrap().holder());
        assert_eq!(5, k.thread(t[1]).unwrap().current_priority);
    }

    #[test]
    fn best_waiter_gets_mutex_first() {
        let (mut k, t) = kernel(&[30, 25, 12, 12]);
        let m = k.create_mutex(false, "m").unwrap();
        k.wait_synchronization(t[0], m).unwrap();
        k.wait_synchronization(t[1], m).unwrap();
        k.wait_synchronization(t[2], m).unwrap();
        k.wait_synchronization(t[3], m).unwrap();

        k.release_mutex(m, t[0]).unwrap();
        assert_eq!(Some(t[2]), k.mutex(m).unwrap().holder());
        // Those left still donate to the new holder
        assert_eq!(12, k.mutex(m).unwrap().priority());
        assert_eq!(2, k.mutex(m).unwrap().waiters().len());
        assert_eq!(ThreadStatus::WaitSynch, k.thread(t[3]).unwrap().status);

        k.release_mutex(m, t[2]).unwrap();
        assert_eq!(Some(t[3]), k.mutex(m).unwrap().holder());
        assert_eq!(25, k.mutex(m).unwrap().priority());
    }

    #[test]
    fn bulk_release_wakes_waiters() {
        let (mut k, t) = kernel(&[30, 20, 10]);
        let a = k.create_mutex(false, "a").unwrap();
        let b = k.create_mutex(false, "b").unwrap();
        k.acquire_mutex(a, t[0]).unwrap();
        k.acquire_mutex(a, t[0]).unwrap();
        k.acquire_mutex(b, t[0]).unwrap();
        k.wait_synchronization(t[1], a).unwrap();
        k.wait_synchronization(t[2], b).unwrap();

        k.release_thread_mutexes(t[0]);
        assert_eq!(0, k.thread(t[0]).unwrap().held_mutexes().count());
        assert_eq!(Some(t[1]), k.mutex(a).unwrap().holder());
        assert_eq!(1, k.mutex(a).unwrap().lock_count());
        assert_eq!(Some(t[2]), k.mutex(b).unwrap().holder());
    }

    #[test]
    fn created_locked_by_running_thread() {
        let (mut k, t) = kernel(&[30]);
        k.reschedule(0);
        let m = k.create_mutex(true, "m").unwrap();
        assert_eq!(Some(t[0]), k.mutex(m).unwrap().holder());
        assert_eq!(1, k.mutex(m).unwrap().lock_count());
        assert!(k.take_reschedule_request());
    }

    #[test]
    fn stale_ids_are_rejected() {
        let (mut k, t) = kernel(&[30]);
        assert!(!k.should_wait(MutexId(999), t[0]));
        assert_eq!(
            Err(KernelError::InvalidHandle),
            k.acquire_mutex(MutexId(999), t[0])
        );

        let m = k.create_mutex(false, "m").unwrap();
        assert_eq!(
            Err(KernelError::InvalidHandle),
            k.acquire_mutex(m, ThreadId(999))
        );
        assert_eq!(0, k.mutex(m).unwrap().lock_count());
    }

    #[test]
    fn closing_last_handle_destroys_unused_mutex() {
        let (mut k, t) = kernel(&[30]);
        let m = k.create_mutex(false, "m").unwrap();
        k.duplicate_mutex(m).unwrap();

        k.close_mutex(m).unwrap();
        assert!(k.mutex(m).is_some());
        k.close_mutex(m).unwrap();
        assert!(k.mutex(m).is_none());
        assert_eq!(Err(KernelError::InvalidHandle), k.close_mutex(m));
        assert_eq!(
            Err(KernelError::InvalidHandle),
            k.wait_synchronization(t[0], m)
        );
    }

    #[test]
    fn closed_mutex_lives_until_holder_and_waiters_are_done() {
        let (mut k, t) = kernel(&[30, 10]);
        let m = k.create_mutex(false, "m").unwrap();
        k.wait_synchronization(t[0], m).unwrap();
        k.wait_synchronization(t[1], m).unwrap();

        k.close_mutex(m).unwrap();
        assert_eq!(Some(t[0]), k.mutex(m).unwrap().holder());
        assert_eq!(10, k.thread(t[0]).unwrap().current_priority);
        assert_eq!(Err(KernelError::InvalidHandle), k.close_mutex(m));
        assert_eq!(Err(KernelError::InvalidHandle), k.duplicate_mutex(m));

        // The holder dies without releasing: the waiter still gets the mutex
        k.exit_thread(t[0]).unwrap();
        assert_eq!(Some(t[1]), k.mutex(m).unwrap().holder());
        assert_eq!(ThreadStatus::Ready, k.thread(t[1]).unwrap().status);
        k.reschedule(0);
        assert_eq!(Some(t[1]), k.current_thread());

        k.release_mutex(m, t[1]).unwrap();
        assert!(k.mutex(m).is_none());
        assert_eq!(0, k.thread(t[1]).unwrap().held_mutexes().count());
    }

    #[test]
    fn closed_mutex_goes_away_with_its_last_waiter() {
        let (mut k, t) = kernel(&[30, 10]);
        let m = k.create_mutex(false, "m").unwrap();
        k.wait_synchronization(t[0], m).unwrap();
        k.wait_synchronization(t[1], m).unwrap();
        k.close_mutex(m).unwrap();

        k.release_mutex(m, t[0]).unwrap();
        assert_eq!(Some(t[1]), k.mutex(m).unwrap().holder());
        k.exit_thread(t[1]).unwrap();
        assert!(k.mutex(m).is_none());
    }
}
