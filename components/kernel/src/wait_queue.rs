// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use crate::thread::ThreadId;

/// Threads blocked on a synchronization object, in the order they
/// started waiting.
#[derive(Debug, Default, Clone)]
pub struct WaitQueue {
    waiters: Vec<ThreadId>,
}

impl WaitQueue {
    /// Add a thread. Adding a thread that is already waiting does nothing.
    pub fn add(&mut self, thread: ThreadId) {
        if !self.contains(thread) {
            self.waiters.push(thread);
        }
    }

    /// Remove a thread, returning if it was waiting.
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|t| *t != thread);
        before != self.waiters.len()
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.waiters.contains(&thread)
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Take all waiters out of the queue.
    pub fn take(&mut self) -> Vec<ThreadId> {
        std::mem::take(&mut self.waiters)
    }
}
