// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

//! A CPU core that executes nothing and only burns ticks, for driving
//! the scheduler without a real CPU.

use std::{cell::RefCell, rc::Rc};

use core_timing::EventTimer;

use crate::cpu::CpuCore;

/// What a [SyntheticCore] was asked to do so far.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoreStats {
    pub runs: usize,
    pub steps: usize,
    pub reschedules: usize,
    pub invalidations: usize,
    /// Downcount of the timer at the start of every run.
    pub slices: Vec<i64>,
}

pub type SharedStats = Rc<RefCell<CoreStats>>;

pub struct SyntheticCore {
    id: usize,
    /// Extra ticks charged after every run, like a JIT finishing
    /// its block past the end of the slice.
    overshoot: u64,
    /// Most ticks a run executes before stopping on its own,
    /// like a thread yielding early.
    budget: Option<u64>,
    stats: SharedStats,
}

impl SyntheticCore {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            overshoot: 0,
            budget: None,
            stats: SharedStats::default(),
        }
    }

    pub fn with_overshoot(mut self, overshoot: u64) -> Self {
        self.overshoot = overshoot;
        self
    }

    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Handle to the statistics, which stays valid after the core is
    /// given to the system.
    pub fn stats(&self) -> SharedStats {
        Rc::clone(&self.stats)
    }
}

impl CpuCore for SyntheticCore {
    fn id(&self) -> usize {
        self.id
    }

    fn run(&mut self, timer: &mut EventTimer) {
        let downcount = timer.downcount();
        let mut stats = self.stats.borrow_mut();
        stats.runs += 1;
        stats.slices.push(downcount);
        let slice = downcount.max(0) as u64;
        let executed = self.budget.map_or(slice, |budget| budget.min(slice));
        timer.add_ticks(executed + self.overshoot);
    }

    fn step(&mut self, timer: &mut EventTimer) {
        self.stats.borrow_mut().steps += 1;
        timer.add_ticks(1);
    }

    fn prepare_reschedule(&mut self) {
        self.stats.borrow_mut().reschedules += 1;
    }

    fn invalidate_cache_range(&mut self, addr: u32, len: usize) {
        log::trace!("Core {}: invalidating {len:#X} bytes at {addr:#010X}", self.id);
        self.stats.borrow_mut().invalidations += 1;
    }
}
