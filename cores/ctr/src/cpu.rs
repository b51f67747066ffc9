// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use core_timing::EventTimer;

/// Interface to one emulated ARM11 core, regardless of how it executes
/// instructions. The core charges executed instructions to the timer it
/// is given with [EventTimer::add_ticks].
pub trait CpuCore {
    /// Index of this core, also the index of its timer.
    fn id(&self) -> usize;

    /// Execute until the timer's downcount is used up.
    fn run(&mut self, timer: &mut EventTimer);

    /// Execute a single instruction.
    fn step(&mut self, timer: &mut EventTimer);

    /// Stop execution at the next opportunity, since the thread running
    /// on this core might change.
    fn prepare_reschedule(&mut self);

    /// Drop any cached translations of guest code in the given range.
    fn invalidate_cache_range(&mut self, addr: u32, len: usize);
}
