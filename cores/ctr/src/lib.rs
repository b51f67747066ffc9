// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

//! The emulated system: ARM11 cores, their timers and the guest kernel,
//! driven together by [System::run].

mod cpu;
pub mod testing;

use std::mem;

use common::{
    common::debugger::{DebugStub, ExecutionMode, NoDebugger},
    SystemConfig, TimeS,
};
pub use core_timing::{EventTimer, EventTypeId, Timing, TimingHost};
pub use cpu::CpuCore;
use kernel::KernelSystem;

/// Outcome of one iteration of [System::run].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Success,
    ShutdownRequested,
    /// The system was run before its cores were set up.
    ErrorNotInitialized,
}

pub struct System {
    pub timing: Timing<System>,
    pub kernel: KernelSystem,
    pub debugger: Box<dyn DebugStub>,
    cores: Vec<Box<dyn CpuCore>>,
    running_core: usize,

    reset_requested: bool,
    shutdown_requested: bool,
    config: SystemConfig,
}

impl TimingHost for System {
    fn timing(&mut self) -> &mut Timing<Self> {
        &mut self.timing
    }
}

impl System {
    /// Create a system. It can only run once its cores are set up
    /// with [System::init_cores].
    pub fn new(config: SystemConfig) -> Self {
        Self {
            timing: Timing::new(&config),
            kernel: KernelSystem::new(config.core_count()),
            debugger: Box::new(NoDebugger),
            cores: Vec::new(),
            running_core: 0,
            reset_requested: false,
            shutdown_requested: false,
            config,
        }
    }

    /// Create all cores the configuration provisions.
    pub fn init_cores(&mut self, mut make_core: impl FnMut(usize) -> Box<dyn CpuCore>) {
        self.cores = (0..self.config.core_count()).map(&mut make_core).collect();
        for (id, core) in self.cores.iter().enumerate() {
            assert_eq!(id, core.id(), "Core created with mismatched id");
        }
        log::debug!("Initialized {} ARM11 core(s)", self.cores.len());
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn running_core(&self) -> usize {
        self.running_core
    }

    /// Run one iteration of the scheduler: bring all cores to the same
    /// time, then let them execute a slice.
    pub fn run(&mut self) -> ResultStatus {
        if self.cores.is_empty() || self.cores.len() != self.timing.timer_count() {
            return ResultStatus::ErrorNotInitialized;
        }

        let mode = if self.debugger.is_server_enabled() {
            self.debugger.handle_packet();
            self.debugger.execution_mode()
        } else {
            ExecutionMode::Continuous
        };
        if mode == ExecutionMode::Halted {
            return ResultStatus::Success;
        }

        // All cores should be at the same time. If they are not, an event
        // was scheduled closer than some core's remaining downcount, so
        // the cores behind need to catch up first.
        let global_ticks = self.timing.global_ticks();
        let mut max_delay: TimeS = 0;
        let mut behind_most = None;
        for id in 0..self.cores.len() {
            let ticks = self.timing.timer(id).ticks();
            if ticks < global_ticks {
                let delay = (global_ticks - ticks) as TimeS;
                self.prepare_core(id);
                self.timing.timer_mut(id).set_next_slice(delay);
                if max_delay < delay {
                    max_delay = delay;
                    behind_most = Some(id);
                }
            }
        }

        match behind_most {
            // Small lags from JIT overshoot are not worth syncing
            Some(id) if max_delay > self.config.min_catch_up_delay => {
                log::trace!(
                    "Core {id} running (delayed) for {} ticks",
                    self.timing.timer(id).downcount()
                );
                self.set_running_core(id);
                self.execute(id, mode);
            }
            _ => self.run_together(mode),
        }

        if self.debugger.is_server_enabled() {
            self.debugger.set_cpu_step_flag(false);
        }

        self.reschedule();

        if mem::take(&mut self.reset_requested) {
            self.reset();
        } else if mem::take(&mut self.shutdown_requested) {
            return ResultStatus::ShutdownRequested;
        }
        ResultStatus::Success
    }

    /// All cores are at the same time: run them one after another for
    /// the same amount of ticks.
    fn run_together(&mut self, mode: ExecutionMode) {
        let mut max_slice = self.config.max_slice_length;
        for id in 0..self.cores.len() {
            self.prepare_core(id);
            max_slice = max_slice.min(self.timing.timer(id).max_slice_length());
        }

        for id in 0..self.cores.len() {
            self.timing.timer_mut(id).set_next_slice(max_slice);
            let start_ticks = self.timing.timer(id).ticks();
            log::trace!(
                "Core {id} running for {} ticks",
                self.timing.timer(id).downcount()
            );
            self.set_running_core(id);
            self.execute(id, mode);
            // Cores after this one may not run further than it did
            max_slice = (self.timing.timer(id).ticks() - start_ticks) as TimeS;
        }
    }

    /// Make the core active, run its due events and pick its next thread.
    fn prepare_core(&mut self, id: usize) {
        self.set_running_core(id);
        Timing::advance(self, id);
        self.cores[id].prepare_reschedule();
        self.kernel.reschedule(id);
    }

    /// Let the core execute its slice, or idle through it if it has
    /// no thread to run.
    fn execute(&mut self, id: usize, mode: ExecutionMode) {
        if self.kernel.current_thread().is_none() {
            log::trace!("Core {id} idling");
            self.timing.timer_mut(id).idle();
            self.prepare_reschedule();
            return;
        }

        let timer = self.timing.timer_mut(id);
        let core = &mut self.cores[id];
        match mode {
            ExecutionMode::SingleStep => core.step(timer),
            _ => core.run(timer),
        }
    }

    /// Make the given core the one kernel calls and unqualified event
    /// scheduling refer to.
    pub fn set_running_core(&mut self, id: usize) {
        self.running_core = id;
        self.kernel.set_running_core(id);
        self.timing.set_current_timer(id);
    }

    /// Stop the running core so threads get rescheduled after it.
    pub fn prepare_reschedule(&mut self) {
        if let Some(core) = self.cores.get_mut(self.running_core) {
            core.prepare_reschedule();
        }
        self.kernel.prepare_reschedule();
    }

    /// Reschedule the threads of every core, if any kernel activity
    /// asked for it.
    fn reschedule(&mut self) {
        if self.kernel.take_reschedule_request() {
            self.kernel.reschedule_all();
        }
    }

    /// Invalidate cached guest code on every core.
    pub fn invalidate_cache_range(&mut self, addr: u32, len: usize) {
        for core in &mut self.cores {
            core.invalidate_cache_range(addr, len);
        }
    }

    /// Reset the system at the end of the current iteration.
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    /// Stop the system at the end of the current iteration.
    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    /// Rebuild timing and the kernel from the configuration.
    /// Cores and registered event types are kept.
    pub fn reset(&mut self) {
        log::info!("Resetting system");
        self.shutdown();
        self.timing.reset(&self.config);
        self.running_core = 0;
    }

    /// Tear down timing and the kernel.
    pub fn shutdown(&mut self) {
        self.timing.shutdown();
        self.kernel = KernelSystem::new(self.config.core_count());
        log::debug!("System shut down");
    }
}
