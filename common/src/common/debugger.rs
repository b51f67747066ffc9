// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

/// How the scheduler should treat the next tick of the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Run cores for their full slices.
    #[default]
    Continuous,
    /// Execute a single instruction on every core that gets to run.
    SingleStep,
    /// Do not execute anything; timers stay where they are.
    Halted,
}

/// Contract for a remote debugger connected to the system.
/// The transport behind it is of no concern to the scheduler,
/// which only looks at the flags.
pub trait DebugStub {
    /// If a debugger server is active at all. When this is false,
    /// none of the other functions are consulted.
    fn is_server_enabled(&self) -> bool;
    /// Process any packets the debugger sent since the last tick.
    fn handle_packet(&mut self);
    /// If the debugger requested the CPU to be halted.
    fn cpu_halt_flag(&self) -> bool;
    /// If the debugger requested a single step.
    fn cpu_step_flag(&self) -> bool;
    /// Set or clear the single step request.
    fn set_cpu_step_flag(&mut self, step: bool);

    /// Mode the next tick should execute in.
    fn execution_mode(&self) -> ExecutionMode {
        if !self.is_server_enabled() || !self.cpu_halt_flag() {
            ExecutionMode::Continuous
        } else if self.cpu_step_flag() {
            ExecutionMode::SingleStep
        } else {
            ExecutionMode::Halted
        }
    }
}

/// Debug stub for when no debugger is attached.
#[derive(Default)]
pub struct NoDebugger;

impl DebugStub for NoDebugger {
    fn is_server_enabled(&self) -> bool {
        false
    }

    fn handle_packet(&mut self) {}

    fn cpu_halt_flag(&self) -> bool {
        false
    }

    fn cpu_step_flag(&self) -> bool {
        false
    }

    fn set_cpu_step_flag(&mut self, _step: bool) {}
}

/// A debug stub that is driven by setting its flags directly,
/// for example from a frontend or from tests.
#[derive(Debug, Default)]
pub struct ManualDebugger {
    /// If the stub should be considered enabled.
    pub enabled: bool,
    /// Halt request.
    pub halt: bool,
    /// Step request. Cleared by the scheduler after every tick.
    pub step: bool,
    /// How many times packets were handled.
    pub packets_handled: usize,
}

impl ManualDebugger {
    /// Put the stub into the given mode.
    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.enabled = true;
        match mode {
            ExecutionMode::Continuous => self.halt = false,
            ExecutionMode::SingleStep => {
                self.halt = true;
                self.step = true;
            }
            ExecutionMode::Halted => {
                self.halt = true;
                self.step = false;
            }
        }
    }
}

impl DebugStub for ManualDebugger {
    fn is_server_enabled(&self) -> bool {
        self.enabled
    }

    fn handle_packet(&mut self) {
        self.packets_handled += 1;
    }

    fn cpu_halt_flag(&self) -> bool {
        self.halt
    }

    fn cpu_step_flag(&self) -> bool {
        self.step
    }

    fn set_cpu_step_flag(&mut self, step: bool) {
        self.step = step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_flags() {
        let mut dbg = ManualDebugger::default();
        assert_eq!(ExecutionMode::Continuous, dbg.execution_mode());

        // Halt without the server being enabled is ignored
        dbg.halt = true;
        assert_eq!(ExecutionMode::Continuous, dbg.execution_mode());

        dbg.set_mode(ExecutionMode::Halted);
        assert_eq!(ExecutionMode::Halted, dbg.execution_mode());
        dbg.set_mode(ExecutionMode::SingleStep);
        assert_eq!(ExecutionMode::SingleStep, dbg.execution_mode());
        dbg.set_cpu_step_flag(false);
        assert_eq!(ExecutionMode::Halted, dbg.execution_mode());
        dbg.set_mode(ExecutionMode::Continuous);
        assert_eq!(ExecutionMode::Continuous, dbg.execution_mode());
    }

    #[test]
    fn no_debugger_always_continues() {
        assert_eq!(ExecutionMode::Continuous, NoDebugger.execution_mode());
    }
}
