// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use super::time::{TimeS, DEFAULT_SLICE_LENGTH};

/// Configuration used when initializing the system.
/// These options don't change at runtime; a reset rebuilds the
/// system from them.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde_config", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde_config", serde(default))]
pub struct SystemConfig {
    /// If the second ARM11 core should be provisioned.
    pub enable_core_2: bool,
    /// Upper bound for the slice all cores run together for.
    pub max_slice_length: TimeS,
    /// Slice length a freshly created timer starts with.
    pub initial_slice_length: TimeS,
    /// Downcount a freshly created timer starts with.
    pub initial_downcount: TimeS,
    /// Maximum slice length reported by a timer with no queued events.
    pub empty_queue_slice_length: TimeS,
    /// Cores lagging behind the global time by at most this many ticks
    /// are not caught up on their own.
    pub min_catch_up_delay: TimeS,
    /// Charge a fixed amount of ticks per [add_ticks] call instead of
    /// the amount reported by the CPU.
    pub use_custom_cpu_ticks: bool,
    /// Ticks charged per call when [use_custom_cpu_ticks] is set.
    pub custom_cpu_ticks: u64,
    /// Emulated CPU speed, in percent of the real clock.
    /// Below 100 makes every instruction cost more ticks.
    pub cpu_clock_percentage: u32,
}

impl SystemConfig {
    /// Amount of ARM11 cores this configuration provisions.
    pub fn core_count(&self) -> usize {
        if self.enable_core_2 {
            2
        } else {
            1
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            enable_core_2: false,
            max_slice_length: DEFAULT_SLICE_LENGTH,
            initial_slice_length: DEFAULT_SLICE_LENGTH,
            initial_downcount: DEFAULT_SLICE_LENGTH,
            empty_queue_slice_length: DEFAULT_SLICE_LENGTH,
            min_catch_up_delay: 100,
            use_custom_cpu_ticks: false,
            custom_cpu_ticks: 77,
            cpu_clock_percentage: 100,
        }
    }
}
