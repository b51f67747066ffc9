// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

/// Unsigned tick count, used for absolute points on a core's timeline.
pub type Time = u64;
/// Signed tick count, used for slice budgets and lateness.
pub type TimeS = i64;

/// Clock rate of the ARM11 cores in Hz. All virtual time is counted in
/// ticks of this clock.
pub const BASE_CLOCK_RATE_ARM11: Time = 268_111_856;

/// Default length of a single scheduling slice.
pub const DEFAULT_SLICE_LENGTH: TimeS = (BASE_CLOCK_RATE_ARM11 / 234) as TimeS;

/// Convert ticks of the ARM11 clock to microseconds.
pub fn ticks_to_us(ticks: Time) -> u64 {
    (ticks as u128 * 1_000_000 / BASE_CLOCK_RATE_ARM11 as u128) as u64
}
