// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

//! Structures shared by every crate of the emulator: configuration,
//! clock constants and the debug stub contract.

pub use common::{
    options::SystemConfig,
    time::{Time, TimeS},
};

pub mod common;
