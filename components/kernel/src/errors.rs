// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

/// Errors kernel objects can return to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("mutex released by a thread that does not hold it")]
    WrongLockingThread,
    #[error("mutex has a holder but a lock count of zero")]
    InvalidResultValue,
    #[error("value out of range")]
    OutOfRange,
    #[error("handle does not refer to a live object")]
    InvalidHandle,
}

impl KernelError {
    /// The result code the guest sees for this error.
    pub fn result_code(self) -> ResultCode {
        match self {
            Self::WrongLockingThread => ResultCode::new(
                31,
                ErrorModule::Kernel,
                ErrorSummary::InvalidArgument,
                ErrorLevel::Permanent,
            ),
            Self::InvalidResultValue => ResultCode::new(
                1023,
                ErrorModule::Kernel,
                ErrorSummary::InvalidState,
                ErrorLevel::Permanent,
            ),
            Self::OutOfRange => ResultCode::new(
                1021,
                ErrorModule::Kernel,
                ErrorSummary::InvalidArgument,
                ErrorLevel::Permanent,
            ),
            Self::InvalidHandle => ResultCode::new(
                1015,
                ErrorModule::Kernel,
                ErrorSummary::InvalidArgument,
                ErrorLevel::Permanent,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorModule {
    Common = 0,
    Kernel = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorSummary {
    Success = 0,
    InvalidState = 5,
    InvalidArgument = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorLevel {
    Success = 0,
    Permanent = 27,
}

/// Raw 32-bit result code as returned to the guest.
/// Layout: description (10 bits), module (8 bits), 3 reserved bits,
/// summary (6 bits), level (5 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);

    pub fn new(description: u32, module: ErrorModule, summary: ErrorSummary, level: ErrorLevel) -> Self {
        Self(
            (description & 0x3FF)
                | ((module as u32 & 0xFF) << 10)
                | ((summary as u32 & 0x3F) << 21)
                | ((level as u32 & 0x1F) << 27),
        )
    }

    pub fn description(self) -> u32 {
        self.0 & 0x3FF
    }

    pub fn is_error(self) -> bool {
        (self.0 as i32) < 0
    }
}

impl From<KernelError> for ResultCode {
    fn from(err: KernelError) -> Self {
        err.result_code()
    }
}

impl From<Result<(), KernelError>> for ResultCode {
    fn from(res: Result<(), KernelError>) -> Self {
        match res {
            Ok(()) => ResultCode::SUCCESS,
            Err(err) => err.result_code(),
        }
    }
}
