// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use num_enum::{FromPrimitive, IntoPrimitive};

/// Kernel error codes. The numeric values cross the syscall ABI; 0 is
/// success and is never constructed as an error.
#[repr(usize)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum KernelError {
    InvalidArgument = 1,
    InvalidCapability,
    IllegalOperation,
    RangeError,
    AlignmentError,
    FailedLookup,
    DeleteFirst,
    RevokeFirst,
    NotEnoughMemory,
    SlotOccupied,
    #[default]
    UnknownError,
}

impl KernelError {
    /// Converts a raw syscall return code into a `Result`.
    pub fn wrap(code: isize) -> Result<(), KernelError> {
        if code == 0 {
            Ok(())
        } else {
            Err(KernelError::from(code as usize))
        }
    }
}
