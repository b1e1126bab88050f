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

//! Spawn-domain parameter page layout.
//!
//! The header sits at offset 0 of the args frame; argument and environment
//! strings are packed after it, each NUL-terminated, the first aligned to
//! 4 bytes past the header.

use crate::Word;
use core::mem::size_of;

pub const MAX_CMDLINE_ARGS: usize = 128;
pub const MAX_ENVIRON_VARS: usize = 128;

/// Pointer expressed in the child's address space.
pub type ChildPtr = Word;

#[repr(C)]
pub struct SpawnDomainParams {
    pub argc: usize,
    /// NULL-terminated argv; entries are child-vspace pointers.
    pub argv: [ChildPtr; MAX_CMDLINE_ARGS + 1],
    /// NULL-terminated envp; entries are child-vspace pointers.
    pub envp: [ChildPtr; MAX_ENVIRON_VARS + 1],
}

impl SpawnDomainParams {
    /// Offset of the first packed string within the args frame.
    pub const fn strings_offset() -> usize {
        crate::round_up(size_of::<SpawnDomainParams>(), 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::BASE_PAGE_SIZE;

    #[test]
    fn test_strings_offset_aligned() {
        assert_eq!(SpawnDomainParams::strings_offset() % 4, 0);
        assert!(SpawnDomainParams::strings_offset() >= size_of::<SpawnDomainParams>());
    }

    #[test]
    fn test_header_leaves_string_space() {
        // The header plus a reasonable amount of argument text must fit in
        // one base page.
        assert!(SpawnDomainParams::strings_offset() + 512 <= BASE_PAGE_SIZE);
    }
}
