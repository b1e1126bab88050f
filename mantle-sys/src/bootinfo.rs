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

//! Boot information handed to the init domain.
//!
//! Describes memory regions and the multiboot modules the bootloader
//! staged. Module frames live in `CNODE_MODULE` at each region's
//! `mrmod_slot`.

use crate::Word;

pub const MAX_BOOTINFO_REGIONS: usize = 32;
pub const MOD_CMDLINE_LEN: usize = 128;

#[repr(usize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegionType {
    Empty = 0,
    Ram,
    Module,
    PlatformData,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct MemRegion {
    pub mr_base: Word,
    pub mr_bytes: usize,
    pub mr_type: RegionType,
    /// Slot of the module frame in `CNODE_MODULE`.
    pub mrmod_slot: usize,
    /// NUL-terminated module command line; the first token is the module
    /// name as the bootloader staged it.
    pub mrmod_data: [u8; MOD_CMDLINE_LEN],
}

impl MemRegion {
    pub const EMPTY: MemRegion = MemRegion {
        mr_base: 0,
        mr_bytes: 0,
        mr_type: RegionType::Empty,
        mrmod_slot: 0,
        mrmod_data: [0; MOD_CMDLINE_LEN],
    };

    /// The module command line up to the first NUL.
    pub fn cmdline(&self) -> &str {
        let len = self
            .mrmod_data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MOD_CMDLINE_LEN);
        core::str::from_utf8(&self.mrmod_data[..len]).unwrap_or("")
    }

    /// The module name: the basename of the command line's first token.
    pub fn module_name(&self) -> &str {
        let first = self.cmdline().split(|c| c == ' ' || c == '\t').next().unwrap_or("");
        first.rsplit('/').next().unwrap_or(first)
    }
}

#[repr(C)]
pub struct Bootinfo {
    pub regions_length: usize,
    pub regions: [MemRegion; MAX_BOOTINFO_REGIONS],
}

impl Bootinfo {
    pub const fn empty() -> Self {
        Bootinfo {
            regions_length: 0,
            regions: [MemRegion::EMPTY; MAX_BOOTINFO_REGIONS],
        }
    }

    /// Adds a module region; used by boot glue and tests.
    pub fn push_module(&mut self, slot: usize, cmdline: &str) {
        let mut region = MemRegion {
            mr_type: RegionType::Module,
            mrmod_slot: slot,
            ..MemRegion::EMPTY
        };
        let bytes = cmdline.as_bytes();
        let len = core::cmp::min(bytes.len(), MOD_CMDLINE_LEN - 1);
        region.mrmod_data[..len].copy_from_slice(&bytes[..len]);
        self.regions[self.regions_length] = region;
        self.regions_length += 1;
    }
}
