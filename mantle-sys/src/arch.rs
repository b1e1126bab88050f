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

//! ARMv7 translation-table constants and kernel object types.

use crate::Word;
use bitflags::bitflags;
use num_enum::IntoPrimitive;

pub const BASE_PAGE_BITS: usize = 12;
pub const BASE_PAGE_SIZE: usize = 1 << BASE_PAGE_BITS;

/// Entries in the L1 page directory; each covers a 1 MiB slice.
pub const L1_PAGETABLE_ENTRIES: usize = 4096;
/// Entries in an L2 page table; each covers a base page.
pub const L2_PAGETABLE_ENTRIES: usize = 256;

/// First virtual address handed to a domain's region allocator.
pub const VADDR_OFFSET: Word = 0x4000_0000;

/// L1 page-directory index of `vaddr`.
///
/// The mask is a no-op on the 32-bit target; it bounds the index when the
/// code runs with wider words.
pub const fn l1_index(vaddr: Word) -> usize { (vaddr >> 20) & (L1_PAGETABLE_ENTRIES - 1) }

/// Index within an L2 page table of `vaddr`.
pub const fn l2_index(vaddr: Word) -> usize {
    (vaddr >> BASE_PAGE_BITS) & (L2_PAGETABLE_ENTRIES - 1)
}

// CPSR bits for priming the dispatcher save areas.
pub const CPSR_F_MASK: Word = 1 << 6;
pub const ARM_MODE_USR: Word = 0x10;

/// Kernel object types accepted by retype/create invocations.
#[repr(usize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
pub enum ObjType {
    VnodeArmL1 = 1,
    VnodeArmL2,
    Frame,
    EndPoint,
    Dispatcher,
    CNodeL1,
    CNodeL2,
}

bitflags! {
    /// Permission flags for a virtual-region mapping.
    pub struct VRegionFlags: usize {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

impl VRegionFlags {
    pub const READ_WRITE: VRegionFlags =
        VRegionFlags::from_bits_truncate(Self::READ.bits | Self::WRITE.bits);
    pub const READ_EXECUTE: VRegionFlags =
        VRegionFlags::from_bits_truncate(Self::READ.bits | Self::EXECUTE.bits);
}
