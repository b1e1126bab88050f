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

//! Dispatcher frame layout.
//!
//! One page-aligned frame of `1 << DISPATCHER_FRAME_BITS` bytes shared
//! between the kernel and the domain. The field offsets are ABI; the
//! kernel reads/writes the same structures.

use crate::Word;
use core::mem::size_of;
use static_assertions::const_assert;

pub const DISPATCHER_FRAME_BITS: usize = 13;
pub const DISP_NAME_LEN: usize = 16;

/// Number of general-purpose registers in a save area.
pub const NUM_REGS: usize = 16;
/// Register carrying the GOT base for position-independent code.
pub const PIC_REGISTER: usize = 9;

/// An ARMv7 register save area. `regs[15]` is the program counter.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Registers {
    pub regs: [Word; NUM_REGS],
    pub cpsr: Word,
}

impl Registers {
    pub const fn zeroed() -> Self {
        Registers {
            regs: [0; NUM_REGS],
            cpsr: 0,
        }
    }

    pub fn pc(&self) -> Word { self.regs[15] }

    pub fn set_pc(&mut self, pc: Word) { self.regs[15] = pc; }
}

/// Fields shared with the kernel for scheduling and upcall delivery.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DispatcherShared {
    /// Non-zero while the domain runs in disabled mode.
    pub disabled: Word,
    pub haswork: Word,
    /// Address of this frame in the domain's own vspace.
    pub udisp: Word,
    pub fpu_used: Word,
    /// Non-zero to trap on FPU instructions.
    pub fpu_trap: Word,
    /// NUL-padded domain name, for debug output.
    pub name: [u8; DISP_NAME_LEN],
}

impl DispatcherShared {
    pub const fn zeroed() -> Self {
        DispatcherShared {
            disabled: 0,
            haswork: 0,
            udisp: 0,
            fpu_used: 0,
            fpu_trap: 0,
            name: [0; DISP_NAME_LEN],
        }
    }

    /// Stores `name` truncated to `DISP_NAME_LEN` bytes.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; DISP_NAME_LEN];
        let bytes = name.as_bytes();
        let len = core::cmp::min(bytes.len(), DISP_NAME_LEN);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    /// Returns the stored name up to the first NUL.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DISP_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// ARM-specific shared fields.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DispatcherSharedArm {
    pub got_base: Word,
}

/// Domain-private generic fields.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DispatcherGeneric {
    pub core_id: Word,
    pub eh_frame: Word,
    pub eh_frame_size: Word,
    pub eh_frame_hdr: Word,
    pub eh_frame_hdr_size: Word,
}

/// The full dispatcher frame: three overlapping views plus the two
/// register save areas, at fixed offsets.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DispatcherFrame {
    pub shared: DispatcherShared,
    pub shared_arm: DispatcherSharedArm,
    pub enabled_save_area: Registers,
    pub disabled_save_area: Registers,
    pub generic: DispatcherGeneric,
}

impl DispatcherFrame {
    pub const fn zeroed() -> Self {
        DispatcherFrame {
            shared: DispatcherShared::zeroed(),
            shared_arm: DispatcherSharedArm { got_base: 0 },
            enabled_save_area: Registers::zeroed(),
            disabled_save_area: Registers::zeroed(),
            generic: DispatcherGeneric {
                core_id: 0,
                eh_frame: 0,
                eh_frame_size: 0,
                eh_frame_hdr: 0,
                eh_frame_hdr_size: 0,
            },
        }
    }
}

const_assert!(size_of::<DispatcherFrame>() <= 1 << DISPATCHER_FRAME_BITS);

/// Handle to a mapped dispatcher frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DispatcherHandle(*mut DispatcherFrame);

// The handle names a per-domain shared frame; access is serialized by the
// single-threaded bootstrap.
unsafe impl Send for DispatcherHandle {}
unsafe impl Sync for DispatcherHandle {}

impl DispatcherHandle {
    pub fn from_vaddr(vaddr: Word) -> Self { DispatcherHandle(vaddr as *mut DispatcherFrame) }

    pub fn as_ptr(&self) -> *mut u8 { self.0 as *mut u8 }

    pub fn vaddr(&self) -> Word { self.0 as Word }

    /// Returns the frame behind the handle.
    ///
    /// # Safety
    /// The handle must point at a live mapped dispatcher frame.
    pub unsafe fn frame(&self) -> &'static DispatcherFrame { &*self.0 }

    /// Mutable view of the frame behind the handle.
    ///
    /// # Safety
    /// The handle must point at a live mapped dispatcher frame and the
    /// caller must be the only writer.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self) -> &'static mut DispatcherFrame { &mut *self.0 }
}
