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

//! Capability slot allocation.
//!
//! A slot allocator hands out fresh slot indices within one CNode. The
//! paging manager and spawner draw mapping-capability slots through the
//! [`SlotAllocator`] trait so a child's allocator (over its PAGECN) and
//! the domain's default allocator are interchangeable.

#![cfg_attr(not(test), no_std)]
#![allow(non_snake_case)]

use bitvec::prelude::*;
use core::ops::Range;
#[cfg(feature = "TRACE_OPS")]
use log::trace;
use mantle_sys::{CNodeRef, CapRef};
use spin::Mutex;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotError {
    Exhausted,
    Uninitialized,
}

/// A source of fresh capability slots. Implementations serialize
/// internally; the paging state stores one as a shared trait object.
pub trait SlotAllocator: Sync {
    fn alloc(&self) -> Result<CapRef, SlotError>;
    fn free(&self, cap: CapRef);
}

struct Slots {
    bits: Option<BitBox<u8, Lsb0>>,
    used: usize,
    name: &'static str,
}

impl Slots {
    fn new(name: &'static str, size: usize) -> Self {
        Slots {
            bits: Some(bitvec![u8, Lsb0; 0; size].into_boxed_bitslice()),
            used: 0,
            name,
        }
    }

    const fn empty() -> Self {
        Slots {
            bits: None,
            used: 0,
            name: "",
        }
    }

    fn init(&mut self, name: &'static str, size: usize) {
        self.bits = Some(bitvec![u8, Lsb0; 0; size].into_boxed_bitslice());
        self.name = name;
    }

    fn used_slots(&self) -> usize { self.used }

    fn free_slots(&self) -> Result<usize, SlotError> {
        let bits = self.bits.as_ref().ok_or(SlotError::Uninitialized)?;
        Ok(bits.len() - self.used)
    }

    fn alloc_first_fit(&mut self) -> Result<usize, SlotError> {
        let bits = self.bits.as_mut().ok_or(SlotError::Uninitialized)?;
        let bit = bits.first_zero().ok_or(SlotError::Exhausted)?;
        unsafe { bits.set_unchecked(bit, true) };
        self.used += 1;
        #[cfg(feature = "TRACE_OPS")]
        trace!("{}:alloc {}", self.name, bit);
        Ok(bit)
    }

    fn free(&mut self, slot: usize) {
        #[cfg(feature = "TRACE_OPS")]
        trace!("{}:free {}", self.name, slot);
        let bits = self.bits.as_mut().expect("slots uninitialized");
        assert!(bits[slot], "{}: free of free slot {}", self.name, slot);
        bits.set(slot, false);
        self.used -= 1;
    }
}

/// Bitmap slot allocator over one CNode. `base_slot` offsets the handed
/// out indices so a caller can hold back the CNode's leading slots (the
/// spawner keeps PAGECN slot 0 for the child's L1 page directory).
pub struct CNodeSlotAllocator {
    cnode: CNodeRef,
    slots: Mutex<Slots>,
    base_slot: usize,
}

impl CNodeSlotAllocator {
    pub fn new(name: &'static str, cnode: CNodeRef, base_slot: usize, size: usize) -> Self {
        CNodeSlotAllocator {
            cnode,
            slots: Mutex::new(Slots::new(name, size)),
            base_slot,
        }
    }

    /// Creates an UNINITIALIZED allocator; `init` must run before use.
    pub const fn empty() -> Self {
        CNodeSlotAllocator {
            cnode: CNodeRef(0),
            slots: Mutex::new(Slots::empty()),
            base_slot: 0,
        }
    }

    pub fn init(&mut self, name: &'static str, cnode: CNodeRef, base_slot: usize, size: usize) {
        self.cnode = cnode;
        self.base_slot = base_slot;
        self.slots.lock().init(name, size);
    }

    pub fn cnode(&self) -> CNodeRef { self.cnode }

    pub fn base_slot(&self) -> usize { self.base_slot }

    pub fn used_slots(&self) -> usize { self.slots.lock().used_slots() }

    pub fn free_slots(&self) -> usize { self.slots.lock().free_slots().unwrap_or(0) }
}

impl SlotAllocator for CNodeSlotAllocator {
    fn alloc(&self) -> Result<CapRef, SlotError> {
        let slot = self.slots.lock().alloc_first_fit()?;
        Ok(CapRef::new(self.cnode, self.base_slot + slot))
    }

    fn free(&self, cap: CapRef) {
        assert_eq!(cap.cnode, self.cnode);
        assert!(cap.slot >= self.base_slot);
        self.slots.lock().free(cap.slot - self.base_slot);
    }
}

// The domain's default slot allocator, seeded over a local CNode during
// bootstrap. Set once; a second initialization indicates a bootstrap bug.
static DOMAIN_SLOTS: Mutex<Option<CNodeSlotAllocator>> = Mutex::new(None);

/// Slot range the default allocator manages within `cnode`.
pub fn default_slot_allocator_init(cnode: CNodeRef, slots: Range<usize>) {
    let mut guard = DOMAIN_SLOTS.lock();
    if guard.is_some() {
        log::warn!("default slot allocator re-initialized");
    }
    *guard = Some(CNodeSlotAllocator::new(
        "domain",
        cnode,
        slots.start,
        slots.end - slots.start,
    ));
}

/// Allocates a slot from the domain's default allocator.
pub fn slot_alloc() -> Result<CapRef, SlotError> {
    DOMAIN_SLOTS
        .lock()
        .as_ref()
        .ok_or(SlotError::Uninitialized)?
        .alloc()
}

/// Returns a slot to the domain's default allocator.
pub fn slot_free(cap: CapRef) {
    if let Some(sa) = DOMAIN_SLOTS.lock().as_ref() {
        sa.free(cap);
    }
}

/// The default allocator as a `SlotAllocator` trait object with static
/// lifetime, for storing in a paging state.
pub struct DefaultSlotAllocator;

pub static DEFAULT_SLOT_ALLOCATOR: DefaultSlotAllocator = DefaultSlotAllocator;

impl SlotAllocator for DefaultSlotAllocator {
    fn alloc(&self) -> Result<CapRef, SlotError> { slot_alloc() }
    fn free(&self, cap: CapRef) { slot_free(cap) }
}
