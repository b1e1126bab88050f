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

//! Morecore: the domain heap.
//!
//! Bootstraps from a small static pool so allocation works before paging
//! is up (which also keeps slab refills fault-free), then moves to a
//! mapped paging region once the vspace manager runs. The program crate
//! declares `MORECORE` as its `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use linked_list_allocator::Heap;
use mantle_paging::{with_current_paging_state, PagingError, PagingRegion};
use mantle_sys::Word;
use spin::Mutex;

/// Size of the static bootstrap pool.
pub const EARLY_HEAP_BYTES: usize = 64 * 1024;

/// Default size of the mapped heap region.
pub const MORECORE_REGION_BYTES: usize = 1 << 20;

pub struct MorecoreHeap {
    heap: Mutex<Option<Heap>>,
}

impl MorecoreHeap {
    /// Creates a new UNINITIALIZED heap; [`morecore_init`] must run
    /// before the first allocation.
    pub const fn empty() -> MorecoreHeap {
        MorecoreHeap {
            heap: Mutex::new(None),
        }
    }

    /// Points the heap at `[start, start + size)`.
    ///
    /// # Safety
    /// The range must be writable, unused memory that outlives the heap.
    pub unsafe fn init(&self, start: *mut u8, size: usize) {
        *self.heap.lock() = Some(Heap::new(start, size));
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize { self.heap.lock().as_ref().map_or(0, |h| h.used()) }

    /// Bytes still available.
    pub fn free(&self) -> usize { self.heap.lock().as_ref().map_or(0, |h| h.free()) }
}

unsafe impl GlobalAlloc for MorecoreHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.heap.lock().as_mut() {
            Some(heap) => heap
                .allocate_first_fit(layout)
                .ok()
                .map_or(ptr::null_mut(), |allocation| allocation.as_ptr()),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(heap) = self.heap.lock().as_mut() {
            heap.deallocate(NonNull::new_unchecked(ptr), layout);
        }
    }
}

pub static MORECORE: MorecoreHeap = MorecoreHeap::empty();

static mut EARLY_POOL: [u8; EARLY_HEAP_BYTES] = [0; EARLY_HEAP_BYTES];

/// Seeds the morecore heap from the static bootstrap pool. Runs before
/// paging; cannot fault.
pub fn morecore_init() -> Result<(), PagingError> {
    unsafe {
        MORECORE.init(ptr::addr_of_mut!(EARLY_POOL) as *mut u8, EARLY_HEAP_BYTES);
    }
    Ok(())
}

/// Re-seeds the heap from a freshly mapped paging region of `bytes`.
/// Call once the vspace manager is up; allocations made from the early
/// pool are abandoned in place.
pub fn morecore_extend(bytes: usize) -> Result<(), PagingError> {
    let (base, got): (Word, usize) = with_current_paging_state(|st| {
        let mut region = PagingRegion::new(st, bytes)?;
        region.map(st, bytes)
    })?;
    unsafe {
        MORECORE.init(base as *mut u8, got);
    }
    Ok(())
}
