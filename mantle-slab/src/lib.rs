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

//! Fixed-size node arena with a refill hook.
//!
//! Elements are addressed by stable `u32` indices so list structures can
//! link nodes by index instead of by reference. The arena grows in chunks:
//! either from the domain heap (which is pre-backed and therefore cannot
//! page-fault) or from a caller-provided raw buffer during early bootstrap
//! when no heap exists yet.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec::Vec;
use log::trace;

/// Stable index of an arena element.
pub type SlabIx = u32;

/// Number of elements added by the default refill hook.
pub const DEFAULT_REFILL_COUNT: usize = 64;

#[derive(Debug, Eq, PartialEq)]
pub enum SlabError {
    Exhausted,
    NoRefill,
}

enum Entry<T> {
    Vacant { next_free: Option<SlabIx> },
    Occupied(T),
}

enum Chunk<T: 'static> {
    Heap(Box<[Entry<T>]>),
    Raw(&'static mut [Entry<T>]),
}

impl<T: 'static> Chunk<T> {
    fn slots(&self) -> &[Entry<T>] {
        match self {
            Chunk::Heap(s) => s,
            Chunk::Raw(s) => s,
        }
    }
    fn slots_mut(&mut self) -> &mut [Entry<T>] {
        match self {
            Chunk::Heap(s) => s,
            Chunk::Raw(s) => s,
        }
    }
}

pub type RefillFn<T> = fn(&mut SlabArena<T>) -> Result<(), SlabError>;

pub struct SlabArena<T: 'static> {
    chunks: Vec<Chunk<T>>,
    free_head: Option<SlabIx>,
    free_count: usize,
    refill_fn: Option<RefillFn<T>>,
}

impl<T: 'static> SlabArena<T> {
    pub const fn new() -> Self {
        SlabArena {
            chunks: Vec::new(),
            free_head: None,
            free_count: 0,
            refill_fn: None,
        }
    }

    pub fn with_refill(refill_fn: RefillFn<T>) -> Self {
        SlabArena {
            chunks: Vec::new(),
            free_head: None,
            free_count: 0,
            refill_fn: Some(refill_fn),
        }
    }

    /// Number of elements available without growing.
    pub fn free_count(&self) -> usize { self.free_count }

    /// Runs the installed refill hook.
    pub fn refill(&mut self) -> Result<(), SlabError> {
        match self.refill_fn {
            Some(f) => f(self),
            None => Err(SlabError::NoRefill),
        }
    }

    /// Grows the arena by `count` elements from the heap.
    pub fn grow(&mut self, count: usize) {
        let base = self.capacity();
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(self.vacant_entry(base, count, i));
        }
        self.chunks.push(Chunk::Heap(slots.into_boxed_slice()));
        self.free_head = Some(base as SlabIx);
        self.free_count += count;
        trace!("slab grow {} -> capacity {}", count, self.capacity());
    }

    /// Grows the arena from a pre-existing buffer, bypassing the heap.
    /// Used during early bootstrap before any allocator exists.
    ///
    /// # Safety
    /// `buf`/`bytes` must describe writable memory that outlives the arena
    /// and is not used for anything else.
    pub unsafe fn grow_raw(&mut self, buf: *mut u8, bytes: usize) {
        let align = core::mem::align_of::<Entry<T>>();
        let aligned = (buf as usize + align - 1) & !(align - 1);
        let count = (bytes - (aligned - buf as usize)) / core::mem::size_of::<Entry<T>>();
        if count == 0 {
            return;
        }
        let base = self.capacity();
        let slots = core::slice::from_raw_parts_mut(aligned as *mut Entry<T>, count);
        for (i, slot) in slots.iter_mut().enumerate() {
            core::ptr::write(slot, self.vacant_entry(base, count, i));
        }
        self.chunks.push(Chunk::Raw(slots));
        self.free_head = Some(base as SlabIx);
        self.free_count += count;
    }

    // Entry `i` of a fresh chunk of `count` elements starting at global
    // index `base`: linked to its right neighbor, the last to the current
    // free head.
    fn vacant_entry(&self, base: usize, count: usize, i: usize) -> Entry<T> {
        let next_free = if i + 1 < count {
            Some((base + i + 1) as SlabIx)
        } else {
            self.free_head
        };
        Entry::Vacant { next_free }
    }

    fn capacity(&self) -> usize { self.chunks.iter().map(|c| c.slots().len()).sum() }

    fn entry(&self, ix: SlabIx) -> Option<&Entry<T>> {
        let mut ix = ix as usize;
        for chunk in &self.chunks {
            if ix < chunk.slots().len() {
                return Some(&chunk.slots()[ix]);
            }
            ix -= chunk.slots().len();
        }
        None
    }

    fn entry_mut(&mut self, ix: SlabIx) -> Option<&mut Entry<T>> {
        let mut ix = ix as usize;
        for chunk in &mut self.chunks {
            if ix < chunk.slots().len() {
                return Some(&mut chunk.slots_mut()[ix]);
            }
            ix -= chunk.slots().len();
        }
        None
    }

    /// Allocates an element, storing `value`. Fails when the arena is
    /// exhausted; the caller decides when to refill.
    pub fn alloc(&mut self, value: T) -> Result<SlabIx, SlabError> {
        let ix = self.free_head.ok_or(SlabError::Exhausted)?;
        let next = match self.entry(ix) {
            Some(Entry::Vacant { next_free }) => *next_free,
            _ => unreachable!("free list points at occupied slot"),
        };
        self.free_head = next;
        *self.entry_mut(ix).unwrap() = Entry::Occupied(value);
        self.free_count -= 1;
        Ok(ix)
    }

    /// Releases the element at `ix`.
    pub fn free(&mut self, ix: SlabIx) {
        let head = self.free_head;
        match self.entry_mut(ix) {
            Some(slot @ Entry::Occupied(_)) => {
                *slot = Entry::Vacant { next_free: head };
            }
            _ => panic!("free of vacant slab index {}", ix),
        }
        self.free_head = Some(ix);
        self.free_count += 1;
    }

    pub fn get(&self, ix: SlabIx) -> Option<&T> {
        match self.entry(ix) {
            Some(Entry::Occupied(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, ix: SlabIx) -> Option<&mut T> {
        match self.entry_mut(ix) {
            Some(Entry::Occupied(v)) => Some(v),
            _ => None,
        }
    }
}

/// Default refill hook: grows from the domain heap. The heap is backed by
/// pre-mapped morecore memory so this path cannot re-enter the paging
/// manager.
pub fn heap_refill<T: 'static>(arena: &mut SlabArena<T>) -> Result<(), SlabError> {
    arena.grow(DEFAULT_REFILL_COUNT);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free() {
        let mut arena: SlabArena<u64> = SlabArena::new();
        arena.grow(4);
        assert_eq!(arena.free_count(), 4);

        let a = arena.alloc(11).unwrap();
        let b = arena.alloc(22).unwrap();
        assert_eq!(arena.free_count(), 2);
        assert_eq!(arena.get(a), Some(&11));
        assert_eq!(arena.get(b), Some(&22));

        arena.free(a);
        assert_eq!(arena.free_count(), 3);
        assert_eq!(arena.get(a), None);

        // Free slots are reused.
        let c = arena.alloc(33).unwrap();
        assert_eq!(c, a);
        assert_eq!(arena.get(c), Some(&33));
    }

    #[test]
    fn test_exhausted() {
        let mut arena: SlabArena<u32> = SlabArena::new();
        assert_eq!(arena.alloc(1), Err(SlabError::Exhausted));
        arena.grow(1);
        arena.alloc(1).unwrap();
        assert_eq!(arena.alloc(2), Err(SlabError::Exhausted));
    }

    #[test]
    fn test_grow_across_chunks() {
        let mut arena: SlabArena<usize> = SlabArena::new();
        arena.grow(2);
        let a = arena.alloc(1).unwrap();
        let b = arena.alloc(2).unwrap();
        arena.grow(2);
        let c = arena.alloc(3).unwrap();
        assert_eq!(arena.free_count(), 1);
        assert!(c >= 2);
        assert_eq!(arena.get(a), Some(&1));
        assert_eq!(arena.get(b), Some(&2));
        assert_eq!(arena.get(c), Some(&3));
    }

    #[test]
    fn test_refill_hook() {
        let mut arena: SlabArena<u8> = SlabArena::with_refill(heap_refill);
        assert_eq!(arena.free_count(), 0);
        arena.refill().unwrap();
        assert_eq!(arena.free_count(), DEFAULT_REFILL_COUNT);
    }

    #[test]
    fn test_no_refill_hook() {
        let mut arena: SlabArena<u8> = SlabArena::new();
        assert_eq!(arena.refill(), Err(SlabError::NoRefill));
    }

    #[test]
    fn test_grow_raw() {
        let mut arena: SlabArena<u64> = SlabArena::new();
        let buf = Box::leak(vec![0u8; 1024].into_boxed_slice());
        unsafe { arena.grow_raw(buf.as_mut_ptr(), buf.len()) };
        assert!(arena.free_count() > 0);
        let ix = arena.alloc(99).unwrap();
        assert_eq!(arena.get(ix), Some(&99));
    }

    #[test]
    fn test_mutation() {
        let mut arena: SlabArena<(u32, u32)> = SlabArena::new();
        arena.grow(2);
        let ix = arena.alloc((1, 2)).unwrap();
        arena.get_mut(ix).unwrap().1 = 7;
        assert_eq!(arena.get(ix), Some(&(1, 7)));
    }

    #[test]
    #[should_panic]
    fn test_double_free() {
        let mut arena: SlabArena<u8> = SlabArena::new();
        arena.grow(1);
        let ix = arena.alloc(1).unwrap();
        arena.free(ix);
        arena.free(ix);
    }
}
