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

//! Mantle OS virtual-address-space manager.
//!
//! Owns a domain's virtual memory: a region allocator over the span
//! `[start_vaddr, end-of-address-space)` plus the two-level ARM page-table
//! installer that lazily materializes L2 tables and commits frames into
//! chosen virtual ranges.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod paging_region;
mod region;

pub use paging_region::PagingRegion;
pub use region::{RegionKind, RegionList, RegionNode};

use alloc::boxed::Box;
use alloc::vec::Vec;
use log::{error, trace};
use mantle_slab::SlabError;
use mantle_slot_allocator::{SlotAllocator, SlotError, DEFAULT_SLOT_ALLOCATOR};
use mantle_sys::arch::{
    l1_index, l2_index, ObjType, VRegionFlags, BASE_PAGE_SIZE, L1_PAGETABLE_ENTRIES,
    L2_PAGETABLE_ENTRIES, VADDR_OFFSET,
};
use mantle_sys::{round_up, syscall, CapRef, KernelError, Word, CNODE_PAGE};
use spin::Mutex;

/// Refill the node arena once fewer than this many nodes remain.
pub const SLAB_REFILL_THRESHOLD: usize = 6;

/// Nodes seeded into a fresh paging state's arena. Enough to carry the
/// domain until the memory manager is up.
const INITIAL_SLAB_NODES: usize = 64;

static_assertions::const_assert!(SLAB_REFILL_THRESHOLD < INITIAL_SLAB_NODES);

#[derive(Debug, Eq, PartialEq)]
pub enum PagingError {
    /// No free region fits the request.
    VRegionNotFound,
    /// Region bookkeeping failed (no covering node, or node arena
    /// exhausted).
    VRegionMap,
    SlotAlloc(SlotError),
    VnodeCreate(KernelError),
    /// Installing an L2 table into the L1 directory failed.
    L2Map(KernelError),
    /// Installing frame pages into an L2 table failed.
    FrameMap(KernelError),
    CapCopy(KernelError),
    FrameAlloc(KernelError),
    MmuAwareInit(Box<PagingError>),
    MmuAwareMap(Box<PagingError>),
    MmuAwareNoSpace,
}

impl From<SlotError> for PagingError {
    fn from(e: SlotError) -> Self { PagingError::SlotAlloc(e) }
}

/// Observer invoked after every new mapping capability (L1-to-L2 and
/// frame-to-L2). A parent building a child vspace wires this to clone
/// the mapping capabilities into the child's cspace.
pub trait MappingObserver: Sync {
    fn mapping_created(&self, mapping: CapRef) -> Result<(), PagingError>;
}

/// Per-vspace paging state.
pub struct PagingState<'a> {
    l1_pagetable: CapRef,
    slot_alloc: &'a dyn SlotAllocator,
    regions: RegionList,
    l2_tables: Box<[Option<CapRef>]>,
    slab_refilling: bool,
    mapping_observer: Option<&'a dyn MappingObserver>,
}

impl<'a> PagingState<'a> {
    /// Initializes a fresh paging state managing
    /// `[start_vaddr, end-of-address-space)`.
    ///
    /// `pdir` may be a placeholder; it is stored, not interpreted. The
    /// real L1 capability can be assigned later with
    /// [`set_l1_pagetable`](Self::set_l1_pagetable), before the first
    /// mapping.
    pub fn init_state(
        start_vaddr: Word,
        pdir: CapRef,
        slot_alloc: &'a dyn SlotAllocator,
    ) -> Result<Self, PagingError> {
        debug_assert_eq!(start_vaddr % BASE_PAGE_SIZE, 0);
        trace!("paging init_state start {:#x}", start_vaddr);

        let mut regions = RegionList::new(mantle_slab::heap_refill);
        regions.grow_slab(INITIAL_SLAB_NODES);
        regions.seed(start_vaddr, Word::MAX - start_vaddr)?;

        let mut l2_tables = Vec::with_capacity(L1_PAGETABLE_ENTRIES);
        l2_tables.resize(L1_PAGETABLE_ENTRIES, None);

        Ok(PagingState {
            l1_pagetable: pdir,
            slot_alloc,
            regions,
            l2_tables: l2_tables.into_boxed_slice(),
            slab_refilling: false,
            mapping_observer: None,
        })
    }

    pub fn l1_pagetable(&self) -> CapRef { self.l1_pagetable }

    /// The slot allocator this state draws capability slots from.
    pub fn slot_allocator(&self) -> &'a dyn SlotAllocator { self.slot_alloc }

    pub fn set_l1_pagetable(&mut self, pdir: CapRef) { self.l1_pagetable = pdir; }

    pub fn set_mapping_observer(&mut self, observer: &'a dyn MappingObserver) {
        self.mapping_observer = Some(observer);
    }

    pub fn regions(&self) -> &RegionList { &self.regions }

    /// Reserves `bytes` of virtual address space without installing any
    /// frame.
    pub fn alloc(&mut self, bytes: usize) -> Result<Word, PagingError> {
        self.regions.reserve(bytes)
    }

    /// Maps `frame` somewhere convenient and returns the chosen address.
    /// Tops up the node arena first when it runs low, suppressing
    /// recursive refills.
    pub fn map_frame(
        &mut self,
        bytes: usize,
        frame: CapRef,
        flags: VRegionFlags,
    ) -> Result<Word, PagingError> {
        if self.should_refill_slab() {
            self.slab_refilling = true;
            let refilled = self.regions.refill_slab();
            self.slab_refilling = false;
            refilled.map_err(|e: SlabError| {
                error!("slab refill failed: {:?}", e);
                PagingError::VRegionMap
            })?;
        }
        let buf = self.alloc(bytes)?;
        self.map_fixed(buf, frame, bytes, flags)?;
        Ok(buf)
    }

    fn should_refill_slab(&self) -> bool {
        self.regions.free_nodes() < SLAB_REFILL_THRESHOLD && !self.slab_refilling
    }

    /// Maps `frame` at the fixed address `vaddr`. The covering region
    /// must not already be Allocated. The range is walked L2 table by L2
    /// table; missing tables are created on the way.
    ///
    /// On a kernel error the operation returns without rolling back the
    /// region split or mappings already installed.
    pub fn map_fixed(
        &mut self,
        vaddr: Word,
        frame: CapRef,
        bytes: usize,
        flags: VRegionFlags,
    ) -> Result<(), PagingError> {
        let bytes = round_up(bytes, BASE_PAGE_SIZE);
        if bytes == 0 {
            return Ok(());
        }
        trace!("map_fixed {:#x} size {:#x} {:?}", vaddr, bytes, flags);

        self.regions.claim_fixed(vaddr, bytes)?;

        let mut vaddr = vaddr;
        let mut remaining = bytes;
        let mut mapped_pages = 0;
        while remaining > 0 {
            let l2_cap = self.ensure_l2(l1_index(vaddr))?;

            let slot = l2_index(vaddr);
            let entries_left = L2_PAGETABLE_ENTRIES - slot;
            let chunk = core::cmp::min(remaining, entries_left * BASE_PAGE_SIZE);

            let mapping = self.slot_alloc.alloc()?;
            syscall::vnode_map(
                l2_cap,
                frame,
                slot,
                flags,
                mapped_pages,
                chunk / BASE_PAGE_SIZE,
                mapping,
            )
            .map_err(PagingError::FrameMap)?;
            self.notify_mapping(mapping)?;

            mapped_pages += chunk / BASE_PAGE_SIZE;
            remaining -= chunk;
            vaddr += chunk;
        }
        Ok(())
    }

    /// Unmaps the region starting at `vaddr`. Stub; see
    /// [`RegionList::release`].
    pub fn unmap(&mut self, vaddr: Word) -> Result<(), PagingError> {
        self.regions.release(vaddr)
    }

    // Returns the L2 table covering L1 slot `l1_slot`, creating and
    // installing it on first use. Each slot is initialized at most once
    // over the state's lifetime.
    fn ensure_l2(&mut self, l1_slot: usize) -> Result<CapRef, PagingError> {
        if let Some(cap) = self.l2_tables[l1_slot] {
            return Ok(cap);
        }

        let l2_cap = self.slot_alloc.alloc()?;
        syscall::vnode_create(l2_cap, ObjType::VnodeArmL2).map_err(PagingError::VnodeCreate)?;

        let mapping = self.slot_alloc.alloc()?;
        syscall::vnode_map(
            self.l1_pagetable,
            l2_cap,
            l1_slot,
            VRegionFlags::READ_WRITE,
            0,
            1,
            mapping,
        )
        .map_err(PagingError::L2Map)?;
        self.notify_mapping(mapping)?;

        self.l2_tables[l1_slot] = Some(l2_cap);
        Ok(l2_cap)
    }

    fn notify_mapping(&self, mapping: CapRef) -> Result<(), PagingError> {
        match self.mapping_observer {
            Some(observer) => observer.mapping_created(mapping),
            None => Ok(()),
        }
    }
}

// The process-wide current paging state, set once during bootstrap.
static CURRENT_PAGING_STATE: Mutex<Option<&'static mut PagingState<'static>>> = Mutex::new(None);

pub fn set_current_paging_state(st: &'static mut PagingState<'static>) {
    let mut guard = CURRENT_PAGING_STATE.lock();
    if guard.is_some() {
        log::warn!("current paging state replaced");
    }
    *guard = Some(st);
}

/// Runs `f` with the domain's own paging state.
///
/// Panics when paging has not been initialized.
pub fn with_current_paging_state<R>(f: impl FnOnce(&mut PagingState<'static>) -> R) -> R {
    let mut guard = CURRENT_PAGING_STATE.lock();
    let st = guard.as_mut().expect("paging not initialized");
    f(st)
}

/// Initializes paging for this domain: the L1 page directory capability
/// sits at slot 0 of `CNODE_PAGE`, slots come from the default
/// allocator, and the managed span starts at `VADDR_OFFSET`. Called once
/// before main.
pub fn paging_init() -> Result<(), PagingError> {
    let l1_cap = CapRef::new(CNODE_PAGE, 0);
    let st = PagingState::init_state(VADDR_OFFSET, l1_cap, &DEFAULT_SLOT_ALLOCATOR)?;
    set_current_paging_state(Box::leak(Box::new(st)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use mantle_slot_allocator::CNodeSlotAllocator;
    use mantle_sys::fake;
    use mantle_sys::CNodeRef;

    const START: Word = 0x4000_0000;

    fn test_slot_allocator() -> CNodeSlotAllocator {
        CNodeSlotAllocator::new("test", CNodeRef(0xE0), 0, 4096)
    }

    fn test_frame(bytes: usize) -> CapRef {
        let (frame, actual) = syscall::frame_alloc(bytes).unwrap();
        assert_eq!(actual, round_up(bytes, BASE_PAGE_SIZE));
        frame
    }

    fn check_invariants(st: &PagingState) {
        let mut expected = START;
        for node in st.regions().iter() {
            assert_eq!(node.base, expected);
            assert_eq!(node.base % BASE_PAGE_SIZE, 0);
            expected = node.base + node.size;
        }
        assert_eq!(expected, START + (Word::MAX - START));
    }

    #[test]
    fn test_exact_fit_alloc() {
        let _k = fake::scope();
        let sa = test_slot_allocator();
        let mut st = PagingState::init_state(START, CapRef::NULL, &sa).unwrap();
        assert_eq!(st.alloc(4096).unwrap(), 0x4000_0000);
        assert_eq!(st.alloc(4096).unwrap(), 0x4000_1000);
        check_invariants(&st);
    }

    #[test]
    fn test_alloc_zero() {
        let _k = fake::scope();
        let sa = test_slot_allocator();
        let mut st = PagingState::init_state(START, CapRef::NULL, &sa).unwrap();
        assert_eq!(st.alloc(0).unwrap(), START);
        assert_eq!(st.alloc(4096).unwrap(), START);
    }

    #[test]
    fn test_map_into_claimed() {
        let _k = fake::scope();
        let sa = test_slot_allocator();
        let l1 = CapRef::new(CNodeRef(0xE1), 0);
        let mut st = PagingState::init_state(START, l1, &sa).unwrap();

        let v = st.alloc(0x2000).unwrap();
        let frame = test_frame(0x2000);
        st.map_fixed(v, frame, 0x2000, VRegionFlags::READ_WRITE).unwrap();

        let node = st.regions().iter().next().unwrap();
        assert_eq!(node.base, v);
        assert_eq!(node.size, 0x2000);
        assert_eq!(node.kind, RegionKind::Allocated);

        fake::with(|k| {
            // One L2 table created and installed, one frame mapping.
            assert_eq!(k.vnodes.len(), 1);
            assert_eq!(k.maps.len(), 2);
            assert_eq!(k.maps[0].dest_vnode, l1);
            assert_eq!(k.maps[1].src, frame);
            assert_eq!(k.maps[1].pte_count, 2);
            assert_eq!(k.maps[1].offset_pages, 0);
        });
        check_invariants(&st);
    }

    #[test]
    fn test_map_fixed_rejects_mapped_range() {
        let _k = fake::scope();
        let sa = test_slot_allocator();
        let mut st = PagingState::init_state(START, CapRef::new(CNodeRef(0xE1), 0), &sa).unwrap();
        let frame = test_frame(0x1000);
        st.map_fixed(START, frame, 0x1000, VRegionFlags::READ_WRITE).unwrap();
        assert_eq!(
            st.map_fixed(START, frame, 0x1000, VRegionFlags::READ_WRITE),
            Err(PagingError::VRegionMap)
        );
    }

    #[test]
    fn test_cross_l2_mapping() {
        let _k = fake::scope();
        let sa = test_slot_allocator();
        let l1 = CapRef::new(CNodeRef(0xE1), 0);
        let mut st = PagingState::init_state(START, l1, &sa).unwrap();

        let frame = test_frame(0x20_0000);
        st.map_fixed(START, frame, 0x20_0000, VRegionFlags::READ_WRITE).unwrap();

        fake::with(|k| {
            // Two L2 tables, two L1 installs, two frame mappings of 256
            // pages each.
            assert_eq!(k.vnodes.len(), 2);
            assert_eq!(k.maps_into(l1), 2);
            let frame_maps: Vec<_> = k.maps.iter().filter(|m| m.src == frame).collect();
            assert_eq!(frame_maps.len(), 2);
            assert_eq!(frame_maps[0].pte_count, 256);
            assert_eq!(frame_maps[0].offset_pages, 0);
            assert_eq!(frame_maps[1].pte_count, 256);
            assert_eq!(frame_maps[1].offset_pages, 256);
        });
    }

    #[test]
    fn test_l2_created_at_most_once() {
        let _k = fake::scope();
        let sa = test_slot_allocator();
        let l1 = CapRef::new(CNodeRef(0xE1), 0);
        let mut st = PagingState::init_state(START, l1, &sa).unwrap();

        for _ in 0..4 {
            let frame = test_frame(0x1000);
            st.map_frame(0x1000, frame, VRegionFlags::READ_WRITE).unwrap();
        }
        fake::with(|k| {
            // All four pages land in the same 1 MiB slice.
            assert_eq!(k.vnodes.len(), 1);
            assert_eq!(k.maps_into(l1), 1);
        });
    }

    #[test]
    fn test_map_frame_returns_aligned_and_unreserved() {
        let _k = fake::scope();
        let sa = test_slot_allocator();
        let mut st = PagingState::init_state(START, CapRef::new(CNodeRef(0xE1), 0), &sa).unwrap();

        let frame = test_frame(0x3000);
        let buf = st.map_frame(0x3000, frame, VRegionFlags::READ_WRITE).unwrap();
        assert_eq!(buf % BASE_PAGE_SIZE, 0);

        // A later alloc never overlaps the mapped range.
        let next = st.alloc(0x1000).unwrap();
        assert!(next >= buf + 0x3000 || next + 0x1000 <= buf);
        check_invariants(&st);
    }

    #[test]
    fn test_slab_refill_triggered() {
        let _k = fake::scope();
        let sa = test_slot_allocator();
        let mut st = PagingState::init_state(START, CapRef::new(CNodeRef(0xE1), 0), &sa).unwrap();

        // Each reservation splits a node off the arena; drive it below
        // the refill threshold.
        while st.regions().free_nodes() >= SLAB_REFILL_THRESHOLD {
            st.alloc(BASE_PAGE_SIZE).unwrap();
        }
        let frame = test_frame(0x1000);
        st.map_frame(0x1000, frame, VRegionFlags::READ_WRITE).unwrap();
        assert!(st.regions().free_nodes() >= SLAB_REFILL_THRESHOLD);
    }

    struct CountingObserver {
        count: AtomicUsize,
    }
    impl MappingObserver for CountingObserver {
        fn mapping_created(&self, _mapping: CapRef) -> Result<(), PagingError> {
            self.count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_mapping_observer_sees_every_mapping() {
        let _k = fake::scope();
        let sa = test_slot_allocator();
        let observer = CountingObserver {
            count: AtomicUsize::new(0),
        };
        let mut st = PagingState::init_state(START, CapRef::new(CNodeRef(0xE1), 0), &sa).unwrap();
        st.set_mapping_observer(&observer);

        let frame = test_frame(0x20_0000);
        st.map_fixed(START, frame, 0x20_0000, VRegionFlags::READ_WRITE).unwrap();

        let maps = fake::with(|k| k.maps.len());
        assert_eq!(observer.count.load(Ordering::Relaxed), maps);
        assert_eq!(maps, 4);
    }

    #[test]
    fn test_map_failure_surfaces_kernel_error() {
        let _k = fake::scope();
        fake::with(|k| k.fail_vnode_map_after = Some(1));
        let sa = test_slot_allocator();
        let mut st = PagingState::init_state(START, CapRef::new(CNodeRef(0xE1), 0), &sa).unwrap();

        let frame = test_frame(0x1000);
        let err = st.map_fixed(START, frame, 0x1000, VRegionFlags::READ_WRITE).unwrap_err();
        assert_eq!(err, PagingError::FrameMap(KernelError::NotEnoughMemory));
        // Partial state: the region stays Allocated (no rollback).
        assert_eq!(st.regions().iter().next().unwrap().kind, RegionKind::Allocated);
    }

    #[test]
    fn test_paging_init_seeds_current_state() {
        let _k = fake::scope();
        mantle_slot_allocator::default_slot_allocator_init(CNodeRef(0xE9), 64..512);
        paging_init().unwrap();
        with_current_paging_state(|st| {
            assert_eq!(st.l1_pagetable(), CapRef::new(CNODE_PAGE, 0));
            assert_eq!(st.alloc(BASE_PAGE_SIZE).unwrap(), VADDR_OFFSET);
        });
    }
}
