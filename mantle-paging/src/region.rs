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

//! Virtual-address region list.
//!
//! An address-sorted doubly-linked list of contiguous regions tagged
//! Free, Claimed or Allocated, covering the whole managed span. Nodes
//! live in the slab arena and link each other by index.

use crate::PagingError;
use mantle_slab::{RefillFn, SlabArena, SlabError, SlabIx};
use mantle_sys::arch::BASE_PAGE_SIZE;
use mantle_sys::{round_up, Word};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegionKind {
    /// Available address space.
    Free,
    /// Reserved by a region allocation, not yet backed by a frame.
    Claimed,
    /// Backed by a frame and installed in the page tables.
    Allocated,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionNode {
    pub base: Word,
    pub size: usize,
    pub kind: RegionKind,
    prev: Option<SlabIx>,
    next: Option<SlabIx>,
}

pub struct RegionList {
    arena: SlabArena<RegionNode>,
    head: Option<SlabIx>,
}

impl RegionList {
    pub fn new(refill: RefillFn<RegionNode>) -> Self {
        RegionList {
            arena: SlabArena::with_refill(refill),
            head: None,
        }
    }

    /// Installs the initial Free region spanning `[base, base + size)`.
    pub fn seed(&mut self, base: Word, size: usize) -> Result<(), PagingError> {
        debug_assert!(self.head.is_none());
        let ix = self
            .arena
            .alloc(RegionNode {
                base,
                size,
                kind: RegionKind::Free,
                prev: None,
                next: None,
            })
            .map_err(|_| PagingError::VRegionMap)?;
        self.head = Some(ix);
        Ok(())
    }

    pub fn grow_slab(&mut self, count: usize) { self.arena.grow(count) }

    pub fn refill_slab(&mut self) -> Result<(), SlabError> { self.arena.refill() }

    pub fn free_nodes(&self) -> usize { self.arena.free_count() }

    fn node(&self, ix: SlabIx) -> RegionNode { *self.arena.get(ix).expect("region node") }

    fn set(&mut self, ix: SlabIx, node: RegionNode) {
        *self.arena.get_mut(ix).expect("region node") = node;
    }

    /// First-fit reservation of `bytes` (rounded up to the base page).
    /// The chosen region becomes Claimed; a larger region is split with
    /// the remainder staying Free. `reserve(0)` returns the first Free
    /// base without consuming a node.
    pub fn reserve(&mut self, bytes: usize) -> Result<Word, PagingError> {
        let bytes = round_up(bytes, BASE_PAGE_SIZE);
        let mut cur = self.head;
        while let Some(ix) = cur {
            let mut node = self.node(ix);
            if node.kind == RegionKind::Free && node.size >= bytes {
                if bytes == 0 {
                    return Ok(node.base);
                }
                node.kind = RegionKind::Claimed;
                if node.size > bytes {
                    let right = RegionNode {
                        base: node.base + bytes,
                        size: node.size - bytes,
                        kind: RegionKind::Free,
                        prev: Some(ix),
                        next: node.next,
                    };
                    let rix = self.arena.alloc(right).map_err(|_| PagingError::VRegionMap)?;
                    if let Some(nix) = node.next {
                        self.arena.get_mut(nix).expect("region node").prev = Some(rix);
                    }
                    node.next = Some(rix);
                    node.size = bytes;
                }
                self.set(ix, node);
                return Ok(node.base);
            }
            cur = node.next;
        }
        Err(PagingError::VRegionNotFound)
    }

    /// Marks `[vaddr, vaddr + bytes)` Allocated. The covering node must
    /// not already be Allocated; Claimed nodes are eligible (the
    /// reserved-then-mapped path). Splits off Free remainders on either
    /// side as needed.
    pub fn claim_fixed(&mut self, vaddr: Word, bytes: usize) -> Result<(), PagingError> {
        let mut cur = self.head;
        while let Some(ix) = cur {
            let mut node = self.node(ix);
            if node.kind == RegionKind::Allocated
                || node.base > vaddr
                || node.base + node.size < vaddr + bytes
            {
                cur = node.next;
                continue;
            }

            if node.base + node.size > vaddr + bytes {
                let right = RegionNode {
                    base: vaddr + bytes,
                    size: node.size - (vaddr - node.base) - bytes,
                    kind: RegionKind::Free,
                    prev: Some(ix),
                    next: node.next,
                };
                let rix = self.arena.alloc(right).map_err(|_| PagingError::VRegionMap)?;
                if let Some(nix) = node.next {
                    self.arena.get_mut(nix).expect("region node").prev = Some(rix);
                }
                node.next = Some(rix);
                node.size -= right.size;
            }

            if vaddr > node.base {
                let left = RegionNode {
                    base: node.base,
                    size: vaddr - node.base,
                    kind: RegionKind::Free,
                    prev: node.prev,
                    next: Some(ix),
                };
                let lix = self.arena.alloc(left).map_err(|_| PagingError::VRegionMap)?;
                if let Some(pix) = node.prev {
                    self.arena.get_mut(pix).expect("region node").next = Some(lix);
                }
                if self.head == Some(ix) {
                    self.head = Some(lix);
                }
                node.prev = Some(lix);
                node.base = vaddr;
                node.size -= left.size;
            }

            node.kind = RegionKind::Allocated;
            self.set(ix, node);
            return Ok(());
        }
        Err(PagingError::VRegionMap)
    }

    /// Releases the region starting at `base`.
    ///
    /// A complete implementation re-tags the region Free and coalesces
    /// with Free neighbors; today this is a stub.
    pub fn release(&mut self, _base: Word) -> Result<(), PagingError> { Ok(()) }

    pub fn iter(&self) -> RegionIter<'_> {
        RegionIter {
            list: self,
            cur: self.head,
        }
    }
}

pub struct RegionIter<'a> {
    list: &'a RegionList,
    cur: Option<SlabIx>,
}

impl<'a> Iterator for RegionIter<'a> {
    type Item = RegionNode;

    fn next(&mut self) -> Option<RegionNode> {
        let ix = self.cur?;
        let node = self.list.node(ix);
        self.cur = node.next;
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantle_slab::heap_refill;

    const START: Word = 0x4000_0000;
    const SPAN: usize = 0x1000_0000;

    fn list() -> RegionList {
        let mut rl = RegionList::new(heap_refill);
        rl.grow_slab(64);
        rl.seed(START, SPAN).unwrap();
        rl
    }

    // The list stays sorted, contiguous, page-aligned and covers the
    // seeded span.
    fn check_invariants(rl: &RegionList) {
        let nodes: Vec<RegionNode> = rl.iter().collect();
        assert!(!nodes.is_empty());
        assert_eq!(nodes[0].base, START);
        let mut expected = START;
        for node in &nodes {
            assert_eq!(node.base, expected, "list must be contiguous");
            assert_eq!(node.base % BASE_PAGE_SIZE, 0);
            assert_eq!(node.size % BASE_PAGE_SIZE, 0);
            expected = node.base + node.size;
        }
        assert_eq!(expected, START + SPAN, "list must cover the span");
    }

    #[test]
    fn test_exact_fit_sequence() {
        let mut rl = list();
        assert_eq!(rl.reserve(4096).unwrap(), 0x4000_0000);
        assert_eq!(rl.reserve(4096).unwrap(), 0x4000_1000);
        check_invariants(&rl);
    }

    #[test]
    fn test_reserve_rounds_to_page() {
        let mut rl = list();
        assert_eq!(rl.reserve(100).unwrap(), START);
        assert_eq!(rl.reserve(4096).unwrap(), START + 4096);
        check_invariants(&rl);
    }

    #[test]
    fn test_reserve_zero() {
        let mut rl = list();
        let before: Vec<RegionNode> = rl.iter().collect();
        assert_eq!(rl.reserve(0).unwrap(), START);
        let after: Vec<RegionNode> = rl.iter().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_reserve_too_big() {
        let mut rl = list();
        assert_eq!(rl.reserve(SPAN + BASE_PAGE_SIZE), Err(PagingError::VRegionNotFound));
        // The span itself still fits exactly.
        assert_eq!(rl.reserve(SPAN).unwrap(), START);
        assert_eq!(rl.reserve(4096), Err(PagingError::VRegionNotFound));
    }

    #[test]
    fn test_claim_fixed_whole_claimed_node() {
        let mut rl = list();
        let v = rl.reserve(0x2000).unwrap();
        rl.claim_fixed(v, 0x2000).unwrap();
        let node = rl.iter().next().unwrap();
        assert_eq!(node.base, v);
        assert_eq!(node.size, 0x2000);
        assert_eq!(node.kind, RegionKind::Allocated);
        check_invariants(&rl);
    }

    #[test]
    fn test_claim_fixed_splits_both_sides() {
        let mut rl = list();
        rl.claim_fixed(START + 0x3000, 0x2000).unwrap();
        let nodes: Vec<RegionNode> = rl.iter().collect();
        assert_eq!(nodes[0].kind, RegionKind::Free);
        assert_eq!(nodes[0].size, 0x3000);
        assert_eq!(nodes[1].kind, RegionKind::Allocated);
        assert_eq!(nodes[1].base, START + 0x3000);
        assert_eq!(nodes[1].size, 0x2000);
        assert_eq!(nodes[2].kind, RegionKind::Free);
        check_invariants(&rl);
    }

    #[test]
    fn test_claim_fixed_rejects_allocated() {
        let mut rl = list();
        rl.claim_fixed(START, 0x1000).unwrap();
        assert_eq!(rl.claim_fixed(START, 0x1000), Err(PagingError::VRegionMap));
    }

    #[test]
    fn test_reserve_skips_claimed_and_allocated() {
        let mut rl = list();
        let a = rl.reserve(0x1000).unwrap();
        rl.claim_fixed(a, 0x1000).unwrap();
        let b = rl.reserve(0x1000).unwrap();
        assert_eq!(b, a + 0x1000);
        // A fresh reservation never lands inside a claimed or mapped range.
        let c = rl.reserve(0x4000).unwrap();
        assert!(c >= b + 0x1000);
        check_invariants(&rl);
    }

    #[test]
    fn test_release_is_stub() {
        let mut rl = list();
        let v = rl.reserve(0x1000).unwrap();
        rl.release(v).unwrap();
        // Still Claimed; release does not yet coalesce.
        assert_eq!(rl.iter().next().unwrap().kind, RegionKind::Claimed);
    }
}
