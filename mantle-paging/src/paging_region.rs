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

//! Paging regions: pre-reserved address ranges consumed incrementally.
//!
//! Backed lazily by a frame on first map; used by allocation-heavy
//! clients such as the morecore heap.

use crate::{PagingError, PagingState};
use alloc::boxed::Box;
use log::debug;
use mantle_sys::arch::{VRegionFlags, BASE_PAGE_SIZE};
use mantle_sys::{round_up, syscall, Word};

pub struct PagingRegion {
    base: Word,
    current: Word,
    size: usize,
    mapped: bool,
}

impl PagingRegion {
    /// Reserves `size` bytes (rounded up to at least one page) of address
    /// space in `st`. Nothing is mapped yet.
    pub fn new(st: &mut PagingState, size: usize) -> Result<Self, PagingError> {
        let mut size = round_up(size, BASE_PAGE_SIZE);
        if size == 0 {
            size = BASE_PAGE_SIZE;
        }
        let base = st
            .alloc(size)
            .map_err(|e| PagingError::MmuAwareInit(Box::new(e)))?;
        Ok(PagingRegion {
            base,
            current: base,
            size,
            mapped: false,
        })
    }

    pub fn base(&self) -> Word { self.base }

    pub fn size(&self) -> usize { self.size }

    /// Hands out the next `req_size` bytes of the region, backing the
    /// whole region with a frame on the first call. Returns the start
    /// address and the byte count actually granted.
    pub fn map(
        &mut self,
        st: &mut PagingState,
        req_size: usize,
    ) -> Result<(Word, usize), PagingError> {
        if !self.mapped {
            let (frame, retsize) = syscall::frame_alloc(self.size)
                .map_err(|e| PagingError::MmuAwareMap(Box::new(PagingError::FrameAlloc(e))))?;
            st.map_fixed(self.base, frame, retsize, VRegionFlags::READ_WRITE)
                .map_err(|e| PagingError::MmuAwareMap(Box::new(e)))?;
            self.size = retsize;
            self.mapped = true;
        }

        let end = self.base + self.size;
        let rem = end.saturating_sub(self.current);
        if rem > req_size {
            let buf = self.current;
            self.current += req_size;
            Ok((buf, req_size))
        } else if rem > 0 {
            let buf = self.current;
            self.current += rem;
            debug!("exhausted paging region, expect badness on next allocation");
            Ok((buf, rem))
        } else {
            Err(PagingError::MmuAwareNoSpace)
        }
    }

    /// Returns part of the region. Optional; holes are not tracked yet.
    pub fn unmap(&mut self, _base: Word, _bytes: usize) -> Result<(), PagingError> { Ok(()) }
}
