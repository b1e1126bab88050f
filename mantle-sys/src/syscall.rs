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

//! Capability syscall surface.
//!
//! Thin typed wrappers over the kernel trap stubs (`mk_*`), which the
//! kernel's support library provides at link time. With
//! `CONFIG_FAKE_SYSCALLS` the stubs are replaced by the in-process
//! recording fake.

use crate::arch::{ObjType, VRegionFlags};
use crate::{CNodeRef, CapRef, KernelError, Word};

/// Physical identity of a frame capability.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameIdentity {
    pub base: Word,
    pub bytes: usize,
}

#[cfg(not(feature = "CONFIG_FAKE_SYSCALLS"))]
extern "C" {
    fn mk_cnode_create_l1(dest: *mut CapRef, cnoderef: *mut CNodeRef) -> isize;
    fn mk_cnode_create_foreign_l2(root: CapRef, slot: usize, cnoderef: *mut CNodeRef) -> isize;
    fn mk_dispatcher_create(dest: CapRef) -> isize;
    fn mk_cap_copy(dest: CapRef, src: CapRef) -> isize;
    fn mk_cap_retype(
        dest: CapRef,
        src: CapRef,
        offset: usize,
        new_type: usize,
        objsize: usize,
        count: usize,
    ) -> isize;
    fn mk_cap_revoke(cap: CapRef) -> isize;
    fn mk_cap_delete(cap: CapRef) -> isize;
    fn mk_vnode_create(dest: CapRef, obj_type: usize) -> isize;
    fn mk_vnode_map(
        dest_vnode: CapRef,
        src: CapRef,
        slot: usize,
        flags: usize,
        offset_pages: usize,
        pte_count: usize,
        mapping: CapRef,
    ) -> isize;
    fn mk_frame_alloc(dest: *mut CapRef, bytes: usize, retbytes: *mut usize) -> isize;
    fn mk_frame_identify(frame: CapRef, ret: *mut FrameIdentity) -> isize;
    fn mk_invoke_dispatcher(
        disp: CapRef,
        endpoint: CapRef,
        rootcn: CapRef,
        l1_pdir: CapRef,
        dispframe: CapRef,
        run: usize,
    ) -> isize;
    fn mk_sys_print(buf: *const u8, len: usize) -> isize;
}

#[cfg(feature = "CONFIG_FAKE_SYSCALLS")]
use crate::fake::{
    mk_cap_copy, mk_cap_delete, mk_cap_retype, mk_cap_revoke, mk_cnode_create_foreign_l2,
    mk_cnode_create_l1, mk_dispatcher_create, mk_frame_alloc, mk_frame_identify,
    mk_invoke_dispatcher, mk_sys_print, mk_vnode_create, mk_vnode_map,
};

/// Creates a new L1 CNode; returns the capability plus a CNode handle
/// usable as the container of further `CapRef`s.
pub fn cnode_create_l1() -> Result<(CapRef, CNodeRef), KernelError> {
    let mut cap = CapRef::NULL;
    let mut cnoderef = CNodeRef(0);
    KernelError::wrap(unsafe { mk_cnode_create_l1(&mut cap, &mut cnoderef) })?;
    Ok((cap, cnoderef))
}

/// Creates a foreign L2 CNode at `slot` of the L1 CNode named by `root`.
pub fn cnode_create_foreign_l2(root: CapRef, slot: usize) -> Result<CNodeRef, KernelError> {
    let mut cnoderef = CNodeRef(0);
    KernelError::wrap(unsafe { mk_cnode_create_foreign_l2(root, slot, &mut cnoderef) })?;
    Ok(cnoderef)
}

/// Creates a dispatcher object in `dest`.
pub fn dispatcher_create(dest: CapRef) -> Result<(), KernelError> {
    KernelError::wrap(unsafe { mk_dispatcher_create(dest) })
}

pub fn cap_copy(dest: CapRef, src: CapRef) -> Result<(), KernelError> {
    KernelError::wrap(unsafe { mk_cap_copy(dest, src) })
}

pub fn cap_retype(
    dest: CapRef,
    src: CapRef,
    offset: usize,
    new_type: ObjType,
    objsize: usize,
    count: usize,
) -> Result<(), KernelError> {
    KernelError::wrap(unsafe { mk_cap_retype(dest, src, offset, new_type.into(), objsize, count) })
}

pub fn cap_revoke(cap: CapRef) -> Result<(), KernelError> {
    KernelError::wrap(unsafe { mk_cap_revoke(cap) })
}

pub fn cap_delete(cap: CapRef) -> Result<(), KernelError> {
    KernelError::wrap(unsafe { mk_cap_delete(cap) })
}

/// Creates a page-table object (L1 directory or L2 table) in `dest`.
pub fn vnode_create(dest: CapRef, obj_type: ObjType) -> Result<(), KernelError> {
    KernelError::wrap(unsafe { mk_vnode_create(dest, obj_type.into()) })
}

/// Installs `src` into `dest_vnode` at `slot`. For frame mappings
/// `offset_pages`/`pte_count` select which pages of the frame back the
/// consecutive entries; `mapping` receives the new mapping capability.
pub fn vnode_map(
    dest_vnode: CapRef,
    src: CapRef,
    slot: usize,
    flags: VRegionFlags,
    offset_pages: usize,
    pte_count: usize,
    mapping: CapRef,
) -> Result<(), KernelError> {
    KernelError::wrap(unsafe {
        mk_vnode_map(dest_vnode, src, slot, flags.bits(), offset_pages, pte_count, mapping)
    })
}

/// Allocates a frame of at least `bytes`; returns the capability and the
/// actual size.
pub fn frame_alloc(bytes: usize) -> Result<(CapRef, usize), KernelError> {
    let mut cap = CapRef::NULL;
    let mut retbytes = 0usize;
    KernelError::wrap(unsafe { mk_frame_alloc(&mut cap, bytes, &mut retbytes) })?;
    Ok((cap, retbytes))
}

pub fn frame_identify(frame: CapRef) -> Result<FrameIdentity, KernelError> {
    let mut id = FrameIdentity { base: 0, bytes: 0 };
    KernelError::wrap(unsafe { mk_frame_identify(frame, &mut id) })?;
    Ok(id)
}

/// Primes and (optionally) runs a dispatcher: wires its endpoint, root
/// CNode, L1 page directory and dispatcher frame, then makes it runnable
/// when `run` is set.
pub fn invoke_dispatcher(
    disp: CapRef,
    endpoint: CapRef,
    rootcn: CapRef,
    l1_pdir: CapRef,
    dispframe: CapRef,
    run: bool,
) -> Result<(), KernelError> {
    KernelError::wrap(unsafe {
        mk_invoke_dispatcher(disp, endpoint, rootcn, l1_pdir, dispframe, run as usize)
    })
}

/// Writes `msg` to the kernel console; returns the number of bytes
/// accepted.
pub fn sys_print(msg: &[u8]) -> usize {
    let rc = unsafe { mk_sys_print(msg.as_ptr(), msg.len()) };
    if rc < 0 {
        0
    } else {
        rc as usize
    }
}
