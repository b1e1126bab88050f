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

//! In-process fake of the kernel and collaborator contracts.
//!
//! Records every invocation so unit tests can assert on call sequences
//! (L2 creation counts, vnode_map chunking, observer ordering). Tests
//! serialize access with [`scope`], which also resets the state.

use crate::arch::BASE_PAGE_SIZE;
use crate::syscall::FrameIdentity;
use crate::{round_up, CNodeRef, CapRef, KernelError, Word};
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

/// First handle value fabricated for kernel objects; keeps fakes clear of
/// the well-known CNode handles.
const FIRST_HANDLE: Word = 0x100;

const FAKE_LOCAL_CNODE: CNodeRef = CNodeRef(0xF0);
const FAKE_FRAME_CNODE: CNodeRef = CNodeRef(0xF1);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MapCall {
    pub dest_vnode: CapRef,
    pub src: CapRef,
    pub slot: usize,
    pub flags: usize,
    pub offset_pages: usize,
    pub pte_count: usize,
    pub mapping: CapRef,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvokeCall {
    pub disp: CapRef,
    pub endpoint: CapRef,
    pub rootcn: CapRef,
    pub l1_pdir: CapRef,
    pub dispframe: CapRef,
    pub run: bool,
}

#[derive(Default)]
pub struct FakeKernel {
    next_handle: Word,
    pub domain_id: Word,

    pub l1_cnodes: Vec<(CapRef, CNodeRef)>,
    pub foreign_l2s: Vec<(CapRef, usize, CNodeRef)>,
    pub dispatchers: Vec<CapRef>,
    pub copies: Vec<(CapRef, CapRef)>,
    pub retypes: Vec<(CapRef, CapRef, usize)>,
    pub revoked: Vec<CapRef>,
    pub deleted: Vec<CapRef>,
    pub vnodes: Vec<(CapRef, usize)>,
    pub maps: Vec<MapCall>,
    pub frames: Vec<(CapRef, usize)>,
    pub invocations: Vec<InvokeCall>,
    pub console: Vec<u8>,
    pub waitsets: usize,
    pub channels: usize,
    pub channel_sends: Vec<Vec<u8>>,

    // Error injection knobs.
    pub fail_frame_alloc: Option<KernelError>,
    pub fail_vnode_map_after: Option<usize>,
    pub fail_revoke: Option<KernelError>,
}

impl FakeKernel {
    fn fresh_handle(&mut self) -> Word {
        let h = if self.next_handle < FIRST_HANDLE {
            FIRST_HANDLE
        } else {
            self.next_handle
        };
        self.next_handle = h + 1;
        h
    }

    /// Count of vnode_map calls whose destination is `vnode`.
    pub fn maps_into(&self, vnode: CapRef) -> usize {
        self.maps.iter().filter(|m| m.dest_vnode == vnode).count()
    }

    /// Count of vnode objects created with `obj_type`.
    pub fn vnodes_of_type(&self, obj_type: usize) -> usize {
        self.vnodes.iter().filter(|(_, t)| *t == obj_type).count()
    }

    /// Frame size recorded for `cap`, if the fake allocated it.
    pub fn frame_bytes(&self, cap: CapRef) -> Option<usize> {
        self.frames.iter().find(|(c, _)| *c == cap).map(|(_, b)| *b)
    }

    pub fn console_str(&self) -> alloc::string::String {
        alloc::string::String::from_utf8_lossy(&self.console).into_owned()
    }
}

static KERNEL: Mutex<FakeKernel> = Mutex::new(FakeKernel {
    next_handle: 0,
    domain_id: 0,
    l1_cnodes: Vec::new(),
    foreign_l2s: Vec::new(),
    dispatchers: Vec::new(),
    copies: Vec::new(),
    retypes: Vec::new(),
    revoked: Vec::new(),
    deleted: Vec::new(),
    vnodes: Vec::new(),
    maps: Vec::new(),
    frames: Vec::new(),
    invocations: Vec::new(),
    console: Vec::new(),
    waitsets: 0,
    channels: 0,
    channel_sends: Vec::new(),
    fail_frame_alloc: None,
    fail_vnode_map_after: None,
    fail_revoke: None,
});

static TEST_GUARD: Mutex<()> = Mutex::new(());

/// Serializes a test against the shared fake and resets its state.
/// Hold the returned guard for the duration of the test.
#[must_use]
pub struct FakeScope {
    _guard: MutexGuard<'static, ()>,
}

pub fn scope() -> FakeScope {
    let guard = TEST_GUARD.lock();
    *KERNEL.lock() = FakeKernel::default();
    FakeScope { _guard: guard }
}

/// Runs `f` with the fake kernel state.
pub fn with<R>(f: impl FnOnce(&mut FakeKernel) -> R) -> R {
    f(&mut KERNEL.lock())
}

fn err_code(e: KernelError) -> isize {
    let code: usize = e.into();
    code as isize
}

// Kernel syscall stubs.

pub(crate) unsafe fn mk_cnode_create_l1(dest: *mut CapRef, cnoderef: *mut CNodeRef) -> isize {
    let (cap, cn) = with(|k| {
        let cap = CapRef::new(FAKE_LOCAL_CNODE, k.fresh_handle());
        let cn = CNodeRef(k.fresh_handle());
        k.l1_cnodes.push((cap, cn));
        (cap, cn)
    });
    *dest = cap;
    *cnoderef = cn;
    0
}

pub(crate) unsafe fn mk_cnode_create_foreign_l2(
    root: CapRef,
    slot: usize,
    cnoderef: *mut CNodeRef,
) -> isize {
    let cn = with(|k| {
        let cn = CNodeRef(k.fresh_handle());
        k.foreign_l2s.push((root, slot, cn));
        cn
    });
    *cnoderef = cn;
    0
}

pub(crate) unsafe fn mk_dispatcher_create(dest: CapRef) -> isize {
    with(|k| {
        k.dispatchers.push(dest);
        0
    })
}

pub(crate) unsafe fn mk_cap_copy(dest: CapRef, src: CapRef) -> isize {
    with(|k| {
        k.copies.push((dest, src));
        0
    })
}

pub(crate) unsafe fn mk_cap_retype(
    dest: CapRef,
    src: CapRef,
    _offset: usize,
    new_type: usize,
    _objsize: usize,
    _count: usize,
) -> isize {
    with(|k| {
        k.retypes.push((dest, src, new_type));
        0
    })
}

pub(crate) unsafe fn mk_cap_revoke(cap: CapRef) -> isize {
    with(|k| {
        if let Some(e) = k.fail_revoke {
            return err_code(e);
        }
        k.revoked.push(cap);
        0
    })
}

pub(crate) unsafe fn mk_cap_delete(cap: CapRef) -> isize {
    with(|k| {
        k.deleted.push(cap);
        0
    })
}

pub(crate) unsafe fn mk_vnode_create(dest: CapRef, obj_type: usize) -> isize {
    with(|k| {
        k.vnodes.push((dest, obj_type));
        0
    })
}

pub(crate) unsafe fn mk_vnode_map(
    dest_vnode: CapRef,
    src: CapRef,
    slot: usize,
    flags: usize,
    offset_pages: usize,
    pte_count: usize,
    mapping: CapRef,
) -> isize {
    with(|k| {
        if let Some(after) = k.fail_vnode_map_after {
            if k.maps.len() >= after {
                return err_code(KernelError::NotEnoughMemory);
            }
        }
        k.maps.push(MapCall {
            dest_vnode,
            src,
            slot,
            flags,
            offset_pages,
            pte_count,
            mapping,
        });
        0
    })
}

pub(crate) unsafe fn mk_frame_alloc(dest: *mut CapRef, bytes: usize, retbytes: *mut usize) -> isize {
    let alloc = with(|k| {
        if let Some(e) = k.fail_frame_alloc {
            return Err(e);
        }
        let actual = round_up(core::cmp::max(bytes, 1), BASE_PAGE_SIZE);
        let cap = CapRef::new(FAKE_FRAME_CNODE, k.fresh_handle());
        k.frames.push((cap, actual));
        Ok((cap, actual))
    });
    match alloc {
        Ok((cap, actual)) => {
            *dest = cap;
            *retbytes = actual;
            0
        }
        Err(e) => err_code(e),
    }
}

pub(crate) unsafe fn mk_frame_identify(frame: CapRef, ret: *mut FrameIdentity) -> isize {
    match with(|k| k.frame_bytes(frame)) {
        Some(bytes) => {
            *ret = FrameIdentity {
                base: 0x8000_0000 + (frame.slot << 20),
                bytes,
            };
            0
        }
        None => err_code(KernelError::InvalidCapability),
    }
}

pub(crate) unsafe fn mk_invoke_dispatcher(
    disp: CapRef,
    endpoint: CapRef,
    rootcn: CapRef,
    l1_pdir: CapRef,
    dispframe: CapRef,
    run: usize,
) -> isize {
    with(|k| {
        k.invocations.push(InvokeCall {
            disp,
            endpoint,
            rootcn,
            l1_pdir,
            dispframe,
            run: run != 0,
        });
        0
    })
}

pub(crate) unsafe fn mk_sys_print(buf: *const u8, len: usize) -> isize {
    let msg = core::slice::from_raw_parts(buf, len);
    with(|k| {
        k.console.extend_from_slice(msg);
        len as isize
    })
}

// Collaborator stubs.

pub(crate) unsafe fn svc_disp_init_disabled(_handle: *mut u8) {}

pub(crate) unsafe fn svc_thread_init_disabled(_handle: *mut u8, _init_domain: usize) {}

pub(crate) unsafe fn svc_thread_exit(status: isize) -> ! {
    panic!("thread_exit({})", status);
}

pub(crate) unsafe fn svc_waitset_init(ws: *mut crate::services::WaitsetRef) -> isize {
    let handle = with(|k| {
        k.waitsets += 1;
        k.fresh_handle()
    });
    *ws = crate::services::WaitsetRef(handle);
    0
}

pub(crate) unsafe fn svc_ram_alloc_init() {}

pub(crate) unsafe fn svc_ram_alloc_set_fixed(_fixed: usize) -> isize { 0 }

pub(crate) unsafe fn svc_endpoint_init() {}

pub(crate) unsafe fn svc_domain_id() -> usize {
    with(|k| k.domain_id)
}

pub(crate) unsafe fn svc_channel_open_init(
    _ws: crate::services::WaitsetRef,
    chan: *mut crate::services::ChannelRef,
) -> isize {
    let handle = with(|k| {
        k.channels += 1;
        k.fresh_handle()
    });
    *chan = crate::services::ChannelRef(handle);
    0
}

pub(crate) unsafe fn svc_channel_send_string(
    _chan: crate::services::ChannelRef,
    buf: *const u8,
    len: usize,
) -> isize {
    let msg = core::slice::from_raw_parts(buf, len);
    with(|k| {
        k.channel_sends.push(msg.to_vec());
        len as isize
    })
}
