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

//! Mantle OS domain spawner.
//!
//! Constructs a fresh protection domain from a statically linked ELF
//! module: the child's capability name-space, its vspace skeleton, the
//! mapped and loaded program image, a primed dispatcher control block and
//! the argument page. The stages run strictly in that order; no child is
//! made runnable before all of them completed.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cmdline;
pub mod multiboot;
pub mod registry;

use alloc::boxed::Box;
use log::{debug, error, trace};
use mantle_elf::{ElfError, EM_ARM, SHF_EXECINSTR, SHF_WRITE};
use mantle_paging::{
    with_current_paging_state, MappingObserver, PagingError, PagingState,
};
use mantle_slot_allocator::{slot_alloc, CNodeSlotAllocator, SlotAllocator, SlotError};
use mantle_sys::arch::{
    ObjType, VRegionFlags, ARM_MODE_USR, BASE_PAGE_SIZE, CPSR_F_MASK,
};
use mantle_sys::bootinfo::Bootinfo;
use mantle_sys::dispatcher::{DispatcherHandle, DISPATCHER_FRAME_BITS, PIC_REGISTER};
use mantle_sys::domain_params::{SpawnDomainParams, MAX_CMDLINE_ARGS, MAX_ENVIRON_VARS};
use mantle_sys::{
    syscall, CNodeRef, CapRef, KernelError, Word, CAP_DISPATCHER, CNODE_MODULE, L2_CNODE_SLOTS,
    ROOTCN_SLOT_BASE_PAGE_CN, ROOTCN_SLOT_PAGECN, ROOTCN_SLOT_SLOT_ALLOC0, ROOTCN_SLOT_SLOT_ALLOC1,
    ROOTCN_SLOT_SLOT_ALLOC2, ROOTCN_SLOT_TASKCN, TASKCN_SLOT_ARGSPAGE, TASKCN_SLOT_DISPATCHER,
    TASKCN_SLOT_DISPFRAME, TASKCN_SLOT_ROOTCN,
};
use smallstr::SmallString;

pub type BinaryName = SmallString<[u8; 32]>;

#[derive(Debug, Eq, PartialEq)]
pub enum SpawnError {
    /// The named module is not in the bootinfo registry.
    FindModule,
    /// The module is not a loadable ELF image.
    ElfHeader,
    /// Image or argument constraints violated.
    Load,
    CSpace(KernelError),
    CapCopy(KernelError),
    FrameAlloc(KernelError),
    FrameIdentify(KernelError),
    SlotAlloc(SlotError),
    Paging(PagingError),
    Elf(ElfError),
    Invoke(KernelError),
}

impl From<PagingError> for SpawnError {
    fn from(e: PagingError) -> Self { SpawnError::Paging(e) }
}

impl From<SlotError> for SpawnError {
    fn from(e: SlotError) -> Self { SpawnError::SlotAlloc(e) }
}

// Copies every new mapping capability of the child vspace into scratch
// slots of the child's SLOT_ALLOC0 CNode so they stay reachable from the
// child's cspace bookkeeping.
struct MappingTracker {
    scratch: CNodeSlotAllocator,
}

impl MappingTracker {
    fn new(cnode: CNodeRef) -> Self {
        MappingTracker {
            scratch: CNodeSlotAllocator::new("child-mappings", cnode, 0, L2_CNODE_SLOTS),
        }
    }
}

impl MappingObserver for MappingTracker {
    fn mapping_created(&self, mapping: CapRef) -> Result<(), PagingError> {
        let dest = self.scratch.alloc().map_err(PagingError::SlotAlloc)?;
        syscall::cap_copy(dest, mapping).map_err(PagingError::CapCopy)
    }
}

/// Everything the spawner accumulates while constructing one child
/// domain. Created zeroed, populated stage by stage.
pub struct SpawnInfo {
    binary_name: BinaryName,

    // Child cspace.
    pub l1_cap: CapRef,
    pub l1_cnoderef: CNodeRef,
    pub taskcn: CNodeRef,
    pub pagecn: CNodeRef,
    pub base_pagecn: CNodeRef,
    pub alloc0: CNodeRef,
    pub alloc1: CNodeRef,
    pub alloc2: CNodeRef,
    pub dispatcher: CapRef,
    pub rootcn: CapRef,
    pub selfep: CapRef,

    // Frames, owned in the parent cspace with copies in TASKCN.
    pub dispframe: CapRef,
    pub argspage: CapRef,

    // Child vspace.
    pg_state: Option<&'static mut PagingState<'static>>,

    // Image.
    pub entry_point: Word,
    pub got_base: Word,

    // Parent-side views.
    pub disp_handle: Option<DispatcherHandle>,
    pub args_vaddr: Word,
}

impl core::fmt::Debug for SpawnInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpawnInfo")
            .field("binary_name", &self.binary_name.as_str())
            .finish_non_exhaustive()
    }
}

impl SpawnInfo {
    pub fn new(binary_name: &str) -> Self {
        SpawnInfo {
            binary_name: BinaryName::from_str(binary_name),
            l1_cap: CapRef::NULL,
            l1_cnoderef: CNodeRef(0),
            taskcn: CNodeRef(0),
            pagecn: CNodeRef(0),
            base_pagecn: CNodeRef(0),
            alloc0: CNodeRef(0),
            alloc1: CNodeRef(0),
            alloc2: CNodeRef(0),
            dispatcher: CapRef::NULL,
            rootcn: CapRef::NULL,
            selfep: CapRef::NULL,
            dispframe: CapRef::NULL,
            argspage: CapRef::NULL,
            pg_state: None,
            entry_point: 0,
            got_base: 0,
            disp_handle: None,
            args_vaddr: 0,
        }
    }

    pub fn binary_name(&self) -> &str { self.binary_name.as_str() }

    pub fn paging_state(&mut self) -> Option<&mut PagingState<'static>> {
        self.pg_state.as_deref_mut()
    }

    /// Builds the child's capability name-space: the root L1 CNode, the
    /// standard foreign L2 CNodes at their ABI slots, the dispatcher, a
    /// copy of the root CNode into TASKCN, and the parent's endpoint to
    /// the child retyped from the fresh dispatcher.
    pub fn setup_cspace(&mut self) -> Result<(), SpawnError> {
        trace!("setup_cspace {}", self.binary_name());

        let (l1_cap, l1_cnoderef) = syscall::cnode_create_l1().map_err(SpawnError::CSpace)?;
        self.l1_cap = l1_cap;
        self.l1_cnoderef = l1_cnoderef;

        self.taskcn = syscall::cnode_create_foreign_l2(l1_cap, ROOTCN_SLOT_TASKCN)
            .map_err(SpawnError::CSpace)?;
        self.pagecn = syscall::cnode_create_foreign_l2(l1_cap, ROOTCN_SLOT_PAGECN)
            .map_err(SpawnError::CSpace)?;
        self.base_pagecn = syscall::cnode_create_foreign_l2(l1_cap, ROOTCN_SLOT_BASE_PAGE_CN)
            .map_err(SpawnError::CSpace)?;
        self.alloc0 = syscall::cnode_create_foreign_l2(l1_cap, ROOTCN_SLOT_SLOT_ALLOC0)
            .map_err(SpawnError::CSpace)?;
        self.alloc1 = syscall::cnode_create_foreign_l2(l1_cap, ROOTCN_SLOT_SLOT_ALLOC1)
            .map_err(SpawnError::CSpace)?;
        self.alloc2 = syscall::cnode_create_foreign_l2(l1_cap, ROOTCN_SLOT_SLOT_ALLOC2)
            .map_err(SpawnError::CSpace)?;

        self.dispatcher = CapRef::new(self.taskcn, TASKCN_SLOT_DISPATCHER);
        syscall::dispatcher_create(self.dispatcher).map_err(SpawnError::CSpace)?;

        self.rootcn = CapRef::new(self.taskcn, TASKCN_SLOT_ROOTCN);
        syscall::cap_copy(self.rootcn, self.l1_cap).map_err(SpawnError::CapCopy)?;

        // TASKCN_SLOT_DISPFRAME and TASKCN_SLOT_ARGSPAGE stay reserved;
        // the frames are copied in once they exist.

        let selfep = slot_alloc()?;
        syscall::cap_retype(selfep, self.dispatcher, 0, ObjType::EndPoint, 0, 1)
            .map_err(SpawnError::CSpace)?;
        self.selfep = selfep;

        Ok(())
    }

    /// Builds the child's vspace skeleton: a slot allocator over PAGECN
    /// (slot 0 held back for the L1 page directory), a paging state, the
    /// L1 vnode, and the mapping observer that clones mapping
    /// capabilities into the child's cspace.
    pub fn setup_vspace(&mut self) -> Result<(), SpawnError> {
        trace!("setup_vspace {}", self.binary_name());

        let ssa: &'static CNodeSlotAllocator = Box::leak(Box::new(CNodeSlotAllocator::new(
            "child-pagecn",
            self.pagecn,
            1,
            L2_CNODE_SLOTS - 1,
        )));

        // The pdir capability is a placeholder until the L1 exists.
        let mut st = PagingState::init_state(0, CapRef::NULL, ssa)?;

        let l1_pdir = CapRef::new(self.pagecn, 0);
        st.set_l1_pagetable(l1_pdir);
        syscall::vnode_create(l1_pdir, ObjType::VnodeArmL1)
            .map_err(|e| SpawnError::Paging(PagingError::VnodeCreate(e)))?;

        let st: &'static mut PagingState<'static> = Box::leak(Box::new(st));
        let tracker: &'static MappingTracker = Box::leak(Box::new(MappingTracker::new(self.alloc0)));
        st.set_mapping_observer(tracker);

        self.pg_state = Some(st);
        Ok(())
    }

    /// Drives the ELF loader over `image`. Each allocatable section gets
    /// a frame, mapped twice: into the parent for the copy-in, and into
    /// the child at the section's requested address with its requested
    /// permissions. Records the entry point and the GOT base.
    pub fn load_image(&mut self, image: &[u8]) -> Result<(), SpawnError> {
        trace!("load_image {} ({} bytes)", self.binary_name(), image.len());

        if !mantle_elf::is_elf(image) {
            return Err(SpawnError::ElfHeader);
        }
        let st = self.pg_state.as_deref_mut().ok_or(SpawnError::Load)?;

        let mut cb_err = None;
        let entry = mantle_elf::elf_load(EM_ARM, image, &mut |vaddr, size, flags| {
            elf_section_allocate(st, vaddr, size, flags).map_err(|e| {
                cb_err = Some(e);
            })
        });
        let entry = match entry {
            Ok(entry) => entry,
            Err(ElfError::Allocate) => return Err(cb_err.unwrap_or(SpawnError::Load)),
            Err(ElfError::Header) => return Err(SpawnError::ElfHeader),
            Err(e) => return Err(SpawnError::Elf(e)),
        };
        self.entry_point = entry as Word;

        let got = mantle_elf::find_section_header_name(image, ".got").ok_or(SpawnError::Load)?;
        self.got_base = got.sh_addr as Word;
        trace!("entry {:#x} got {:#x}", self.entry_point, self.got_base);
        Ok(())
    }

    /// Allocates and dual-maps the dispatcher frame, then fills the
    /// generic view, the ARM view and the register save areas: the child
    /// starts disabled at the image entry point with the GOT base in the
    /// PIC register.
    pub fn setup_dispatcher(&mut self) -> Result<(), SpawnError> {
        trace!("setup_dispatcher {}", self.binary_name());

        let (dispframe, retsize) =
            syscall::frame_alloc(1 << DISPATCHER_FRAME_BITS).map_err(SpawnError::FrameAlloc)?;
        assert!(1 << DISPATCHER_FRAME_BITS <= retsize);
        self.dispframe = dispframe;
        syscall::cap_copy(CapRef::new(self.taskcn, TASKCN_SLOT_DISPFRAME), dispframe)
            .map_err(SpawnError::CapCopy)?;

        let my_dispframe = slot_alloc()?;
        syscall::cap_copy(my_dispframe, dispframe).map_err(SpawnError::CapCopy)?;

        let addr_me = with_current_paging_state(|st| {
            st.map_frame(retsize, my_dispframe, VRegionFlags::READ_WRITE)
        })?;
        let handle = DispatcherHandle::from_vaddr(addr_me);
        self.disp_handle = Some(handle);

        let st = self.pg_state.as_deref_mut().ok_or(SpawnError::Load)?;
        let addr_child = st.map_frame(retsize, dispframe, VRegionFlags::READ_WRITE)?;

        unsafe {
            core::ptr::write_bytes(addr_me as *mut u8, 0, retsize);
        }
        let frame = unsafe { handle.frame_mut() };
        frame.generic.core_id = 0;
        frame.shared.udisp = addr_child;
        frame.shared.disabled = 1;
        frame.shared.fpu_trap = 1;
        frame.shared.set_name(self.binary_name.as_str());

        frame.disabled_save_area.set_pc(self.entry_point);
        frame.shared_arm.got_base = self.got_base;
        frame.enabled_save_area.regs[PIC_REGISTER] = self.got_base;
        frame.disabled_save_area.regs[PIC_REGISTER] = self.got_base;
        frame.enabled_save_area.cpsr = CPSR_F_MASK | ARM_MODE_USR;
        frame.disabled_save_area.cpsr = CPSR_F_MASK | ARM_MODE_USR;
        // eh_frame fields stay zero.

        Ok(())
    }

    /// Packs argv (and envp) into one dual-mapped base page: the
    /// `SpawnDomainParams` header at offset 0, strings after it, all
    /// pointers expressed in the child's address space.
    pub fn setup_args(&mut self, argv: &[&str], envp: &[&str]) -> Result<(), SpawnError> {
        trace!("setup_args {} argc {}", self.binary_name(), argv.len());

        if argv.len() > MAX_CMDLINE_ARGS || envp.len() > MAX_ENVIRON_VARS {
            return Err(SpawnError::Load);
        }

        let (argspage, retsize) =
            syscall::frame_alloc(BASE_PAGE_SIZE).map_err(SpawnError::FrameAlloc)?;
        self.argspage = argspage;
        syscall::cap_copy(CapRef::new(self.taskcn, TASKCN_SLOT_ARGSPAGE), argspage)
            .map_err(SpawnError::CapCopy)?;

        let my_argsframe = slot_alloc()?;
        syscall::cap_copy(my_argsframe, argspage).map_err(SpawnError::CapCopy)?;

        let addr_me = with_current_paging_state(|st| {
            st.map_frame(retsize, my_argsframe, VRegionFlags::READ_WRITE)
        })?;
        self.args_vaddr = addr_me;

        let st = self.pg_state.as_deref_mut().ok_or(SpawnError::Load)?;
        let addr_child = st.map_frame(retsize, argspage, VRegionFlags::READ_WRITE)?;

        unsafe {
            core::ptr::write_bytes(addr_me as *mut u8, 0, retsize);
        }
        let params = unsafe { &mut *(addr_me as *mut SpawnDomainParams) };
        params.argc = argv.len();

        let mut offset = SpawnDomainParams::strings_offset();
        let mut copy_string = |s: &str, offset: &mut usize| -> Result<Word, SpawnError> {
            let bytes = s.as_bytes();
            if *offset + bytes.len() + 1 >= retsize {
                return Err(SpawnError::Load);
            }
            let child_ptr = addr_child + *offset;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    (addr_me + *offset) as *mut u8,
                    bytes.len(),
                );
            }
            // The page is pre-zeroed; the terminating NUL is in place.
            *offset += bytes.len() + 1;
            Ok(child_ptr)
        };

        for (i, arg) in argv.iter().enumerate() {
            params.argv[i] = copy_string(arg, &mut offset)?;
        }
        for (i, var) in envp.iter().enumerate() {
            params.envp[i] = copy_string(var, &mut offset)?;
        }
        // argv[argc] and envp[len] stay NULL from the zero fill, as does
        // the trailing NUL past the last string.

        Ok(())
    }

    /// Asks the kernel to make the child's dispatcher runnable.
    pub fn make_runnable(&mut self) -> Result<(), SpawnError> {
        let st = self.pg_state.as_deref_mut().ok_or(SpawnError::Load)?;
        syscall::invoke_dispatcher(
            self.dispatcher,
            CAP_DISPATCHER,
            self.l1_cap,
            st.l1_pagetable(),
            self.dispframe,
            true,
        )
        .map_err(SpawnError::Invoke)
    }

    /// Best-effort release of the child's capabilities after a failed
    /// spawn stage. Errors are logged and ignored.
    pub fn release(&mut self) {
        for cap in [
            self.selfep,
            self.dispframe,
            self.argspage,
            self.dispatcher,
            self.l1_cap,
        ] {
            if !cap.is_null() {
                if let Err(e) = syscall::cap_delete(cap) {
                    error!("spawn cleanup: delete {:?} failed: {:?}", cap, e);
                }
            }
        }
    }
}

// Per-section allocator handed to the ELF loader: allocate a frame, map
// it into the parent for the copy-in, copy the frame capability into the
// child's cspace and map it at the section's requested address.
fn elf_section_allocate(
    st: &mut PagingState<'static>,
    vaddr: u32,
    size: usize,
    flags: u32,
) -> Result<*mut u8, SpawnError> {
    trace!("section at {:#x} size {:#x} flags {:#x}", vaddr, size, flags);

    let (frame, retsize) = syscall::frame_alloc(size).map_err(SpawnError::FrameAlloc)?;

    let parent_vaddr = with_current_paging_state(|cur| {
        cur.map_frame(retsize, frame, VRegionFlags::READ_WRITE)
    })?;

    let child_frame = st.slot_allocator().alloc()?;
    syscall::cap_copy(child_frame, frame).map_err(SpawnError::CapCopy)?;
    st.map_fixed(vaddr as Word, child_frame, retsize, section_flags(flags))?;

    Ok(parent_vaddr as *mut u8)
}

fn section_flags(sh_flags: u32) -> VRegionFlags {
    let mut flags = VRegionFlags::READ;
    if sh_flags & SHF_WRITE != 0 {
        flags |= VRegionFlags::WRITE;
    }
    if sh_flags & SHF_EXECINSTR != 0 {
        flags |= VRegionFlags::EXECUTE;
    }
    flags
}

/// Spawns the named multiboot module as a new domain: locates the module
/// frame, maps it for reading, runs the construction stages in order and
/// finally makes the dispatcher runnable.
pub fn spawn_load_by_name(bi: &Bootinfo, binary_name: &str) -> Result<SpawnInfo, SpawnError> {
    debug!("spawn: loading and starting {}", binary_name);

    let module = multiboot::find_module(bi, binary_name).ok_or_else(|| {
        error!("spawn: module {} not found", binary_name);
        SpawnError::FindModule
    })?;
    let module_frame = CapRef::new(CNODE_MODULE, module.mrmod_slot);

    let identity = syscall::frame_identify(module_frame).map_err(SpawnError::FrameIdentify)?;
    let mapped = with_current_paging_state(|st| {
        st.map_frame(identity.bytes, module_frame, VRegionFlags::READ)
    })?;
    let image = unsafe { core::slice::from_raw_parts(mapped as *const u8, identity.bytes) };
    if !mantle_elf::is_elf(image) {
        error!("spawn: module {} is not an ELF executable", binary_name);
        return Err(SpawnError::ElfHeader);
    }

    let mut si = SpawnInfo::new(binary_name);
    let staged = (|| {
        si.setup_cspace()?;
        si.setup_vspace()?;
        si.load_image(image)?;
        si.setup_dispatcher()?;

        let args = cmdline::tokenize_cmdargs(multiboot::module_opts(module));
        let argv: smallvec::SmallVec<[&str; 8]> = args.iter().map(|s| s.as_str()).collect();
        si.setup_args(&argv, &[])?;

        si.make_runnable()
    })();

    match staged {
        Ok(()) => Ok(si),
        Err(e) => {
            si.release();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantle_elf::testimage::{build, Section};
    use mantle_elf::{SHF_ALLOC, SHT_PROGBITS};
    use mantle_paging::set_current_paging_state;
    use mantle_sys::dispatcher::DISP_NAME_LEN;
    use mantle_sys::fake;
    use mantle_sys::round_up;

    fn setup() -> fake::FakeScope {
        let scope = fake::scope();
        mantle_slot_allocator::default_slot_allocator_init(CNodeRef(0xD2), 0..4096);
        scope
    }

    // Installs a parent paging state whose managed span sits inside a
    // leaked writable arena, so parent-side mappings hand out real
    // memory.
    fn install_parent_vspace(pages: usize) -> Word {
        let buf = Box::leak(vec![0u8; (pages + 1) * BASE_PAGE_SIZE].into_boxed_slice());
        let base = round_up(buf.as_ptr() as usize, BASE_PAGE_SIZE);
        let sa: &'static CNodeSlotAllocator = Box::leak(Box::new(CNodeSlotAllocator::new(
            "parent",
            CNodeRef(0xD0),
            0,
            4096,
        )));
        let st = PagingState::init_state(base, CapRef::new(CNodeRef(0xD1), 0), sa).unwrap();
        set_current_paging_state(Box::leak(Box::new(st)));
        base
    }

    fn hello_image() -> Vec<u8> {
        build(
            EM_ARM,
            0x40_0040,
            &[
                Section {
                    name: ".text",
                    sh_type: SHT_PROGBITS,
                    flags: SHF_ALLOC | SHF_EXECINSTR,
                    addr: 0x40_0000,
                    data: vec![0xAA; 64],
                },
                Section {
                    name: ".got",
                    sh_type: SHT_PROGBITS,
                    flags: SHF_ALLOC | SHF_WRITE,
                    addr: 0x40_2000,
                    data: vec![0xBB; 32],
                },
            ],
        )
    }

    #[test]
    fn test_setup_cspace_builds_abi_layout() {
        let _k = setup();
        let mut si = SpawnInfo::new("hello");
        si.setup_cspace().unwrap();

        fake::with(|k| {
            // One root CNode, six foreign L2s at the ABI slots.
            assert_eq!(k.l1_cnodes.len(), 1);
            let slots: Vec<usize> = k.foreign_l2s.iter().map(|(_, slot, _)| *slot).collect();
            assert_eq!(
                slots,
                [
                    ROOTCN_SLOT_TASKCN,
                    ROOTCN_SLOT_PAGECN,
                    ROOTCN_SLOT_BASE_PAGE_CN,
                    ROOTCN_SLOT_SLOT_ALLOC0,
                    ROOTCN_SLOT_SLOT_ALLOC1,
                    ROOTCN_SLOT_SLOT_ALLOC2,
                ]
            );
            for (root, _, _) in &k.foreign_l2s {
                assert_eq!(*root, si.l1_cap);
            }

            assert_eq!(k.dispatchers, [CapRef::new(si.taskcn, TASKCN_SLOT_DISPATCHER)]);
            // Root CNode wired into TASKCN by copy.
            assert!(k
                .copies
                .contains(&(CapRef::new(si.taskcn, TASKCN_SLOT_ROOTCN), si.l1_cap)));
            // Parent endpoint retyped from the dispatcher.
            assert_eq!(k.retypes.len(), 1);
            let (dest, src, _) = k.retypes[0];
            assert_eq!(dest, si.selfep);
            assert_eq!(src, si.dispatcher);
        });
    }

    #[test]
    fn test_setup_vspace_creates_l1_at_pagecn_slot0() {
        let _k = setup();
        let mut si = SpawnInfo::new("hello");
        si.setup_cspace().unwrap();
        si.setup_vspace().unwrap();

        let l1_pdir = CapRef::new(si.pagecn, 0);
        assert_eq!(si.paging_state().unwrap().l1_pagetable(), l1_pdir);
        fake::with(|k| {
            let l1_type: usize = ObjType::VnodeArmL1.into();
            assert!(k.vnodes.contains(&(l1_pdir, l1_type)));
        });
    }

    #[test]
    fn test_load_image_maps_sections_dual() {
        let _k = setup();
        install_parent_vspace(16);
        let mut si = SpawnInfo::new("hello");
        si.setup_cspace().unwrap();
        si.setup_vspace().unwrap();
        si.load_image(&hello_image()).unwrap();

        assert_eq!(si.entry_point, 0x40_0040);
        assert_eq!(si.got_base, 0x40_2000);

        fake::with(|k| {
            // One frame per section.
            assert_eq!(k.frames.len(), 2);
            // The child-side text mapping carries execute permission.
            let rx = VRegionFlags::READ_EXECUTE.bits();
            assert!(k.maps.iter().any(|m| m.flags == rx));
            let rw = VRegionFlags::READ_WRITE.bits();
            assert!(k.maps.iter().any(|m| m.flags == rw));
            // Section frame capabilities copied into the child's PAGECN.
            assert!(k
                .copies
                .iter()
                .any(|(dest, _)| dest.cnode == si.pagecn && dest.slot > 0));
            // The mapping observer cloned mapping caps into SLOT_ALLOC0.
            assert!(k.copies.iter().any(|(dest, _)| dest.cnode == si.alloc0));
        });
    }

    #[test]
    fn test_load_image_rejects_garbage() {
        let _k = setup();
        let mut si = SpawnInfo::new("bad");
        si.setup_cspace().unwrap();
        si.setup_vspace().unwrap();
        assert_eq!(si.load_image(b"not an elf"), Err(SpawnError::ElfHeader));
    }

    #[test]
    fn test_setup_dispatcher_primes_frame() {
        let _k = setup();
        install_parent_vspace(32);
        let mut si = SpawnInfo::new("hello");
        si.setup_cspace().unwrap();
        si.setup_vspace().unwrap();
        si.load_image(&hello_image()).unwrap();
        si.setup_dispatcher().unwrap();

        let frame = unsafe { si.disp_handle.unwrap().frame() };
        assert_eq!(frame.shared.disabled, 1);
        assert_eq!(frame.shared.fpu_trap, 1);
        assert_eq!(frame.shared.name(), "hello");
        assert_eq!(frame.generic.core_id, 0);
        assert_eq!(frame.disabled_save_area.pc(), 0x40_0040);
        assert_eq!(frame.shared_arm.got_base, 0x40_2000);
        assert_eq!(frame.enabled_save_area.regs[PIC_REGISTER], 0x40_2000);
        assert_eq!(frame.disabled_save_area.regs[PIC_REGISTER], 0x40_2000);
        assert_eq!(frame.enabled_save_area.cpsr, CPSR_F_MASK | ARM_MODE_USR);
        assert_eq!(frame.disabled_save_area.cpsr, CPSR_F_MASK | ARM_MODE_USR);
        assert_eq!(frame.generic.eh_frame, 0);
        assert_eq!(frame.generic.eh_frame_size, 0);
        // The child sees the frame at a child-vspace address.
        assert_ne!(frame.shared.udisp, 0);

        fake::with(|k| {
            // The dispatcher frame capability was published in TASKCN.
            assert!(k
                .copies
                .contains(&(CapRef::new(si.taskcn, TASKCN_SLOT_DISPFRAME), si.dispframe)));
        });
    }

    #[test]
    fn test_dispatcher_name_truncated() {
        let _k = setup();
        install_parent_vspace(32);
        let mut si = SpawnInfo::new("a-binary-with-a-very-long-name");
        si.setup_cspace().unwrap();
        si.setup_vspace().unwrap();
        si.load_image(&hello_image()).unwrap();
        si.setup_dispatcher().unwrap();

        let frame = unsafe { si.disp_handle.unwrap().frame() };
        assert_eq!(frame.shared.name().len(), DISP_NAME_LEN);
    }

    #[test]
    fn test_setup_args_packs_strings() {
        let _k = setup();
        install_parent_vspace(16);
        let mut si = SpawnInfo::new("hello");
        si.setup_cspace().unwrap();
        si.setup_vspace().unwrap();
        si.setup_args(&["foo", "bar baz", "qux"], &["HOME=/"]).unwrap();

        let params = unsafe { &*(si.args_vaddr as *const SpawnDomainParams) };
        assert_eq!(params.argc, 3);

        let strings = SpawnDomainParams::strings_offset();
        let child_base = params.argv[0] - strings;
        assert_eq!(params.argv[1], child_base + strings + 4);
        assert_eq!(params.argv[2], child_base + strings + 4 + 8);
        assert_eq!(params.argv[3], 0);
        assert_eq!(params.envp[0], child_base + strings + 4 + 8 + 4);
        assert_eq!(params.envp[1], 0);

        // Strings are packed NUL-terminated in the parent view.
        let bytes =
            unsafe { core::slice::from_raw_parts((si.args_vaddr + strings) as *const u8, 24) };
        assert_eq!(&bytes[..16], b"foo\0bar baz\0qux\0");
        assert_eq!(&bytes[16..23], b"HOME=/\0");
        assert_eq!(bytes[23], 0);

        fake::with(|k| {
            assert!(k
                .copies
                .contains(&(CapRef::new(si.taskcn, TASKCN_SLOT_ARGSPAGE), si.argspage)));
        });
    }

    #[test]
    fn test_setup_args_rejects_too_many() {
        let _k = setup();
        install_parent_vspace(8);
        let mut si = SpawnInfo::new("hello");
        si.setup_cspace().unwrap();
        si.setup_vspace().unwrap();

        let many: Vec<&str> = core::iter::repeat("x").take(MAX_CMDLINE_ARGS + 1).collect();
        assert_eq!(si.setup_args(&many, &[]), Err(SpawnError::Load));
    }

    #[test]
    fn test_make_runnable_invokes_kernel() {
        let _k = setup();
        install_parent_vspace(32);
        let mut si = SpawnInfo::new("hello");
        si.setup_cspace().unwrap();
        si.setup_vspace().unwrap();
        si.load_image(&hello_image()).unwrap();
        si.setup_dispatcher().unwrap();
        si.setup_args(&["hello"], &[]).unwrap();
        si.make_runnable().unwrap();

        fake::with(|k| {
            assert_eq!(k.invocations.len(), 1);
            let inv = k.invocations[0];
            assert!(inv.run);
            assert_eq!(inv.disp, si.dispatcher);
            assert_eq!(inv.endpoint, CAP_DISPATCHER);
            assert_eq!(inv.rootcn, si.l1_cap);
            assert_eq!(inv.l1_pdir, CapRef::new(si.pagecn, 0));
            assert_eq!(inv.dispframe, si.dispframe);
        });
    }

    #[test]
    fn test_spawn_unknown_module() {
        let _k = setup();
        install_parent_vspace(8);
        let bi = Bootinfo::empty();
        assert_eq!(
            spawn_load_by_name(&bi, "missing").unwrap_err(),
            SpawnError::FindModule
        );
        // Nothing was constructed.
        fake::with(|k| {
            assert!(k.l1_cnodes.is_empty());
            assert!(k.invocations.is_empty());
        });
    }
}
