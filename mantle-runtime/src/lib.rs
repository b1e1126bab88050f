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

//! Mantle OS per-domain runtime bootstrap.
//!
//! Two entry points, called by the CRT stub: [`init_disabled`] runs on
//! the dispatcher stack in disabled mode before any thread exists;
//! [`init_onthread`] runs as the domain's first thread and brings up the
//! wait-set, RAM allocator, morecore heap, paging, slot allocator and
//! (for non-init domains) the message channel to init.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod libc_glue;
pub mod morecore;
mod rpc;

#[cfg(all(not(test), target_os = "none"))]
mod panic;

pub use rpc::InitRpc;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use log::debug;
use mantle_paging::{paging_init, PagingError};
use mantle_slot_allocator::{default_slot_allocator_init, SlotError};
use mantle_sys::dispatcher::DispatcherHandle;
use mantle_sys::domain_params::SpawnDomainParams;
use mantle_sys::services::{self, WaitsetRef};
use mantle_sys::{KernelError, CNODE_SLOT_ALLOC, L2_CNODE_SLOTS};
use spin::Mutex;

#[derive(Debug, Eq, PartialEq)]
pub enum RuntimeError {
    WaitsetInit(KernelError),
    RamAllocSet(KernelError),
    MorecoreInit(PagingError),
    VspaceInit(PagingError),
    SlotAllocInit(SlotError),
    ChannelInit(KernelError),
}

// Process-wide bootstrap state. Each of these is written once during
// disabled/enabled init and read-only afterwards.
static INIT_DOMAIN: AtomicBool = AtomicBool::new(false);
static DISP_HANDLE: Mutex<Option<DispatcherHandle>> = Mutex::new(None);
static DEFAULT_WAITSET: Mutex<Option<WaitsetRef>> = Mutex::new(None);
pub(crate) static INIT_RPC: Mutex<Option<InitRpc>> = Mutex::new(None);
static ENVIRON: AtomicUsize = AtomicUsize::new(0);

/// Whether this domain is init (and thus talks to the kernel directly
/// for console output and memory).
pub fn is_init_domain() -> bool { INIT_DOMAIN.load(Ordering::Relaxed) }

/// The dispatcher handle recorded during disabled init.
pub fn disp_handle() -> Option<DispatcherHandle> { *DISP_HANDLE.lock() }

pub fn default_waitset() -> Option<WaitsetRef> { *DEFAULT_WAITSET.lock() }

/// Runs `f` with the channel to init, if one was established.
pub fn with_init_rpc<R>(f: impl FnOnce(&InitRpc) -> R) -> Option<R> {
    INIT_RPC.lock().as_ref().map(f)
}

/// Address of the envp vector installed from the spawn parameters, or 0.
pub fn environ() -> usize { ENVIRON.load(Ordering::Relaxed) }

/// Disabled-phase initialization. Runs on the dispatcher stack before
/// the dispatcher is set up; must not invoke capabilities or assume
/// threads exist.
pub fn init_disabled(handle: DispatcherHandle, init_domain: bool) {
    INIT_DOMAIN.store(init_domain, Ordering::Relaxed);
    *DISP_HANDLE.lock() = Some(handle);
    services::disp_init_disabled(handle);
    services::thread_init_disabled(handle, init_domain);
}

/// Wires the C library hooks (terminal I/O, exit, assert) and the
/// logger. Safe to call from the CRT right after [`init_disabled`].
pub fn libc_glue_init() {
    mantle_logger::init(log::LevelFilter::Debug);
    libc_glue::install_hooks(is_init_domain());
}

fn slot_alloc_init() -> Result<(), SlotError> {
    default_slot_allocator_init(CNODE_SLOT_ALLOC, 0..L2_CNODE_SLOTS);
    Ok(())
}

/// Enabled-phase initialization; runs as the domain's first thread,
/// before main.
pub fn init_onthread(params: Option<&SpawnDomainParams>) -> Result<(), RuntimeError> {
    if let Some(p) = params {
        if p.envp[0] != 0 {
            ENVIRON.store(p.envp.as_ptr() as usize, Ordering::Relaxed);
        }
    }

    let ws = services::waitset_init().map_err(RuntimeError::WaitsetInit)?;
    *DEFAULT_WAITSET.lock() = Some(ws);

    services::ram_alloc_init();
    // All domains start from the small static pool; only init stays on
    // the fixed policy.
    services::ram_alloc_set_fixed(is_init_domain()).map_err(RuntimeError::RamAllocSet)?;

    morecore::morecore_init().map_err(RuntimeError::MorecoreInit)?;

    paging_init().map_err(RuntimeError::VspaceInit)?;

    slot_alloc_init().map_err(RuntimeError::SlotAllocInit)?;

    services::endpoint_init();

    // Init gets only the partial setup; everything else talks to init.
    if is_init_domain() {
        return Ok(());
    }

    let rpc = InitRpc::open(ws).map_err(RuntimeError::ChannelInit)?;
    *INIT_RPC.lock() = Some(rpc);
    debug!("runtime: connected to init");

    Ok(())
}
