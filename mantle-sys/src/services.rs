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

//! Contracts of external library collaborators.
//!
//! The thread scheduler, wait-set machinery, physical RAM allocator and
//! the message channel to init live outside this repository; the runtime
//! bootstrap drives them through these entry points.

use crate::dispatcher::DispatcherHandle;
use crate::{KernelError, Word};

/// Handle to a wait-set (the domain's event/continuation queue).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WaitsetRef(pub Word);

/// Handle to a message channel.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChannelRef(pub Word);

#[cfg(not(feature = "CONFIG_FAKE_SYSCALLS"))]
extern "C" {
    fn svc_disp_init_disabled(handle: *mut u8);
    fn svc_thread_init_disabled(handle: *mut u8, init_domain: usize);
    fn svc_thread_exit(status: isize) -> !;
    fn svc_waitset_init(ws: *mut WaitsetRef) -> isize;
    fn svc_ram_alloc_init();
    fn svc_ram_alloc_set_fixed(fixed: usize) -> isize;
    fn svc_endpoint_init();
    fn svc_domain_id() -> usize;
    fn svc_channel_open_init(ws: WaitsetRef, chan: *mut ChannelRef) -> isize;
    fn svc_channel_send_string(chan: ChannelRef, buf: *const u8, len: usize) -> isize;
}

#[cfg(feature = "CONFIG_FAKE_SYSCALLS")]
use crate::fake::{
    svc_channel_open_init, svc_channel_send_string, svc_disp_init_disabled, svc_domain_id,
    svc_endpoint_init, svc_ram_alloc_init, svc_ram_alloc_set_fixed, svc_thread_exit,
    svc_thread_init_disabled, svc_waitset_init,
};

/// Initializes the dispatcher descriptor. Disabled-mode only; must not
/// invoke capabilities.
pub fn disp_init_disabled(handle: DispatcherHandle) {
    unsafe { svc_disp_init_disabled(handle.as_ptr()) }
}

/// Initializes the thread subsystem. Disabled-mode only.
pub fn thread_init_disabled(handle: DispatcherHandle, init_domain: bool) {
    unsafe { svc_thread_init_disabled(handle.as_ptr(), init_domain as usize) }
}

/// Terminates the current thread.
pub fn thread_exit(status: isize) -> ! {
    unsafe { svc_thread_exit(status) }
}

/// Initializes a wait-set and returns its handle.
pub fn waitset_init() -> Result<WaitsetRef, KernelError> {
    let mut ws = WaitsetRef(0);
    KernelError::wrap(unsafe { svc_waitset_init(&mut ws) })?;
    Ok(ws)
}

/// Initializes the RAM-allocator client state.
pub fn ram_alloc_init() {
    unsafe { svc_ram_alloc_init() }
}

/// Selects the RAM allocation policy: `fixed` pins allocations to the
/// early static pool (init domain only).
pub fn ram_alloc_set_fixed(fixed: bool) -> Result<(), KernelError> {
    KernelError::wrap(unsafe { svc_ram_alloc_set_fixed(fixed as usize) })
}

/// Initializes endpoint bookkeeping for the domain.
pub fn endpoint_init() {
    unsafe { svc_endpoint_init() }
}

/// Identifier of the current domain; 0 for init-spawned domains.
pub fn domain_id() -> Word {
    unsafe { svc_domain_id() }
}

/// Opens the message channel to the init domain over `ws`.
pub fn channel_open_init(ws: WaitsetRef) -> Result<ChannelRef, KernelError> {
    let mut chan = ChannelRef(0);
    KernelError::wrap(unsafe { svc_channel_open_init(ws, &mut chan) })?;
    Ok(chan)
}

/// Sends `msg` to init over `chan`; returns the byte count delivered.
pub fn channel_send_string(chan: ChannelRef, msg: &[u8]) -> Result<usize, KernelError> {
    let rc = unsafe { svc_channel_send_string(chan, msg.as_ptr(), msg.len()) };
    if rc < 0 {
        Err(KernelError::from((-rc) as usize))
    } else {
        Ok(rc as usize)
    }
}
