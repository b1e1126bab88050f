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

//! C library hook table.
//!
//! Terminal I/O, exit and assert for the C side of the runtime. The
//! init domain writes straight to the kernel console; spawned domains
//! relay through the message channel to init.

use core::fmt::Write;
use log::debug;
use mantle_sys::{services, syscall, CAP_DISPATCHER};
use spin::Mutex;

pub type TerminalWriteFn = fn(&[u8]) -> usize;
pub type TerminalReadFn = fn(&mut [u8]) -> usize;

struct LibcHooks {
    write: TerminalWriteFn,
    read: TerminalReadFn,
}

static HOOKS: Mutex<LibcHooks> = Mutex::new(LibcHooks {
    write: syscall_terminal_write,
    read: dummy_terminal_read,
});

fn syscall_terminal_write(buf: &[u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    syscall::sys_print(buf)
}

fn rpc_terminal_write(buf: &[u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    crate::with_init_rpc(|rpc| rpc.send_bytes(buf)).unwrap_or(0)
}

fn dummy_terminal_read(buf: &mut [u8]) -> usize {
    debug!("terminal read NYI, claiming {} bytes read", buf.len());
    buf.len()
}

/// Selects the hook implementations for this domain.
pub fn install_hooks(init_domain: bool) {
    let mut hooks = HOOKS.lock();
    hooks.write = if init_domain {
        syscall_terminal_write
    } else {
        rpc_terminal_write
    };
    hooks.read = dummy_terminal_read;
}

/// Terminal write hook; returns the byte count delivered.
pub fn terminal_write(buf: &[u8]) -> usize { (HOOKS.lock().write)(buf) }

/// Terminal read hook.
pub fn terminal_read(buf: &mut [u8]) -> usize { (HOOKS.lock().read)(buf) }

/// Exit hook. For init-spawned domains the dispatcher capability is
/// revoked and deleted; a failure of either leaves nothing sane to run,
/// so the domain spins. Finally the current thread terminates.
pub fn libc_exit(status: isize) -> ! {
    if services::domain_id() == 0 {
        if syscall::cap_revoke(CAP_DISPATCHER).is_err() {
            syscall::sys_print(b"revoking dispatcher failed in _Exit, spinning!\n");
            loop {
                core::hint::spin_loop();
            }
        }
        if syscall::cap_delete(CAP_DISPATCHER).is_err() {
            syscall::sys_print(b"deleting dispatcher failed in _Exit, spinning!\n");
            loop {
                core::hint::spin_loop();
            }
        }
    } else {
        debug!("exit: teardown via init NYI");
    }
    services::thread_exit(status)
}

const ASSERT_BUF_LEN: usize = 512;

struct AssertBuffer {
    buf: [u8; ASSERT_BUF_LEN],
    pos: usize,
}

impl Write for AssertBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let room = ASSERT_BUF_LEN - self.pos;
        let len = core::cmp::min(room, bytes.len());
        self.buf[self.pos..self.pos + len].copy_from_slice(&bytes[..len]);
        self.pos += len;
        Ok(())
    }
}

/// Assert hook: formats a diagnostic with the core id and dispatcher
/// name and emits it through the kernel console.
pub fn libc_assert(expression: &str, file: &str, function: &str, line: u32) {
    let (core_id, name) = match crate::disp_handle() {
        Some(handle) => {
            let frame = unsafe { handle.frame() };
            (frame.generic.core_id, frame.shared.name())
        }
        None => (0, "unknown"),
    };

    let mut msg = AssertBuffer {
        buf: [0; ASSERT_BUF_LEN],
        pos: 0,
    };
    let _ = write!(
        &mut msg,
        "Assertion failed on core {} in {}: {}, function {}, file {}, line {}.\n",
        core_id, name, expression, function, file, line
    );
    syscall::sys_print(&msg.buf[..msg.pos]);
}
