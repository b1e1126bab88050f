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

//! `log` facade binding for Mantle OS domains.
//!
//! Formats records into a bounded stack buffer and emits them through
//! the kernel console. Messages too long for the buffer are truncated
//! with a trailing "...".

#![cfg_attr(not(test), no_std)]

use core::fmt::Write;
use log::{Metadata, Record};
use mantle_sys::syscall;

pub const MAX_MSG_LEN: usize = 256;

struct MsgBuffer {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
}

impl MsgBuffer {
    fn new() -> Self {
        MsgBuffer {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
        }
    }

    // Marks an overflowed message with a trailing "...". The failed
    // write already packed the buffer to capacity.
    fn truncate_with_ellipsis(&mut self) {
        self.buf[MAX_MSG_LEN - 3..].copy_from_slice(b"...");
        self.pos = MAX_MSG_LEN;
    }

    fn as_bytes(&self) -> &[u8] { &self.buf[..self.pos] }
}

impl Write for MsgBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let room = MAX_MSG_LEN - self.pos;
        let len = core::cmp::min(room, bytes.len());
        self.buf[self.pos..self.pos + len].copy_from_slice(&bytes[..len]);
        self.pos += len;
        if len < bytes.len() {
            return Err(core::fmt::Error);
        }
        Ok(())
    }
}

pub struct DebugLogger;

pub static MANTLE_LOGGER: DebugLogger = DebugLogger;

impl log::Log for DebugLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool { true }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut msg = MsgBuffer::new();
        // Log msgs are of the form: <target>::<fmt'd-msg>\n
        if write!(&mut msg, "{}::{}\n", record.target(), record.args()).is_err() {
            msg.truncate_with_ellipsis();
        }
        syscall::sys_print(msg.as_bytes());
    }

    fn flush(&self) {}
}

/// Installs the console logger. Called once during the disabled-phase
/// bootstrap; later calls are ignored.
pub fn init(max_level: log::LevelFilter) {
    if log::set_logger(&MANTLE_LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}
