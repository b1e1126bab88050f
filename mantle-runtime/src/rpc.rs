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

//! Message channel to the init domain.
//!
//! The channel machinery itself lives in the channel library; this is
//! the handle a spawned domain keeps for console relaying and service
//! requests.

use log::warn;
use mantle_sys::services::{self, ChannelRef, WaitsetRef};
use mantle_sys::KernelError;

pub struct InitRpc {
    chan: ChannelRef,
}

impl InitRpc {
    /// Opens the channel to init over the given wait-set.
    pub fn open(ws: WaitsetRef) -> Result<Self, KernelError> {
        let chan = services::channel_open_init(ws)?;
        Ok(InitRpc { chan })
    }

    pub fn channel(&self) -> ChannelRef { self.chan }

    /// Sends raw bytes to init; returns the count delivered.
    pub fn send_bytes(&self, msg: &[u8]) -> usize {
        match services::channel_send_string(self.chan, msg) {
            Ok(n) => n,
            Err(e) => {
                warn!("send to init failed: {:?}", e);
                0
            }
        }
    }

    pub fn send_string(&self, msg: &str) -> usize { self.send_bytes(msg.as_bytes()) }
}
