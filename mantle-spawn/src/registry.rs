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

//! Registry of spawned domains.
//!
//! Init keeps one of these so it can enumerate and address the children
//! it created.

use hashbrown::HashMap;
use mantle_sys::CapRef;
use smallstr::SmallString;

pub type DomainName = SmallString<[u8; 32]>;

// Domain capacity before spillover to the heap.
pub const DEFAULT_DOMAINS_CAPACITY: usize = 10;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DomainState {
    Running,
    Stopped,
}

#[derive(Debug, Copy, Clone)]
pub struct DomainEntry {
    pub dispatcher: CapRef,
    pub state: DomainState,
}

pub struct SpawnRegistry {
    domains: HashMap<DomainName, DomainEntry>,
}

impl Default for SpawnRegistry {
    fn default() -> Self { Self::new() }
}

impl SpawnRegistry {
    pub fn new() -> Self {
        SpawnRegistry {
            domains: HashMap::with_capacity(DEFAULT_DOMAINS_CAPACITY),
        }
    }

    /// Records a freshly spawned domain. Returns false if the name is
    /// already taken.
    pub fn register(&mut self, name: &str, dispatcher: CapRef) -> bool {
        let key = DomainName::from_str(name);
        if self.domains.contains_key(&key) {
            return false;
        }
        self.domains.insert(
            key,
            DomainEntry {
                dispatcher,
                state: DomainState::Running,
            },
        );
        true
    }

    pub fn lookup(&self, name: &str) -> Option<&DomainEntry> {
        self.domains.get(&DomainName::from_str(name))
    }

    pub fn set_state(&mut self, name: &str, state: DomainState) -> bool {
        match self.domains.get_mut(&DomainName::from_str(name)) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<DomainEntry> {
        self.domains.remove(&DomainName::from_str(name))
    }

    pub fn len(&self) -> usize { self.domains.len() }

    pub fn is_empty(&self) -> bool { self.domains.is_empty() }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(|k| k.as_str())
    }
}
