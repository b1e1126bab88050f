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

//! Multiboot module lookup over bootinfo.

use mantle_sys::bootinfo::{Bootinfo, MemRegion, RegionType};

/// Finds the module region whose name matches `name`.
pub fn find_module<'a>(bi: &'a Bootinfo, name: &str) -> Option<&'a MemRegion> {
    bi.regions[..bi.regions_length]
        .iter()
        .find(|r| r.mr_type == RegionType::Module && r.module_name() == name)
}

/// The module's command-line option string.
pub fn module_opts(region: &MemRegion) -> &str { region.cmdline() }
