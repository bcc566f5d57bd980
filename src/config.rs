// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use memory_addr::PAGE_SIZE_4K;

/// Pages of boot memory handed to the guest right after its kernel image.
pub const DEFAULT_BOOTMEM_PAGES: usize = 0x140;

const MIB: usize = 1024 * 1024;

/// Per-monitor configuration, filled by the (external) configuration loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Size of the guest's pseudo-physical memory in bytes.
    ///
    /// `None` picks a default from the amount of host memory.
    pub ram_size: Option<usize>,
    /// Pages of boot memory mapped after the kernel image.
    pub bootmem_pages: usize,
    /// Forces the no-execute workaround on or off. `None` follows the CPU.
    pub nx_workaround: Option<bool>,
    /// Populate all of the guest's memory at boot instead of on request.
    pub populate_at_boot: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ram_size: None,
            bootmem_pages: DEFAULT_BOOTMEM_PAGES,
            nx_workaround: None,
            populate_at_boot: true,
        }
    }
}

impl MonitorConfig {
    /// Guest memory size in bytes, page aligned.
    ///
    /// Without an explicit `ram_size` the guest gets 32 MiB on hosts with at
    /// least 128 MiB of memory and 16 MiB otherwise.
    pub fn memory_size(&self, host_memory_pages: usize) -> usize {
        let size = match self.ram_size {
            Some(size) => size,
            None if host_memory_pages * PAGE_SIZE_4K >= 128 * MIB => 32 * MIB,
            None => 16 * MIB,
        };
        memory_addr::align_down_4k(size)
    }
}
