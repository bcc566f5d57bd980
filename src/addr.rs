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

use memory_addr::{PhysAddr, VirtAddr, PAGE_SIZE_4K};

/// Host virtual address.
pub type HostVirtAddr = VirtAddr;
/// Host physical address.
pub type HostPhysAddr = PhysAddr;
/// Guest (kernel) virtual address.
///
/// The guest runs its kernel with a fixed offset between virtual and
/// pseudo-physical addresses, so this is the only guest address type the
/// monitor deals with.
pub type GuestVirtAddr = VirtAddr;

/// Start of the guest kernel's linear mapping of pseudo-physical memory.
pub const GUEST_PAGE_OFFSET: usize = 0xC000_0000;

/// Shift between an address and its 4K frame number.
pub const PAGE_SHIFT: usize = 12;

/// Frame number of a host physical address.
pub const fn host_pfn(paddr: HostPhysAddr) -> usize {
    paddr.as_usize() >> PAGE_SHIFT
}

/// Number of 4K pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE_4K)
}

/// Narrows a host address for the 32-bit structures shared with the switch
/// routine. Returns `None` if the value does not fit.
pub fn narrow(value: usize) -> Option<u32> {
    u32::try_from(value).ok()
}
