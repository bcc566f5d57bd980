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

use axerrno::AxResult;

use crate::{HostPhysAddr, HostVirtAddr};

/// The interfaces which the host kernel must implement.
///
/// Unlike a per-architecture HAL, this one carries state: every monitor draws its
/// pages from a pool that is shared across monitors (see [`crate::Manager`]), so
/// methods take `&self`.
pub trait MonitorHal {
    /// Returns the number of physical pages of the host.
    ///
    /// Used to size reverse maps indexed by host frame number, and to pick the
    /// default guest memory size.
    fn host_memory_pages(&self) -> usize;

    /// Allocates `count` physically contiguous, pinned and zeroed pages.
    ///
    /// # Parameters
    ///
    /// * `count` - The number of 4K pages.
    ///
    /// # Returns
    ///
    /// * `AxResult<HostVirtAddr>` - The host virtual address of the first page.
    fn alloc_pages(&self, count: usize) -> AxResult<HostVirtAddr>;

    /// Returns a run of pages obtained from [`MonitorHal::alloc_pages`].
    fn free_pages(&self, vaddr: HostVirtAddr, count: usize);

    /// Maps an arbitrary host physical page into host virtual memory.
    ///
    /// # Parameters
    ///
    /// * `paddr` - The page-aligned physical address.
    ///
    /// # Returns
    ///
    /// * `AxResult<HostVirtAddr>` - Where the page can be accessed until unmapped.
    fn map(&self, paddr: HostPhysAddr) -> AxResult<HostVirtAddr>;

    /// Drops a mapping made by [`MonitorHal::map`].
    fn unmap(&self, vaddr: HostVirtAddr, paddr: HostPhysAddr);

    /// Converts a host virtual address to a host physical address.
    ///
    /// # Parameters
    ///
    /// * `vaddr` - The virtual address to convert.
    ///
    /// # Returns
    ///
    /// * `HostPhysAddr` - The corresponding physical address.
    fn virt_to_phys(&self, vaddr: HostVirtAddr) -> HostPhysAddr;

    /// Returns a pointer through which the monitor may access `vaddr`.
    ///
    /// On a real host this is the address itself. Hosts that hand out addresses
    /// from a window the monitor cannot dereference directly translate here.
    fn host_ptr(&self, vaddr: HostVirtAddr) -> *mut u8 {
        vaddr.as_mut_ptr()
    }
}

impl<T: MonitorHal + ?Sized> MonitorHal for &T {
    fn host_memory_pages(&self) -> usize {
        (**self).host_memory_pages()
    }

    fn alloc_pages(&self, count: usize) -> AxResult<HostVirtAddr> {
        (**self).alloc_pages(count)
    }

    fn free_pages(&self, vaddr: HostVirtAddr, count: usize) {
        (**self).free_pages(vaddr, count)
    }

    fn map(&self, paddr: HostPhysAddr) -> AxResult<HostVirtAddr> {
        (**self).map(paddr)
    }

    fn unmap(&self, vaddr: HostVirtAddr, paddr: HostPhysAddr) {
        (**self).unmap(vaddr, paddr)
    }

    fn virt_to_phys(&self, vaddr: HostVirtAddr) -> HostPhysAddr {
        (**self).virt_to_phys(vaddr)
    }

    fn host_ptr(&self, vaddr: HostVirtAddr) -> *mut u8 {
        (**self).host_ptr(vaddr)
    }
}
