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

//! Pseudo-physical memory of the guest.
//!
//! Guest frame `n` lives at guest virtual address `GUEST_PAGE_OFFSET + n * 4K`
//! and is backed by whatever host page the monitor mapped there. The mapping is
//! kept in 32-bit page table entries that the guest itself uses as its kernel
//! page tables, plus two reverse maps keyed by host frame.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use memory_addr::{is_aligned_4k, PAGE_SIZE_4K};

use crate::addr::{host_pfn, narrow, GUEST_PAGE_OFFSET, PAGE_SHIFT};
use crate::space::PageTableFlags;
use crate::{GuestVirtAddr, HostPhysAddr, HostVirtAddr, MonitorError, MonitorHal, MonitorResult};

/// Entries per page of 32-bit page table entries.
pub const PTES_PER_PAGE: usize = PAGE_SIZE_4K / 4;

const PTE_ADDR_MASK: u32 = !(PAGE_SIZE_4K as u32 - 1);

/// One page of guest page table entries.
#[derive(Debug, Clone, Copy)]
struct PtePage {
    vaddr: HostVirtAddr,
    paddr: HostPhysAddr,
}

/// The guest's frame table and its reverse maps.
pub struct FrameTable {
    frames: usize,
    pte_pages: Vec<PtePage>,
    /// Pages allocated as one run, recorded at the run's first frame.
    allocated: Vec<u32>,
    host_va: BTreeMap<usize, HostVirtAddr>,
    guest_va: BTreeMap<usize, GuestVirtAddr>,
}

impl FrameTable {
    /// Creates an empty table for `frames` pseudo-physical frames. The page
    /// table pages are allocated from the host right away.
    pub fn new<H: MonitorHal>(hal: &H, frames: usize) -> MonitorResult<Self> {
        let mut table = Self {
            frames,
            pte_pages: Vec::new(),
            allocated: vec![0; frames],
            host_va: BTreeMap::new(),
            guest_va: BTreeMap::new(),
        };
        let count = frames.div_ceil(PTES_PER_PAGE);
        for _ in 0..count {
            match hal.alloc_pages(1) {
                Ok(vaddr) => {
                    let paddr = hal.virt_to_phys(vaddr);
                    table.pte_pages.push(PtePage { vaddr, paddr });
                }
                Err(_) => {
                    table.free(hal);
                    return Err(MonitorError::OutOfMemory {
                        what: "frame table",
                        pages: count,
                    });
                }
            }
        }
        Ok(table)
    }

    /// Number of pseudo-physical frames.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Number of page table pages.
    pub fn table_pages(&self) -> usize {
        self.pte_pages.len()
    }

    /// Host virtual address of page table page `index`.
    pub fn table_page(&self, index: usize) -> Option<(HostVirtAddr, HostPhysAddr)> {
        self.pte_pages.get(index).map(|p| (p.vaddr, p.paddr))
    }

    /// Guest virtual address of `frame`.
    pub fn guest_address(frame: usize) -> GuestVirtAddr {
        GuestVirtAddr::from(GUEST_PAGE_OFFSET + (frame << PAGE_SHIFT))
    }

    /// The frame at guest address `vaddr`, if it is inside pseudo-physical
    /// memory.
    pub fn frame_of(&self, vaddr: GuestVirtAddr) -> Option<usize> {
        let frame = vaddr.as_usize().checked_sub(GUEST_PAGE_OFFSET)? >> PAGE_SHIFT;
        (frame < self.frames).then_some(frame)
    }

    fn pte_ptr<H: MonitorHal>(&self, hal: &H, frame: usize) -> *mut u32 {
        let page = &self.pte_pages[frame / PTES_PER_PAGE];
        // SAFETY: the index stays inside the page.
        unsafe { (hal.host_ptr(page.vaddr) as *mut u32).add(frame % PTES_PER_PAGE) }
    }

    fn pte<H: MonitorHal>(&self, hal: &H, frame: usize) -> u32 {
        // SAFETY: page table pages are owned until `free`.
        unsafe { self.pte_ptr(hal, frame).read_volatile() }
    }

    fn set_pte<H: MonitorHal>(&mut self, hal: &H, frame: usize, value: u32) {
        // SAFETY: as above.
        unsafe { self.pte_ptr(hal, frame).write_volatile(value) }
    }

    /// Raw entry of `frame`, zero when unmapped.
    pub fn entry<H: MonitorHal>(&self, hal: &H, frame: usize) -> u32 {
        if frame < self.frames {
            self.pte(hal, frame)
        } else {
            0
        }
    }

    /// Whether `frame` is backed.
    pub fn is_mapped<H: MonitorHal>(&self, hal: &H, frame: usize) -> bool {
        self.entry(hal, frame) & PageTableFlags::PRESENT.bits() as u32 != 0
    }

    /// Host virtual address of the host frame `pfn`, if the guest maps it.
    pub fn host_va_of(&self, pfn: usize) -> Option<HostVirtAddr> {
        self.host_va.get(&pfn).copied()
    }

    /// Guest virtual address of the host frame `pfn`, if the guest maps it.
    pub fn guest_va_of(&self, pfn: usize) -> Option<GuestVirtAddr> {
        self.guest_va.get(&pfn).copied()
    }

    /// Number of host frames in the reverse maps.
    pub fn mapped_frames(&self) -> usize {
        self.host_va.len()
    }

    /// Pages allocated as a run starting at `frame`, zero if none.
    pub fn allocation_at(&self, frame: usize) -> usize {
        self.allocated.get(frame).copied().unwrap_or(0) as usize
    }

    /// Backs `frame` with the host page at `host_page`.
    ///
    /// Mapping a frame again to the same page is a no-op. Mapping it to another
    /// page, or mapping a page that already backs another frame, is an
    /// [`MonitorError::InconsistentState`]. A host page the guest's 32-bit
    /// entries cannot reach is reported as [`MonitorError::OutOfMemory`].
    pub fn map_page<H: MonitorHal>(
        &mut self,
        hal: &H,
        frame: usize,
        host_page: HostVirtAddr,
    ) -> MonitorResult {
        if frame >= self.frames || !is_aligned_4k(host_page.as_usize()) {
            return Err(MonitorError::BadGuestAddress(
                Self::guest_address(frame).as_usize(),
            ));
        }
        let paddr = hal.virt_to_phys(host_page);
        let Some(pa32) = narrow(paddr.as_usize()) else {
            warn!("host page {:#x} is above 4 GiB", paddr.as_usize());
            return Err(MonitorError::OutOfMemory {
                what: "32-bit addressable host page",
                pages: 1,
            });
        };
        let entry = pa32 | PageTableFlags::KERNEL_TABLE.bits() as u32;
        match self.pte(hal, frame) {
            0 => {}
            existing if existing == entry => return Ok(()),
            _ => return Err(MonitorError::InconsistentState { frame }),
        }
        // One host page backs at most one frame, or the reverse maps lose it.
        let pfn = host_pfn(paddr);
        if self.guest_va.contains_key(&pfn) {
            return Err(MonitorError::InconsistentState { frame });
        }

        self.set_pte(hal, frame, entry);
        self.host_va.insert(pfn, host_page);
        self.guest_va.insert(pfn, Self::guest_address(frame));
        Ok(())
    }

    /// Removes the backing of `frame`, returning whether there was one.
    pub fn unmap_page<H: MonitorHal>(&mut self, hal: &H, frame: usize) -> bool {
        if frame >= self.frames {
            return false;
        }
        let entry = self.pte(hal, frame);
        if entry == 0 {
            return false;
        }
        self.set_pte(hal, frame, 0);
        let pfn = (entry & PTE_ADDR_MASK) as usize >> PAGE_SHIFT;
        self.host_va.remove(&pfn);
        self.guest_va.remove(&pfn);
        true
    }

    fn region(&self, base: GuestVirtAddr, count: usize) -> MonitorResult<usize> {
        match self.frame_of(base) {
            Some(frame)
                if count > 0 && is_aligned_4k(base.as_usize()) && frame + count <= self.frames =>
            {
                Ok(frame)
            }
            _ => Err(MonitorError::BadGuestAddress(base.as_usize())),
        }
    }

    /// Backs `count` frames from `base` with one run of fresh host pages.
    ///
    /// A region already allocated with the same count, or already entirely
    /// mapped, is left alone. A partially backed region or one overlapping a
    /// run of another size is an [`MonitorError::InsaneAllocation`].
    pub fn allocate_and_map_region<H: MonitorHal>(
        &mut self,
        hal: &H,
        base: GuestVirtAddr,
        count: usize,
    ) -> MonitorResult {
        let frame = self.region(base, count)?;
        let recorded = self.allocation_at(frame);
        if recorded == count {
            return Ok(());
        }
        let mapped = (frame..frame + count)
            .filter(|&f| self.is_mapped(hal, f))
            .count();
        if mapped == count && recorded == 0 {
            return Ok(());
        }
        if mapped != 0 || recorded != 0 {
            error!("insane allocation: {count} pages at frame {frame:#x}, {mapped} mapped, {recorded} recorded");
            return Err(MonitorError::InsaneAllocation {
                frame,
                pages: count,
            });
        }

        let vaddr = hal
            .alloc_pages(count)
            .map_err(|_| MonitorError::OutOfMemory {
                what: "guest memory",
                pages: count,
            })?;
        for i in 0..count {
            if let Err(err) = self.map_page(hal, frame + i, vaddr + i * PAGE_SIZE_4K) {
                for done in frame..frame + i {
                    self.unmap_page(hal, done);
                }
                hal.free_pages(vaddr, count);
                return Err(err);
            }
        }
        self.allocated[frame] = count as u32;
        Ok(())
    }

    /// Undoes [`FrameTable::allocate_and_map_region`] for the run at `base`,
    /// giving the host pages back as one run.
    pub fn unmap_and_free<H: MonitorHal>(&mut self, hal: &H, base: GuestVirtAddr) -> MonitorResult {
        let frame = self.region(base, 1)?;
        let count = self.allocation_at(frame);
        if count == 0 {
            return Err(MonitorError::NotFound);
        }
        let pfn = (self.pte(hal, frame) & PTE_ADDR_MASK) as usize >> PAGE_SHIFT;
        let Some(vaddr) = self.host_va_of(pfn) else {
            return Err(MonitorError::InconsistentState { frame });
        };
        for f in frame..frame + count {
            self.unmap_page(hal, f);
        }
        self.allocated[frame] = 0;
        hal.free_pages(vaddr, count);
        Ok(())
    }

    /// Backs every frame from `first` on that is still empty, one page at a time.
    ///
    /// On failure every page this call allocated is released again.
    pub fn alloc_and_map_all<H: MonitorHal>(&mut self, hal: &H, first: usize) -> MonitorResult {
        let mut populated = Vec::new();
        for frame in first..self.frames {
            if self.is_mapped(hal, frame) {
                continue;
            }
            let base = Self::guest_address(frame);
            if let Err(err) = self.allocate_and_map_region(hal, base, 1) {
                error!(
                    "populating guest memory failed at frame {frame:#x} after {} pages: {err}",
                    populated.len()
                );
                for &done in populated.iter().rev() {
                    // Just allocated as single pages.
                    if let Err(undo) = self.unmap_and_free(hal, Self::guest_address(done)) {
                        warn!("rollback of frame {done:#x} failed: {undo}");
                    }
                }
                return Err(err);
            }
            populated.push(frame);
        }
        info!("populated {} guest pages", populated.len());
        Ok(())
    }

    /// Frees every run recorded in the table, last frame first.
    pub fn release_allocations<H: MonitorHal>(&mut self, hal: &H) -> usize {
        let mut released = 0;
        for frame in (0..self.frames).rev() {
            if self.allocated[frame] != 0
                && self.unmap_and_free(hal, Self::guest_address(frame)).is_ok()
            {
                released += 1;
            }
        }
        released
    }

    /// Returns the page table pages to the host. Entries still present are
    /// dropped without freeing what they point at.
    pub fn free<H: MonitorHal>(&mut self, hal: &H) {
        while let Some(page) = self.pte_pages.pop() {
            hal.free_pages(page.vaddr, 1);
        }
        self.host_va.clear();
        self.guest_va.clear();
        self.allocated.iter_mut().for_each(|n| *n = 0);
    }

    /// Host pointer to guest address `vaddr`, valid up to the end of its page.
    fn host_ptr_of<H: MonitorHal>(&self, hal: &H, vaddr: usize) -> MonitorResult<*mut u8> {
        let frame = self
            .frame_of(GuestVirtAddr::from(vaddr))
            .ok_or(MonitorError::BadGuestAddress(vaddr))?;
        let entry = self.pte(hal, frame);
        if entry & PageTableFlags::PRESENT.bits() as u32 == 0 {
            return Err(MonitorError::BadGuestAddress(vaddr));
        }
        let pfn = (entry & PTE_ADDR_MASK) as usize >> PAGE_SHIFT;
        let page = self
            .host_va_of(pfn)
            .ok_or(MonitorError::InconsistentState { frame })?;
        // SAFETY: the offset stays inside the page.
        Ok(unsafe { hal.host_ptr(page).add(vaddr % PAGE_SIZE_4K) })
    }

    /// Copies `data` into guest memory at `vaddr`, page by page.
    pub fn copy_to_guest<H: MonitorHal>(
        &self,
        hal: &H,
        vaddr: GuestVirtAddr,
        data: &[u8],
    ) -> MonitorResult {
        let mut done = 0;
        while done < data.len() {
            let at = vaddr.as_usize() + done;
            let chunk = (PAGE_SIZE_4K - at % PAGE_SIZE_4K).min(data.len() - done);
            let dst = self.host_ptr_of(hal, at)?;
            // SAFETY: `chunk` bytes fit in the destination page.
            unsafe { core::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst, chunk) };
            done += chunk;
        }
        Ok(())
    }

    /// Copies guest memory at `vaddr` into `buf`, page by page.
    pub fn copy_from_guest<H: MonitorHal>(
        &self,
        hal: &H,
        vaddr: GuestVirtAddr,
        buf: &mut [u8],
    ) -> MonitorResult {
        let mut done = 0;
        while done < buf.len() {
            let at = vaddr.as_usize() + done;
            let chunk = (PAGE_SIZE_4K - at % PAGE_SIZE_4K).min(buf.len() - done);
            let src = self.host_ptr_of(hal, at)?;
            // SAFETY: `chunk` bytes fit in the source page.
            unsafe { core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk) };
            done += chunk;
        }
        Ok(())
    }
}
