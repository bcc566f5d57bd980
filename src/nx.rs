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

//! Execute-disable workaround.
//!
//! Some CPUs keep honouring a stale no-execute bit for the passage page right
//! after the CR3 load in the middle of the switch. While the workaround is
//! active, the host entry mapping the passage page has its NX bit cleared for
//! the duration of every switch.
//!
//! The workaround keys off the NX and PAE feature bits alone; it does not look
//! at CPU family or model.

use memory_addr::PAGE_SIZE_4K;

use crate::addr::PAGE_SHIFT;
use crate::space::PageTableFlags;
use crate::{ArchCpu, CpuFeatures, HostPhysAddr, HostVirtAddr, MonitorError, MonitorHal, MonitorResult};

const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// The host page table entry covering the passage page, kept mapped.
#[derive(Debug)]
struct NxEntry {
    table_va: HostVirtAddr,
    table_pa: HostPhysAddr,
    index: usize,
}

impl NxEntry {
    fn ptr<H: MonitorHal>(&self, hal: &H) -> *mut u64 {
        // SAFETY: `index` is below 512, within the mapped table page.
        unsafe { (hal.host_ptr(self.table_va) as *mut u64).add(self.index) }
    }
}

/// Clears and restores the NX bit of the passage page around each switch.
#[derive(Debug, Default)]
pub struct NxWorkaround {
    entry: Option<NxEntry>,
}

impl NxWorkaround {
    /// A workaround that does nothing.
    pub const fn inactive() -> Self {
        Self { entry: None }
    }

    /// Whether a CPU with `features` needs the workaround.
    pub fn needed(features: CpuFeatures) -> bool {
        features.contains(CpuFeatures::NX | CpuFeatures::PAE_ENABLED)
    }

    /// Whether switches are being wrapped.
    pub fn is_active(&self) -> bool {
        self.entry.is_some()
    }

    /// Finds the host PAE entry mapping `vaddr` under `cr3` and keeps its table
    /// mapped for later use.
    pub fn setup<H: MonitorHal>(hal: &H, cr3: u32, vaddr: u32) -> MonitorResult<Self> {
        let pdpt_pa = HostPhysAddr::from((cr3 as usize) & !(PAGE_SIZE_4K - 1));
        let pdpt_offset = (cr3 & 0xfe0) as usize;
        let pdpte = read_entry(hal, pdpt_pa, pdpt_offset / 8 + (vaddr >> 30) as usize)?;
        if pdpte & PageTableFlags::PRESENT.bits() == 0 {
            warn!("NX workaround: no PDPT entry for {vaddr:#x}");
            return Err(MonitorError::NotFound);
        }

        let pmd_pa = HostPhysAddr::from((pdpte & PHYS_ADDR_MASK) as usize);
        let pmd_index = ((vaddr >> 21) & 0x1ff) as usize;
        let pmde = read_entry(hal, pmd_pa, pmd_index)?;
        if pmde & PageTableFlags::PRESENT.bits() == 0 {
            warn!("NX workaround: no directory entry for {vaddr:#x}");
            return Err(MonitorError::NotFound);
        }
        if pmde & PageTableFlags::HUGE_PAGE.bits() != 0 {
            return Self::keep(hal, pmd_pa, pmd_index);
        }

        let pte_pa = HostPhysAddr::from((pmde & PHYS_ADDR_MASK) as usize);
        Self::keep(hal, pte_pa, ((vaddr as usize) >> PAGE_SHIFT) & 0x1ff)
    }

    fn keep<H: MonitorHal>(hal: &H, table_pa: HostPhysAddr, index: usize) -> MonitorResult<Self> {
        let table_va = hal.map(table_pa).map_err(|_| MonitorError::OutOfMemory {
            what: "NX workaround table mapping",
            pages: 1,
        })?;
        debug!(
            "NX workaround: entry {index} of table {:#x}",
            table_pa.as_usize()
        );
        Ok(Self {
            entry: Some(NxEntry {
                table_va,
                table_pa,
                index,
            }),
        })
    }

    /// Runs `f` with the passage page executable, if active.
    pub fn around<A, H, R>(&self, hal: &H, arch: &mut A, f: impl FnOnce(&mut A) -> R) -> R
    where
        A: ArchCpu,
        H: MonitorHal,
    {
        let Some(entry) = &self.entry else {
            return f(arch);
        };
        let ptr = entry.ptr(hal);
        let irq = arch.irq_save();
        // SAFETY: the table page stays mapped until `teardown`.
        let saved = unsafe { ptr.read_volatile() };
        unsafe { ptr.write_volatile(saved & !PageTableFlags::NO_EXECUTE.bits()) };
        arch.flush_tlb();

        let result = f(arch);

        // Bits the CPU set meanwhile (accessed, dirty) are kept.
        let no_execute = saved & PageTableFlags::NO_EXECUTE.bits();
        unsafe { ptr.write_volatile(ptr.read_volatile() | no_execute) };
        arch.flush_tlb();
        arch.irq_restore(irq);
        result
    }

    /// Drops the table mapping. Does nothing if inactive.
    pub fn teardown<H: MonitorHal>(&mut self, hal: &H) {
        if let Some(entry) = self.entry.take() {
            hal.unmap(entry.table_va, entry.table_pa);
        }
    }
}

/// Reads entry `index` of the 64-bit table at `table_pa` through a temporary
/// mapping.
fn read_entry<H: MonitorHal>(hal: &H, table_pa: HostPhysAddr, index: usize) -> MonitorResult<u64> {
    let table_va = hal.map(table_pa).map_err(|_| MonitorError::OutOfMemory {
        what: "NX workaround table mapping",
        pages: 1,
    })?;
    // SAFETY: the page is mapped and `index` stays below 512.
    let entry = unsafe { (hal.host_ptr(table_va) as *const u64).add(index).read_volatile() };
    hal.unmap(table_va, table_pa);
    Ok(entry)
}
