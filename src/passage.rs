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

use core::ptr::NonNull;

use memory_addr::PAGE_SIZE_4K;

use crate::addr::narrow;
use crate::context::Cr4;
use crate::error::InitError;
use crate::layout::PASSAGE_CODE_SIZE;
use crate::space::{build_transitional, TransitionalSpaces, TransitionalTables};
use crate::{
    ArchCpu, CpuContext, DescriptorTablePointer, GuestVirtAddr, HostPhysAddr, HostVirtAddr,
    CpuFeatures, Mailbox, MonitorError, MonitorHal, MonitorResult, NxWorkaround, PagingMode,
    RFlags, Side,
};

/// Pages in a passage: the header plus the transitional tables.
pub const PASSAGE_PAGES: usize = 1 + crate::space::TRANSITIONAL_TABLE_PAGES;

/// Kernel code selector of the guest.
pub const GUEST_KERNEL_CS: u16 = 0x10;
/// Kernel data selector of the guest.
pub const GUEST_KERNEL_DS: u16 = 0x18;

/// Bytes left unused at the top of the guest's initial stack.
const INIT_STACK_SLACK: u32 = 0x50;
/// Size of the guest's initial task union, stack included.
const INIT_TASK_SIZE: u32 = 0x2000;
/// GDT entries the guest kernel expects at least.
const GUEST_GDT_ENTRIES: u16 = 0x20;
/// IDT entries of the guest kernel.
const GUEST_IDT_ENTRIES: u16 = 256;

/// The first page of a passage.
#[repr(C, align(4096))]
pub struct PassageHeader {
    /// Physical address of this page.
    pub self_physical: u32,
    /// Virtual address of this page per [`Side`].
    pub views: [u32; 2],
    /// Host paging mode: 0 for flat paging, 1 for PAE.
    pub mode: u32,
    reserved0: [u32; 12],
    /// Saved state of the host.
    pub host: CpuContext,
    /// Saved state of the guest.
    pub guest: CpuContext,
    reserved1: [u8; 0xf0],
    /// Requests between the two sides.
    pub mailbox: Mailbox,
    reserved2: [u8; 0x1fc],
    /// The switch routine.
    pub code: [u8; PASSAGE_CODE_SIZE],
}

impl PassageHeader {
    /// An all-zero header.
    pub const fn zeroed() -> Self {
        Self {
            self_physical: 0,
            views: [0; 2],
            mode: 0,
            reserved0: [0; 12],
            host: CpuContext::zeroed(),
            guest: CpuContext::zeroed(),
            reserved1: [0; 0xf0],
            mailbox: Mailbox::zeroed(),
            reserved2: [0; 0x1fc],
            code: [0; PASSAGE_CODE_SIZE],
        }
    }

    /// The saved state of `side`.
    pub fn context(&self, side: Side) -> &CpuContext {
        match side {
            Side::Host => &self.host,
            Side::Guest => &self.guest,
        }
    }

    /// The saved state of `side`, mutably.
    pub fn context_mut(&mut self, side: Side) -> &mut CpuContext {
        match side {
            Side::Host => &mut self.host,
            Side::Guest => &mut self.guest,
        }
    }

    /// The paging mode of the host.
    pub fn paging_mode(&self) -> PagingMode {
        if self.mode == 1 {
            PagingMode::Extended
        } else {
            PagingMode::Flat
        }
    }

    /// Physical address of the first transitional table page.
    pub fn tables_phys(&self) -> u32 {
        self.self_physical + PAGE_SIZE_4K as u32
    }
}

/// A whole passage: header and tables, physically contiguous.
#[repr(C)]
pub struct PassagePage {
    /// Contexts, mailbox and switch code.
    pub header: PassageHeader,
    /// Page tables of the transitional spaces.
    pub tables: TransitionalTables,
}

impl PassagePage {
    /// An all-zero passage.
    pub const fn zeroed() -> Self {
        Self {
            header: PassageHeader::zeroed(),
            tables: TransitionalTables::new(),
        }
    }
}

/// What the guest image tells the monitor about how to boot it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestBootParams {
    /// The cooperative entry point.
    pub entry: u32,
    /// Base of the initial task union, which holds the boot stack.
    pub init_task_union: u32,
    /// Physical address of the guest's page directory.
    pub page_directory: u32,
    /// The guest kernel's GDT.
    pub gdt_table: u32,
    /// The guest kernel's IDT.
    pub idt_table: u32,
}

/// Builds the guest's first state from the host's.
///
/// The guest starts with the host's control and debug registers, minus the CR4
/// features it does not handle, and its own tables, selectors and stack. Its
/// page tables are flat, so it never runs with PAE even on a PAE host.
pub fn guest_context(
    host: &CpuContext,
    boot: &GuestBootParams,
    spaces: &TransitionalSpaces,
) -> CpuContext {
    let mut guest = *host;
    guest.tr = 0;
    guest.ldt = 0;
    guest.cr4 = host.cr4 & !(Cr4::MCE | Cr4::PGE | Cr4::OSXMMEXCPT | Cr4::PAE).bits();
    guest.cr3 = boot.page_directory;
    let gdt_limit = (GUEST_GDT_ENTRIES * 8 - 1).max(host.gdt.limit);
    guest.gdt = DescriptorTablePointer::new(boot.gdt_table, gdt_limit);
    guest.idt = DescriptorTablePointer::new(boot.idt_table, GUEST_IDT_ENTRIES * 8 - 1);
    guest.esp = boot.init_task_union + INIT_TASK_SIZE - INIT_STACK_SLACK;
    guest.flags = host.flags & !RFlags::IF.bits();
    guest.return_eip = boot.entry;
    guest.cs = GUEST_KERNEL_CS;
    guest.ds = GUEST_KERNEL_DS;
    guest.es = GUEST_KERNEL_DS;
    guest.fs = GUEST_KERNEL_DS;
    guest.gs = GUEST_KERNEL_DS;
    guest.ss = GUEST_KERNEL_DS;
    guest.other_map = spaces.other_map(Side::Guest);
    guest.temp_cr3 = spaces.space(Side::Guest).root;
    guest.scratch = [0; 3];
    guest
}

/// Owner of one passage page run.
pub struct Passage {
    vaddr: HostVirtAddr,
    paddr: HostPhysAddr,
    page: NonNull<PassagePage>,
    spaces: Option<TransitionalSpaces>,
    nx: NxWorkaround,
}

impl Passage {
    /// Reserves a pinned, physically contiguous passage.
    pub fn allocate<H: MonitorHal>(hal: &H) -> MonitorResult<Self> {
        let vaddr = hal
            .alloc_pages(PASSAGE_PAGES)
            .map_err(|_| MonitorError::OutOfMemory {
                what: "passage page",
                pages: PASSAGE_PAGES,
            })?;
        let Some(page) = NonNull::new(hal.host_ptr(vaddr) as *mut PassagePage) else {
            hal.free_pages(vaddr, PASSAGE_PAGES);
            return Err(MonitorError::OutOfMemory {
                what: "passage page",
                pages: PASSAGE_PAGES,
            });
        };
        // SAFETY: the run is ours and large enough for a `PassagePage`, which is
        // valid when all zero.
        unsafe { page.as_ptr().write_bytes(0, 1) };
        let paddr = hal.virt_to_phys(vaddr);
        debug!(
            "passage page at {:#x} (phys {:#x})",
            vaddr.as_usize(),
            paddr.as_usize()
        );
        Ok(Self {
            vaddr,
            paddr,
            page,
            spaces: None,
            nx: NxWorkaround::inactive(),
        })
    }

    /// Host virtual address of the passage.
    pub fn vaddr(&self) -> HostVirtAddr {
        self.vaddr
    }

    /// Physical address of the passage.
    pub fn paddr(&self) -> HostPhysAddr {
        self.paddr
    }

    /// The transitional spaces, once initialized.
    pub fn spaces(&self) -> Option<&TransitionalSpaces> {
        self.spaces.as_ref()
    }

    /// Whether switches go through the NX workaround.
    pub fn nx_active(&self) -> bool {
        self.nx.is_active()
    }

    /// The page contents.
    pub fn page(&self) -> &PassagePage {
        // SAFETY: exclusively owned until `free`.
        unsafe { self.page.as_ref() }
    }

    /// The page contents, mutably.
    pub fn page_mut(&mut self) -> &mut PassagePage {
        // SAFETY: exclusively owned until `free`.
        unsafe { self.page.as_mut() }
    }

    /// The request record shared with the guest.
    pub fn mailbox(&mut self) -> &mut Mailbox {
        &mut self.page_mut().header.mailbox
    }

    /// Fills both contexts, the switch code and the transitional tables.
    ///
    /// # Parameters
    ///
    /// * `arch` - The CPU, for its features, code and a host snapshot.
    /// * `boot` - What the guest image exports.
    /// * `guest_view` - Where the guest maps the passage.
    /// * `nx_override` - Forces the NX workaround on or off. Forcing it on
    ///   requires a host with PAE paging.
    pub fn initialize<H: MonitorHal, A: ArchCpu>(
        &mut self,
        hal: &H,
        arch: &A,
        boot: &GuestBootParams,
        guest_view: GuestVirtAddr,
        nx_override: Option<bool>,
    ) -> MonitorResult<TransitionalSpaces> {
        let host_view = narrow(self.vaddr.as_usize())
            .ok_or(InitError::NotAddressable("passage host view"))?;
        let guest_view = narrow(guest_view.as_usize())
            .ok_or(InitError::NotAddressable("passage guest view"))?;
        let self_physical = narrow(self.paddr.as_usize() + PASSAGE_PAGES * PAGE_SIZE_4K)
            .and_then(|_| narrow(self.paddr.as_usize()))
            .ok_or(InitError::NotAddressable("passage page"))?;

        let features = arch.features();
        let mode = PagingMode::detect(features);
        let nx = nx_override.unwrap_or_else(|| NxWorkaround::needed(features));
        if nx && !features.contains(CpuFeatures::PAE_ENABLED) {
            return Err(InitError::Unsupported("NX workaround without PAE").into());
        }
        let code = arch.passage_code();
        if code.len() > PASSAGE_CODE_SIZE {
            return Err(InitError::LayoutOverflow("switch routine").into());
        }

        let mut views = [0; 2];
        views[Side::Host as usize] = host_view;
        views[Side::Guest as usize] = guest_view;

        let host_snapshot = arch.capture();
        let page = self.page_mut();
        page.header = PassageHeader::zeroed();
        page.header.self_physical = self_physical;
        page.header.views = views;
        page.header.mode = (mode == PagingMode::Extended) as u32;
        page.header.code[..code.len()].copy_from_slice(code);

        let tables_phys = page.header.tables_phys();
        let spaces = build_transitional(&mut page.tables, tables_phys, self_physical, mode, views)?;

        let mut host = host_snapshot;
        host.other_map = spaces.other_map(Side::Host);
        host.temp_cr3 = spaces.space(Side::Host).root;
        page.header.host = host;
        page.header.guest = guest_context(&host, boot, &spaces);

        page.header.host.dump("host");
        page.header.guest.dump("guest");
        for side in [Side::Host, Side::Guest] {
            let space = spaces.space(side);
            debug!(
                "{side:?} transitional space: {:?}, root {:#x}, {} leaf table(s)",
                space.mode, space.root, space.leaf_tables
            );
        }

        if nx {
            self.nx = NxWorkaround::setup(hal, host.cr3, host_view)?;
            info!("NX workaround enabled");
        }
        self.spaces = Some(spaces);
        Ok(spaces)
    }

    /// Runs the guest until it switches back, with the NX workaround if active.
    ///
    /// # Safety
    ///
    /// The passage must be initialized and the guest's address space complete.
    pub unsafe fn switch<H: MonitorHal, A: ArchCpu>(&mut self, hal: &H, arch: &mut A) {
        // SAFETY: exclusively owned until `free`.
        let page = unsafe { self.page.as_mut() };
        self.nx.around(hal, arch, |arch| unsafe { arch.switch(page) });
    }

    /// Returns the pages to the host. Works on a passage in any state.
    pub fn free<H: MonitorHal>(mut self, hal: &H) {
        self.nx.teardown(hal);
        hal.free_pages(self.vaddr, PASSAGE_PAGES);
        debug!("passage page at {:#x} freed", self.vaddr.as_usize());
    }
}
