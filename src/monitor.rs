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

use alloc::vec::Vec;

use memory_addr::{align_up_4k, is_aligned_4k, PAGE_SIZE_4K};

use crate::addr::{narrow, pages_for, GUEST_PAGE_OFFSET, PAGE_SHIFT};
use crate::error::InitError;
use crate::memory::PTES_PER_PAGE;
use crate::space::PageTableFlags;
use crate::{
    ArchCpu, DeviceRequest, FrameTable, GuestBootParams, GuestVirtAddr, HostPhysAddr,
    HostVirtAddr, MonitorConfig, MonitorDevices, MonitorError, MonitorHal, MonitorResult,
    Operation, Passage, TerminateReason, PASSAGE_PAGES,
};

/// Largest order the guest may pass with [`Operation::AllocPages`].
const MAX_ALLOC_ORDER: u32 = 10;

/// Most pseudo-physical memory the kernel entries of one page directory reach.
pub const MAX_GUEST_MEMORY: usize = (PTES_PER_PAGE - (GUEST_PAGE_OFFSET >> 22)) << 22;

/// Addresses the guest kernel image exports to the monitor.
///
/// Filled in by the loader from the image's symbol table. A zero field means
/// the symbol is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportTable {
    /// First byte of the kernel image.
    pub kernel_start: usize,
    /// End of the kernel image.
    pub kernel_end: usize,
    /// The initial task union, boot stack included.
    pub kernel_init_task_union: usize,
    /// The cooperative entry point.
    pub kernel_colinux_start: usize,
    /// The kernel's page directory.
    pub kernel_swapper_pg_dir: usize,
    /// The kernel's IDT.
    pub kernel_idt_table: usize,
    /// The kernel's GDT.
    pub kernel_gdt_table: usize,
}

impl ImportTable {
    /// Checks every symbol is present and the image is laid out sanely.
    pub fn validate(&self) -> MonitorResult {
        let symbols = [
            ("kernel_start", self.kernel_start),
            ("kernel_end", self.kernel_end),
            ("kernel_init_task_union", self.kernel_init_task_union),
            ("kernel_colinux_start", self.kernel_colinux_start),
            ("kernel_swapper_pg_dir", self.kernel_swapper_pg_dir),
            ("kernel_idt_table", self.kernel_idt_table),
            ("kernel_gdt_table", self.kernel_gdt_table),
        ];
        for (name, value) in symbols {
            if value == 0 {
                return Err(InitError::MissingSymbol(name).into());
            }
            if narrow(value).is_none() {
                return Err(InitError::NotAddressable(name).into());
            }
        }

        let (start, end) = (self.kernel_start, self.kernel_end);
        if start < GUEST_PAGE_OFFSET || end <= start || !is_aligned_4k(start) {
            return Err(InitError::BadKernelRange { start, end }.into());
        }
        let pgd = self.kernel_swapper_pg_dir;
        if pgd < start || pgd + PAGE_SIZE_4K > end || !is_aligned_4k(pgd) {
            return Err(InitError::LayoutOverflow("kernel_swapper_pg_dir").into());
        }
        Ok(())
    }

    fn boot_params(&self, page_directory: u32) -> GuestBootParams {
        // Every field was checked to fit by `validate`.
        GuestBootParams {
            entry: self.kernel_colinux_start as u32,
            init_task_union: self.kernel_init_task_union as u32,
            page_directory,
            gdt_table: self.kernel_gdt_table as u32,
            idt_table: self.kernel_idt_table as u32,
        }
    }
}

/// Where everything goes in the guest's pseudo-physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootLayout {
    /// Size of pseudo-physical memory in bytes.
    pub memory_size: usize,
    /// Number of pseudo-physical frames.
    pub frames: usize,
    /// First frame of the kernel image.
    pub kernel_frame: usize,
    /// Pages of the kernel image.
    pub kernel_pages: usize,
    /// Start of boot memory, right after the kernel.
    pub bootmem: GuestVirtAddr,
    /// Pages of boot memory.
    pub bootmem_pages: usize,
    /// The guest's view of the passage page.
    pub passage: GuestVirtAddr,
    /// Where the guest sees its own page table pages.
    pub table_window: GuestVirtAddr,
    /// Number of page table pages.
    pub table_pages: usize,
}

impl BootLayout {
    /// Lays out the guest for `import` and `config` on a host with
    /// `host_pages` pages.
    pub fn compute(
        import: &ImportTable,
        config: &MonitorConfig,
        host_pages: usize,
    ) -> MonitorResult<Self> {
        let memory_size = config.memory_size(host_pages);
        if memory_size > MAX_GUEST_MEMORY {
            return Err(InitError::LayoutOverflow("guest memory").into());
        }
        let frames = memory_size >> PAGE_SHIFT;
        let core_end = align_up_4k(import.kernel_end);
        let bootmem_pages = config.bootmem_pages;
        let passage = core_end + bootmem_pages * PAGE_SIZE_4K;
        let table_window = passage + PASSAGE_PAGES * PAGE_SIZE_4K;
        let table_pages = frames.div_ceil(PTES_PER_PAGE);
        let end = table_window + table_pages * PAGE_SIZE_4K;
        let fits = end
            .checked_sub(GUEST_PAGE_OFFSET)
            .is_some_and(|used| used <= memory_size);
        if !fits || narrow(end).is_none() {
            return Err(InitError::LayoutOverflow("boot layout").into());
        }
        Ok(Self {
            memory_size,
            frames,
            kernel_frame: (import.kernel_start - GUEST_PAGE_OFFSET) >> PAGE_SHIFT,
            kernel_pages: pages_for(import.kernel_end - import.kernel_start),
            bootmem: GuestVirtAddr::from(core_end),
            bootmem_pages,
            passage: GuestVirtAddr::from(passage),
            table_window: GuestVirtAddr::from(table_window),
            table_pages,
        })
    }

    fn frame(vaddr: GuestVirtAddr) -> usize {
        (vaddr.as_usize() - GUEST_PAGE_OFFSET) >> PAGE_SHIFT
    }
}

/// The lifecycle state of a monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    /// An invalid state, entered when a lifecycle step fails.
    Invalid = 0,
    /// The kernel image is allocated and can be loaded.
    Initialized = 1,
    /// Memory and passage are set up; the guest can be entered.
    Ready = 2,
    /// The run loop is switching to and from the guest.
    Running = 3,
    /// The guest asked to terminate; no further switch will happen.
    AwaitingTermination = 4,
    /// Every resource has been released.
    Down = 5,
}

/// A resource acquired during startup, released in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquired {
    KernelImage,
    FrameTable,
    KernelMapping,
    BootMemory,
    Passage,
    PassageMapping,
    TableWindow,
    Ram,
}

/// The guest kernel image, one contiguous host run.
#[derive(Debug, Clone, Copy)]
struct KernelImage {
    vaddr: HostVirtAddr,
    paddr: HostPhysAddr,
    pages: usize,
}

/// One cooperative guest and everything it owns on the host.
///
/// The monitor is driven from a single host thread: [`Monitor::run`] returns only
/// once the guest terminates.
pub struct Monitor<H: MonitorHal, A: ArchCpu, D: MonitorDevices> {
    hal: H,
    arch: A,
    devices: D,
    config: MonitorConfig,
    import: ImportTable,
    layout: BootLayout,
    state: MonitorState,
    kernel: KernelImage,
    frames: Option<FrameTable>,
    passage: Option<Passage>,
    acquired: Vec<Acquired>,
    switches: usize,
}

impl<H: MonitorHal, A: ArchCpu, D: MonitorDevices> Monitor<H, A, D> {
    /// Create a new [`Monitor`] and allocate room for the guest kernel image.
    pub fn new(
        hal: H,
        arch: A,
        devices: D,
        config: MonitorConfig,
        import: ImportTable,
    ) -> MonitorResult<Self> {
        import.validate().inspect_err(|err| error!("{err}"))?;
        let layout = BootLayout::compute(&import, &config, hal.host_memory_pages())
            .inspect_err(|err| error!("{err}"))?;
        if layout.kernel_frame + layout.kernel_pages > layout.frames {
            return Err(InitError::LayoutOverflow("kernel image").into());
        }

        let pages = layout.kernel_pages;
        let vaddr = hal.alloc_pages(pages).map_err(|_| {
            let err = MonitorError::OutOfMemory {
                what: "kernel image",
                pages,
            };
            error!("{err}");
            err
        })?;
        let kernel = KernelImage {
            vaddr,
            paddr: hal.virt_to_phys(vaddr),
            pages,
        };
        info!(
            "monitor created: {} KiB of guest memory, kernel {:#x}..{:#x}",
            layout.memory_size / 1024,
            import.kernel_start,
            import.kernel_end
        );
        Ok(Self {
            hal,
            arch,
            devices,
            config,
            import,
            layout,
            state: MonitorState::Initialized,
            kernel,
            frames: None,
            passage: None,
            acquired: vec![Acquired::KernelImage],
            switches: 0,
        })
    }

    /// Get the state of the monitor.
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// The guest layout.
    pub fn layout(&self) -> &BootLayout {
        &self.layout
    }

    /// The host abstraction the monitor allocates from.
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// The CPU the monitor switches on.
    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// The CPU the monitor switches on, mutably.
    pub fn arch_mut(&mut self) -> &mut A {
        &mut self.arch
    }

    /// The device layer.
    pub fn devices(&mut self) -> &mut D {
        &mut self.devices
    }

    /// The guest's frame table, once booted.
    pub fn frames(&self) -> Option<&FrameTable> {
        self.frames.as_ref()
    }

    /// The passage, once booted.
    pub fn passage(&self) -> Option<&Passage> {
        self.passage.as_ref()
    }

    /// Number of switches into the guest so far.
    pub fn switches(&self) -> usize {
        self.switches
    }

    /// Execute a block with the state of the monitor transitioned from `from` to `to`. If the current state is not `from`, return an error.
    ///
    /// The state will be set to [`MonitorState::Invalid`] if an error occurs (including the case that the current state is not `from`).
    fn with_state_transition<F, T>(&mut self, from: MonitorState, to: MonitorState, f: F) -> MonitorResult<T>
    where
        F: FnOnce(&mut Self) -> MonitorResult<T>,
    {
        if self.state != from {
            warn!("monitor state is not {:?}, but {:?}", from, self.state);
            self.state = MonitorState::Invalid;
            return Err(MonitorError::BadState);
        }
        let result = f(self);
        self.state = if result.is_err() {
            MonitorState::Invalid
        } else {
            to
        };
        result
    }

    /// Copies a section of the guest image to guest address `address`.
    pub fn load_section(&mut self, address: GuestVirtAddr, data: &[u8]) -> MonitorResult {
        if self.state != MonitorState::Initialized {
            warn!("cannot load a section in state {:?}", self.state);
            return Err(MonitorError::BadState);
        }
        let start = address.as_usize();
        let image_end = self.import.kernel_start + self.kernel.pages * PAGE_SIZE_4K;
        if start < self.import.kernel_start || start + data.len() > image_end {
            return Err(MonitorError::BadGuestAddress(start));
        }
        let offset = start - self.import.kernel_start;
        let dst = self.hal.host_ptr(self.kernel.vaddr);
        // SAFETY: the destination range lies within the kernel image run.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst.add(offset), data.len()) };
        debug!("loaded {} bytes at {start:#x}", data.len());
        Ok(())
    }

    /// Builds the guest's memory and the passage.
    ///
    /// On failure, everything acquired so far (the kernel image included) is
    /// released in reverse order and the monitor is left [`MonitorState::Invalid`].
    pub fn boot(&mut self) -> MonitorResult {
        let result = self.with_state_transition(MonitorState::Initialized, MonitorState::Ready, |this| {
            this.boot_steps()
        });
        if let Err(err) = &result {
            error!("monitor boot failed: {err}");
            self.teardown();
        }
        result
    }

    fn boot_steps(&mut self) -> MonitorResult {
        let layout = self.layout;
        let hal = &self.hal;
        let frames = self.frames.insert(FrameTable::new(hal, layout.frames)?);
        self.acquired.push(Acquired::FrameTable);

        let page_directory = init_page_directory(hal, frames, &self.import, &self.kernel)?;

        for i in 0..layout.kernel_pages {
            let page = self.kernel.vaddr + i * PAGE_SIZE_4K;
            frames.map_page(hal, layout.kernel_frame + i, page)?;
        }
        self.acquired.push(Acquired::KernelMapping);

        frames.allocate_and_map_region(hal, layout.bootmem, layout.bootmem_pages)?;
        self.acquired.push(Acquired::BootMemory);

        let passage = self.passage.insert(Passage::allocate(hal)?);
        self.acquired.push(Acquired::Passage);

        let passage_frame = BootLayout::frame(layout.passage);
        for i in 0..PASSAGE_PAGES {
            let page = passage.vaddr() + i * PAGE_SIZE_4K;
            frames.map_page(hal, passage_frame + i, page)?;
        }
        self.acquired.push(Acquired::PassageMapping);

        let window_frame = BootLayout::frame(layout.table_window);
        for i in 0..layout.table_pages {
            if let Some((page, _)) = frames.table_page(i) {
                frames.map_page(hal, window_frame + i, page)?;
            }
        }
        self.acquired.push(Acquired::TableWindow);

        let boot = self.import.boot_params(page_directory);
        passage.initialize(hal, &self.arch, &boot, layout.passage, self.config.nx_workaround)?;

        if self.config.populate_at_boot {
            frames.alloc_and_map_all(hal, 0)?;
            self.acquired.push(Acquired::Ram);
        }
        info!("monitor booted, passage at guest {:#x}", layout.passage.as_usize());
        Ok(())
    }

    /// Starts the guest and serves its requests until it terminates, then
    /// releases everything.
    ///
    /// Boots first if [`Monitor::boot`] has not been called.
    pub fn run(&mut self) -> MonitorResult<TerminateReason> {
        if self.state == MonitorState::Initialized {
            self.boot()?;
        }
        self.with_state_transition(MonitorState::Ready, MonitorState::Running, |this| {
            let layout = this.layout;
            let params = [
                layout.bootmem.as_usize() as u32,
                layout.bootmem_pages as u32,
                layout.memory_size as u32,
                (layout.table_pages * PAGE_SIZE_4K) as u32,
            ];
            let passage = this.passage.as_mut().ok_or(MonitorError::BadState)?;
            passage.mailbox().post(Operation::Start, &params);
            Ok(())
        })?;

        let reason = loop {
            match self.iteration() {
                Ok(Some(reason)) => break reason,
                Ok(None) => {}
                Err(err) => {
                    error!("monitor run loop failed: {err}");
                    self.state = MonitorState::Invalid;
                    self.unload();
                    return Err(err);
                }
            }
        };
        self.unload();
        Ok(reason)
    }

    /// Switches into the guest once and serves the request it comes back with.
    ///
    /// Returns the terminate reason once the guest asks to go away; after that no
    /// further switch is made.
    pub fn iteration(&mut self) -> MonitorResult<Option<TerminateReason>> {
        if self.state != MonitorState::Running {
            warn!("monitor is not running, but {:?}", self.state);
            return Err(MonitorError::BadState);
        }
        let passage = self.passage.as_mut().ok_or(MonitorError::BadState)?;
        // SAFETY: the passage was initialized by `boot` and the guest's memory is
        // in place while the monitor runs.
        unsafe { passage.switch(&self.hal, &mut self.arch) };
        self.switches += 1;

        let mailbox = passage.mailbox();
        let operation = match mailbox.operation() {
            Ok(operation) => operation,
            Err(raw) => {
                warn!("unknown guest operation {raw:#x}, terminating");
                self.state = MonitorState::AwaitingTermination;
                return Ok(Some(TerminateReason::Unknown));
            }
        };
        trace!("guest operation {operation:?}");

        match operation {
            Operation::Terminate => {
                let reason = mailbox.terminate_reason();
                info!("guest terminated: {reason:?}");
                self.state = MonitorState::AwaitingTermination;
                return Ok(Some(reason));
            }
            Operation::DebugLine => {
                info!("guest: {}", mailbox.debug_line());
            }
            Operation::ForwardInterrupt => {
                self.devices.forward_interrupt();
                self.devices.poll();
            }
            Operation::Idle => {
                self.devices.idle();
                self.devices.poll();
            }
            Operation::MoreData => self.devices.poll(),
            Operation::Device => {
                let status = match DeviceRequest::decode(mailbox) {
                    Ok(request) => self.devices.request(request, mailbox),
                    Err(raw) => {
                        warn!("request for unknown device {raw}");
                        Err(MonitorError::NotFound)
                    }
                };
                mailbox.params[3] = status_word(status);
            }
            Operation::AllocPages => {
                let (address, order) = (mailbox.params[0] as usize, mailbox.params[1]);
                let status = match self.frames.as_mut() {
                    Some(_) if order > MAX_ALLOC_ORDER => Err(MonitorError::BadGuestAddress(address)),
                    Some(frames) => frames.allocate_and_map_region(
                        &self.hal,
                        GuestVirtAddr::from(address),
                        1 << order,
                    ),
                    None => Err(MonitorError::BadState),
                };
                log_memory_failure("allocate", address, &status);
                mailbox.params[2] = status_word(status);
            }
            Operation::FreePages => {
                let address = mailbox.params[0] as usize;
                let status = match self.frames.as_mut() {
                    Some(frames) => frames.unmap_and_free(&self.hal, GuestVirtAddr::from(address)),
                    None => Err(MonitorError::BadState),
                };
                log_memory_failure("free", address, &status);
                mailbox.params[2] = status_word(status);
            }
            Operation::Start => {
                warn!("guest sent a start request, terminating");
                self.state = MonitorState::AwaitingTermination;
                return Ok(Some(TerminateReason::Unknown));
            }
        }
        Ok(None)
    }

    /// Releases everything the monitor holds, last acquired first.
    ///
    /// Safe to call in any state and more than once.
    pub fn unload(&mut self) {
        if self.state == MonitorState::Down {
            return;
        }
        self.teardown();
        self.state = MonitorState::Down;
        info!("monitor unloaded after {} switches", self.switches);
    }

    fn teardown(&mut self) {
        while let Some(resource) = self.acquired.pop() {
            debug!("releasing {resource:?}");
            self.release(resource);
        }
    }

    fn release(&mut self, resource: Acquired) {
        let layout = self.layout;
        let hal = &self.hal;
        match resource {
            Acquired::KernelImage => hal.free_pages(self.kernel.vaddr, self.kernel.pages),
            Acquired::Passage => {
                if let Some(passage) = self.passage.take() {
                    passage.free(hal);
                }
            }
            _ => {
                let Some(frames) = self.frames.as_mut() else {
                    return;
                };
                match resource {
                    Acquired::FrameTable => {
                        frames.release_allocations(hal);
                        frames.free(hal);
                        self.frames = None;
                    }
                    Acquired::KernelMapping => {
                        for i in 0..layout.kernel_pages {
                            frames.unmap_page(hal, layout.kernel_frame + i);
                        }
                    }
                    Acquired::BootMemory => {
                        if frames.allocation_at(BootLayout::frame(layout.bootmem)) != 0 {
                            let _ = frames.unmap_and_free(hal, layout.bootmem);
                        }
                    }
                    Acquired::PassageMapping => {
                        let first = BootLayout::frame(layout.passage);
                        for frame in first..first + PASSAGE_PAGES {
                            frames.unmap_page(hal, frame);
                        }
                    }
                    Acquired::TableWindow => {
                        let first = BootLayout::frame(layout.table_window);
                        for frame in first..first + layout.table_pages {
                            frames.unmap_page(hal, frame);
                        }
                    }
                    Acquired::Ram => {
                        frames.release_allocations(hal);
                    }
                    Acquired::KernelImage | Acquired::Passage => {}
                }
            }
        }
    }
}

impl<H: MonitorHal, A: ArchCpu, D: MonitorDevices> Drop for Monitor<H, A, D> {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Points the kernel entries of the guest's page directory at the frame table
/// pages. Returns the directory's physical address.
fn init_page_directory<H: MonitorHal>(
    hal: &H,
    frames: &FrameTable,
    import: &ImportTable,
    kernel: &KernelImage,
) -> MonitorResult<u32> {
    let offset = import.kernel_swapper_pg_dir - import.kernel_start;
    // SAFETY: `validate` placed the directory page inside the kernel image.
    let pgd = unsafe { hal.host_ptr(kernel.vaddr).add(offset) as *mut u32 };
    let first = GUEST_PAGE_OFFSET >> 22;
    if first + frames.table_pages() > PTES_PER_PAGE {
        return Err(InitError::LayoutOverflow("guest memory").into());
    }
    for i in 0..frames.table_pages() {
        let Some((_, paddr)) = frames.table_page(i) else {
            break;
        };
        let paddr = narrow(paddr.as_usize()).ok_or(InitError::NotAddressable("frame table"))?;
        let entry = paddr | PageTableFlags::KERNEL_TABLE.bits() as u32;
        // SAFETY: `first + i` is below 1024, checked above.
        unsafe { pgd.add(first + i).write_volatile(entry) };
    }
    narrow(kernel.paddr.as_usize() + offset)
        .ok_or_else(|| InitError::NotAddressable("kernel page directory").into())
}

/// Encodes a result as the status word the guest reads.
fn status_word(result: MonitorResult) -> u32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.status_code() as u32,
    }
}

fn log_memory_failure(what: &str, address: usize, status: &MonitorResult) {
    match status {
        Err(err) if err.is_internal() => error!("cannot {what} guest memory at {address:#x}: {err}"),
        Err(err) => warn!("cannot {what} guest memory at {address:#x}: {err}"),
        Ok(()) => {}
    }
}
