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

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cell::RefCell;

use axerrno::{ax_err, AxResult};
use memory_addr::PAGE_SIZE_4K;
use proptest::prelude::*;

use crate::addr::host_pfn;
use crate::context::Cr4;
use crate::error::InitError;
use crate::sim::{GuestKernel, SimulatedCpu};
use crate::space::PageTableFlags;
use crate::{
    BootLayout, CpuFeatures, DeviceId, DeviceRequest, FrameTable, GuestVirtAddr, HostPhysAddr,
    HostVirtAddr, ImportTable, Mailbox, Manager, Monitor, MonitorConfig, MonitorDevices,
    MonitorError, MonitorHal, MonitorResult, MonitorState, NxWorkaround, Operation, PagingMode,
    RFlags, RegisterFile, Side, TerminateReason, GUEST_KERNEL_CS, MAX_GUEST_MEMORY,
    PASSAGE_PAGES,
};

// Host addresses handed out by the mock stay below 4 GiB, like on a 32-bit host.
const MOCK_VA_BASE: usize = 0x8000_0000;
const MOCK_PA_BASE: usize = 0x0010_0000;
const MOCK_PAGES: usize = 2048;
const HOST_CR3: u32 = 0x0003_9000;

// Mock host: a contiguous arena of pages behind a fake address window.
struct MockHal {
    base: *mut u8,
    pages: usize,
    state: RefCell<MockState>,
}

#[derive(Default)]
struct MockState {
    used: Vec<bool>,
    allocs: usize,
    fail_at: Option<usize>,
    mappings: usize,
}

impl MockHal {
    fn new() -> Self {
        Self::with_pages(MOCK_PAGES)
    }

    fn with_pages(pages: usize) -> Self {
        let layout = Self::layout(pages);
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self {
            base,
            pages,
            state: RefCell::new(MockState {
                used: vec![false; pages],
                ..Default::default()
            }),
        }
    }

    /// Makes the `n`-th allocation (1-based) and every later one fail.
    fn failing_at(self, n: usize) -> Self {
        self.state.borrow_mut().fail_at = Some(n);
        self
    }

    fn layout(pages: usize) -> Layout {
        Layout::from_size_align(pages * PAGE_SIZE_4K, PAGE_SIZE_4K).unwrap()
    }

    fn used_pages(&self) -> usize {
        self.state.borrow().used.iter().filter(|&&used| used).count()
    }

    fn live_mappings(&self) -> usize {
        self.state.borrow().mappings
    }

    fn index(&self, vaddr: HostVirtAddr) -> usize {
        let index = (vaddr.as_usize() - MOCK_VA_BASE) / PAGE_SIZE_4K;
        assert!(index < self.pages, "{:#x} is not a mock address", vaddr.as_usize());
        index
    }

    fn phys(&self, vaddr: HostVirtAddr) -> u64 {
        self.virt_to_phys(vaddr).as_usize() as u64
    }

    fn read_u64(&self, table: HostVirtAddr, index: usize) -> u64 {
        unsafe { (self.host_ptr(table) as *const u64).add(index).read() }
    }

    fn write_u64(&self, table: HostVirtAddr, index: usize, value: u64) {
        unsafe { (self.host_ptr(table) as *mut u64).add(index).write(value) }
    }
}

impl Drop for MockHal {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, Self::layout(self.pages)) };
    }
}

impl MonitorHal for MockHal {
    fn host_memory_pages(&self) -> usize {
        self.pages
    }

    fn alloc_pages(&self, count: usize) -> AxResult<HostVirtAddr> {
        let mut state = self.state.borrow_mut();
        state.allocs += 1;
        let allocs = state.allocs;
        if matches!(state.fail_at, Some(n) if allocs >= n) {
            return ax_err!(NoMemory);
        }
        let mut run = 0;
        for i in 0..self.pages {
            if state.used[i] {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = i + 1 - count;
                state.used[first..=i].iter_mut().for_each(|used| *used = true);
                unsafe {
                    self.base
                        .add(first * PAGE_SIZE_4K)
                        .write_bytes(0, count * PAGE_SIZE_4K)
                };
                return Ok(HostVirtAddr::from(MOCK_VA_BASE + first * PAGE_SIZE_4K));
            }
        }
        ax_err!(NoMemory)
    }

    fn free_pages(&self, vaddr: HostVirtAddr, count: usize) {
        let first = self.index(vaddr);
        let mut state = self.state.borrow_mut();
        for used in &mut state.used[first..first + count] {
            assert!(*used, "double free at {:#x}", vaddr.as_usize());
            *used = false;
        }
    }

    fn map(&self, paddr: HostPhysAddr) -> AxResult<HostVirtAddr> {
        let pa = paddr.as_usize();
        if pa < MOCK_PA_BASE || pa >= MOCK_PA_BASE + self.pages * PAGE_SIZE_4K {
            return ax_err!(BadAddress);
        }
        self.state.borrow_mut().mappings += 1;
        Ok(HostVirtAddr::from(pa - MOCK_PA_BASE + MOCK_VA_BASE))
    }

    fn unmap(&self, _vaddr: HostVirtAddr, _paddr: HostPhysAddr) {
        self.state.borrow_mut().mappings -= 1;
    }

    fn virt_to_phys(&self, vaddr: HostVirtAddr) -> HostPhysAddr {
        HostPhysAddr::from(vaddr.as_usize() - MOCK_VA_BASE + MOCK_PA_BASE)
    }

    fn host_ptr(&self, vaddr: HostVirtAddr) -> *mut u8 {
        let offset = vaddr.as_usize() - MOCK_VA_BASE;
        assert!(offset < self.pages * PAGE_SIZE_4K);
        unsafe { self.base.add(offset) }
    }
}

// Mock guest kernel: replays a script, one request per entry.
#[derive(Debug, Clone, Copy)]
enum Step {
    Terminate(TerminateReason),
    DebugLine(&'static str),
    Device(DeviceId, u32, u32),
    RawDevice(u32),
    Alloc(u32, u32),
    Free(u32),
    Interrupt,
    Idle,
    Raw(u32),
}

/// Where the scripted guest resumes after its first request.
const GUEST_RESUME: u32 = 0xC010_0200;

struct ScriptedGuest {
    steps: VecDeque<Step>,
    entries: Vec<RegisterFile>,
    replies: Vec<Mailbox>,
    /// A host page table entry sampled on every entry.
    watch: Option<*const u64>,
    observed: Vec<u64>,
}

impl ScriptedGuest {
    fn new(steps: &[Step]) -> Self {
        Self {
            steps: steps.iter().copied().collect(),
            entries: Vec::new(),
            replies: Vec::new(),
            watch: None,
            observed: Vec::new(),
        }
    }
}

impl GuestKernel for ScriptedGuest {
    fn run(&mut self, regs: &mut RegisterFile, mailbox: &mut Mailbox) {
        self.entries.push(*regs);
        self.replies.push(*mailbox);
        if let Some(entry) = self.watch {
            self.observed.push(unsafe { entry.read_volatile() });
        }
        let step = self
            .steps
            .pop_front()
            .unwrap_or(Step::Terminate(TerminateReason::Halt));
        match step {
            Step::Terminate(reason) => mailbox.post(Operation::Terminate, &[u32::from(reason)]),
            Step::DebugLine(line) => mailbox.post_debug_line(line),
            Step::Device(device, unit, opcode) => {
                mailbox.post(Operation::Device, &[u32::from(device), unit, opcode])
            }
            Step::RawDevice(device) => mailbox.post(Operation::Device, &[device, 0, 0]),
            Step::Alloc(address, order) => mailbox.post(Operation::AllocPages, &[address, order]),
            Step::Free(address) => mailbox.post(Operation::FreePages, &[address]),
            Step::Interrupt => mailbox.post(Operation::ForwardInterrupt, &[]),
            Step::Idle => mailbox.post(Operation::Idle, &[]),
            Step::Raw(operation) => mailbox.operation = operation,
        }
        regs.eip = GUEST_RESUME;
    }
}

// Mock device layer: records what it is asked.
#[derive(Default)]
struct RecordingDevices {
    requests: Vec<DeviceRequest>,
    interrupts: usize,
    idles: usize,
    polls: usize,
}

impl MonitorDevices for RecordingDevices {
    fn request(&mut self, request: DeviceRequest, mailbox: &mut Mailbox) -> MonitorResult {
        self.requests.push(request);
        match request.device {
            DeviceId::Console => {
                mailbox.params[4] = 0x1234;
                Ok(())
            }
            DeviceId::Block => Err(MonitorError::AccessDenied),
            _ => Err(MonitorError::NotFound),
        }
    }

    fn forward_interrupt(&mut self) {
        self.interrupts += 1;
    }

    fn idle(&mut self) {
        self.idles += 1;
    }

    fn poll(&mut self) {
        self.polls += 1;
    }
}

type TestMonitor<'a> = Monitor<&'a MockHal, SimulatedCpu<ScriptedGuest>, RecordingDevices>;

fn test_import() -> ImportTable {
    ImportTable {
        kernel_start: 0xC010_0000,
        kernel_end: 0xC010_8000,
        kernel_init_task_union: 0xC010_4000,
        kernel_colinux_start: 0xC010_0100,
        kernel_swapper_pg_dir: 0xC010_2000,
        kernel_idt_table: 0xC010_6000,
        kernel_gdt_table: 0xC010_7000,
    }
}

fn test_config(populate_at_boot: bool) -> MonitorConfig {
    MonitorConfig {
        ram_size: Some(4 << 20),
        bootmem_pages: 16,
        nx_workaround: None,
        populate_at_boot,
    }
}

fn create_monitor<'a>(
    hal: &'a MockHal,
    features: CpuFeatures,
    config: MonitorConfig,
    steps: &[Step],
) -> TestMonitor<'a> {
    let cpu = SimulatedCpu::with_host_state(features, HOST_CR3, ScriptedGuest::new(steps));
    Monitor::new(hal, cpu, RecordingDevices::default(), config, test_import()).unwrap()
}

fn read_guest_u32(hal: &MockHal, frames: &FrameTable, vaddr: usize) -> u32 {
    let mut buf = [0u8; 4];
    frames
        .copy_from_guest(&hal, GuestVirtAddr::from(vaddr), &mut buf)
        .unwrap();
    u32::from_le_bytes(buf)
}

#[test]
fn test_map_page_is_idempotent_and_detects_conflicts() {
    let hal = MockHal::new();
    let mut frames = FrameTable::new(&hal, 1024).unwrap();
    let first = hal.alloc_pages(1).unwrap();
    let second = hal.alloc_pages(1).unwrap();
    let pa = hal.virt_to_phys(first);

    frames.map_page(&hal, 5, first).unwrap();
    frames.map_page(&hal, 5, first).unwrap();
    assert_eq!(
        frames.map_page(&hal, 5, second),
        Err(MonitorError::InconsistentState { frame: 5 })
    );
    assert_eq!(frames.entry(&hal, 5), pa.as_usize() as u32 | 0x63);
    assert_eq!(frames.host_va_of(host_pfn(pa)), Some(first));
    assert_eq!(
        frames.guest_va_of(host_pfn(pa)),
        Some(GuestVirtAddr::from(0xC000_5000))
    );
    assert_eq!(
        frames.map_page(&hal, 1024, second),
        Err(MonitorError::BadGuestAddress(0xC040_0000))
    );

    assert!(frames.unmap_page(&hal, 5));
    assert!(!frames.unmap_page(&hal, 5));
    assert_eq!(frames.mapped_frames(), 0);
    frames.free(&hal);
    hal.free_pages(first, 1);
    hal.free_pages(second, 1);
    assert_eq!(hal.used_pages(), 0);
}

#[test]
fn test_host_page_backs_one_frame() {
    let hal = MockHal::new();
    let mut frames = FrameTable::new(&hal, 1024).unwrap();
    let page = hal.alloc_pages(1).unwrap();
    let pfn = host_pfn(hal.virt_to_phys(page));

    frames.map_page(&hal, 5, page).unwrap();
    assert_eq!(
        frames.map_page(&hal, 6, page),
        Err(MonitorError::InconsistentState { frame: 6 })
    );
    assert_eq!(frames.entry(&hal, 6), 0);
    assert_eq!(frames.guest_va_of(pfn), Some(GuestVirtAddr::from(0xC000_5000)));

    assert!(frames.unmap_page(&hal, 5));
    assert_eq!(frames.host_va_of(pfn), None);
    assert_eq!(frames.mapped_frames(), 0);
    frames.free(&hal);
    hal.free_pages(page, 1);
    assert_eq!(hal.used_pages(), 0);
}

/// Places every host page above 4 GiB.
#[cfg(target_pointer_width = "64")]
struct HighMemoryHal<'a>(&'a MockHal);

#[cfg(target_pointer_width = "64")]
impl MonitorHal for HighMemoryHal<'_> {
    fn host_memory_pages(&self) -> usize {
        self.0.host_memory_pages()
    }

    fn alloc_pages(&self, count: usize) -> AxResult<HostVirtAddr> {
        self.0.alloc_pages(count)
    }

    fn free_pages(&self, vaddr: HostVirtAddr, count: usize) {
        self.0.free_pages(vaddr, count)
    }

    fn map(&self, paddr: HostPhysAddr) -> AxResult<HostVirtAddr> {
        self.0.map(HostPhysAddr::from(paddr.as_usize() - (1 << 32)))
    }

    fn unmap(&self, vaddr: HostVirtAddr, paddr: HostPhysAddr) {
        self.0.unmap(vaddr, paddr)
    }

    fn virt_to_phys(&self, vaddr: HostVirtAddr) -> HostPhysAddr {
        HostPhysAddr::from(self.0.virt_to_phys(vaddr).as_usize() + (1 << 32))
    }

    fn host_ptr(&self, vaddr: HostVirtAddr) -> *mut u8 {
        self.0.host_ptr(vaddr)
    }
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_host_page_above_4g_is_rejected() {
    let hal = MockHal::new();
    let high = HighMemoryHal(&hal);
    let mut frames = FrameTable::new(&high, 1024).unwrap();
    let page = high.alloc_pages(1).unwrap();

    assert_eq!(
        frames.map_page(&high, 0, page),
        Err(MonitorError::OutOfMemory {
            what: "32-bit addressable host page",
            pages: 1
        })
    );
    assert!(!frames.is_mapped(&high, 0));
    assert_eq!(frames.mapped_frames(), 0);

    // A region is given back whole when its pages cannot be mapped.
    assert!(matches!(
        frames.allocate_and_map_region(&high, GuestVirtAddr::from(0xC000_0000), 4),
        Err(MonitorError::OutOfMemory { .. })
    ));
    frames.free(&high);
    high.free_pages(page, 1);
    assert_eq!(hal.used_pages(), 0);
}

#[test]
fn test_region_alloc_and_free_restores_host_pages() {
    let hal = MockHal::new();
    let mut frames = FrameTable::new(&hal, 1024).unwrap();
    let before = hal.used_pages();
    let base = GuestVirtAddr::from(0xC000_0000);

    frames.allocate_and_map_region(&hal, base, 4).unwrap();
    assert_eq!(hal.used_pages(), before + 4);
    assert!((0..4).all(|frame| frames.is_mapped(&hal, frame)));
    assert!(!frames.is_mapped(&hal, 4));
    assert_eq!(frames.allocation_at(0), 4);

    frames.unmap_and_free(&hal, base).unwrap();
    assert_eq!(hal.used_pages(), before);
    assert!((0..4).all(|frame| !frames.is_mapped(&hal, frame)));
    assert_eq!(frames.mapped_frames(), 0);
    frames.free(&hal);
}

#[test]
fn test_region_rejects_inconsistent_requests() {
    let hal = MockHal::new();
    let mut frames = FrameTable::new(&hal, 1024).unwrap();
    let base = GuestVirtAddr::from(0xC000_0000);
    frames.allocate_and_map_region(&hal, base, 4).unwrap();

    // The same request again is fine.
    frames.allocate_and_map_region(&hal, base, 4).unwrap();
    assert_eq!(
        frames.allocate_and_map_region(&hal, GuestVirtAddr::from(0xC000_2000), 4),
        Err(MonitorError::InsaneAllocation { frame: 2, pages: 4 })
    );
    assert_eq!(
        frames.allocate_and_map_region(&hal, base, 8),
        Err(MonitorError::InsaneAllocation { frame: 0, pages: 8 })
    );
    assert_eq!(
        frames.allocate_and_map_region(&hal, GuestVirtAddr::from(0xC000_0010), 1),
        Err(MonitorError::BadGuestAddress(0xC000_0010))
    );
    assert_eq!(
        frames.allocate_and_map_region(&hal, GuestVirtAddr::from(0xBFFF_F000), 1),
        Err(MonitorError::BadGuestAddress(0xBFFF_F000))
    );
    assert_eq!(
        frames.unmap_and_free(&hal, GuestVirtAddr::from(0xC000_8000)),
        Err(MonitorError::NotFound)
    );

    assert_eq!(frames.release_allocations(&hal), 1);
    frames.free(&hal);
    assert_eq!(hal.used_pages(), 0);
}

proptest! {
    #[test]
    fn test_region_roundtrip_leaves_no_trace(first in 0usize..64, count in 1usize..32) {
        let hal = MockHal::with_pages(64);
        let mut frames = FrameTable::new(&hal, 128).unwrap();
        let before = hal.used_pages();
        let base = FrameTable::guest_address(first);

        frames.allocate_and_map_region(&hal, base, count).unwrap();
        prop_assert_eq!(hal.used_pages(), before + count);
        prop_assert_eq!(frames.mapped_frames(), count);
        frames.unmap_and_free(&hal, base).unwrap();

        prop_assert_eq!(hal.used_pages(), before);
        prop_assert_eq!(frames.mapped_frames(), 0);
        prop_assert!((0..128).all(|frame| frames.entry(&hal, frame) == 0));
        frames.free(&hal);
    }
}

#[test]
fn test_copy_across_page_boundary() {
    let hal = MockHal::new();
    let mut frames = FrameTable::new(&hal, 1024).unwrap();
    frames
        .allocate_and_map_region(&hal, GuestVirtAddr::from(0xC000_0000), 2)
        .unwrap();

    let data: Vec<u8> = (0..32).collect();
    let at = GuestVirtAddr::from(0xC000_0FF0);
    frames.copy_to_guest(&hal, at, &data).unwrap();
    let mut back = [0u8; 32];
    frames.copy_from_guest(&hal, at, &mut back).unwrap();
    assert_eq!(&back[..], &data[..]);

    assert_eq!(
        frames.copy_to_guest(&hal, GuestVirtAddr::from(0xC000_1FF8), &data),
        Err(MonitorError::BadGuestAddress(0xC000_2000))
    );
    frames.release_allocations(&hal);
    frames.free(&hal);
}

#[test]
fn test_terminate_returns_after_one_switch() {
    let hal = MockHal::new();
    let steps = [Step::Terminate(TerminateReason::NotSupported)];
    let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(true), &steps);

    assert_eq!(monitor.run(), Ok(TerminateReason::NotSupported));
    assert_eq!(monitor.switches(), 1);
    assert_eq!(monitor.arch().switches, 1);
    assert_eq!(monitor.state(), MonitorState::Down);
    assert_eq!(hal.used_pages(), 0);
}

#[test]
fn test_switch_round_trip_restores_host() {
    let hal = MockHal::new();
    let steps = [Step::Terminate(TerminateReason::Halt)];
    let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(false), &steps);
    monitor.boot().unwrap();
    assert_eq!(monitor.state(), MonitorState::Ready);

    let host_before = monitor.arch().regs;
    let passage = monitor.passage().unwrap();
    let host_view = passage.vaddr().as_usize() as u32;
    let spaces = *passage.spaces().unwrap();
    assert!(spaces.shared());
    let space = spaces.space(Side::Host);
    assert_eq!(space.mode, PagingMode::Flat);
    assert_eq!(space.leaf_tables, 2);
    let guest_view = monitor.layout().passage.as_usize() as u32;

    assert_eq!(monitor.run(), Ok(TerminateReason::Halt));
    let cpu = monitor.arch();
    assert_eq!(cpu.regs, host_before);
    assert_eq!(cpu.transitions.len(), 2);
    assert_eq!(cpu.transitions[0].relocated_pc, guest_view + 0x800);
    assert_eq!(cpu.transitions[1].relocated_pc, host_view + 0x800);
    // DR7 is parked and then restored; the other debug registers match.
    assert_eq!(cpu.transitions[0].debug_writes, 2);
    assert_eq!(cpu.transitions[1].debug_writes, 2);
    assert!(cpu.transitions.iter().all(|t| !t.paging_switched));
}

#[test]
fn test_guest_first_entry_state() {
    let hal = MockHal::new();
    let import = test_import();
    let steps = [Step::Idle, Step::Terminate(TerminateReason::Reboot)];
    let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(false), &steps);
    assert_eq!(monitor.run(), Ok(TerminateReason::Reboot));

    let guest = &monitor.arch().guest;
    let first = guest.entries[0];
    assert_eq!(first.cs, GUEST_KERNEL_CS);
    assert_eq!(first.eip, import.kernel_colinux_start as u32);
    assert_eq!(first.esp, import.kernel_init_task_union as u32 + 0x2000 - 0x50);
    // The kernel image is the first host allocation.
    assert_eq!(first.cr3, (MOCK_PA_BASE + 0x2000) as u32);
    assert_eq!(first.eflags & RFlags::IF.bits(), 0);
    assert_eq!(first.cr4 & (Cr4::PGE | Cr4::MCE | Cr4::OSXMMEXCPT).bits(), 0);
    assert_eq!(first.gdt.base, import.kernel_gdt_table as u32);
    assert_eq!(first.idt.base, import.kernel_idt_table as u32);
    assert_eq!(first.idt.limit, 256 * 8 - 1);
    assert_eq!(guest.entries[1].eip, GUEST_RESUME);

    let start = guest.replies[0];
    assert_eq!(start.operation(), Ok(Operation::Start));
    assert_eq!(start.params[..4], [0xC010_8000, 16, 4 << 20, 0x1000]);
}

#[test]
fn test_guest_requests_are_served() {
    let hal = MockHal::new();
    let steps = [
        Step::DebugLine("hello from the guest"),
        Step::Device(DeviceId::Console, 0, 7),
        Step::Device(DeviceId::Block, 1, 2),
        Step::RawDevice(42),
        Step::Alloc(0xC020_0000, 2),
        Step::Free(0xC020_0000),
        Step::Free(0xC020_0000),
        Step::Alloc(0xC030_0000, 11),
        Step::Idle,
        Step::Interrupt,
        Step::Terminate(TerminateReason::Poweroff),
    ];
    let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(false), &steps);
    assert_eq!(monitor.run(), Ok(TerminateReason::Poweroff));
    assert_eq!(monitor.switches(), steps.len());

    let replies = &monitor.arch().guest.replies;
    assert_eq!(replies[2].params[3], 0);
    assert_eq!(replies[2].params[4], 0x1234);
    assert_eq!(replies[3].params[3], -13i32 as u32);
    assert_eq!(replies[4].params[3], -2i32 as u32);
    assert_eq!(replies[5].params[2], 0);
    assert_eq!(replies[6].params[2], 0);
    assert_eq!(replies[7].params[2], -2i32 as u32);
    assert_eq!(replies[8].params[2], -14i32 as u32);

    let devices = monitor.devices();
    assert_eq!(
        devices.requests,
        [
            DeviceRequest {
                device: DeviceId::Console,
                unit: 0,
                opcode: 7
            },
            DeviceRequest {
                device: DeviceId::Block,
                unit: 1,
                opcode: 2
            },
        ]
    );
    assert_eq!(devices.idles, 1);
    assert_eq!(devices.interrupts, 1);
    assert_eq!(devices.polls, 2);
    assert_eq!(hal.used_pages(), 0);
}

#[test]
fn test_unknown_operation_terminates() {
    let hal = MockHal::new();
    let mut monitor = create_monitor(
        &hal,
        CpuFeatures::empty(),
        test_config(false),
        &[Step::Raw(0x99)],
    );
    assert_eq!(monitor.run(), Ok(TerminateReason::Unknown));
    assert_eq!(monitor.switches(), 1);
}

#[test]
fn test_boot_failure_releases_everything() {
    // Kernel image, frame table and boot memory succeed; the passage fails.
    let hal = MockHal::new().failing_at(4);
    let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(true), &[]);

    assert_eq!(
        monitor.boot(),
        Err(MonitorError::OutOfMemory {
            what: "passage page",
            pages: PASSAGE_PAGES
        })
    );
    assert_eq!(monitor.state(), MonitorState::Invalid);
    assert_eq!(hal.used_pages(), 0);
    assert_eq!(monitor.run(), Err(MonitorError::BadState));
    assert_eq!(monitor.arch().switches, 0);
}

#[test]
fn test_populate_failure_rolls_back() {
    let hal = MockHal::with_pages(600);
    let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(true), &[]);

    let err = monitor.boot().unwrap_err();
    assert!(matches!(
        err,
        MonitorError::OutOfMemory {
            what: "guest memory",
            ..
        }
    ));
    assert_eq!(hal.used_pages(), 0);
    assert_eq!(hal.live_mappings(), 0);
}

#[test]
fn test_import_errors_are_reported() {
    let hal = MockHal::new();
    let mut import = test_import();
    import.kernel_idt_table = 0;
    let cpu = SimulatedCpu::with_host_state(CpuFeatures::empty(), HOST_CR3, ScriptedGuest::new(&[]));
    let Err(err) = Monitor::new(&hal, cpu, RecordingDevices::default(), test_config(true), import)
    else {
        panic!("monitor created without an IDT");
    };
    assert_eq!(
        err,
        MonitorError::Initialization(InitError::MissingSymbol("kernel_idt_table"))
    );

    let mut import = test_import();
    import.kernel_start = 0x0010_0000;
    assert_eq!(
        import.validate(),
        Err(MonitorError::Initialization(InitError::BadKernelRange {
            start: 0x0010_0000,
            end: 0xC010_8000
        }))
    );

    let mut import = test_import();
    import.kernel_swapper_pg_dir = 0xC020_0000;
    assert_eq!(
        import.validate(),
        Err(MonitorError::Initialization(InitError::LayoutOverflow(
            "kernel_swapper_pg_dir"
        )))
    );
    assert_eq!(hal.used_pages(), 0);
}

#[test]
fn test_layout_must_fit_guest_memory() {
    let hal = MockHal::new();
    let mut config = test_config(true);
    config.ram_size = Some(1 << 20);
    let cpu = SimulatedCpu::with_host_state(CpuFeatures::empty(), HOST_CR3, ScriptedGuest::new(&[]));
    let Err(err) = Monitor::new(&hal, cpu, RecordingDevices::default(), config, test_import())
    else {
        panic!("kernel placed above guest memory");
    };
    assert_eq!(err, MonitorError::Initialization(InitError::LayoutOverflow("boot layout")));
}

#[test]
fn test_guest_memory_limited_to_one_directory() {
    let import = test_import();
    let mut config = test_config(false);
    assert_eq!(MAX_GUEST_MEMORY, 1 << 30);

    config.ram_size = Some(2 << 30);
    assert_eq!(
        BootLayout::compute(&import, &config, MOCK_PAGES),
        Err(MonitorError::Initialization(InitError::LayoutOverflow("guest memory")))
    );
    config.ram_size = Some((1 << 30) + PAGE_SIZE_4K);
    assert!(BootLayout::compute(&import, &config, MOCK_PAGES).is_err());

    // Exactly the 256 kernel entries of the directory.
    config.ram_size = Some(1 << 30);
    let layout = BootLayout::compute(&import, &config, MOCK_PAGES).unwrap();
    assert_eq!(layout.frames, 1 << 18);
    assert_eq!(layout.table_pages, 256);
}

#[test]
fn test_page_directory_and_table_window() {
    let hal = MockHal::new();
    let import = test_import();
    let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(false), &[]);
    monitor.boot().unwrap();

    let frames = monitor.frames().unwrap();
    let (_, table_pa) = frames.table_page(0).unwrap();
    let kernel_entry = PageTableFlags::KERNEL_TABLE.bits() as u32;
    let pgd_entry = read_guest_u32(&hal, frames, import.kernel_swapper_pg_dir + 0x300 * 4);
    assert_eq!(pgd_entry, table_pa.as_usize() as u32 | kernel_entry);

    // The guest sees its own page table through the window.
    let layout = *monitor.layout();
    let window_entry = read_guest_u32(&hal, frames, layout.table_window.as_usize() + layout.kernel_frame * 4);
    assert_eq!(window_entry, MOCK_PA_BASE as u32 | kernel_entry);

    let passage_frame = frames.frame_of(layout.passage).unwrap();
    let passage_pa = monitor.passage().unwrap().paddr().as_usize() as u32;
    assert_eq!(frames.entry(&hal, passage_frame) & !0xfff, passage_pa);
}

#[test]
fn test_load_section() {
    let hal = MockHal::new();
    let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(false), &[]);
    let at = GuestVirtAddr::from(0xC010_0100);
    monitor.load_section(at, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
    assert_eq!(
        monitor.load_section(GuestVirtAddr::from(0xC010_7FFE), &[0; 4]),
        Err(MonitorError::BadGuestAddress(0xC010_7FFE))
    );

    monitor.boot().unwrap();
    let value = read_guest_u32(&hal, monitor.frames().unwrap(), at.as_usize());
    assert_eq!(value, 0xefbe_adde);
    assert_eq!(monitor.load_section(at, &[0]), Err(MonitorError::BadState));
}

#[test]
fn test_extended_paging_without_workaround() {
    let hal = MockHal::new();
    let mut config = test_config(false);
    config.nx_workaround = Some(false);
    let features = CpuFeatures::NX | CpuFeatures::PAE_ENABLED;
    let steps = [Step::Idle, Step::Terminate(TerminateReason::Halt)];
    let mut monitor = create_monitor(&hal, features, config, &steps);
    monitor.boot().unwrap();

    let passage = monitor.passage().unwrap();
    assert!(!passage.nx_active());
    let spaces = passage.spaces().unwrap();
    assert_eq!(spaces.space(Side::Host).mode, PagingMode::Extended);
    assert_eq!(spaces.space(Side::Guest).mode, PagingMode::Flat);
    assert_eq!(passage.page().header.mode, 1);
    assert_eq!(passage.page().header.guest.cr4 & Cr4::PAE.bits(), 0);

    assert_eq!(monitor.run(), Ok(TerminateReason::Halt));
    let cpu = monitor.arch();
    assert_eq!(cpu.switches, 2);
    assert_eq!(cpu.tlb_flushes, 0);
    // The guest's tables are flat: it never runs with PAE.
    assert!(cpu.guest.entries.iter().all(|e| e.cr4 & Cr4::PAE.bits() == 0));
    assert_ne!(cpu.regs.cr4 & Cr4::PAE.bits(), 0);
    assert_eq!(cpu.transitions.len(), 4);
    assert!(cpu.transitions.iter().all(|t| t.paging_switched));
    assert_eq!(hal.used_pages(), 0);
}

#[test]
fn test_nx_workaround_requires_pae() {
    let hal = MockHal::new();
    let mut config = test_config(false);
    config.nx_workaround = Some(true);
    let mut monitor = create_monitor(&hal, CpuFeatures::NX, config, &[]);

    assert_eq!(
        monitor.boot(),
        Err(MonitorError::Initialization(InitError::Unsupported(
            "NX workaround without PAE"
        )))
    );
    assert_eq!(monitor.state(), MonitorState::Invalid);
    assert_eq!(hal.used_pages(), 0);
    assert_eq!(hal.live_mappings(), 0);
}

#[test]
fn test_nx_workaround_during_run() {
    let hal = MockHal::new();
    let nx = PageTableFlags::NO_EXECUTE.bits();
    let kernel_table = PageTableFlags::KERNEL_TABLE.bits();

    // Host PAE tables covering the whole arena with no-execute pages.
    let pdpt = hal.alloc_pages(1).unwrap();
    let pmd = hal.alloc_pages(1).unwrap();
    let table_count = MOCK_PAGES / 512;
    let mut tables = Vec::new();
    for k in 0..table_count {
        let pt = hal.alloc_pages(1).unwrap();
        for i in 0..512 {
            let pa = (MOCK_PA_BASE + (k * 512 + i) * PAGE_SIZE_4K) as u64;
            hal.write_u64(pt, i, pa | kernel_table | nx);
        }
        hal.write_u64(pmd, ((MOCK_VA_BASE >> 21) & 0x1ff) + k, hal.phys(pt) | kernel_table);
        tables.push(pt);
    }
    hal.write_u64(pdpt, MOCK_VA_BASE >> 30, hal.phys(pmd) | 1);
    let host_tables = hal.used_pages();

    let features = CpuFeatures::NX | CpuFeatures::PAE_ENABLED;
    let steps = [Step::Idle, Step::Idle, Step::Terminate(TerminateReason::Halt)];
    let cpu = SimulatedCpu::with_host_state(features, hal.phys(pdpt) as u32, ScriptedGuest::new(&steps));
    let mut config = test_config(false);
    config.nx_workaround = Some(true);
    let mut monitor = Monitor::new(&hal, cpu, RecordingDevices::default(), config, test_import()).unwrap();
    monitor.boot().unwrap();
    assert!(monitor.passage().unwrap().nx_active());
    assert_eq!(hal.live_mappings(), 1);

    let view = monitor.passage().unwrap().vaddr().as_usize();
    let pt = tables[(view - MOCK_VA_BASE) >> 21];
    let index = (view >> 12) & 0x1ff;
    let leaf = hal.read_u64(pt, index);
    assert_ne!(leaf & nx, 0);
    let entry = unsafe { (hal.host_ptr(pt) as *const u64).add(index) };
    monitor.arch_mut().guest.watch = Some(entry);

    assert_eq!(monitor.run(), Ok(TerminateReason::Halt));
    let cpu = monitor.arch();
    assert_eq!(cpu.switches, 3);
    assert_eq!(cpu.tlb_flushes, 2 * cpu.switches);
    assert_eq!(cpu.guest.observed, [leaf & !nx; 3]);
    assert_eq!(hal.read_u64(pt, index), leaf);
    assert_eq!(hal.live_mappings(), 0);

    assert_eq!(hal.used_pages(), host_tables);
    for pt in tables {
        hal.free_pages(pt, 1);
    }
    hal.free_pages(pmd, 1);
    hal.free_pages(pdpt, 1);
    assert_eq!(hal.used_pages(), 0);
}

#[test]
fn test_nx_workaround_clears_and_restores() {
    let hal = MockHal::with_pages(16);
    assert!(NxWorkaround::needed(CpuFeatures::NX | CpuFeatures::PAE_ENABLED));
    assert!(!NxWorkaround::needed(CpuFeatures::NX));

    let pdpt = hal.alloc_pages(1).unwrap();
    let pmd = hal.alloc_pages(1).unwrap();
    let pt = hal.alloc_pages(1).unwrap();
    let vaddr: u32 = 0xC123_4000;
    let leaf_index = ((vaddr >> 12) & 0x1ff) as usize;
    let nx = PageTableFlags::NO_EXECUTE.bits();
    let dirty = PageTableFlags::DIRTY.bits();
    let leaf = 0x0abc_d000 | 0x23 | nx;
    // CR3 points 0x20 bytes into its page, at the fifth entry.
    hal.write_u64(pdpt, 4 + (vaddr >> 30) as usize, hal.phys(pmd) | 1);
    hal.write_u64(pmd, ((vaddr >> 21) & 0x1ff) as usize, hal.phys(pt) | 0x63);
    hal.write_u64(pt, leaf_index, leaf);
    let cr3 = hal.phys(pdpt) as u32 + 0x20;

    let mut workaround = NxWorkaround::setup(&hal, cr3, vaddr).unwrap();
    assert!(workaround.is_active());
    assert_eq!(hal.live_mappings(), 1);

    let features = CpuFeatures::NX | CpuFeatures::PAE_ENABLED;
    let noop = |_: &mut RegisterFile, _: &mut Mailbox| {};
    let mut cpu = SimulatedCpu::with_host_state(features, cr3, noop);
    let (during, irq) = workaround.around(&hal, &mut cpu, |cpu| {
        let during = hal.read_u64(pt, leaf_index);
        // The CPU marks the page dirty while the switch runs.
        hal.write_u64(pt, leaf_index, during | dirty);
        (during, cpu.regs.eflags & RFlags::IF.bits())
    });
    assert_eq!(during, leaf & !nx);
    assert_eq!(irq, 0);
    assert_eq!(hal.read_u64(pt, leaf_index), leaf | dirty);
    assert_eq!(cpu.tlb_flushes, 2);
    assert_ne!(cpu.regs.eflags & RFlags::IF.bits(), 0);

    workaround.teardown(&hal);
    assert!(!workaround.is_active());
    assert_eq!(hal.live_mappings(), 0);

    // Nothing maps this address.
    assert_eq!(
        NxWorkaround::setup(&hal, cr3, 0x4000_0000).unwrap_err(),
        MonitorError::NotFound
    );
    assert_eq!(hal.live_mappings(), 0);
}

#[test]
fn test_unload_is_idempotent() {
    let hal = MockHal::new();
    let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(true), &[]);
    monitor.boot().unwrap();
    assert!(hal.used_pages() > 1000);

    monitor.unload();
    monitor.unload();
    assert_eq!(monitor.state(), MonitorState::Down);
    assert_eq!(hal.used_pages(), 0);
    assert_eq!(monitor.iteration(), Err(MonitorError::BadState));
}

#[test]
fn test_dropping_a_monitor_releases_its_pages() {
    let hal = MockHal::new();
    {
        let mut monitor = create_monitor(&hal, CpuFeatures::empty(), test_config(false), &[]);
        monitor.boot().unwrap();
        assert_ne!(hal.used_pages(), 0);
    }
    assert_eq!(hal.used_pages(), 0);
}

#[test]
fn test_manager_enforces_host_limit() {
    let hal = MockHal::new();
    let manager = Manager::new(&hal, 40);
    let shared = manager.hal();
    assert_eq!(manager.monitors(), 1);

    let run = shared.alloc_pages(30).unwrap();
    assert_eq!(manager.used_pages(), 30);
    assert!(shared.alloc_pages(11).is_err());
    assert_eq!(manager.used_pages(), 30);
    shared.free_pages(run, 30);
    assert_eq!(manager.used_pages(), 0);
    drop(shared);
    assert_eq!(manager.monitors(), 0);

    // Populating 4 MiB does not fit in 40 pages.
    let cpu = SimulatedCpu::with_host_state(CpuFeatures::empty(), HOST_CR3, ScriptedGuest::new(&[]));
    let mut monitor = manager
        .create_monitor(cpu, RecordingDevices::default(), test_config(true), test_import())
        .unwrap();
    assert!(matches!(
        monitor.run(),
        Err(MonitorError::OutOfMemory { .. })
    ));
    assert_eq!(manager.used_pages(), 0);
    assert_eq!(hal.used_pages(), 0);

    manager.set_limit_pages(2048);
    assert_eq!(manager.limit_pages(), 2048);
}
