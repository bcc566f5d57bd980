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

use bitflags::bitflags;

bitflags! {
    /// The EFLAGS bits the monitor cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u32 {
        /// Carry.
        const CF = 1 << 0;
        /// Reserved, always one.
        const RESERVED_1 = 1 << 1;
        /// Zero.
        const ZF = 1 << 6;
        /// Trap.
        const TF = 1 << 8;
        /// Interrupt enable.
        const IF = 1 << 9;
        /// Direction.
        const DF = 1 << 10;
        /// Nested task.
        const NT = 1 << 14;
    }
}

bitflags! {
    /// The CR4 bits the monitor cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4: u32 {
        /// Page size extensions.
        const PSE = 1 << 4;
        /// Physical address extension.
        const PAE = 1 << 5;
        /// Machine check enable.
        const MCE = 1 << 6;
        /// Global pages.
        const PGE = 1 << 7;
        /// FXSAVE/FXRSTOR support.
        const OSFXSR = 1 << 9;
        /// Unmasked SIMD floating point exceptions.
        const OSXMMEXCPT = 1 << 10;
    }
}

/// A GDT or IDT pointer as stored by `sgdt`/`sidt`.
///
/// The leading pad keeps `limit` and `base` contiguous at a 2-byte offset, so the
/// switch routine can feed `&limit` straight to `lgdt`/`lidt`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTablePointer {
    pub(crate) pad: u16,
    /// Size of the table minus one.
    pub limit: u16,
    /// Linear address of the table.
    pub base: u32,
}

impl DescriptorTablePointer {
    /// Creates a descriptor table pointer.
    pub const fn new(base: u32, limit: u16) -> Self {
        Self { pad: 0, limit, base }
    }
}

/// Saved CPU state of one side of the passage.
///
/// The switch routine addresses these fields by fixed byte offsets, see
/// [`crate::layout`]. Field order and sizes are part of that contract.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    /// Code segment selector.
    pub cs: u16,
    /// Data segment selector.
    pub ds: u16,
    /// Extra segment selector.
    pub es: u16,
    /// FS selector.
    pub fs: u16,
    /// GS selector.
    pub gs: u16,
    /// Stack segment selector.
    pub ss: u16,

    /// Control register 0.
    pub cr0: u32,
    /// Last page fault address.
    pub cr2: u32,
    /// Page table root of this side's own address space.
    pub cr3: u32,
    /// Control register 4.
    pub cr4: u32,

    /// Breakpoint address 0.
    pub dr0: u32,
    /// Breakpoint address 1.
    pub dr1: u32,
    /// Breakpoint address 2.
    pub dr2: u32,
    /// Breakpoint address 3.
    pub dr3: u32,
    /// Debug status.
    pub dr6: u32,
    /// Debug control.
    pub dr7: u32,

    /// Global descriptor table.
    pub gdt: DescriptorTablePointer,
    /// Interrupt descriptor table.
    pub idt: DescriptorTablePointer,
    /// Local descriptor table selector.
    pub ldt: u16,
    /// Task register selector.
    pub tr: u16,

    /// Stack pointer at the time of the switch.
    pub esp: u32,
    /// EFLAGS at the time of the switch.
    pub flags: u32,
    /// Where this side resumes.
    pub return_eip: u32,
    /// Delta from this side's view of the passage page to the peer's view.
    pub other_map: i32,
    /// Root of the transitional space this side enters when leaving.
    pub temp_cr3: u32,
    /// Working storage for the switch routine.
    pub scratch: [u32; 3],
}

impl CpuContext {
    /// A context with every field zero.
    pub const fn zeroed() -> Self {
        Self {
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            gdt: DescriptorTablePointer::new(0, 0),
            idt: DescriptorTablePointer::new(0, 0),
            ldt: 0,
            tr: 0,
            esp: 0,
            flags: 0,
            return_eip: 0,
            other_map: 0,
            temp_cr3: 0,
            scratch: [0; 3],
        }
    }

    /// The debug registers in the order the switch routine saves them.
    pub const fn debug_registers(&self) -> [u32; 6] {
        [self.dr0, self.dr1, self.dr2, self.dr3, self.dr6, self.dr7]
    }

    /// Logs every field at debug level.
    pub fn dump(&self, side: &str) {
        debug!(
            "{side}: cs={:#06x} ds={:#06x} es={:#06x} fs={:#06x} gs={:#06x} ss={:#06x}",
            self.cs, self.ds, self.es, self.fs, self.gs, self.ss
        );
        debug!(
            "{side}: cr0={:#010x} cr2={:#010x} cr3={:#010x} cr4={:#010x}",
            self.cr0, self.cr2, self.cr3, self.cr4
        );
        debug!(
            "{side}: dr0={:#010x} dr1={:#010x} dr2={:#010x} dr3={:#010x} dr6={:#010x} dr7={:#010x}",
            self.dr0, self.dr1, self.dr2, self.dr3, self.dr6, self.dr7
        );
        debug!(
            "{side}: gdt={:#010x}:{:#06x} idt={:#010x}:{:#06x} ldt={:#06x} tr={:#06x}",
            self.gdt.base, self.gdt.limit, self.idt.base, self.idt.limit, self.ldt, self.tr
        );
        debug!(
            "{side}: esp={:#010x} flags={:#010x} eip={:#010x} other_map={:#010x} temp_cr3={:#010x}",
            self.esp, self.flags, self.return_eip, self.other_map, self.temp_cr3
        );
    }
}
