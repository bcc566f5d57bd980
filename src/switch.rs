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

use crate::context::Cr4;
use crate::layout::PASSAGE_CODE;
use crate::space::{builder_for, PagingMode};
use crate::{CpuContext, DescriptorTablePointer, PassagePage, RFlags};

/// Value loaded into DR7 while the switch runs: breakpoints off, `GE`/`LE` and
/// the reserved bit 10 set.
pub const SWITCH_DR7: u32 = 0x700;

bitflags! {
    /// Host CPU capabilities relevant to the passage.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u32 {
        /// Execute-disable page protection (CPUID 0x8000_0001, EDX bit 20).
        const NX = 1 << 0;
        /// The host currently runs with PAE paging.
        const PAE_ENABLED = 1 << 1;
        /// Large pages in non-PAE mode.
        const PSE = 1 << 2;
        /// Global pages.
        const PGE = 1 << 3;
        /// `fxsave`/`fxrstor`.
        const FXSR = 1 << 4;
    }
}

/// One side of the passage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The host kernel.
    Host = 0,
    /// The guest kernel.
    Guest = 1,
}

impl Side {
    /// The side on the other end of the passage.
    pub const fn peer(self) -> Self {
        match self {
            Self::Host => Self::Guest,
            Self::Guest => Self::Host,
        }
    }
}

/// Architecture-specific operations the monitor needs from the CPU it runs on.
///
/// The real implementation lives in [`crate::arch`]; [`crate::sim::SimulatedCpu`]
/// replays the same protocol on a register file in memory.
pub trait ArchCpu {
    /// Capabilities of the CPU, read once at boot.
    fn features(&self) -> CpuFeatures;

    /// Takes a snapshot of the live CPU state, as the host side of the passage
    /// would save it.
    fn capture(&self) -> CpuContext;

    /// The position-independent switch routine to copy into the passage page.
    fn passage_code(&self) -> &[u8];

    /// Flushes the local TLB.
    fn flush_tlb(&mut self);

    /// Disables local interrupts, returning whether they were enabled.
    fn irq_save(&mut self) -> bool;

    /// Re-enables local interrupts if `enabled`.
    fn irq_restore(&mut self, enabled: bool);

    /// Enters the guest through the passage page and returns once the guest has
    /// switched back to the host.
    ///
    /// # Safety
    ///
    /// `page` must be pinned, initialized, and mapped at the views recorded in
    /// its header; both contexts must describe runnable states.
    unsafe fn switch(&mut self, page: &mut PassagePage);
}

/// The architectural registers touched by a switch, as a plain record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterFile {
    /// Code segment.
    pub cs: u16,
    /// Data segment.
    pub ds: u16,
    /// Extra segment.
    pub es: u16,
    /// FS segment.
    pub fs: u16,
    /// GS segment.
    pub gs: u16,
    /// Stack segment.
    pub ss: u16,
    /// Control register 0.
    pub cr0: u32,
    /// Page fault address.
    pub cr2: u32,
    /// Page table root.
    pub cr3: u32,
    /// Control register 4. Its PAE bit picks the paging format walked.
    pub cr4: u32,
    /// DR0-DR3, DR6, DR7.
    pub dr: [u32; 6],
    /// GDT register.
    pub gdt: DescriptorTablePointer,
    /// IDT register.
    pub idt: DescriptorTablePointer,
    /// LDT selector.
    pub ldt: u16,
    /// Task register.
    pub tr: u16,
    /// Stack pointer.
    pub esp: u32,
    /// Flags register.
    pub eflags: u32,
    /// Instruction pointer.
    pub eip: u32,
}

impl RegisterFile {
    /// The registers as the passage would save them.
    pub fn save(&self, ctx: &mut CpuContext) {
        ctx.cs = self.cs;
        ctx.ds = self.ds;
        ctx.es = self.es;
        ctx.fs = self.fs;
        ctx.gs = self.gs;
        ctx.ss = self.ss;
        ctx.cr0 = self.cr0;
        ctx.cr2 = self.cr2;
        ctx.cr3 = self.cr3;
        ctx.cr4 = self.cr4;
        [ctx.dr0, ctx.dr1, ctx.dr2, ctx.dr3, ctx.dr6, ctx.dr7] = self.dr;
        ctx.gdt = self.gdt;
        ctx.idt = self.idt;
        ctx.ldt = self.ldt;
        ctx.tr = self.tr;
        ctx.esp = self.esp;
        ctx.flags = self.eflags;
        ctx.return_eip = self.eip;
    }

    /// A register file holding what `ctx` describes.
    pub fn from_context(ctx: &CpuContext) -> Self {
        Self {
            cs: ctx.cs,
            ds: ctx.ds,
            es: ctx.es,
            fs: ctx.fs,
            gs: ctx.gs,
            ss: ctx.ss,
            cr0: ctx.cr0,
            cr2: ctx.cr2,
            cr3: ctx.cr3,
            cr4: ctx.cr4,
            dr: ctx.debug_registers(),
            gdt: ctx.gdt,
            idt: ctx.idt,
            ldt: ctx.ldt,
            tr: ctx.tr,
            esp: ctx.esp,
            eflags: ctx.flags,
            eip: ctx.return_eip,
        }
    }

    /// Writes DR`index` unless it already holds `value`. Returns whether a
    /// write happened.
    fn write_debug(&mut self, index: usize, value: u32) -> bool {
        if self.dr[index] == value {
            return false;
        }
        self.dr[index] = value;
        true
    }
}

/// What a modelled switch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Address the routine continued at in the peer's view.
    pub relocated_pc: u32,
    /// Debug register writes issued, including the ones that park DR7.
    pub debug_writes: usize,
    /// Whether the routine changed paging mode through the identity mapping.
    pub paging_switched: bool,
}

/// Why a modelled switch would have crashed the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchFault {
    /// The routine's code is not mapped at `vaddr` in the transitional space.
    CodeUnmapped {
        /// The faulting fetch address.
        vaddr: u32,
    },
    /// Relocation by `other_map` did not land on the peer's view.
    BadRelocation {
        /// Where execution would have continued.
        vaddr: u32,
    },
}

/// Checks that the routine at `vaddr` is reachable with the paging state in
/// `regs`.
fn fetch(page: &PassagePage, regs: &RegisterFile, vaddr: u32) -> Result<(), SwitchFault> {
    let header = &page.header;
    let code_phys = header.self_physical + PASSAGE_CODE as u32;
    let builder = builder_for(PagingMode::of_cr4(regs.cr4));
    match builder.translate(&page.tables, header.tables_phys(), regs.cr3, vaddr) {
        Some(phys) if phys == code_phys => Ok(()),
        _ => Err(SwitchFault::CodeUnmapped { vaddr }),
    }
}

/// Runs the passage protocol from side `from` to its peer on `regs`.
///
/// This is the register-level model of the switch routine:
///
/// 1. interrupts off, current state saved into `from`'s descriptor;
/// 2. breakpoints parked, CR4 reduced to the paging bits, CR3 pointed at the
///    current side's transitional space;
/// 3. if the peer uses another transitional space, a hop to the identity
///    mapping, where paging is turned off while CR4 and CR3 take the peer's
///    paging bits and transitional root;
/// 4. execution relocated the rest of the way to the peer's view;
/// 5. the peer's descriptor loaded, CR4 before CR3 and debug registers only
///    where they differ;
/// 6. execution resumed at the peer's saved flags and return address.
pub fn transition(
    regs: &mut RegisterFile,
    page: &mut PassagePage,
    from: Side,
) -> Result<Transition, SwitchFault> {
    let to = from.peer();
    let mut debug_writes = 0;

    // Save, with the flags as they were before `cli`.
    let current = page.header.context_mut(from);
    regs.save(current);
    let mut delta = current.other_map as u32;
    let own_root = current.temp_cr3;
    regs.eflags &= !RFlags::IF.bits();

    if regs.write_debug(5, SWITCH_DR7) {
        debug_writes += 1;
    }

    let other = *page.header.context(to);
    let identity = page.header.self_physical + PASSAGE_CODE as u32;
    let target = page.header.views[to as usize].wrapping_add(PASSAGE_CODE as u32);

    regs.cr4 &= Cr4::PAE.bits();
    regs.cr3 = own_root;
    let mut pc = page.header.views[from as usize].wrapping_add(PASSAGE_CODE as u32);
    fetch(page, regs, pc)?;

    let paging_switched = other.temp_cr3 != own_root;
    if paging_switched {
        delta = delta.wrapping_sub(identity.wrapping_sub(pc));
        pc = identity;
        fetch(page, regs, pc)?;
        // CR0.PG is off between these loads; the identity address stays valid.
        regs.cr4 = other.cr4 & Cr4::PAE.bits();
        regs.cr3 = other.temp_cr3;
        fetch(page, regs, pc)?;
    }

    let relocated_pc = pc.wrapping_add(delta);
    if relocated_pc != target {
        return Err(SwitchFault::BadRelocation {
            vaddr: relocated_pc,
        });
    }
    fetch(page, regs, relocated_pc)?;

    regs.gdt = other.gdt;
    regs.idt = other.idt;
    regs.cr0 = other.cr0;
    regs.cr2 = other.cr2;
    regs.cr4 = other.cr4;
    regs.cr3 = other.cr3;
    regs.ldt = other.ldt;
    regs.tr = other.tr;
    regs.cs = other.cs;
    regs.ds = other.ds;
    regs.es = other.es;
    regs.fs = other.fs;
    regs.gs = other.gs;
    regs.ss = other.ss;
    // DR7 last, so no breakpoint fires while the others change.
    for (index, value) in other.debug_registers().into_iter().enumerate() {
        if regs.write_debug(index, value) {
            debug_writes += 1;
        }
    }
    regs.esp = other.esp;
    regs.eflags = other.flags;
    regs.eip = other.return_eip;

    Ok(Transition {
        relocated_pc,
        debug_writes,
        paging_switched,
    })
}
