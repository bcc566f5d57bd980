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

use core::arch::{asm, global_asm};
use core::arch::x86::__cpuid;

use crate::context::Cr4;
use crate::layout::*;
use crate::switch::SWITCH_DR7;
use crate::{ArchCpu, CpuContext, CpuFeatures, DescriptorTablePointer, PassagePage};

// The switch routine. It is copied into every passage page and runs from there,
// so it must stay position independent.
//
// In: eax = this side's context, edx = the peer's context, both as seen from
// this side. Returns once the peer switches back.
global_asm!(
    ".section .text.axcomon_passage, \"ax\"",
    ".global axcomon_passage_begin",
    ".global axcomon_passage_end",
    "axcomon_passage_begin:",
    "    pushfd",
    "    cli",
    "    push ebp",
    "    push ebx",
    "    push esi",
    "    push edi",
    "    mov ebp, eax",
    "    mov word ptr [ebp + {cs}], cs",
    "    mov word ptr [ebp + {ds}], ds",
    "    mov word ptr [ebp + {es}], es",
    "    mov word ptr [ebp + {fs}], fs",
    "    mov word ptr [ebp + {gs}], gs",
    "    mov word ptr [ebp + {ss}], ss",
    "    mov [ebp + {esp}], esp",
    "    mov ecx, [esp + 16]",
    "    mov [ebp + {flags}], ecx",
    "    call .Lpassage_here",
    ".Lpassage_here:",
    "    pop ecx",
    "    mov edi, ecx",
    "    add ecx, .Lpassage_resume - .Lpassage_here",
    "    mov [ebp + {eip}], ecx",
    "    mov ecx, cr0",
    "    mov [ebp + {cr0}], ecx",
    "    mov ecx, cr2",
    "    mov [ebp + {cr2}], ecx",
    "    mov ecx, cr3",
    "    mov [ebp + {cr3}], ecx",
    "    mov ecx, cr4",
    "    mov [ebp + {cr4}], ecx",
    "    mov ecx, dr0",
    "    mov [ebp + {dr0}], ecx",
    "    mov ecx, dr1",
    "    mov [ebp + {dr1}], ecx",
    "    mov ecx, dr2",
    "    mov [ebp + {dr2}], ecx",
    "    mov ecx, dr3",
    "    mov [ebp + {dr3}], ecx",
    "    mov ecx, dr6",
    "    mov [ebp + {dr6}], ecx",
    "    mov ecx, dr7",
    "    mov [ebp + {dr7}], ecx",
    "    mov ecx, {park_dr7}",
    "    mov dr7, ecx",
    "    sgdt [ebp + {gdt}]",
    "    sidt [ebp + {idt}]",
    "    sldt word ptr [ebp + {ldt}]",
    "    str word ptr [ebp + {tr}]",
    // Into this side's transitional space. Contexts live in the header page.
    // The stack is not mapped from here on; edi holds .Lpassage_here.
    "    mov esi, ebp",
    "    and esi, 0xfffff000",
    "    mov ecx, cr4",
    "    and ecx, {pae}",
    "    mov cr4, ecx",
    "    mov ecx, [ebp + {temp_cr3}]",
    "    mov cr3, ecx",
    "    mov ecx, [ebp + {other_map}]",
    "    xor ebx, ebx",
    "    mov eax, [ebp + {temp_cr3}]",
    "    cmp eax, [edx + {temp_cr3}]",
    "    je .Lpassage_relocate",
    // Separate spaces: through the identity mapping, paging off while CR4 and
    // CR3 take the peer's transitional settings.
    "    mov ebx, [esi + {self_physical}]",
    "    sub ebx, esi",
    "    add edx, ebx",
    "    mov eax, edi",
    "    add eax, .Lpassage_flat - .Lpassage_here",
    "    add eax, ebx",
    "    jmp eax",
    ".Lpassage_flat:",
    "    mov eax, cr0",
    "    and eax, 0x7fffffff",
    "    mov cr0, eax",
    "    mov eax, [edx + {cr4}]",
    "    and eax, {pae}",
    "    mov cr4, eax",
    "    mov eax, [edx + {temp_cr3}]",
    "    mov cr3, eax",
    "    mov eax, cr0",
    "    or eax, 0x80000000",
    "    mov cr0, eax",
    // Continue in the peer's view: ebx + ecx is this side's other_map.
    ".Lpassage_relocate:",
    "    sub ecx, ebx",
    "    add edx, ecx",
    "    mov eax, edi",
    "    add eax, .Lpassage_other - .Lpassage_here",
    "    add eax, ebx",
    "    add eax, ecx",
    "    jmp eax",
    ".Lpassage_other:",
    "    mov ebp, edx",
    "    lgdt [ebp + {gdt}]",
    "    lidt [ebp + {idt}]",
    "    mov ecx, [ebp + {cr0}]",
    "    mov cr0, ecx",
    "    mov ecx, [ebp + {cr4}]",
    "    mov cr4, ecx",
    "    mov ecx, [ebp + {cr3}]",
    "    mov cr3, ecx",
    "    mov ecx, [ebp + {cr2}]",
    "    mov cr2, ecx",
    // A busy TSS cannot be loaded again: clear the busy bit first.
    "    movzx ecx, word ptr [ebp + {tr}]",
    "    test ecx, ecx",
    "    jz .Lpassage_no_tr",
    "    mov ebx, [ebp + {gdt} + 2]",
    "    and ecx, 0xfff8",
    "    and byte ptr [ebx + ecx + 5], 0xfd",
    "    ltr word ptr [ebp + {tr}]",
    ".Lpassage_no_tr:",
    "    lldt word ptr [ebp + {ldt}]",
    "    mov ss, word ptr [ebp + {ss}]",
    "    mov esp, [ebp + {esp}]",
    "    mov ds, word ptr [ebp + {ds}]",
    "    mov es, word ptr [ebp + {es}]",
    "    mov fs, word ptr [ebp + {fs}]",
    "    mov gs, word ptr [ebp + {gs}]",
    // Debug registers only where they differ, DR7 last.
    "    mov ecx, [ebp + {dr0}]",
    "    mov ebx, dr0",
    "    cmp ecx, ebx",
    "    je 2f",
    "    mov dr0, ecx",
    "2:",
    "    mov ecx, [ebp + {dr1}]",
    "    mov ebx, dr1",
    "    cmp ecx, ebx",
    "    je 3f",
    "    mov dr1, ecx",
    "3:",
    "    mov ecx, [ebp + {dr2}]",
    "    mov ebx, dr2",
    "    cmp ecx, ebx",
    "    je 4f",
    "    mov dr2, ecx",
    "4:",
    "    mov ecx, [ebp + {dr3}]",
    "    mov ebx, dr3",
    "    cmp ecx, ebx",
    "    je 5f",
    "    mov dr3, ecx",
    "5:",
    "    mov ecx, [ebp + {dr6}]",
    "    mov ebx, dr6",
    "    cmp ecx, ebx",
    "    je 6f",
    "    mov dr6, ecx",
    "6:",
    "    mov ecx, [ebp + {dr7}]",
    "    mov ebx, dr7",
    "    cmp ecx, ebx",
    "    je 7f",
    "    mov dr7, ecx",
    "7:",
    "    push dword ptr [ebp + {flags}]",
    "    movzx ecx, word ptr [ebp + {cs}]",
    "    push ecx",
    "    push dword ptr [ebp + {eip}]",
    "    iretd",
    ".Lpassage_resume:",
    "    pop edi",
    "    pop esi",
    "    pop ebx",
    "    pop ebp",
    "    popfd",
    "    ret",
    "axcomon_passage_end:",
    ".text",
    cs = const CTX_CS,
    ds = const CTX_DS,
    es = const CTX_ES,
    fs = const CTX_FS,
    gs = const CTX_GS,
    ss = const CTX_SS,
    cr0 = const CTX_CR0,
    cr2 = const CTX_CR2,
    cr3 = const CTX_CR3,
    cr4 = const CTX_CR4,
    dr0 = const CTX_DR0,
    dr1 = const CTX_DR1,
    dr2 = const CTX_DR2,
    dr3 = const CTX_DR3,
    dr6 = const CTX_DR6,
    dr7 = const CTX_DR7,
    gdt = const CTX_GDT,
    idt = const CTX_IDT,
    ldt = const CTX_LDT,
    tr = const CTX_TR,
    esp = const CTX_ESP,
    flags = const CTX_FLAGS,
    eip = const CTX_RETURN_EIP,
    other_map = const CTX_OTHER_MAP,
    temp_cr3 = const CTX_TEMP_CR3,
    self_physical = const PASSAGE_SELF_PHYSICAL,
    pae = const Cr4::PAE.bits(),
    park_dr7 = const SWITCH_DR7,
);

extern "C" {
    static axcomon_passage_begin: u8;
    static axcomon_passage_end: u8;
}

/// The CPU the host kernel runs on.
#[derive(Debug, Default)]
pub struct X86Cpu {
    _private: (),
}

impl X86Cpu {
    /// Creates the handle. Only one should exist per CPU.
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

macro_rules! read_reg {
    ($reg:literal) => {{
        let value: u32;
        // SAFETY: reading a control, debug or segment register has no side effect.
        unsafe { asm!(concat!("mov {0}, ", $reg), out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }};
}

impl ArchCpu for X86Cpu {
    fn features(&self) -> CpuFeatures {
        let mut features = CpuFeatures::empty();
        // SAFETY: every CPU able to run this code has CPUID.
        let basic = unsafe { __cpuid(1) };
        features.set(CpuFeatures::PSE, basic.edx & (1 << 3) != 0);
        features.set(CpuFeatures::PGE, basic.edx & (1 << 13) != 0);
        features.set(CpuFeatures::FXSR, basic.edx & (1 << 24) != 0);
        let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
        if max_extended >= 0x8000_0001 {
            let extended = unsafe { __cpuid(0x8000_0001) };
            features.set(CpuFeatures::NX, extended.edx & (1 << 20) != 0);
        }
        let cr4: u32 = read_reg!("cr4");
        features.set(CpuFeatures::PAE_ENABLED, cr4 & Cr4::PAE.bits() != 0);
        features
    }

    fn capture(&self) -> CpuContext {
        let mut ctx = CpuContext::zeroed();
        ctx.cs = read_reg!("cs") as u16;
        ctx.ds = read_reg!("ds") as u16;
        ctx.es = read_reg!("es") as u16;
        ctx.fs = read_reg!("fs") as u16;
        ctx.gs = read_reg!("gs") as u16;
        ctx.ss = read_reg!("ss") as u16;
        ctx.cr0 = read_reg!("cr0");
        ctx.cr2 = read_reg!("cr2");
        ctx.cr3 = read_reg!("cr3");
        ctx.cr4 = read_reg!("cr4");
        ctx.dr0 = read_reg!("dr0");
        ctx.dr1 = read_reg!("dr1");
        ctx.dr2 = read_reg!("dr2");
        ctx.dr3 = read_reg!("dr3");
        ctx.dr6 = read_reg!("dr6");
        ctx.dr7 = read_reg!("dr7");

        let mut gdt = DescriptorTablePointer::default();
        let mut idt = DescriptorTablePointer::default();
        let (ldt, tr): (u16, u16);
        // SAFETY: `sgdt`/`sidt` store six bytes, limit then base, which is the
        // layout after the pad.
        unsafe {
            let gdt_ptr = (&mut gdt as *mut DescriptorTablePointer as *mut u8).add(2);
            let idt_ptr = (&mut idt as *mut DescriptorTablePointer as *mut u8).add(2);
            asm!("sgdt [{0}]", in(reg) gdt_ptr, options(nostack, preserves_flags));
            asm!("sidt [{0}]", in(reg) idt_ptr, options(nostack, preserves_flags));
            asm!("sldt {0:x}", out(reg) ldt, options(nomem, nostack, preserves_flags));
            asm!("str {0:x}", out(reg) tr, options(nomem, nostack, preserves_flags));
        }
        ctx.gdt = gdt;
        ctx.idt = idt;
        ctx.ldt = ldt;
        ctx.tr = tr;

        let flags: u32;
        // SAFETY: pushfd and pop are balanced.
        unsafe { asm!("pushfd", "pop {0}", out(reg) flags, options(nomem, preserves_flags)) };
        ctx.flags = flags;
        ctx
    }

    fn passage_code(&self) -> &[u8] {
        // SAFETY: both symbols delimit the routine emitted above.
        unsafe {
            let begin = core::ptr::addr_of!(axcomon_passage_begin);
            let end = core::ptr::addr_of!(axcomon_passage_end);
            core::slice::from_raw_parts(begin, end as usize - begin as usize)
        }
    }

    fn flush_tlb(&mut self) {
        // SAFETY: reloading CR3 with its own value only drops non-global entries.
        unsafe { asm!("mov {0}, cr3", "mov cr3, {0}", out(reg) _, options(nostack, preserves_flags)) };
    }

    fn irq_save(&mut self) -> bool {
        let flags: u32;
        // SAFETY: masks interrupts on this CPU only.
        unsafe { asm!("pushfd", "pop {0}", "cli", out(reg) flags, options(nomem)) };
        flags & crate::RFlags::IF.bits() != 0
    }

    fn irq_restore(&mut self, enabled: bool) {
        if enabled {
            // SAFETY: interrupts were enabled when `irq_save` ran.
            unsafe { asm!("sti", options(nomem, nostack)) };
        }
    }

    unsafe fn switch(&mut self, page: &mut PassagePage) {
        let entry = page.header.code.as_ptr();
        let current: *mut CpuContext = &mut page.header.host;
        let other: *mut CpuContext = &mut page.header.guest;
        // SAFETY: the caller guarantees the page is initialized and mapped at
        // both views; the routine preserves ebx, esi, edi and ebp.
        unsafe {
            asm!(
                "call {entry}",
                entry = inout(reg) entry => _,
                inout("eax") current => _,
                inout("edx") other => _,
                out("ecx") _,
            );
        }
    }
}
