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

//! Byte layout of the passage page.
//!
//! The switch routine reaches every field through a fixed offset from the page
//! or context base. All offsets live here, pinned against the Rust types by
//! compile time assertions, and nothing else in the crate relies on them.

use core::mem::{offset_of, size_of};

use memory_addr::PAGE_SIZE_4K;
use static_assertions::{const_assert, const_assert_eq};

use crate::space::{TablePage, TransitionalTables, TRANSITIONAL_TABLE_PAGES};
use crate::{CpuContext, DescriptorTablePointer, Mailbox, PassageHeader, PassagePage};

/// Offsets inside [`CpuContext`].
pub const CTX_CS: usize = 0x00;
pub const CTX_DS: usize = 0x02;
pub const CTX_ES: usize = 0x04;
pub const CTX_FS: usize = 0x06;
pub const CTX_GS: usize = 0x08;
pub const CTX_SS: usize = 0x0a;
pub const CTX_CR0: usize = 0x0c;
pub const CTX_CR2: usize = 0x10;
pub const CTX_CR3: usize = 0x14;
pub const CTX_CR4: usize = 0x18;
pub const CTX_DR0: usize = 0x1c;
pub const CTX_DR1: usize = 0x20;
pub const CTX_DR2: usize = 0x24;
pub const CTX_DR3: usize = 0x28;
pub const CTX_DR6: usize = 0x2c;
pub const CTX_DR7: usize = 0x30;
/// The `limit` half of the GDT pointer, what `lgdt`/`sgdt` operate on.
pub const CTX_GDT: usize = 0x36;
pub const CTX_IDT: usize = 0x3e;
pub const CTX_LDT: usize = 0x44;
pub const CTX_TR: usize = 0x46;
pub const CTX_ESP: usize = 0x48;
pub const CTX_FLAGS: usize = 0x4c;
pub const CTX_RETURN_EIP: usize = 0x50;
pub const CTX_OTHER_MAP: usize = 0x54;
pub const CTX_TEMP_CR3: usize = 0x58;
pub const CTX_SCRATCH: usize = 0x5c;
/// Size of a [`CpuContext`].
pub const CTX_SIZE: usize = 0x68;

/// Offsets inside [`PassageHeader`].
pub const PASSAGE_SELF_PHYSICAL: usize = 0x00;
pub const PASSAGE_VIEWS: usize = 0x04;
pub const PASSAGE_MODE: usize = 0x0c;
pub const PASSAGE_HOST: usize = 0x40;
pub const PASSAGE_GUEST: usize = 0xa8;
pub const PASSAGE_MAILBOX: usize = 0x200;
pub const PASSAGE_CODE: usize = 0x800;
/// Room for the switch routine.
pub const PASSAGE_CODE_SIZE: usize = PAGE_SIZE_4K - PASSAGE_CODE;
/// Bytes of mailbox (operation word plus parameters).
pub const MAILBOX_SIZE: usize = 0x404;

const_assert_eq!(size_of::<CpuContext>(), CTX_SIZE);
const_assert_eq!(offset_of!(CpuContext, cs), CTX_CS);
const_assert_eq!(offset_of!(CpuContext, ds), CTX_DS);
const_assert_eq!(offset_of!(CpuContext, es), CTX_ES);
const_assert_eq!(offset_of!(CpuContext, fs), CTX_FS);
const_assert_eq!(offset_of!(CpuContext, gs), CTX_GS);
const_assert_eq!(offset_of!(CpuContext, ss), CTX_SS);
const_assert_eq!(offset_of!(CpuContext, cr0), CTX_CR0);
const_assert_eq!(offset_of!(CpuContext, cr2), CTX_CR2);
const_assert_eq!(offset_of!(CpuContext, cr3), CTX_CR3);
const_assert_eq!(offset_of!(CpuContext, cr4), CTX_CR4);
const_assert_eq!(offset_of!(CpuContext, dr0), CTX_DR0);
const_assert_eq!(offset_of!(CpuContext, dr1), CTX_DR1);
const_assert_eq!(offset_of!(CpuContext, dr2), CTX_DR2);
const_assert_eq!(offset_of!(CpuContext, dr3), CTX_DR3);
const_assert_eq!(offset_of!(CpuContext, dr6), CTX_DR6);
const_assert_eq!(offset_of!(CpuContext, dr7), CTX_DR7);
const_assert_eq!(
    offset_of!(CpuContext, gdt) + offset_of!(DescriptorTablePointer, limit),
    CTX_GDT
);
const_assert_eq!(
    offset_of!(CpuContext, idt) + offset_of!(DescriptorTablePointer, limit),
    CTX_IDT
);
const_assert_eq!(offset_of!(CpuContext, ldt), CTX_LDT);
const_assert_eq!(offset_of!(CpuContext, tr), CTX_TR);
const_assert_eq!(offset_of!(CpuContext, esp), CTX_ESP);
const_assert_eq!(offset_of!(CpuContext, flags), CTX_FLAGS);
const_assert_eq!(offset_of!(CpuContext, return_eip), CTX_RETURN_EIP);
const_assert_eq!(offset_of!(CpuContext, other_map), CTX_OTHER_MAP);
const_assert_eq!(offset_of!(CpuContext, temp_cr3), CTX_TEMP_CR3);
const_assert_eq!(offset_of!(CpuContext, scratch), CTX_SCRATCH);

const_assert_eq!(size_of::<Mailbox>(), MAILBOX_SIZE);
const_assert_eq!(size_of::<PassageHeader>(), PAGE_SIZE_4K);
const_assert_eq!(offset_of!(PassageHeader, self_physical), PASSAGE_SELF_PHYSICAL);
const_assert_eq!(offset_of!(PassageHeader, views), PASSAGE_VIEWS);
const_assert_eq!(offset_of!(PassageHeader, mode), PASSAGE_MODE);
const_assert_eq!(offset_of!(PassageHeader, host), PASSAGE_HOST);
const_assert_eq!(offset_of!(PassageHeader, guest), PASSAGE_GUEST);
const_assert_eq!(offset_of!(PassageHeader, mailbox), PASSAGE_MAILBOX);
const_assert_eq!(offset_of!(PassageHeader, code), PASSAGE_CODE);
const_assert!(PASSAGE_GUEST + CTX_SIZE <= PASSAGE_MAILBOX);
const_assert!(PASSAGE_MAILBOX + MAILBOX_SIZE <= PASSAGE_CODE);

// The tables must sit physically right after the header.
const_assert_eq!(size_of::<TablePage>(), PAGE_SIZE_4K);
const_assert_eq!(offset_of!(PassagePage, tables), PAGE_SIZE_4K);
const_assert_eq!(
    size_of::<TransitionalTables>(),
    TRANSITIONAL_TABLE_PAGES * PAGE_SIZE_4K
);

/// Raw bytes of a context, as the switch routine sees them.
pub fn context_bytes(ctx: &CpuContext) -> &[u8; CTX_SIZE] {
    // SAFETY: `CpuContext` is `repr(C)`, exactly `CTX_SIZE` bytes long and has no
    // implicit padding.
    unsafe { &*(ctx as *const CpuContext as *const [u8; CTX_SIZE]) }
}

/// Mutable raw bytes of a context.
pub fn context_bytes_mut(ctx: &mut CpuContext) -> &mut [u8; CTX_SIZE] {
    // SAFETY: as above, and every bit pattern is a valid `CpuContext` since all of
    // its fields are plain integers.
    unsafe { &mut *(ctx as *mut CpuContext as *mut [u8; CTX_SIZE]) }
}

/// Reads a little endian word at `offset`.
pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Reads a little endian half word at `offset`.
pub fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}
