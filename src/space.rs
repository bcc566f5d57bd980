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

//! Transitional address spaces.
//!
//! While the switch routine changes CR3 it executes from the passage page, so the
//! page must stay mapped for the few instructions between the two CR3 loads. A
//! transitional address space maps exactly the passage frame and nothing else.
//!
//! A host with flat paging shares one space with the guest that maps both views.
//! A PAE host cannot: the guest always runs with flat paging, so each side gets
//! a space in its own format, mapping its view plus the frame at its physical
//! address. The switch crosses from one to the other through that identity
//! mapping with paging turned off.

use bitflags::bitflags;
use memory_addr::PAGE_SIZE_4K;

use crate::error::InitError;
use crate::{CpuFeatures, MonitorResult, Side};

/// Number of table pages reserved inside the passage page. An extended host
/// space takes at most one top table, two directories and two leaf tables; the
/// flat guest space next to it a directory and two leaf tables.
pub const TRANSITIONAL_TABLE_PAGES: usize = 8;

const PAGE_MASK: u64 = !(PAGE_SIZE_4K as u64 - 1);
const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// x86 page table entry bits, in their 64-bit (PAE) positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is valid.
        const PRESENT = 1 << 0;
        /// Writes allowed.
        const WRITABLE = 1 << 1;
        /// User mode access allowed.
        const USER = 1 << 2;
        /// Set by the CPU on access.
        const ACCESSED = 1 << 5;
        /// Set by the CPU on write.
        const DIRTY = 1 << 6;
        /// Directory entry maps a large page.
        const HUGE_PAGE = 1 << 7;
        /// Instruction fetches forbidden (PAE only).
        const NO_EXECUTE = 1 << 63;

        /// What a kernel page table entry carries (`0x063`).
        const KERNEL_TABLE = Self::PRESENT.bits()
            | Self::WRITABLE.bits()
            | Self::ACCESSED.bits()
            | Self::DIRTY.bits();
    }
}

/// A paging format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Two level, 32-bit entries, 4 MiB per leaf table.
    Flat,
    /// Three level PAE, 64-bit entries, 2 MiB per leaf table.
    Extended,
}

impl PagingMode {
    /// Picks the mode the host currently runs in.
    pub fn detect(features: CpuFeatures) -> Self {
        if features.contains(CpuFeatures::PAE_ENABLED) {
            Self::Extended
        } else {
            Self::Flat
        }
    }

    /// The mode a CPU with control register 4 set to `cr4` walks tables in.
    pub fn of_cr4(cr4: u32) -> Self {
        if cr4 & crate::context::Cr4::PAE.bits() != 0 {
            Self::Extended
        } else {
            Self::Flat
        }
    }
}

/// One 4K page of page table entries.
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
pub struct TablePage([u8; PAGE_SIZE_4K]);

impl TablePage {
    /// An empty table.
    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE_4K])
    }

    /// Reads a 32-bit entry.
    pub fn entry32(&self, index: usize) -> u32 {
        let at = index * 4;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[at..at + 4]);
        u32::from_le_bytes(raw)
    }

    /// Writes a 32-bit entry.
    pub fn set_entry32(&mut self, index: usize, value: u32) {
        let at = index * 4;
        self.0[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads a 64-bit entry.
    pub fn entry64(&self, index: usize) -> u64 {
        let at = index * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[at..at + 8]);
        u64::from_le_bytes(raw)
    }

    /// Writes a 64-bit entry.
    pub fn set_entry64(&mut self, index: usize, value: u64) {
        let at = index * 8;
        self.0[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Whether every entry is zero.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

/// The table pages backing the transitional address spaces. They live inside
/// the passage page, physically right after its header.
#[repr(C)]
pub struct TransitionalTables {
    pages: [TablePage; TRANSITIONAL_TABLE_PAGES],
}

impl TransitionalTables {
    /// Empty tables.
    pub const fn new() -> Self {
        Self {
            pages: [TablePage::zeroed(); TRANSITIONAL_TABLE_PAGES],
        }
    }

    /// Clears every table.
    pub fn clear(&mut self) {
        self.pages.fill(TablePage::zeroed());
    }

    /// Number of pages holding at least one entry.
    pub fn pages_in_use(&self) -> usize {
        self.pages.iter().filter(|p| !p.is_empty()).count()
    }

    /// Finds the table page at physical address `phys`, given the physical
    /// address of the first one.
    fn page_at(&self, tables_phys: u32, phys: u64) -> Option<&TablePage> {
        let delta = phys.checked_sub(tables_phys as u64)?;
        if delta % PAGE_SIZE_4K as u64 != 0 {
            return None;
        }
        self.pages.get((delta / PAGE_SIZE_4K as u64) as usize)
    }
}

impl Default for TransitionalTables {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out table pages in order during a build, starting at `first`.
struct TablePool<'a> {
    tables: &'a mut TransitionalTables,
    tables_phys: u32,
    first: usize,
    next: usize,
}

impl<'a> TablePool<'a> {
    fn new(tables: &'a mut TransitionalTables, tables_phys: u32, first: usize) -> Self {
        if let Some(rest) = tables.pages.get_mut(first..) {
            rest.fill(TablePage::zeroed());
        }
        Self {
            tables,
            tables_phys,
            first,
            next: first,
        }
    }

    fn take(&mut self) -> MonitorResult<usize> {
        if self.next >= TRANSITIONAL_TABLE_PAGES {
            return Err(InitError::TransitionalSpace("table pool exhausted").into());
        }
        self.next += 1;
        Ok(self.next - 1)
    }

    fn used(&self) -> usize {
        self.next - self.first
    }

    fn phys(&self, index: usize) -> u64 {
        self.tables_phys as u64 + (index * PAGE_SIZE_4K) as u64
    }

    /// Index of a table handed out by this build given its physical address.
    fn index_of(&self, phys: u64) -> MonitorResult<usize> {
        let delta = phys.wrapping_sub(self.tables_phys as u64) as usize;
        let index = delta / PAGE_SIZE_4K;
        if phys < self.tables_phys as u64
            || index < self.first
            || index >= self.next
            || delta % PAGE_SIZE_4K != 0
        {
            return Err(InitError::TransitionalSpace("entry points outside the table pool").into());
        }
        Ok(index)
    }

    fn page(&mut self, index: usize) -> &mut TablePage {
        &mut self.tables.pages[index]
    }
}

/// A built transitional address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionalSpace {
    /// Paging mode the tables are laid out for.
    pub mode: PagingMode,
    /// Physical address to load into CR3.
    pub root: u32,
    /// Table pages taken from the pool.
    pub tables: usize,
    /// Leaf tables used (1 or 2).
    pub leaf_tables: usize,
    /// Intermediate directories used. The flat layout's single directory is
    /// also its root.
    pub directories: usize,
    /// Entries installed in directories, one per leaf table.
    pub directory_entries: usize,
}

/// Computes the relocation deltas for a pair of views, indexed by [`Side`].
pub fn other_maps(views: [u32; 2]) -> [i32; 2] {
    let host = views[Side::Host as usize];
    let guest = views[Side::Guest as usize];
    let mut maps = [0; 2];
    maps[Side::Host as usize] = guest.wrapping_sub(host) as i32;
    maps[Side::Guest as usize] = host.wrapping_sub(guest) as i32;
    maps
}

/// The transitional spaces of one passage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionalSpaces {
    /// The space each [`Side`] enters first. Both are the same on flat hosts.
    pub spaces: [TransitionalSpace; 2],
    /// Per [`Side`], the delta from that side's view to the peer's view.
    pub other_map: [i32; 2],
}

impl TransitionalSpaces {
    /// The space `side` switches into.
    pub const fn space(&self, side: Side) -> &TransitionalSpace {
        &self.spaces[side as usize]
    }

    /// The relocation delta of `side`.
    pub const fn other_map(&self, side: Side) -> i32 {
        self.other_map[side as usize]
    }

    /// Whether both sides go through one space, without a paging mode change.
    pub fn shared(&self) -> bool {
        self.spaces[0].root == self.spaces[1].root
    }
}

/// Builds the transitional spaces for a passage whose frame is at `page_phys`,
/// seen at `views` (indexed by [`Side`]), on a host paging in `host_mode`.
pub fn build_transitional(
    tables: &mut TransitionalTables,
    tables_phys: u32,
    page_phys: u32,
    host_mode: PagingMode,
    views: [u32; 2],
) -> MonitorResult<TransitionalSpaces> {
    tables.clear();
    let host_view = views[Side::Host as usize];
    let guest_view = views[Side::Guest as usize];
    let spaces = match host_mode {
        PagingMode::Flat => {
            let space = FLAT.build(tables, tables_phys, 0, page_phys, views)?;
            [space, space]
        }
        PagingMode::Extended => {
            let host = EXTENDED.build(tables, tables_phys, 0, page_phys, [host_view, page_phys])?;
            let guest = FLAT.build(tables, tables_phys, host.tables, page_phys, [guest_view, page_phys])?;
            let mut spaces = [host; 2];
            spaces[Side::Guest as usize] = guest;
            spaces
        }
    };
    Ok(TransitionalSpaces {
        spaces,
        other_map: other_maps(views),
    })
}

/// Builds transitional address spaces for one paging mode.
pub trait AddressSpaceBuilder: Sync {
    /// The paging mode of the tables this builder produces.
    fn mode(&self) -> PagingMode;

    /// Maps the two `views` of the passage page to `page_phys`, using the
    /// tables from index `first` on.
    ///
    /// # Parameters
    ///
    /// * `tables` - The table pages; those from `first` on are cleared.
    /// * `tables_phys` - Physical address of the first table page.
    /// * `first` - Index of the first table page this space may take.
    /// * `page_phys` - Physical address of the passage page.
    /// * `views` - Page-aligned virtual addresses of the passage page.
    ///
    /// # Returns
    ///
    /// * `MonitorResult<TransitionalSpace>` - The root and usage of the tables.
    fn build(
        &self,
        tables: &mut TransitionalTables,
        tables_phys: u32,
        first: usize,
        page_phys: u32,
        views: [u32; 2],
    ) -> MonitorResult<TransitionalSpace>;

    /// Walks the tables from `root` like the MMU would.
    fn translate(
        &self,
        tables: &TransitionalTables,
        tables_phys: u32,
        root: u32,
        vaddr: u32,
    ) -> Option<u32>;
}

/// Builder for two level, non-PAE paging.
pub struct FlatBuilder;

/// Builder for three level PAE paging.
pub struct ExtendedBuilder;

static FLAT: FlatBuilder = FlatBuilder;
static EXTENDED: ExtendedBuilder = ExtendedBuilder;

/// Returns the builder for `mode`.
pub fn builder_for(mode: PagingMode) -> &'static dyn AddressSpaceBuilder {
    match mode {
        PagingMode::Flat => &FLAT,
        PagingMode::Extended => &EXTENDED,
    }
}

/// Installs a leaf entry, tolerating an identical existing one.
fn install_leaf(existing: u64, wanted: u64) -> MonitorResult {
    if existing != 0 && existing != wanted {
        return Err(InitError::TransitionalSpace("conflicting leaf entry").into());
    }
    Ok(())
}

fn check_views(views: [u32; 2], page_phys: u32) -> MonitorResult {
    let aligned = |v: u32| v as usize % PAGE_SIZE_4K == 0;
    if !views.iter().copied().all(aligned) || !aligned(page_phys) {
        return Err(InitError::TransitionalSpace("unaligned passage page").into());
    }
    Ok(())
}

impl AddressSpaceBuilder for FlatBuilder {
    fn mode(&self) -> PagingMode {
        PagingMode::Flat
    }

    fn build(
        &self,
        tables: &mut TransitionalTables,
        tables_phys: u32,
        first: usize,
        page_phys: u32,
        views: [u32; 2],
    ) -> MonitorResult<TransitionalSpace> {
        check_views(views, page_phys)?;
        let kernel_table = PageTableFlags::KERNEL_TABLE.bits() as u32;
        let mut pool = TablePool::new(tables, tables_phys, first);
        let root = pool.take()?;
        let mut leaf_tables = 0;

        for view in views {
            let dir_index = (view >> 22) as usize;
            let dir_entry = pool.page(root).entry32(dir_index);
            let leaf = if dir_entry & PageTableFlags::PRESENT.bits() as u32 != 0 {
                pool.index_of((dir_entry as u64) & PAGE_MASK)?
            } else {
                let leaf = pool.take()?;
                let entry = pool.phys(leaf) as u32 | kernel_table;
                pool.page(root).set_entry32(dir_index, entry);
                leaf_tables += 1;
                leaf
            };

            let leaf_index = ((view >> 12) & 0x3ff) as usize;
            let wanted = page_phys | kernel_table;
            install_leaf(pool.page(leaf).entry32(leaf_index) as u64, wanted as u64)?;
            pool.page(leaf).set_entry32(leaf_index, wanted);
        }

        Ok(TransitionalSpace {
            mode: PagingMode::Flat,
            root: pool.phys(root) as u32,
            tables: pool.used(),
            leaf_tables,
            directories: 1,
            directory_entries: leaf_tables,
        })
    }

    fn translate(
        &self,
        tables: &TransitionalTables,
        tables_phys: u32,
        root: u32,
        vaddr: u32,
    ) -> Option<u32> {
        let present = PageTableFlags::PRESENT.bits() as u32;
        let root = tables.page_at(tables_phys, root as u64)?;
        let dir_entry = root.entry32((vaddr >> 22) as usize);
        if dir_entry & present == 0 {
            return None;
        }
        let leaf = tables.page_at(tables_phys, (dir_entry as u64) & PAGE_MASK)?;
        let entry = leaf.entry32(((vaddr >> 12) & 0x3ff) as usize);
        if entry & present == 0 {
            return None;
        }
        Some((entry & PAGE_MASK as u32) | (vaddr & 0xfff))
    }
}

impl AddressSpaceBuilder for ExtendedBuilder {
    fn mode(&self) -> PagingMode {
        PagingMode::Extended
    }

    fn build(
        &self,
        tables: &mut TransitionalTables,
        tables_phys: u32,
        first: usize,
        page_phys: u32,
        views: [u32; 2],
    ) -> MonitorResult<TransitionalSpace> {
        check_views(views, page_phys)?;
        let present = PageTableFlags::PRESENT.bits();
        let kernel_table = PageTableFlags::KERNEL_TABLE.bits();
        let mut pool = TablePool::new(tables, tables_phys, first);
        let root = pool.take()?;
        let mut directories = 0;
        let mut leaf_tables = 0;

        for view in views {
            // PDPT entries only take the present bit.
            let top_index = (view >> 30) as usize;
            let top_entry = pool.page(root).entry64(top_index);
            let dir = if top_entry & present != 0 {
                pool.index_of(top_entry & PHYS_ADDR_MASK)?
            } else {
                let dir = pool.take()?;
                let entry = pool.phys(dir) | present;
                pool.page(root).set_entry64(top_index, entry);
                directories += 1;
                dir
            };

            let dir_index = ((view >> 21) & 0x1ff) as usize;
            let dir_entry = pool.page(dir).entry64(dir_index);
            let leaf = if dir_entry & present != 0 {
                pool.index_of(dir_entry & PHYS_ADDR_MASK)?
            } else {
                let leaf = pool.take()?;
                let entry = pool.phys(leaf) | kernel_table;
                pool.page(dir).set_entry64(dir_index, entry);
                leaf_tables += 1;
                leaf
            };

            let leaf_index = ((view >> 12) & 0x1ff) as usize;
            let wanted = page_phys as u64 | kernel_table;
            install_leaf(pool.page(leaf).entry64(leaf_index), wanted)?;
            pool.page(leaf).set_entry64(leaf_index, wanted);
        }

        Ok(TransitionalSpace {
            mode: PagingMode::Extended,
            root: pool.phys(root) as u32,
            tables: pool.used(),
            leaf_tables,
            directories,
            directory_entries: leaf_tables,
        })
    }

    fn translate(
        &self,
        tables: &TransitionalTables,
        tables_phys: u32,
        root: u32,
        vaddr: u32,
    ) -> Option<u32> {
        let present = PageTableFlags::PRESENT.bits();
        let root = tables.page_at(tables_phys, root as u64)?;
        let top_entry = root.entry64((vaddr >> 30) as usize);
        if top_entry & present == 0 {
            return None;
        }
        let dir = tables.page_at(tables_phys, top_entry & PHYS_ADDR_MASK)?;
        let dir_entry = dir.entry64(((vaddr >> 21) & 0x1ff) as usize);
        if dir_entry & present == 0 {
            return None;
        }
        let leaf = tables.page_at(tables_phys, dir_entry & PHYS_ADDR_MASK)?;
        let entry = leaf.entry64(((vaddr >> 12) & 0x1ff) as usize);
        if entry & present == 0 {
            return None;
        }
        Some(((entry & PHYS_ADDR_MASK) as u32) | (vaddr & 0xfff))
    }
}
