// Paging (32-bit, non-PAE)
//
// Manages the kernel's single two-level page table hierarchy: one page
// directory of 1024 entries, each pointing at a page table of 1024 entries
// that map 4 KiB pages to physical frames.
//
// Key responsibilities:
// - Map, unmap and re-flag single pages and page ranges
// - Translate virtual addresses back to physical ones
// - Keep the TLB coherent: every single-page change is followed by `invlpg`,
//   and `flush_all` reloads CR3
// - Bring paging up at boot: identity-map the first 64 MiB, load CR3, set
//   CR0.PG, then drop write access on kernel code and read-only data
//
// Design principles:
// - Page tables are created lazily, the first time a 4 MiB region is used
// - The raw memory behind the tables is reached through `TableMemory`, so
//   the mapping logic runs unchanged against an in-memory store in tests
// - Table frames must come from the identity-mapped window, otherwise the
//   kernel could not reach them after paging is on
//
// Correctness notes:
// - Address 0 is a valid frame number here, so lookups return `Option`
// - A USER mapping also marks its directory entry USER, since the CPU
//   checks both levels
// - Physical addresses handed to `map_page` must be frame aligned

#![allow(dead_code)]

use bitflags::bitflags;
use core::fmt;
use spin::Mutex;

use crate::arch;
use crate::boot::BootParams;
use crate::config::{IDENTITY_MAP_END, PAGE_SIZE};
use crate::mm::pmm;
use crate::util::{align_down, align_up, without_interrupts};
use crate::{log_info, log_warn};

const LOG_ORIGIN: &str = "paging";

const ENTRIES_PER_TABLE: usize = 1024;
const FRAME_MASK: u32 = 0xFFFF_F000;
const FLAGS_MASK: u32 = 0xFFF;
const CR0_PAGING: u32 = 0x8000_0000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const RW = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame could be found for a new page table.
    OutOfFrames,
    /// The physical address is not frame aligned.
    Unaligned,
    /// Paging has not been initialized yet.
    NotInitialized,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfFrames => write!(f, "out of frames for page tables"),
            MapError::Unaligned => write!(f, "physical address not frame aligned"),
            MapError::NotInitialized => write!(f, "paging not initialized"),
        }
    }
}

#[inline]
pub const fn pde_index(vaddr: usize) -> usize {
    (vaddr >> 22) & 0x3FF
}

#[inline]
pub const fn pte_index(vaddr: usize) -> usize {
    (vaddr >> 12) & 0x3FF
}

/// Raw access to the frames that hold page directories and page tables.
pub trait TableMemory {
    /// Returns a zero-filled frame the manager can keep addressing.
    fn alloc_table(&mut self) -> Option<usize>;
    fn read(&self, table: usize, index: usize) -> u32;
    fn write(&mut self, table: usize, index: usize, value: u32);
    /// Drops the cached translation of one page.
    fn invalidate(&mut self, vaddr: usize);
    /// Drops every cached translation (reload of the directory base).
    fn flush_all(&mut self, directory: usize);
}

pub struct PageTableManager<M: TableMemory> {
    memory: M,
    directory: usize,
}

impl<M: TableMemory> PageTableManager<M> {
    pub fn new(mut memory: M) -> Result<Self, MapError> {
        let directory = memory.alloc_table().ok_or(MapError::OutOfFrames)?;
        Ok(Self { memory, directory })
    }

    pub fn directory(&self) -> usize {
        self.directory
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    fn table_for(&mut self, vaddr: usize, create: bool, user: bool) -> Result<Option<usize>, MapError> {
        let pdi = pde_index(vaddr);
        let pde = self.memory.read(self.directory, pdi);

        if pde & PageFlags::PRESENT.bits() != 0 {
            return Ok(Some((pde & FRAME_MASK) as usize));
        }

        if !create {
            return Ok(None);
        }

        let table = self.memory.alloc_table().ok_or(MapError::OutOfFrames)?;
        let mut pde_flags = PageFlags::PRESENT | PageFlags::RW;
        if user {
            pde_flags |= PageFlags::USER;
        }
        self.memory
            .write(self.directory, pdi, (table as u32 & FRAME_MASK) | pde_flags.bits());

        Ok(Some(table))
    }

    pub fn map_page(&mut self, vaddr: usize, paddr: usize, flags: PageFlags) -> Result<(), MapError> {
        if paddr % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }

        let user = flags.contains(PageFlags::USER);
        let table = self
            .table_for(vaddr, true, user)?
            .ok_or(MapError::OutOfFrames)?;

        if user {
            let pdi = pde_index(vaddr);
            let pde = self.memory.read(self.directory, pdi);
            self.memory.write(self.directory, pdi, pde | PageFlags::USER.bits());
        }

        let entry = (paddr as u32 & FRAME_MASK) | (flags.bits() & FLAGS_MASK) | PageFlags::PRESENT.bits();
        self.memory.write(table, pte_index(vaddr), entry);
        self.memory.invalidate(align_down(vaddr, PAGE_SIZE));
        Ok(())
    }

    /// Clears one mapping and returns the frame it pointed at.
    pub fn unmap_page(&mut self, vaddr: usize) -> Option<usize> {
        let table = self.table_for(vaddr, false, false).ok().flatten()?;
        let pti = pte_index(vaddr);
        let old = self.memory.read(table, pti);

        self.memory.write(table, pti, 0);
        self.memory.invalidate(align_down(vaddr, PAGE_SIZE));

        if old & PageFlags::PRESENT.bits() != 0 {
            Some((old & FRAME_MASK) as usize)
        } else {
            None
        }
    }

    pub fn get_phys(&self, vaddr: usize) -> Option<usize> {
        let entry = self.entry(vaddr)?;
        Some((entry & FRAME_MASK) as usize | (vaddr & (PAGE_SIZE - 1)))
    }

    pub fn flags(&self, vaddr: usize) -> Option<PageFlags> {
        self.entry(vaddr)
            .map(|entry| PageFlags::from_bits_truncate(entry & FLAGS_MASK))
    }

    fn entry(&self, vaddr: usize) -> Option<u32> {
        let pde = self.memory.read(self.directory, pde_index(vaddr));
        if pde & PageFlags::PRESENT.bits() == 0 {
            return None;
        }

        let entry = self.memory.read((pde & FRAME_MASK) as usize, pte_index(vaddr));
        if entry & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(entry)
    }

    pub fn map_range(&mut self, vaddr: usize, paddr: usize, size: usize, flags: PageFlags) -> Result<(), MapError> {
        let start = align_down(vaddr, PAGE_SIZE);
        let phys = align_down(paddr, PAGE_SIZE);
        for page in 0..page_count(vaddr, size) {
            self.map_page(start + page * PAGE_SIZE, phys + page * PAGE_SIZE, flags)?;
        }
        Ok(())
    }

    pub fn unmap_range(&mut self, vaddr: usize, size: usize) {
        let start = align_down(vaddr, PAGE_SIZE);
        for page in 0..page_count(vaddr, size) {
            self.unmap_page(start + page * PAGE_SIZE);
        }
    }

    /// Replaces the flags of an existing mapping, keeping its frame.
    pub fn remap_page_flags(&mut self, vaddr: usize, flags: PageFlags) -> bool {
        let user = flags.contains(PageFlags::USER);
        let table = match self.table_for(vaddr, false, user) {
            Ok(Some(table)) => table,
            _ => return false,
        };

        let pti = pte_index(vaddr);
        let old = self.memory.read(table, pti);
        if old & PageFlags::PRESENT.bits() == 0 {
            return false;
        }

        if user {
            let pdi = pde_index(vaddr);
            let pde = self.memory.read(self.directory, pdi);
            self.memory.write(self.directory, pdi, pde | PageFlags::USER.bits());
        }

        let entry = (old & FRAME_MASK) | (flags.bits() & FLAGS_MASK) | PageFlags::PRESENT.bits();
        self.memory.write(table, pti, entry);
        self.memory.invalidate(align_down(vaddr, PAGE_SIZE));
        true
    }

    pub fn remap_range_flags(&mut self, vaddr: usize, size: usize, flags: PageFlags) -> usize {
        let start = align_down(vaddr, PAGE_SIZE);
        (0..page_count(vaddr, size))
            .filter(|page| self.remap_page_flags(start + page * PAGE_SIZE, flags))
            .count()
    }

    pub fn flush_all(&mut self) {
        self.memory.flush_all(self.directory);
    }
}

/// Pages touched by [vaddr, vaddr + size), trailing partial page included.
fn page_count(vaddr: usize, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let start = align_down(vaddr, PAGE_SIZE);
    let end = align_up(vaddr + size, PAGE_SIZE);
    (end - start) / PAGE_SIZE
}

/// Page tables reached through the identity map of low physical memory.
pub struct IdentityTables;

impl TableMemory for IdentityTables {
    fn alloc_table(&mut self) -> Option<usize> {
        let frame = pmm::alloc_frame()?;

        // first-fit: if this frame is outside the window, nothing lower is free
        if frame >= IDENTITY_MAP_END {
            pmm::free_frame(frame);
            log_warn!(LOG_ORIGIN, "No identity-mapped frame left for a page table");
            return None;
        }

        unsafe {
            core::ptr::write_bytes(frame as *mut u8, 0, PAGE_SIZE);
        }
        Some(frame)
    }

    fn read(&self, table: usize, index: usize) -> u32 {
        debug_assert!(index < ENTRIES_PER_TABLE);
        unsafe { core::ptr::read_volatile((table as *const u32).add(index)) }
    }

    fn write(&mut self, table: usize, index: usize, value: u32) {
        debug_assert!(index < ENTRIES_PER_TABLE);
        unsafe { core::ptr::write_volatile((table as *mut u32).add(index), value) }
    }

    fn invalidate(&mut self, vaddr: usize) {
        unsafe { arch::invlpg(vaddr) }
    }

    fn flush_all(&mut self, directory: usize) {
        unsafe { arch::write_cr3(directory as u32) }
    }
}

static PAGING: Mutex<Option<PageTableManager<IdentityTables>>> = Mutex::new(None);

#[cfg(all(target_arch = "x86", not(test)))]
fn kernel_sections() -> [(usize, usize); 2] {
    extern "C" {
        static __text_start: u8;
        static __text_end: u8;
        static __rodata_start: u8;
        static __rodata_end: u8;
    }

    unsafe {
        [
            (
                core::ptr::addr_of!(__text_start) as usize,
                core::ptr::addr_of!(__text_end) as usize,
            ),
            (
                core::ptr::addr_of!(__rodata_start) as usize,
                core::ptr::addr_of!(__rodata_end) as usize,
            ),
        ]
    }
}

#[cfg(not(all(target_arch = "x86", not(test))))]
fn kernel_sections() -> [(usize, usize); 2] {
    [(0, 0), (0, 0)]
}

pub fn init(params: &BootParams) -> Result<(), MapError> {
    let mut manager = PageTableManager::new(IdentityTables)?;

    manager.map_range(0, 0, IDENTITY_MAP_END, PageFlags::PRESENT | PageFlags::RW)?;
    if params.kernel_end > IDENTITY_MAP_END {
        let size = params.kernel_end - IDENTITY_MAP_END;
        manager.map_range(IDENTITY_MAP_END, IDENTITY_MAP_END, size, PageFlags::PRESENT | PageFlags::RW)?;
    }

    unsafe {
        arch::write_cr3(manager.directory() as u32);
        arch::write_cr0(arch::read_cr0() | CR0_PAGING);
    }

    log_info!(
        LOG_ORIGIN,
        "Paging enabled: directory={:#X}, identity map [0, {:#X})",
        manager.directory(),
        IDENTITY_MAP_END
    );

    for (start, end) in kernel_sections() {
        if end > start {
            let pages = manager.remap_range_flags(start, end - start, PageFlags::PRESENT);
            log_info!(LOG_ORIGIN, "Read-only [{:#X}, {:#X}): {} pages", start, end, pages);
        }
    }

    *PAGING.lock() = Some(manager);
    Ok(())
}

fn with_manager<R>(f: impl FnOnce(&mut PageTableManager<IdentityTables>) -> R) -> Result<R, MapError> {
    without_interrupts(|| PAGING.lock().as_mut().map(f).ok_or(MapError::NotInitialized))
}

pub fn map_page(vaddr: usize, paddr: usize, flags: PageFlags) -> Result<(), MapError> {
    with_manager(|m| m.map_page(vaddr, paddr, flags))?
}

pub fn unmap_page(vaddr: usize) -> Option<usize> {
    with_manager(|m| m.unmap_page(vaddr)).ok().flatten()
}

pub fn map_range(vaddr: usize, paddr: usize, size: usize, flags: PageFlags) -> Result<(), MapError> {
    with_manager(|m| m.map_range(vaddr, paddr, size, flags))?
}

pub fn unmap_range(vaddr: usize, size: usize) -> Result<(), MapError> {
    with_manager(|m| m.unmap_range(vaddr, size))
}

pub fn remap_page_flags(vaddr: usize, flags: PageFlags) -> bool {
    with_manager(|m| m.remap_page_flags(vaddr, flags)).unwrap_or(false)
}

pub fn remap_range_flags(vaddr: usize, size: usize, flags: PageFlags) -> usize {
    with_manager(|m| m.remap_range_flags(vaddr, size, flags)).unwrap_or(0)
}

pub fn get_phys(vaddr: usize) -> Option<usize> {
    with_manager(|m| m.get_phys(vaddr)).ok().flatten()
}

pub fn flush_all() -> Result<(), MapError> {
    with_manager(|m| m.flush_all())
}
