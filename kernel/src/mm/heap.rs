// Kernel Heap Allocator
//
// A bump-pointer heap over a contiguous virtual region starting at
// `KERNEL_HEAP_BASE`. The region grows one page at a time: whenever an
// allocation would cross the mapped end, fresh physical frames are pulled
// from the PMM and mapped RW behind it. It backs Rust's `alloc` crate
// through `KernelAllocator`.
//
// Invariants:
// - base <= brk <= end, and every page in [base, end) is mapped
// - `brk` only ever increases; `free` is a no-op
// - alignment is at least 8 bytes
// - a failed allocation leaves `brk` untouched

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;
use spin::Mutex;

use crate::config::{KERNEL_HEAP_BASE, KERNEL_HEAP_INITIAL_PAGES, KERNEL_HEAP_MAX_SIZE, PAGE_SIZE};
use crate::mm::paging::{self, PageFlags};
use crate::mm::pmm;
use crate::util::{align_up, without_interrupts};
use crate::{log_info, log_warn};

const LOG_ORIGIN: &str = "heap";

const MIN_ALIGN: usize = 8;

/// Supplies the heap with mapped pages.
pub trait HeapBacking {
    /// Maps one fresh frame at `vaddr`. Returns false when no frame or
    /// page table could be obtained.
    fn map_fresh_page(&mut self, vaddr: usize) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub mapped_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

pub struct KernelHeap<B: HeapBacking> {
    backing: B,
    base: usize,
    brk: usize,
    end: usize,
    limit: usize,
}

impl<B: HeapBacking> KernelHeap<B> {
    pub const fn new(backing: B) -> Self {
        KernelHeap { backing, base: 0, brk: 0, end: 0, limit: 0 }
    }

    /// Places the heap at `base` and maps `initial_pages` pages. The heap
    /// never grows past `base + max_size`.
    pub fn init(&mut self, base: usize, initial_pages: usize, max_size: usize) -> bool {
        self.base = base;
        self.brk = base;
        self.end = base;
        self.limit = base.saturating_add(max_size);

        self.ensure(base + initial_pages * PAGE_SIZE)
    }

    pub fn is_initialized(&self) -> bool {
        self.limit != 0
    }

    /// Maps pages until `end >= target`.
    fn ensure(&mut self, target: usize) -> bool {
        if target > self.limit {
            return false;
        }

        while self.end < target {
            if !self.backing.map_fresh_page(self.end) {
                return false;
            }
            self.end += PAGE_SIZE;
        }
        true
    }

    pub fn alloc(&mut self, size: usize, align: usize) -> Option<usize> {
        if !self.is_initialized() {
            return None;
        }

        let align = align.max(MIN_ALIGN);
        if !align.is_power_of_two() {
            return None;
        }

        let start = align_up(self.brk, align);
        let new_brk = start.checked_add(size)?;

        if !self.ensure(new_brk) {
            return None;
        }

        self.brk = new_brk;
        Some(start)
    }

    pub fn free(&mut self, _addr: usize) {}

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn brk(&self) -> usize {
        self.brk
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            mapped_bytes: self.end - self.base,
            used_bytes: self.brk - self.base,
            free_bytes: self.end - self.brk,
        }
    }
}

/// Frames from the PMM, mapped into the kernel page tables.
pub struct PagedBacking;

impl HeapBacking for PagedBacking {
    fn map_fresh_page(&mut self, vaddr: usize) -> bool {
        let frame = match pmm::alloc_frame() {
            Some(frame) => frame,
            None => return false,
        };

        match paging::map_page(vaddr, frame, PageFlags::PRESENT | PageFlags::RW) {
            Ok(()) => true,
            Err(err) => {
                log_warn!(LOG_ORIGIN, "Cannot map heap page {:#X}: {}", vaddr, err);
                pmm::free_frame(frame);
                false
            }
        }
    }
}

static HEAP: Mutex<KernelHeap<PagedBacking>> = Mutex::new(KernelHeap::new(PagedBacking));

pub struct KernelAllocator;

pub fn init() -> bool {
    let ok = without_interrupts(|| {
        HEAP.lock()
            .init(KERNEL_HEAP_BASE, KERNEL_HEAP_INITIAL_PAGES, KERNEL_HEAP_MAX_SIZE)
    });

    if ok {
        log_info!(
            LOG_ORIGIN,
            "Initialized at {:#X} with {} pages",
            KERNEL_HEAP_BASE,
            KERNEL_HEAP_INITIAL_PAGES
        );
    }
    ok
}

pub fn alloc(size: usize, align: usize) -> Option<usize> {
    without_interrupts(|| HEAP.lock().alloc(size, align))
}

pub fn brk() -> usize {
    without_interrupts(|| HEAP.lock().brk())
}

pub fn end() -> usize {
    without_interrupts(|| HEAP.lock().end())
}

pub fn get_stats() -> HeapStats {
    without_interrupts(|| HEAP.lock().stats())
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match alloc(layout.size(), layout.align()) {
            Some(addr) => addr as *mut u8,
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct CountingBacking {
        pages_left: usize,
        mapped: Vec<usize>,
    }

    impl CountingBacking {
        fn new(pages_left: usize) -> Self {
            CountingBacking { pages_left, mapped: Vec::new() }
        }
    }

    impl HeapBacking for CountingBacking {
        fn map_fresh_page(&mut self, vaddr: usize) -> bool {
            if self.pages_left == 0 {
                return false;
            }
            self.pages_left -= 1;
            self.mapped.push(vaddr);
            true
        }
    }

    const BASE: usize = 0xD000_0000;

    fn heap(pages: usize) -> KernelHeap<CountingBacking> {
        let mut heap = KernelHeap::new(CountingBacking::new(pages));
        assert!(heap.init(BASE, 2, 1024 * PAGE_SIZE));
        heap
    }

    #[test]
    fn uninitialized_heap_refuses() {
        let mut heap = KernelHeap::new(CountingBacking::new(4));
        assert_eq!(heap.alloc(16, 8), None);
    }

    #[test]
    fn init_maps_initial_pages() {
        let heap = heap(8);
        assert_eq!(heap.brk(), BASE);
        assert_eq!(heap.end(), BASE + 2 * PAGE_SIZE);
        assert_eq!(heap.backing().mapped, [BASE, BASE + PAGE_SIZE]);
    }

    #[test]
    fn allocations_are_aligned_and_monotonic() {
        let mut heap = heap(8);
        let a = heap.alloc(3, 1).unwrap();
        let b = heap.alloc(10, 4).unwrap();
        let c = heap.alloc(64, 64).unwrap();

        assert_eq!(a, BASE);
        assert_eq!(b % 8, 0);
        assert!(b >= a + 3);
        assert_eq!(c % 64, 0);
        assert!(c >= b + 10);
        assert_eq!(heap.brk(), c + 64);
    }

    #[test]
    fn heap_grows_page_by_page() {
        let mut heap = heap(8);
        let addr = heap.alloc(3 * PAGE_SIZE, 8).unwrap();

        assert_eq!(addr, BASE);
        assert_eq!(heap.end(), BASE + 3 * PAGE_SIZE);
        assert_eq!(heap.backing().mapped.len(), 3);
    }

    #[test]
    fn failure_leaves_brk_untouched() {
        let mut heap = heap(3);
        heap.alloc(100, 8).unwrap();
        let brk = heap.brk();

        assert_eq!(heap.alloc(4 * PAGE_SIZE, 8), None);
        assert_eq!(heap.brk(), brk);
        assert!(heap.end() <= BASE + 3 * PAGE_SIZE);

        assert!(heap.alloc(16, 8).is_some());
    }

    #[test]
    fn max_size_caps_growth() {
        let mut heap = KernelHeap::new(CountingBacking::new(100));
        assert!(heap.init(BASE, 1, 4 * PAGE_SIZE));
        assert_eq!(heap.alloc(5 * PAGE_SIZE, 8), None);
        assert_eq!(heap.backing().mapped.len(), 1);
    }

    #[test]
    fn stats_track_brk_and_end() {
        let mut heap = heap(8);
        heap.alloc(100, 8).unwrap();
        heap.free(BASE);

        let stats = heap.stats();
        assert_eq!(stats.mapped_bytes, 2 * PAGE_SIZE);
        assert_eq!(stats.used_bytes, 100);
        assert_eq!(stats.free_bytes, 2 * PAGE_SIZE - 100);
    }
}
