// Physical Memory Manager (PMM)
//
// Implements the kernel's physical frame allocator on top of a bitmap.
// Every 4 KiB frame of reported RAM is one bit: 0 = free, 1 = used.
//
// Key responsibilities:
// - Size the managed range from the memory amounts the bootloader reports
// - Keep low memory, the kernel image and the boot info block reserved
// - Allocate and free single frames (first-fit)
// - Reserve or release arbitrary physical ranges
// - Expose frame counters for diagnostics
//
// Design principles:
// - Fixed upper bound (`MAX_FRAMES`): the bitmap lives in .bss inside the
//   kernel image, so reserving the image also reserves the bitmap
// - Deterministic first-fit scan, good enough for a small kernel
// - Resource exhaustion is reported as `None`, never as address 0
//
// Initialization order:
// - Clear the bitmap (all free within the managed range)
// - Reserve [0, 1 MiB) for BIOS data, VGA memory and option ROMs
// - Reserve the kernel image, rounded out to whole frames
// - Reserve the frame holding the boot info block, if any
// - Count what remains free
//
// Correctness notes:
// - Freeing a misaligned address is a kernel bug and asserts
// - Freeing an already free frame leaves the counters untouched; callers
//   still must not double free, since the frame may have been handed out
//   again in between

#![allow(dead_code)]

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::boot::BootParams;
use crate::config::{FALLBACK_MEMORY_BYTES, LOW_MEMORY_RESERVED, MAX_FRAMES, PAGE_SIZE};
use crate::log_info;
use crate::util::{align_down, align_up, without_interrupts};

const LOG_ORIGIN: &str = "pmm";
const BITMAP_WORDS: usize = MAX_FRAMES / 32;

pub struct FrameAllocator {
    bitmap: [u32; BITMAP_WORDS],
    total_frames: usize,
    free_frames: usize,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            total_frames: 0,
            free_frames: 0,
        }
    }

    pub fn init(&mut self, params: &BootParams) {
        let mut total_bytes =
            params.mem_lower_kb as u64 * 1024 + params.mem_upper_kb as u64 * 1024;
        if params.mem_lower_kb == 0 && params.mem_upper_kb == 0 {
            total_bytes = FALLBACK_MEMORY_BYTES;
        }
        if total_bytes < (1 << 20) {
            total_bytes = 1 << 20;
        }

        self.total_frames = ((total_bytes / PAGE_SIZE as u64) as usize).min(MAX_FRAMES);

        let words = (self.total_frames + 31) / 32;
        self.bitmap[..words].fill(0);

        self.reserve(0, LOW_MEMORY_RESERVED);
        self.reserve(params.kernel_start, params.kernel_end);
        if params.boot_info != 0 {
            self.reserve(params.boot_info, params.boot_info + 1);
        }

        let used = (0..self.total_frames).filter(|&f| self.is_set(f)).count();
        self.free_frames = self.total_frames - used;
    }

    #[inline]
    fn is_set(&self, frame: usize) -> bool {
        (self.bitmap[frame >> 5] >> (frame & 31)) & 1 != 0
    }

    #[inline]
    fn set(&mut self, frame: usize) {
        self.bitmap[frame >> 5] |= 1 << (frame & 31);
    }

    #[inline]
    fn clear(&mut self, frame: usize) {
        self.bitmap[frame >> 5] &= !(1 << (frame & 31));
    }

    fn frame_span(&self, start: usize, end: usize) -> (usize, usize) {
        let first = align_down(start, PAGE_SIZE) / PAGE_SIZE;
        let last = (align_up(end, PAGE_SIZE) / PAGE_SIZE).min(self.total_frames);
        (first, last)
    }

    fn reserve(&mut self, start: usize, end: usize) {
        if end <= start {
            return;
        }
        let (first, last) = self.frame_span(start, end);
        for frame in first..last {
            self.set(frame);
        }
    }

    pub fn mark_range_used(&mut self, start: usize, end: usize) {
        if end <= start {
            return;
        }
        let (first, last) = self.frame_span(start, end);
        for frame in first..last {
            if !self.is_set(frame) {
                self.set(frame);
                self.free_frames -= 1;
            }
        }
    }

    pub fn mark_range_free(&mut self, start: usize, end: usize) {
        if end <= start {
            return;
        }
        let (first, last) = self.frame_span(start, end);
        for frame in first..last {
            if self.is_set(frame) {
                self.clear(frame);
                self.free_frames += 1;
            }
        }
    }

    pub fn alloc_frame(&mut self) -> Option<usize> {
        if self.free_frames == 0 {
            return None;
        }

        let words = (self.total_frames + 31) / 32;
        for word in 0..words {
            if self.bitmap[word] == u32::MAX {
                continue;
            }
            let frame = word * 32 + (!self.bitmap[word]).trailing_zeros() as usize;
            if frame >= self.total_frames {
                break;
            }
            self.set(frame);
            self.free_frames -= 1;
            return Some(frame * PAGE_SIZE);
        }

        None
    }

    pub fn free_frame(&mut self, addr: usize) {
        assert!(addr % PAGE_SIZE == 0, "free_frame: unaligned address {:#x}", addr);

        let frame = addr / PAGE_SIZE;
        if frame < self.total_frames && self.is_set(frame) {
            self.clear(frame);
            self.free_frames += 1;
        }
    }

    pub fn is_frame_used(&self, addr: usize) -> bool {
        let frame = addr / PAGE_SIZE;
        frame >= self.total_frames || self.is_set(frame)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    pub fn stats(&self) -> MemoryStats {
        let used = self.used_frames();
        MemoryStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames,
            used_frames: used,
            total_bytes: self.total_frames * PAGE_SIZE,
            free_bytes: self.free_frames * PAGE_SIZE,
            used_bytes: used * PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub used_frames: usize,
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
}

static PMM: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());
static PEAK_USED: AtomicUsize = AtomicUsize::new(0);

pub fn init(params: &BootParams) {
    let stats = with_pmm(|pmm| {
        pmm.init(params);
        pmm.stats()
    });

    PEAK_USED.store(stats.used_frames, Ordering::Relaxed);

    log_info!(
        LOG_ORIGIN,
        "PMM initialized: total_frames={}, free_frames={} ({} KiB free)",
        stats.total_frames,
        stats.free_frames,
        stats.free_bytes / 1024
    );
}

/// Runs `f` on the global allocator with interrupts masked, so a thread
/// preempted while holding the lock cannot starve an allocating handler.
fn with_pmm<R>(f: impl FnOnce(&mut FrameAllocator) -> R) -> R {
    without_interrupts(|| f(&mut PMM.lock()))
}

pub fn alloc_frame() -> Option<usize> {
    with_pmm(|pmm| {
        let frame = pmm.alloc_frame();
        PEAK_USED.fetch_max(pmm.used_frames(), Ordering::Relaxed);
        frame
    })
}

pub fn free_frame(addr: usize) {
    with_pmm(|pmm| pmm.free_frame(addr));
}

pub fn mark_range_used(start: usize, end: usize) {
    with_pmm(|pmm| pmm.mark_range_used(start, end));
}

pub fn mark_range_free(start: usize, end: usize) {
    with_pmm(|pmm| pmm.mark_range_free(start, end));
}

pub fn total_frames() -> usize {
    with_pmm(|pmm| pmm.total_frames())
}

pub fn free_frames() -> usize {
    with_pmm(|pmm| pmm.free_frames())
}

pub fn get_stats() -> MemoryStats {
    with_pmm(|pmm| pmm.stats())
}

pub fn peak_used_frames() -> usize {
    PEAK_USED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::collections::BTreeSet;
    use alloc::vec::Vec;

    const MIB: usize = 1024 * 1024;

    fn params(upper_kb: u32, kernel_start: usize, kernel_end: usize) -> BootParams {
        BootParams {
            mem_lower_kb: 0,
            mem_upper_kb: upper_kb,
            kernel_start,
            kernel_end,
            boot_info: 0,
        }
    }

    fn allocator(p: &BootParams) -> Box<FrameAllocator> {
        let mut pmm = Box::new(FrameAllocator::new());
        pmm.init(p);
        pmm
    }

    #[test]
    fn sixteen_mib_with_kernel_at_one_mib() {
        let mut pmm = allocator(&params(16 * 1024, MIB, 2 * MIB));

        assert_eq!(pmm.total_frames(), 16 * MIB / PAGE_SIZE);
        // 256 low frames + 256 kernel frames stay used
        assert_eq!(pmm.free_frames(), pmm.total_frames() - 512);
        assert_eq!(pmm.free_frames() + pmm.used_frames(), pmm.total_frames());

        let first = pmm.alloc_frame().unwrap();
        assert!(first >= 2 * MIB);
        assert_eq!(first, 2 * MIB);
    }

    #[test]
    fn kernel_end_is_rounded_up_to_a_frame() {
        let pmm = allocator(&params(8 * 1024, MIB, MIB + 1));
        assert!(pmm.is_frame_used(MIB));
        assert!(!pmm.is_frame_used(MIB + PAGE_SIZE));
    }

    #[test]
    fn boot_info_frame_is_reserved() {
        let mut p = params(8 * 1024, MIB, 2 * MIB);
        p.boot_info = 3 * MIB + 16;
        let pmm = allocator(&p);
        assert!(pmm.is_frame_used(3 * MIB));
        assert!(!pmm.is_frame_used(3 * MIB + PAGE_SIZE));
    }

    #[test]
    fn zero_reported_memory_falls_back_to_128_mib() {
        let pmm = allocator(&params(0, MIB, 2 * MIB));
        assert_eq!(pmm.total_frames(), 128 * MIB / PAGE_SIZE);
    }

    #[test]
    fn tiny_memory_is_raised_to_one_mib() {
        let p = BootParams {
            mem_lower_kb: 64,
            mem_upper_kb: 0,
            kernel_start: 0,
            kernel_end: 0,
            boot_info: 0,
        };
        let mut pmm = allocator(&p);
        assert_eq!(pmm.total_frames(), 256);
        assert_eq!(pmm.free_frames(), 0);
        assert_eq!(pmm.alloc_frame(), None);
    }

    #[test]
    fn live_allocations_are_unique_and_exhaustion_returns_none() {
        let mut pmm = allocator(&params(4 * 1024, MIB, MIB + 64 * 1024));
        let mut seen = BTreeSet::new();
        let expected = pmm.free_frames();

        while let Some(frame) = pmm.alloc_frame() {
            assert_eq!(frame % PAGE_SIZE, 0);
            assert!(frame >= MIB + 64 * 1024);
            assert!(seen.insert(frame), "frame {:#x} handed out twice", frame);
            assert_eq!(pmm.free_frames() + pmm.used_frames(), pmm.total_frames());
        }

        assert_eq!(seen.len(), expected);
        assert_eq!(pmm.free_frames(), 0);
        assert_eq!(pmm.alloc_frame(), None);
    }

    #[test]
    fn freed_frames_are_reused_first_fit() {
        let mut pmm = allocator(&params(4 * 1024, MIB, 2 * MIB));
        let frames: Vec<usize> = (0..4).filter_map(|_| pmm.alloc_frame()).collect();
        assert_eq!(frames.len(), 4);

        pmm.free_frame(frames[1]);
        assert_eq!(pmm.alloc_frame(), Some(frames[1]));
    }

    #[test]
    fn double_free_does_not_inflate_the_free_count() {
        let mut pmm = allocator(&params(4 * 1024, MIB, 2 * MIB));
        let before = pmm.free_frames();
        let frame = pmm.alloc_frame().unwrap();

        pmm.free_frame(frame);
        pmm.free_frame(frame);
        assert_eq!(pmm.free_frames(), before);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn freeing_an_unaligned_address_asserts() {
        let mut pmm = allocator(&params(4 * 1024, MIB, 2 * MIB));
        pmm.free_frame(2 * MIB + 12);
    }

    #[test]
    fn range_marking_keeps_counters_consistent() {
        let mut pmm = allocator(&params(8 * 1024, MIB, 2 * MIB));
        let free = pmm.free_frames();

        pmm.mark_range_used(4 * MIB, 4 * MIB + 3 * PAGE_SIZE + 1);
        assert_eq!(pmm.free_frames(), free - 4);

        // overlapping reservation only counts new frames
        pmm.mark_range_used(4 * MIB, 4 * MIB + 5 * PAGE_SIZE);
        assert_eq!(pmm.free_frames(), free - 5);

        pmm.mark_range_free(4 * MIB, 4 * MIB + 5 * PAGE_SIZE);
        assert_eq!(pmm.free_frames(), free);

        let stats = pmm.stats();
        assert_eq!(stats.used_frames + stats.free_frames, stats.total_frames);
        assert_eq!(stats.total_bytes, 8 * MIB);
    }

    #[test]
    fn global_allocator_is_locked_with_interrupts_masked() {
        crate::arch::irq_enable();
        let masked = with_pmm(|_| !crate::arch::interrupts_enabled());
        let restored = crate::arch::interrupts_enabled();
        crate::arch::irq_disable();

        assert!(masked);
        assert!(restored);
    }
}
