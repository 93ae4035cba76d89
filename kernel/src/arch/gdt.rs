// Global Descriptor Table (GDT)
//
// Provides flat protected-mode segmentation for the kernel. Paging does the
// real isolation work; the GDT only has to describe one code and one data
// segment that both span the whole addressable range the kernel uses.
//
// Key responsibilities:
// - Encode and decode 8-byte segment descriptors (base, limit, type)
// - Build the four-entry table: null, unused, code, data
// - Install the table with `lgdt` and reload every segment register
// - Expose the code/data selectors used by the IDT and thread contexts
//
// Encoding rules:
// - Limits up to 64 KiB are stored byte-granular (flags nibble 0x4)
// - Larger limits switch to 4 KiB granularity (flags nibble 0xC); the
//   stored value is adjusted down by one granule unless the low 12 bits
//   are all ones
// - `limit()` and `base()` invert the encoding exactly
//
// Correctness notes:
// - There is no error path: this runs before any fault handling exists
// - The table is a `static` and never mutated after `init`

#![allow(dead_code)]

use core::mem::size_of;

use crate::config::SEGMENT_LIMIT;
use crate::log_info;

const LOG_ORIGIN: &str = "gdt";

pub const ACCESS_CODE: u8 = 0x9A;
pub const ACCESS_DATA: u8 = 0x92;

const FLAGS_BYTE_GRANULAR: u8 = 0x40;
const FLAGS_PAGE_GRANULAR: u8 = 0xC0;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentDescriptor {
    limit_lo: u16,
    base_lo: u16,
    base_hi: u8,
    access: u8,
    flags_limit_hi: u8,
    base_vhi: u8,
}

impl SegmentDescriptor {
    pub const fn null() -> Self {
        Self {
            limit_lo: 0,
            base_lo: 0,
            base_hi: 0,
            access: 0,
            flags_limit_hi: 0,
            base_vhi: 0,
        }
    }

    pub const fn new(base: u32, limit: u32, access: u8) -> Self {
        let (stored, flags) = if limit <= 0x10000 {
            (limit, FLAGS_BYTE_GRANULAR)
        } else if (limit & 0xFFF) != 0xFFF {
            ((limit >> 12) - 1, FLAGS_PAGE_GRANULAR)
        } else {
            (limit >> 12, FLAGS_PAGE_GRANULAR)
        };

        Self {
            limit_lo: (stored & 0xFFFF) as u16,
            base_lo: (base & 0xFFFF) as u16,
            base_hi: ((base >> 16) & 0xFF) as u8,
            access,
            flags_limit_hi: flags | ((stored >> 16) & 0x0F) as u8,
            base_vhi: ((base >> 24) & 0xFF) as u8,
        }
    }

    pub fn base(&self) -> u32 {
        (self.base_lo as u32) | ((self.base_hi as u32) << 16) | ((self.base_vhi as u32) << 24)
    }

    pub fn limit(&self) -> u32 {
        let stored = (self.limit_lo as u32) | (((self.flags_limit_hi & 0x0F) as u32) << 16);
        if self.flags_limit_hi & FLAGS_PAGE_GRANULAR == FLAGS_PAGE_GRANULAR {
            (stored << 12) | 0xFFF
        } else {
            stored
        }
    }

    pub fn access(&self) -> u8 {
        self.access
    }

    pub fn is_page_granular(&self) -> bool {
        self.flags_limit_hi & FLAGS_PAGE_GRANULAR == FLAGS_PAGE_GRANULAR
    }

    pub fn as_bytes(&self) -> [u8; 8] {
        let limit_lo = { self.limit_lo }.to_le_bytes();
        let base_lo = { self.base_lo }.to_le_bytes();
        [
            limit_lo[0],
            limit_lo[1],
            base_lo[0],
            base_lo[1],
            self.base_hi,
            self.access,
            self.flags_limit_hi,
            self.base_vhi,
        ]
    }
}

#[repr(C, align(8))]
pub struct SegmentTable {
    null: SegmentDescriptor,
    unused: SegmentDescriptor,
    code: SegmentDescriptor,
    data: SegmentDescriptor,
}

pub const CODE_SELECTOR: u16 = 2 * size_of::<SegmentDescriptor>() as u16;
pub const DATA_SELECTOR: u16 = 3 * size_of::<SegmentDescriptor>() as u16;

const _: () = assert!(size_of::<SegmentDescriptor>() == 8);

impl SegmentTable {
    pub const fn new() -> Self {
        Self {
            null: SegmentDescriptor::null(),
            unused: SegmentDescriptor::null(),
            code: SegmentDescriptor::new(0, SEGMENT_LIMIT, ACCESS_CODE),
            data: SegmentDescriptor::new(0, SEGMENT_LIMIT, ACCESS_DATA),
        }
    }

    pub fn code_segment_selector(&self) -> u16 {
        let offset = core::ptr::addr_of!(self.code) as usize - self as *const _ as usize;
        offset as u16
    }

    pub fn data_segment_selector(&self) -> u16 {
        let offset = core::ptr::addr_of!(self.data) as usize - self as *const _ as usize;
        offset as u16
    }

    pub fn code(&self) -> &SegmentDescriptor {
        &self.code
    }

    pub fn data(&self) -> &SegmentDescriptor {
        &self.data
    }

    pub fn entries(&self) -> [SegmentDescriptor; 4] {
        [self.null, self.unused, self.code, self.data]
    }

    /// Points GDTR at this table and reloads all segment registers.
    ///
    /// # Safety
    /// `self` must stay at a fixed address for the lifetime of the kernel.
    pub unsafe fn load(&'static self) {
        let pointer = super::DescriptorTablePointer {
            limit: (size_of::<SegmentTable>() - 1) as u16,
            base: self as *const _ as usize as u32,
        };

        load_gdt_and_segments(&pointer, self.code_segment_selector(), self.data_segment_selector());
    }
}

#[cfg(target_arch = "x86")]
unsafe fn load_gdt_and_segments(pointer: &super::DescriptorTablePointer, code: u16, data: u16) {
    core::arch::asm!(
        "lgdt [{ptr}]",
        "push {code:e}",
        "lea {tmp}, [2f]",
        "push {tmp}",
        "retf",
        "2:",
        "mov ds, {data:x}",
        "mov es, {data:x}",
        "mov fs, {data:x}",
        "mov gs, {data:x}",
        "mov ss, {data:x}",
        ptr = in(reg) pointer,
        code = in(reg) code as u32,
        data = in(reg) data as u32,
        tmp = out(reg) _,
        options(preserves_flags)
    );
}

#[cfg(not(target_arch = "x86"))]
unsafe fn load_gdt_and_segments(_pointer: &super::DescriptorTablePointer, _code: u16, _data: u16) {}

static GDT: SegmentTable = SegmentTable::new();

pub fn init() -> &'static SegmentTable {
    unsafe {
        GDT.load();
    }

    log_info!(
        LOG_ORIGIN,
        "GDT loaded: code={:#04X} data={:#04X} limit={:#X}",
        GDT.code_segment_selector(),
        GDT.data_segment_selector(),
        GDT.code().limit()
    );

    &GDT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_limit_stays_byte_granular() {
        let desc = SegmentDescriptor::new(0x1234_5678, 0xFFFF, ACCESS_DATA);
        assert!(!desc.is_page_granular());
        assert_eq!(desc.limit(), 0xFFFF);
        assert_eq!(desc.base(), 0x1234_5678);

        let bytes = desc.as_bytes();
        assert_eq!(bytes[0], 0xFF);
        assert_eq!(bytes[1], 0xFF);
        assert_eq!(bytes[2], 0x78);
        assert_eq!(bytes[3], 0x56);
        assert_eq!(bytes[4], 0x34);
        assert_eq!(bytes[5], ACCESS_DATA);
        assert_eq!(bytes[6], 0x40);
        assert_eq!(bytes[7], 0x12);
    }

    #[test]
    fn exactly_64k_is_still_byte_granular() {
        let desc = SegmentDescriptor::new(0, 0x10000, ACCESS_CODE);
        assert!(!desc.is_page_granular());
        assert_eq!(desc.as_bytes()[6], 0x41);
        assert_eq!(desc.limit(), 0x10000);
    }

    #[test]
    fn large_limit_drops_one_granule_when_not_page_aligned() {
        let desc = SegmentDescriptor::new(0, 64 * 1024 * 1024, ACCESS_CODE);
        assert!(desc.is_page_granular());
        // (0x4000000 >> 12) - 1 = 0x3FFF
        assert_eq!(desc.as_bytes()[0], 0xFF);
        assert_eq!(desc.as_bytes()[1], 0x3F);
        assert_eq!(desc.as_bytes()[6], 0xC0);
        assert_eq!(desc.limit(), 0x03FF_FFFF);
    }

    #[test]
    fn large_limit_with_full_low_bits_keeps_granule() {
        let desc = SegmentDescriptor::new(0, 0xFFFF_FFFF, ACCESS_DATA);
        assert_eq!(desc.as_bytes()[6], 0xCF);
        assert_eq!(desc.limit(), 0xFFFF_FFFF);

        let desc = SegmentDescriptor::new(0x0010_0000, 0x0001_FFFF, ACCESS_DATA);
        assert_eq!(desc.limit(), 0x0001_FFFF);
        assert_eq!(desc.base(), 0x0010_0000);
    }

    #[test]
    fn table_layout_and_selectors() {
        let table = SegmentTable::new();
        assert_eq!(table.code_segment_selector(), 0x10);
        assert_eq!(table.data_segment_selector(), 0x18);
        assert_eq!(CODE_SELECTOR, 0x10);
        assert_eq!(DATA_SELECTOR, 0x18);

        let entries = table.entries();
        assert_eq!(entries[0].as_bytes(), [0; 8]);
        assert_eq!(entries[1].as_bytes(), [0; 8]);
        assert_eq!(entries[2].access(), ACCESS_CODE);
        assert_eq!(entries[3].access(), ACCESS_DATA);
        assert_eq!(entries[2].limit(), SEGMENT_LIMIT);
        assert_eq!(entries[3].base(), 0);
    }

    #[test]
    fn heap_and_stacks_fit_inside_the_flat_segments() {
        use crate::config::{KERNEL_HEAP_BASE, KERNEL_HEAP_MAX_SIZE};

        let table = SegmentTable::new();
        let heap_last = (KERNEL_HEAP_BASE + KERNEL_HEAP_MAX_SIZE - 1) as u64;
        for desc in [table.code(), table.data()] {
            assert!(desc.is_page_granular());
            assert_eq!(desc.base(), 0);
            assert!(heap_last <= desc.limit() as u64);
        }
    }
}
