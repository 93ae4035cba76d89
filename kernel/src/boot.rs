//! Boot-time data handed from the entry stub to the kernel proper.
//!
//! The core does not parse the boot protocol. The entry glue copies the few
//! fields the memory managers need out of the Multiboot v1 information block
//! into a neutral [`BootParams`], and keeps the raw block address opaque.

pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

const MULTIBOOT_INFO_MEMORY: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootParams {
    /// Conventional memory below 1 MiB, in KiB.
    pub mem_lower_kb: u32,
    /// Memory above 1 MiB, in KiB.
    pub mem_upper_kb: u32,
    pub kernel_start: usize,
    pub kernel_end: usize,
    /// Physical address of the boot information block, 0 if none.
    pub boot_info: usize,
}

/// Leading fields of the Multiboot v1 information structure.
#[repr(C)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
}

impl BootParams {
    /// Builds boot parameters from the registers the bootloader left behind.
    ///
    /// # Safety
    /// When `magic` matches, `info` must point at a readable Multiboot
    /// information block.
    pub unsafe fn from_multiboot(
        magic: u32,
        info: *const MultibootInfo,
        kernel_start: usize,
        kernel_end: usize,
    ) -> Self {
        let mut params = BootParams {
            kernel_start,
            kernel_end,
            ..BootParams::default()
        };

        if magic != MULTIBOOT_BOOTLOADER_MAGIC || info.is_null() {
            return params;
        }

        params.boot_info = info as usize;

        let info = &*info;
        if info.flags & MULTIBOOT_INFO_MEMORY != 0 {
            params.mem_lower_kb = info.mem_lower;
            params.mem_upper_kb = info.mem_upper;
        }

        params
    }
}
