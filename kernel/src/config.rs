//! Kernel configuration constants

/// Frame and page size (4 KiB)
pub const PAGE_SIZE: usize = 0x1000;

/// Most frames the PMM bitmap can track (4 GiB / 4 KiB)
pub const MAX_FRAMES: usize = 1024 * 1024;

/// Assumed physical memory when the bootloader reports none (128 MiB)
pub const FALLBACK_MEMORY_BYTES: u64 = 128 * 1024 * 1024;

/// Low memory reserved for BIOS, IVT, VGA and option ROMs (1 MiB)
pub const LOW_MEMORY_RESERVED: usize = 0x10_0000;

/// Identity-mapped window set up by paging init (64 MiB)
pub const IDENTITY_MAP_END: usize = 64 * 1024 * 1024;

/// Limit of the flat code and data segments (4 GiB)
pub const SEGMENT_LIMIT: u32 = 0xFFFF_FFFF;

/// Virtual base of the kernel heap, above the identity-mapped window
pub const KERNEL_HEAP_BASE: usize = 0xD000_0000;

/// Pages mapped into the heap at init
pub const KERNEL_HEAP_INITIAL_PAGES: usize = 2;

/// Largest the heap may grow (256 MiB of virtual space)
pub const KERNEL_HEAP_MAX_SIZE: usize = 256 * 1024 * 1024;

/// First vector used by the remapped PIC
pub const IRQ_OFFSET: u8 = 0x20;

/// Software interrupt for voluntary rescheduling
pub const YIELD_VECTOR: u8 = 0x30;

/// PIT input clock (Hz)
pub const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// Scheduler tick rate (Hz)
pub const TIMER_FREQUENCY: u32 = 100;

/// Number of priority bands (0 = highest)
pub const PRIORITY_BANDS: usize = 5;

/// Time slice per priority band, in ticks
pub const TIME_SLICES: [u32; PRIORITY_BANDS] = [20, 15, 10, 5, 3];

/// Default kernel thread stack (16 KiB)
pub const DEFAULT_STACK_SIZE: usize = 4096 * 4;

/// Smallest stack a thread may be created with
pub const MIN_STACK_SIZE: usize = 1024;

/// Default pipe buffer capacity
pub const PIPE_DEFAULT_CAPACITY: usize = 4096;

/// Max number of live pipes
pub const MAX_PIPES: usize = 64;

/// Max registered readers, and separately writers, per pipe
pub const MAX_PIPE_ENDS: usize = 8;

/// Max length of a pipe or thread name
pub const MAX_NAME_LEN: usize = 32;
