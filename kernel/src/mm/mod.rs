// Memory Management Subsystem
//
// Top-level entry point for the kernel memory managers. Brings them up in
// dependency order, each layer building on the one before:
//
// - `pmm::init` builds the frame bitmap from the boot memory sizes and
//   reserves low memory and the kernel image
// - `paging::init` identity-maps the low window, loads CR3 and turns
//   paging on
// - `heap::init` maps the first heap pages above the identity window
//
// Called once during boot, with interrupts disabled, before the heap is
// used by anything.

pub mod heap;
pub mod paging;
pub mod pmm;

use core::fmt;

use crate::boot::BootParams;
use crate::log_info;

const LOG_ORIGIN: &str = "mm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryInitError {
    Paging(paging::MapError),
    Heap,
}

impl fmt::Display for MemoryInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryInitError::Paging(err) => write!(f, "paging init failed: {}", err),
            MemoryInitError::Heap => f.write_str("heap init failed"),
        }
    }
}

pub fn init(params: &BootParams) -> Result<(), MemoryInitError> {
    pmm::init(params);
    paging::init(params).map_err(MemoryInitError::Paging)?;
    if !heap::init() {
        return Err(MemoryInitError::Heap);
    }

    let frames = pmm::get_stats();
    let heap = heap::get_stats();
    log_info!(
        LOG_ORIGIN,
        "Memory ready: {} KiB free of {} KiB, heap {} KiB mapped",
        frames.free_bytes / 1024,
        frames.total_bytes / 1024,
        heap.mapped_bytes / 1024
    );
    Ok(())
}
