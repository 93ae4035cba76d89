// Kernel entry point and system initialization
//
// This file defines the main kernel entry point (`kmain`) and orchestrates
// the full system initialization sequence after the Multiboot glue has
// handed over a neutral `BootParams`.
//
// Key responsibilities:
// - Serve as the kernel entry point after boot
// - Initialize early I/O (serial, logging)
// - Load the segment table
// - Initialize physical memory, paging and the kernel heap
// - Bring up the interrupt manager (PIC remap, IDT load)
// - Create the scheduler and install the kernel context
// - Register the timer and yield handlers, program the PIT, unmask the
//   IRQ lines and enable interrupts
// - Enable preemption and keep running as the boot thread
//
// Design and implementation:
// - The library is `no_std` on the target and a plain std crate under
//   `cargo test`, so every pure core is unit-tested on the host
// - Initialization follows a strict, explicit ordering
// - Interrupts are enabled only after handlers are installed
// - Failures during critical phases result in an immediate halt
//
// Safety and correctness notes:
// - Boot-provided structures are treated as immutable
// - The panic handler halts the CPU to avoid undefined behavior

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod arch;
mod block;
mod boot;
mod config;
mod context;
mod interrupts;
mod log;
mod mm;
pub mod pipe;
pub mod sched;
mod serial;
pub mod sync;
pub mod thread;
mod util;

#[cfg(all(target_arch = "x86", not(test)))]
#[path = "../../arch/x86/multiboot.rs"]
mod multiboot;

use alloc::boxed::Box;

use crate::arch::halt;
use crate::boot::BootParams;
use crate::config::{TIMER_FREQUENCY, YIELD_VECTOR};
use crate::context::KernelContext;
use crate::interrupts::handlers::YieldHandler;
use crate::interrupts::pit::SchedulerTimerHandler;
use crate::interrupts::{IRQ_CASCADE, IRQ_KEYBOARD, IRQ_MOUSE, IRQ_TIMER, TIMER_VECTOR};
use crate::log::LogLevel;
use crate::sched::Scheduler;

const LOG_KERNEL_INIT: &str = "kernel:init";

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

fn halt_forever(reason: core::fmt::Arguments) -> ! {
    log_panic!(LOG_KERNEL_INIT, "{}", reason);
    log_panic!(LOG_KERNEL_INIT, "SYSTEM HALTED");
    arch::irq_disable();
    loop {
        halt();
    }
}

#[no_mangle]
pub extern "C" fn kmain(params: &'static BootParams) -> ! {
    serial::init();
    log::init(LogLevel::Info);

    log_info!(LOG_KERNEL_INIT, "KOS kernel v{} booting", env!("CARGO_PKG_VERSION"));
    log_info!(
        LOG_KERNEL_INIT,
        "Memory: lower={} KiB upper={} KiB, image [{:#X}, {:#X})",
        params.mem_lower_kb,
        params.mem_upper_kb,
        params.kernel_start,
        params.kernel_end
    );

    arch::gdt::init();

    if let Err(err) = mm::init(params) {
        halt_forever(format_args!("Memory initialization failed: {}", err));
    }

    let interrupts = interrupts::init();

    let scheduler = match Scheduler::new(sched::thread_exit_trampoline, sched::idle_thread_entry) {
        Ok(scheduler) => scheduler,
        Err(err) => halt_forever(format_args!("Scheduler creation failed: {}", err)),
    };

    let ctx = context::install(KernelContext::new(interrupts, scheduler));

    {
        let mut manager = ctx.interrupts.lock();

        let timer = manager.register(TIMER_VECTOR, Box::new(SchedulerTimerHandler::new(&ctx.scheduler)));
        let yielding = manager.register(YIELD_VECTOR, Box::new(YieldHandler::new(&ctx.scheduler)));
        if let Err(err) = timer.and(yielding) {
            drop(manager);
            halt_forever(format_args!("Handler registration failed: {}", err));
        }

        interrupts::init_timer(TIMER_FREQUENCY);

        for irq in [IRQ_TIMER, IRQ_KEYBOARD, IRQ_CASCADE, IRQ_MOUSE] {
            manager.enable_irq(irq);
        }
    }

    log_info!(LOG_KERNEL_INIT, "Enabling interrupts...");
    ctx.interrupts.lock().activate();

    sched::enable_preemption();

    log_info!(LOG_KERNEL_INIT, "Boot complete, kernel_main continues as a thread");

    loop {
        halt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::irq_disable();
    log_panic!("panic", "{}", info);
    loop {
        halt();
    }
}
