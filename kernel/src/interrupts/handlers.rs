// Interrupt and Exception Handlers
//
// Rust side of the interrupt entry path and the kernel's built-in handlers.
//
// Entry flow:
// - `interrupt_common` (stubs.S) calls `interrupt_dispatch(esp)` with the
//   address of the saved `InterruptFrame`
// - The frame's vector is routed through the kernel context's
//   `InterruptManager`; the esp it returns is where the stub resumes
// - An exception nobody handles ends in `fatal_exception`, which dumps
//   the CPU state and halts forever
//
// Built-in handlers:
// - `YieldHandler` on the yield vector: voluntary reschedule through the
//   same esp-substitution path as the timer
//
// Correctness notes:
// - A fault raised while the manager is locked (inside a handler) cannot
//   take the lock again; such faults are treated as unhandled
// - Before the kernel context exists, or while the manager is locked,
//   exceptions are fatal and IRQs are acknowledged straight at the PIC and
//   dropped; every other vector resumes untouched

use spin::Mutex;

use crate::arch::{self, halt, HardwarePorts};
use crate::config::IRQ_OFFSET;
use crate::interrupts::manager::{InterruptController, InterruptHandler, EXCEPTION_VECTORS};
use crate::interrupts::pic::Pic8259;
use crate::sched::Scheduler;
use crate::thread::InterruptFrame;
use crate::log_panic;

const LOG_ORIGIN: &str = "interrupts";

const PAGE_FAULT: u8 = 14;

const EXCEPTION_NAMES: [&str; 32] = [
    "#DE - Divide Error",
    "#DB - Debug",
    "NMI - Non-Maskable Interrupt",
    "#BP - Breakpoint",
    "#OF - Overflow",
    "#BR - Bound Range Exceeded",
    "#UD - Invalid Opcode",
    "#NM - Device Not Available",
    "#DF - Double Fault",
    "Coprocessor Segment Overrun",
    "#TS - Invalid TSS",
    "#NP - Segment Not Present",
    "#SS - Stack-Segment Fault",
    "#GP - General Protection Fault",
    "#PF - Page Fault",
    "Reserved",
    "#MF - x87 FPU Floating-Point Error",
    "#AC - Alignment Check",
    "#MC - Machine Check",
    "#XM - SIMD Floating-Point Exception",
    "#VE - Virtualization Exception",
    "#CP - Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "#HV - Hypervisor Injection",
    "#VC - VMM Communication",
    "#SX - Security Exception",
    "Reserved",
];

pub fn exception_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("External Interrupt")
}

/// Dumps the faulting context and stops the CPU.
pub fn fatal_exception(frame: &InterruptFrame) -> ! {
    let vector = frame.vector as u8;

    arch::irq_disable();

    log_panic!(LOG_ORIGIN, "FATAL EXCEPTION {}: {}", vector, exception_name(vector));
    log_panic!(LOG_ORIGIN, "Error code: {:#X}", frame.error_code);
    log_panic!(
        LOG_ORIGIN,
        "EIP={:#010X} CS={:#06X} EFLAGS={:#010X}",
        frame.eip,
        frame.cs,
        frame.eflags
    );
    log_panic!(
        LOG_ORIGIN,
        "EAX={:#010X} EBX={:#010X} ECX={:#010X} EDX={:#010X}",
        frame.eax,
        frame.ebx,
        frame.ecx,
        frame.edx
    );
    log_panic!(
        LOG_ORIGIN,
        "ESI={:#010X} EDI={:#010X} EBP={:#010X} ESP={:#010X}",
        frame.esi,
        frame.edi,
        frame.ebp,
        frame.esp_dump
    );

    if vector == PAGE_FAULT {
        let code = frame.error_code;
        log_panic!(
            LOG_ORIGIN,
            "Faulting address {:#010X} ({}, {}, {})",
            arch::read_cr2(),
            if code & 1 != 0 { "protection violation" } else { "not present" },
            if code & 2 != 0 { "write" } else { "read" },
            if code & 4 != 0 { "user" } else { "supervisor" }
        );
    }

    log_panic!(LOG_ORIGIN, "System halted due to fatal exception");

    loop {
        halt();
    }
}

fn unmanaged(frame: &InterruptFrame, esp: usize) -> usize {
    let vector = frame.vector as u8;
    if vector < EXCEPTION_VECTORS {
        fatal_exception(frame);
    }
    Pic8259::new(HardwarePorts, IRQ_OFFSET).end_of_interrupt(vector);
    esp
}

/// Called from `interrupt_common` with the saved frame; returns the esp
/// to resume from.
#[no_mangle]
pub extern "C" fn interrupt_dispatch(esp: usize) -> usize {
    let frame = unsafe { &*(esp as *const InterruptFrame) };
    let vector = frame.vector as u8;

    let Some(ctx) = crate::context::get() else {
        return unmanaged(frame, esp);
    };

    let outcome = match ctx.interrupts.try_lock() {
        Some(mut manager) => manager.dispatch(vector, esp),
        None => return unmanaged(frame, esp),
    };

    match outcome {
        Ok(next) => next,
        Err(_) => fatal_exception(frame),
    }
}

/// Voluntary reschedule on the yield vector.
pub struct YieldHandler {
    scheduler: &'static Mutex<Scheduler>,
}

impl YieldHandler {
    pub fn new(scheduler: &'static Mutex<Scheduler>) -> Self {
        YieldHandler { scheduler }
    }
}

impl InterruptHandler for YieldHandler {
    fn handle_interrupt(&mut self, esp: usize) -> usize {
        self.scheduler.lock().reschedule(esp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::tests::{scheduler, spawn};
    use crate::thread::{ThreadPriority, ThreadState};
    use alloc::boxed::Box;

    #[test]
    fn exception_names_cover_the_exception_range() {
        assert_eq!(exception_name(0), "#DE - Divide Error");
        assert_eq!(exception_name(14), "#PF - Page Fault");
        assert_eq!(exception_name(31), "Reserved");
        assert_eq!(exception_name(0x20), "External Interrupt");
    }

    #[test]
    fn yield_hands_the_cpu_to_the_next_ready_thread() {
        let scheduler: &'static Mutex<Scheduler> = Box::leak(Box::new(Mutex::new(scheduler())));
        let boot = scheduler.lock().current();
        let other = spawn(&mut scheduler.lock(), "other", ThreadPriority::Normal);

        let mut handler = YieldHandler::new(scheduler);
        let esp = handler.handle_interrupt(0x1000);

        let s = scheduler.lock();
        assert_eq!(s.current(), other);
        assert_eq!(s.find(boot).unwrap().state, ThreadState::Ready);
        assert_ne!(esp, 0x1000);
    }
}
