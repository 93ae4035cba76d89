// Kernel Context
//
// The one place the runtime-shared kernel state lives once boot is done:
// the interrupt manager, the scheduler and the pipe table. It is built by
// `kmain` in boot order and installed exactly once; everything reached
// from interrupt context finds it through `get()`.
//
// Lock order:
// - interrupts -> scheduler (timer and yield handlers)
// - scheduler -> pipe table / primitive state (blocking wrappers)
// - nothing takes the interrupt manager while holding the scheduler
//
// Every lock is taken with interrupts disabled and released before a
// reschedule is triggered.
//
// Host tests install a context per test thread through `testing`, which
// also stands in for the yield interrupt.

use spin::{Mutex, Once};

use crate::interrupts::KernelInterrupts;
use crate::pipe::PipeManager;
use crate::sched::Scheduler;

pub struct KernelContext {
    pub interrupts: Mutex<KernelInterrupts>,
    pub scheduler: Mutex<Scheduler>,
    pub pipes: Mutex<PipeManager>,
}

impl KernelContext {
    pub fn new(interrupts: KernelInterrupts, scheduler: Scheduler) -> Self {
        KernelContext {
            interrupts: Mutex::new(interrupts),
            scheduler: Mutex::new(scheduler),
            pipes: Mutex::new(PipeManager::new()),
        }
    }
}

static CONTEXT: Once<KernelContext> = Once::new();

/// Installs the context. A second call keeps the first context.
pub fn install(context: KernelContext) -> &'static KernelContext {
    CONTEXT.call_once(|| context)
}

#[cfg(not(test))]
pub fn get() -> Option<&'static KernelContext> {
    CONTEXT.get()
}

#[cfg(test)]
pub fn get() -> Option<&'static KernelContext> {
    testing::installed().or_else(|| CONTEXT.get())
}

pub fn scheduler() -> Option<&'static Mutex<Scheduler>> {
    get().map(|ctx| &ctx.scheduler)
}

pub fn pipes() -> Option<&'static Mutex<PipeManager>> {
    get().map(|ctx| &ctx.pipes)
}
