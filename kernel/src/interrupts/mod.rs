// Interrupt Subsystem Orchestration
//
// Ties together the IDT, the 8259 PIC pair, the PIT and the handler table
// behind a small API for the boot path.
//
// Initialization flow:
// - `init()` remaps the PIC, loads the IDT and returns the interrupt
//   manager that the kernel context will own
// - `init_timer()` programs the PIT; the timer handler itself is
//   registered once the scheduler exists
// - Interrupts stay disabled until the manager is activated
//
// Runtime services:
// - `get_ticks()` exposes the global timer tick counter

pub mod handlers;
pub mod idt;
pub mod manager;
pub mod pic;
pub mod pit;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{gdt, HardwarePorts};
use crate::config::IRQ_OFFSET;
use crate::log_info;

use manager::InterruptManager;
use pic::Pic8259;
use pit::Pit;

const LOG_ORIGIN: &str = "interrupts";

pub const IRQ_TIMER: u8 = 0;
pub const IRQ_KEYBOARD: u8 = 1;
pub const IRQ_CASCADE: u8 = 2;
pub const IRQ_MOUSE: u8 = 12;

pub const TIMER_VECTOR: u8 = IRQ_OFFSET + IRQ_TIMER;

pub type KernelInterrupts = InterruptManager<Pic8259<HardwarePorts>>;

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub(crate) fn record_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn init() -> KernelInterrupts {
    log_info!(LOG_ORIGIN, "Initializing interrupt system...");

    let mut pic = Pic8259::new(HardwarePorts, IRQ_OFFSET);
    pic.remap();
    idt::init(gdt::CODE_SELECTOR);

    log_info!(LOG_ORIGIN, "PIC remapped to {:#04X}, IDT loaded", IRQ_OFFSET);
    InterruptManager::new(pic)
}

pub fn init_timer(frequency_hz: u32) {
    let divisor = Pit::new(HardwarePorts).set_frequency(frequency_hz);
    log_info!(LOG_ORIGIN, "PIT at {} Hz (divisor {})", frequency_hz, divisor);
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::arch::PortBus;
    use alloc::vec::Vec;

    /// Port bus that remembers every write.
    #[derive(Default)]
    pub struct RecordingBus {
        pub writes: Vec<(u16, u8)>,
    }

    impl PortBus for RecordingBus {
        fn write(&mut self, port: u16, value: u8) {
            self.writes.push((port, value));
        }

        fn read(&mut self, _port: u16) -> u8 {
            0xFF
        }
    }

    #[test]
    fn ticks_are_monotonic() {
        let first = super::record_tick();
        let second = super::record_tick();
        assert!(second > first);
        assert!(super::get_ticks() >= second);
    }
}
