// 8253/8254 Programmable Interval Timer, channel 0
//
// Drives the scheduler tick on IRQ 0. Channel 0 runs in mode 3 (square
// wave) with a 16-bit reload divisor of the 1.193182 MHz input clock.

use spin::Mutex;

use crate::arch::PortBus;
use crate::config::PIT_BASE_FREQUENCY;
use crate::interrupts::manager::InterruptHandler;
use crate::interrupts::record_tick;
use crate::sched::Scheduler;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, mode 3, binary.
const CMD_CHANNEL0_SQUARE_WAVE: u8 = 0x36;

/// Reload value for `hz`, clamped to what the counter can hold.
pub const fn divisor(hz: u32) -> u16 {
    if hz == 0 {
        return u16::MAX;
    }
    let raw = PIT_BASE_FREQUENCY / hz;
    if raw == 0 {
        1
    } else if raw > u16::MAX as u32 {
        u16::MAX
    } else {
        raw as u16
    }
}

pub struct Pit<P: PortBus> {
    bus: P,
}

impl<P: PortBus> Pit<P> {
    pub const fn new(bus: P) -> Self {
        Pit { bus }
    }

    /// Programs channel 0 and returns the divisor written.
    pub fn set_frequency(&mut self, hz: u32) -> u16 {
        let divisor = divisor(hz);
        self.bus.write(PIT_COMMAND, CMD_CHANNEL0_SQUARE_WAVE);
        self.bus.write(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        self.bus.write(PIT_CHANNEL0, (divisor >> 8) as u8);
        divisor
    }

    pub fn bus(&self) -> &P {
        &self.bus
    }
}

/// Timer IRQ handler: advances the tick count and lets the scheduler
/// decide whether to switch.
pub struct SchedulerTimerHandler {
    scheduler: &'static Mutex<Scheduler>,
}

impl SchedulerTimerHandler {
    pub fn new(scheduler: &'static Mutex<Scheduler>) -> Self {
        SchedulerTimerHandler { scheduler }
    }
}

impl InterruptHandler for SchedulerTimerHandler {
    fn handle_interrupt(&mut self, esp: usize) -> usize {
        record_tick();
        self.scheduler.lock().on_timer_tick(esp)
    }
}
