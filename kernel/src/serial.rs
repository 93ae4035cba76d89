// Serial Port Driver (Kernel Debug I/O)
//
// Minimal output-only driver for the legacy COM1 UART (0x3F8). Serial is
// the ground-truth log sink: it works before paging, before the heap and
// with interrupts disabled.
//
// Implementation details:
// - Direct port I/O through `arch::outb` / `arch::inb`
// - 38400 baud (divisor 3), 8 data bits, no parity, 1 stop bit
// - Transmit holding register is polled before each byte
// - Newlines are normalized to CRLF
//
// Concurrency:
// - `SERIAL1` is a spinlock; `_print` holds it with interrupts disabled so
//   an interrupt handler cannot deadlock on a half-written line

use core::fmt;

use crate::arch::{inb, outb};
use crate::util::without_interrupts;

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    base: u16,
    present: bool,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        SerialPort { base, present: true }
    }

    pub fn init(&mut self) {
        unsafe {
            outb(self.base + 1, 0x00);
            outb(self.base + 3, 0x80);
            outb(self.base, 0x03);
            outb(self.base + 1, 0x00);
            outb(self.base + 3, 0x03);
            outb(self.base + 2, 0xC7);
            outb(self.base + 4, 0x0B);
            outb(self.base + 4, 0x1E);
            outb(self.base, 0xAE);

            if cfg!(target_arch = "x86") && inb(self.base) != 0xAE {
                self.present = false;
                return;
            }

            outb(self.base + 4, 0x0F);
        }
    }

    fn is_transmit_empty(&self) -> bool {
        unsafe { inb(self.base + 5) & 0x20 != 0 }
    }

    pub fn write_byte(&self, byte: u8) {
        if !self.present {
            return;
        }

        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }

        unsafe {
            outb(self.base, byte);
        }
    }

    pub fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        SerialPort::write_str(self, s);
        Ok(())
    }
}

pub static SERIAL1: spin::Mutex<SerialPort> = spin::Mutex::new(SerialPort::new(COM1));

pub fn init() {
    SERIAL1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
