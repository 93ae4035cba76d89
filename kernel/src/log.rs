// Kernel Logging Subsystem
//
// Implements the kernel's leveled logging framework used for bring-up
// tracing, scheduler and memory diagnostics, and panic reports.
//
// Key responsibilities:
// - Provide standardized log levels (Debug, Info, Warn, Error, Panic)
// - Attach a tick-derived timestamp and subsystem origin to every entry
// - Include source location only for DEBUG entries (file:line)
// - Write every record to the serial port
//
// Design principles:
// - Records below the current level are dropped before any formatting
// - Early-boot friendly: needs neither the heap nor the scheduler
// - Deterministic single-line output, easy to grep from an emulator log
//
// Implementation details:
// - The level is an atomic byte, so it can be changed from any context
// - Timestamps come from the timer tick counter (10 ms per tick at 100 Hz)
//   and read 0.000s until the timer starts
//
// Developer ergonomics:
// - `log_debug!`, `log_info!`, `log_warn!`, `log_error!`, `log_panic!`
//   take an origin string first, then `format_args!`-style arguments
// - Each module declares its own `const LOG_ORIGIN: &str`

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::config::TIMER_FREQUENCY;
use crate::serial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Panic = 4,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Panic => "PANIC",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Panic,
        }
    }
}

static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn init(level: LogLevel) {
    set_level(level);
}

pub fn set_level(level: LogLevel) {
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(CURRENT_LOG_LEVEL.load(Ordering::Relaxed))
}

fn get_timestamp_ms() -> u64 {
    crate::interrupts::get_ticks() * (1000 / TIMER_FREQUENCY as u64)
}

fn format_timestamp(ms: u64) -> (u64, u64) {
    (ms / 1000, ms % 1000)
}

pub fn _log(level: LogLevel, origin: &str, args: fmt::Arguments, file: &str, line: u32) {
    if level < get_level() {
        return;
    }

    let (seconds, milliseconds) = format_timestamp(get_timestamp_ms());

    if level == LogLevel::Debug {
        serial::_print(format_args!(
            "[t={}.{:03}s] [{}] [{}] {} ({}:{})\n",
            seconds,
            milliseconds,
            level.as_str(),
            origin,
            args,
            file,
            line
        ));
    } else {
        serial::_print(format_args!(
            "[t={}.{:03}s] [{}] [{}] {}\n",
            seconds,
            milliseconds,
            level.as_str(),
            origin,
            args
        ));
    }
}

#[macro_export]
macro_rules! log_debug {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Debug,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Info,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Warn,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_error {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Error,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_panic {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Panic,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Error < LogLevel::Panic);
        assert_eq!(LogLevel::from_u8(LogLevel::Warn as u8), LogLevel::Warn);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Panic);
    }

    #[test]
    fn timestamp_splits_seconds_and_millis() {
        assert_eq!(format_timestamp(12_345), (12, 345));
        assert_eq!(format_timestamp(999), (0, 999));
    }
}
