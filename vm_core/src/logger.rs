//! Structured logging facade for the virtual-memory core.
//!
//! Mirrors the kernel's leveled logging macros (`log_debug!`, `log_warn!`,
//! `log_error!`), but the sink is supplied by the embedding kernel instead
//! of being wired directly to a serial port — the console is itself an
//! out-of-scope collaborator as far as this crate is concerned.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
        }
    }
}

/// A logging sink, installed once by the embedding kernel during boot.
pub type Sink = fn(LogLevel, fmt::Arguments);

static SINK: Mutex<Option<Sink>> = Mutex::new(None);
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Install the logging sink. Idempotent; the last caller wins.
pub fn set_sink(sink: Sink) {
    *SINK.lock() = Some(sink);
}

/// Advance the logical tick counter used for log timestamps (called by the
/// embedding kernel's timer interrupt, if it wants timestamps at all).
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Current tick count, for timestamping.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments) {
    if let Some(sink) = *SINK.lock() {
        sink(level, args);
    }
}

#[macro_export]
macro_rules! log_level {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::_log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log_level!($crate::logger::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log_level!($crate::logger::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log_level!($crate::logger::LogLevel::Error, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    static CAPTURED: StdMutex<Vec<String>> = StdMutex::new(Vec::new());

    fn capture(level: LogLevel, args: fmt::Arguments) {
        CAPTURED.lock().unwrap().push(format!("[{}] {}", level.as_str(), args));
    }

    #[test]
    fn sink_receives_formatted_messages() {
        set_sink(capture);
        CAPTURED.lock().unwrap().clear();
        log_error!("swap full: slot {}", 7);
        let captured = CAPTURED.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].contains("ERROR"));
        assert!(captured[0].contains("slot 7"));
    }
}
