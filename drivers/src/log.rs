//! Structured logging sink for transport bring-up and teardown.
//!
//! Unlike the teacher crate's `klog` facade, this is not a process-wide
//! singleton: callers construct a sink once and thread it through
//! `Device::probe` and friends, so the core never touches global state.

use core::fmt;

/// Severity of a log call, mirroring the five-level scheme callers of this
/// crate will already know from the surrounding kernel's logging facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// A destination for the core's bring-up and error-path log lines.
///
/// Implementors decide both where lines go and which levels are enabled;
/// `log` is called unconditionally, gating is the sink's responsibility.
pub trait DriverLog {
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>);

    #[inline]
    fn enabled(&self, _level: LogLevel) -> bool {
        true
    }
}

/// A sink that discards every line. The default for tests and for callers
/// that have no use for transport diagnostics.
pub struct NullLog;

impl DriverLog for NullLog {
    #[inline]
    fn log(&self, _level: LogLevel, _args: fmt::Arguments<'_>) {}

    #[inline]
    fn enabled(&self, _level: LogLevel) -> bool {
        false
    }
}

macro_rules! log_error {
    ($sink:expr, $($arg:tt)*) => {
        if $sink.enabled($crate::log::LogLevel::Error) {
            $sink.log($crate::log::LogLevel::Error, format_args!($($arg)*));
        }
    };
}

macro_rules! log_warn {
    ($sink:expr, $($arg:tt)*) => {
        if $sink.enabled($crate::log::LogLevel::Warn) {
            $sink.log($crate::log::LogLevel::Warn, format_args!($($arg)*));
        }
    };
}

macro_rules! log_info {
    ($sink:expr, $($arg:tt)*) => {
        if $sink.enabled($crate::log::LogLevel::Info) {
            $sink.log($crate::log::LogLevel::Info, format_args!($($arg)*));
        }
    };
}

macro_rules! log_debug {
    ($sink:expr, $($arg:tt)*) => {
        if $sink.enabled($crate::log::LogLevel::Debug) {
            $sink.log($crate::log::LogLevel::Debug, format_args!($($arg)*));
        }
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
