//! Shared utilities: logging and its convenience macros.

pub mod log;

/// Logs an error-level message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::util::log::log($crate::util::log::Level::Error, &format!($($arg)*))
    };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::util::log::log($crate::util::log::Level::Warn, &format!($($arg)*))
    };
}

/// Logs an info-level message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::util::log::log($crate::util::log::Level::Info, &format!($($arg)*))
    };
}

/// Logs a verbose diagnostic, enabled by `-v`.
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)*) => {
        $crate::util::log::log($crate::util::log::Level::Verbose, &format!($($arg)*))
    };
}
