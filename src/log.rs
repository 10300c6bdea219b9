//! Logging facade.
//!
//! `info!`/`error!`-style macros (an optional leading `"context",`
//! literal, then a `format_args!`-style message) dispatching to a
//! host-supplied [`LogSink`] registered once via [`set_sink`], using a
//! `conquer_once::spin::OnceCell` global singleton.

use conquer_once::spin::OnceCell;
use core::fmt::Arguments;

/// Severity of a logged event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A host-supplied destination for the core engine's diagnostics.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, target: &str, args: Arguments<'_>);
}

static SINK: OnceCell<&'static dyn LogSink> = OnceCell::uninit();

/// Registers the process-wide log sink.
///
/// Calling this more than once is a no-op: the first sink wins.
pub fn set_sink(sink: &'static dyn LogSink) {
    let _ = SINK.try_init_once(|| sink);
}

/// Used by the `log_*!` macros; not part of the public API.
#[doc(hidden)]
pub fn dispatch(level: LogLevel, target: &str, args: Arguments<'_>) {
    if let Ok(sink) = SINK.try_get() {
        sink.log(level, target, args);
    }
}

/// Logs an informational message. A leading `"target",` literal is optional.
#[macro_export]
macro_rules! log_info {
    ($target: literal, $($arg: tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Info, $target, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Info, "jbfs", format_args!($($arg)*))
    };
}

/// Logs a warning. A leading `"target",` literal is optional.
#[macro_export]
macro_rules! log_warn {
    ($target: literal, $($arg: tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Warn, $target, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Warn, "jbfs", format_args!($($arg)*))
    };
}

/// Logs an error. A leading `"target",` literal is optional.
#[macro_export]
macro_rules! log_error {
    ($target: literal, $($arg: tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Error, $target, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Error, "jbfs", format_args!($($arg)*))
    };
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    struct Counter;

    impl LogSink for Counter {
        fn log(&self, _level: LogLevel, _target: &str, _args: Arguments<'_>) {
            CALLS.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn dispatch_without_sink_is_a_silent_noop() {
        log_info!("unit-test-target-that-is-never-registered", "{}", 1);
    }

    #[test]
    fn dispatch_reaches_registered_sink() {
        static SINK: Counter = Counter;
        set_sink(&SINK);
        let before = CALLS.load(Ordering::Relaxed);
        log_warn!("fs", "free blocks low: {}", 3);
        assert_eq!(CALLS.load(Ordering::Relaxed), before + 1);
    }
}
