//! Logging macros, routed through the currently active [`crate::iodevice::IoDevice`].
//!
//! `log!` is gated by the `verbose` feature, matching the teacher's habit of
//! compiling event tracing out entirely for release builds rather than
//! paying a runtime cost to suppress it.

#[cfg(feature = "verbose")]
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::hvlog::_log(format_args!($($arg)*))
    };
}

#[cfg(not(feature = "verbose"))]
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        let _ = format_args!($($arg)*);
    };
}

#[cfg(feature = "verbose")]
pub mod hvlog {
    /// Backend written to by [`crate::log`]. Installed once at boot.
    pub trait LogSink: Send {
        fn write_line(&mut self, args: core::fmt::Arguments<'_>);
    }

    static mut SINK: Option<&'static mut dyn LogSink> = None;

    /// Installs the global log sink. Not thread-safe; must be called once
    /// before any other core runs, matching the rest of the crate's
    /// single-core assumptions.
    pub fn install(sink: &'static mut dyn LogSink) {
        // SAFETY: single-core, called once during boot.
        unsafe { SINK = Some(sink) };
    }

    pub fn _log(args: core::fmt::Arguments<'_>) {
        // SAFETY: single-core; `install` happens-before any log call in practice.
        if let Some(sink) = unsafe { SINK.as_deref_mut() } {
            sink.write_line(args);
        }
    }
}
