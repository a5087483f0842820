//! # triton-log: leveled, thread-tagged logging
//!
//! Thin record layer over `tracing`. Call sites go through the
//! [`fatal!`]/[`error!`]/[`warning!`]/[`info!`]/[`debug!`] macros, which check
//! the process-wide severity threshold *before* constructing anything and
//! stamp every record with the calling thread's short tag and its origin
//! (`file:line`). The sink itself never reports errors back to the caller; a
//! fatal-severity record is fatal only by the caller's follow-up action.
//!
//! Framework threads set their tag on startup (`"db"` for the persistence
//! daemon, `"net"` for the poll pump, `"job"` for pool workers); everything
//! else logs as `"main"`.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

/// Record severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Fatal = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
}

impl Level {
    /// Fixed-width name used in formatted output.
    pub fn name(self) -> &'static str {
        match self {
            Level::Fatal => "FATAL",
            Level::Error => "ERROR",
            Level::Warning => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

static LEVEL: AtomicUsize = AtomicUsize::new(Level::Info as usize);

thread_local! {
    static THREAD_TAG: Cell<&'static str> = const { Cell::new("main") };
}

/// Returns the process-wide severity threshold.
pub fn current_level() -> Level {
    match LEVEL.load(Ordering::Relaxed) {
        0 => Level::Fatal,
        1 => Level::Error,
        2 => Level::Warning,
        3 => Level::Info,
        _ => Level::Debug,
    }
}

/// Sets the process-wide severity threshold. Records above `level` are
/// discarded before construction.
pub fn set_level(level: Level) {
    LEVEL.store(level as usize, Ordering::Relaxed);
}

/// Returns the calling thread's tag.
pub fn thread_tag() -> &'static str {
    THREAD_TAG.with(Cell::get)
}

/// Sets the calling thread's tag, stamped onto every record it emits.
pub fn set_thread_tag(tag: &'static str) {
    THREAD_TAG.with(|t| t.set(tag));
}

/// True if a record at `level` would currently be emitted.
#[inline]
pub fn enabled(level: Level) -> bool {
    level <= current_level()
}

/// Hands one record to the sink. Prefer the macros, which perform the level
/// check before evaluating their arguments.
pub fn emit(level: Level, file: &'static str, line: u32, args: std::fmt::Arguments<'_>) {
    let tag = thread_tag();
    match level {
        Level::Fatal | Level::Error => {
            tracing::error!(target: "triton", severity = level.name(), tag, origin = %format_args!("{file}:{line}"), "{args}");
        }
        Level::Warning => {
            tracing::warn!(target: "triton", tag, origin = %format_args!("{file}:{line}"), "{args}");
        }
        Level::Info => {
            tracing::info!(target: "triton", tag, origin = %format_args!("{file}:{line}"), "{args}");
        }
        Level::Debug => {
            tracing::debug!(target: "triton", tag, origin = %format_args!("{file}:{line}"), "{args}");
        }
    }
}

/// Installs the global `tracing-subscriber` fmt sink. Idempotent; later calls
/// are no-ops so tests can call it freely.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[macro_export]
macro_rules! log_at {
    ($lvl:expr, $($arg:tt)+) => {{
        if $crate::enabled($lvl) {
            $crate::emit($lvl, file!(), line!(), format_args!($($arg)+));
        }
    }};
}

#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => { $crate::log_at!($crate::Level::Fatal, $($arg)+) };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => { $crate::log_at!($crate::Level::Error, $($arg)+) };
}

#[macro_export]
macro_rules! warning {
    ($($arg:tt)+) => { $crate::log_at!($crate::Level::Warning, $($arg)+) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => { $crate::log_at!($crate::Level::Info, $($arg)+) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => { $crate::log_at!($crate::Level::Debug, $($arg)+) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_matches_severity() {
        assert!(Level::Fatal < Level::Error);
        assert!(Level::Error < Level::Warning);
        assert!(Level::Warning < Level::Info);
        assert!(Level::Info < Level::Debug);
    }

    // The threshold is process-global, so everything that mutates it lives in
    // one test.
    #[test]
    fn threshold_gates_records_and_argument_evaluation() {
        set_level(Level::Warning);
        assert!(enabled(Level::Fatal));
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warning));
        assert!(!enabled(Level::Info));
        assert!(!enabled(Level::Debug));

        let mut evaluated = false;
        debug!("{}", {
            evaluated = true;
            "x"
        });
        assert!(!evaluated);
        set_level(Level::Info);
    }

    #[test]
    fn thread_tag_is_per_thread() {
        set_thread_tag("outer");
        let inner = std::thread::spawn(|| {
            // A fresh thread starts with the default tag.
            let before = thread_tag();
            set_thread_tag("inner");
            (before, thread_tag())
        })
        .join()
        .unwrap();

        assert_eq!(inner, ("main", "inner"));
        assert_eq!(thread_tag(), "outer");
    }
}
