//! Leveled logging capability consumed by sessions.
//!
//! Sessions never reach for a global logger. A `Logger` is injected through
//! `SessionConfig`, with `NullLogger` as the default.

use std::fmt;

/// Leveled, fire-and-forget logging.
pub trait Logger: Send + Sync {
    fn info(&self, args: fmt::Arguments<'_>);
    fn warn(&self, args: fmt::Arguments<'_>);
    fn debug(&self, args: fmt::Arguments<'_>);
    fn trace(&self, args: fmt::Arguments<'_>);
}

/// Logger that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn info(&self, _args: fmt::Arguments<'_>) {}
    fn warn(&self, _args: fmt::Arguments<'_>) {}
    fn debug(&self, _args: fmt::Arguments<'_>) {}
    fn trace(&self, _args: fmt::Arguments<'_>) {}
}

/// Logger that forwards to `tracing` at the matching level.
///
/// Lines inherit whatever span the session runs in, so the listener's
/// `connection` span tags them with the peer address.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!("{}", args);
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!("{}", args);
    }

    fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!("{}", args);
    }

    fn trace(&self, args: fmt::Arguments<'_>) {
        tracing::trace!("{}", args);
    }
}

/// Render a payload for trace output.
pub fn format_payload(bytes: &[u8], hex_logging: bool) -> String {
    if hex_logging {
        hex::encode(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Logger that keeps every line, for assertions in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingLogger {
    lines: std::sync::Mutex<Vec<(&'static str, String)>>,
}

#[cfg(test)]
impl RecordingLogger {
    fn push(&self, level: &'static str, args: fmt::Arguments<'_>) {
        self.lines.lock().unwrap().push((level, args.to_string()));
    }

    /// Lines logged at `level` that contain `needle`.
    pub(crate) fn count(&self, level: &str, needle: &str) -> usize {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, line)| *l == level && line.contains(needle))
            .count()
    }
}

#[cfg(test)]
impl Logger for RecordingLogger {
    fn info(&self, args: fmt::Arguments<'_>) {
        self.push("info", args);
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        self.push("warn", args);
    }

    fn debug(&self, args: fmt::Arguments<'_>) {
        self.push("debug", args);
    }

    fn trace(&self, args: fmt::Arguments<'_>) {
        self.push("trace", args);
    }
}
