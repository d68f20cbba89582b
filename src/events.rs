//! Observational callbacks: per-entry progress and codec/archiver log messages.

use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Warning => f.write_str("warning"),
            LogLevel::Error => f.write_str("error"),
        }
    }
}

/// Receives warnings and errors raised while archiving or compressing.
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Called with the archive-relative name once an entry is fully written.
pub type EntryObserver = Box<dyn FnMut(&str) + Send>;

/// Sink that forwards to `tracing`.
pub fn tracing_sink() -> LogSink {
    Arc::new(|level: LogLevel, message: &str| match level {
        LogLevel::Warning => tracing::warn!("{message}"),
        LogLevel::Error => tracing::error!("{message}"),
    })
}

pub fn null_sink() -> LogSink {
    Arc::new(|_: LogLevel, _: &str| {})
}
