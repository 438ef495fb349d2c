//! Logging abstraction for testable output.
//!
//! Sinks log through the `Logger` trait so tests can assert on what was reported
//! without installing a global subscriber. The binary uses `TracingLogger`, which
//! forwards every entry to the `tracing` macros.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    /// Most verbose level shown for a CLI `-v` flag count.
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Level::Warn,
            1 => Level::Info,
            _ => Level::Debug,
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }
}

/// Trait for logging output.
///
/// Implementations must be thread-safe: sinks log from their worker thread while
/// operators call into them from others.
pub trait Logger: Send + Sync {
    /// Log a message at the given level.
    fn log(&self, level: Level, message: &str);

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn log(&self, level: Level, message: &str) {
        (**self).log(level, message);
    }
}

/// Logger that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Error => tracing::error!(target: "conduit", "{message}"),
            Level::Warn => tracing::warn!(target: "conduit", "{message}"),
            Level::Info => tracing::info!(target: "conduit", "{message}"),
            Level::Debug => tracing::debug!(target: "conduit", "{message}"),
        }
    }
}

/// A captured log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
}

/// Mock logger for testing that captures all messages.
#[derive(Debug, Clone, Default)]
pub struct MockLogger {
    entries: Arc<RwLock<Vec<LogEntry>>>,
}

impl MockLogger {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking test thread must not hide the entries from the assertions that follow.
    fn read(&self) -> RwLockReadGuard<'_, Vec<LogEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<LogEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get all captured log entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.read().clone()
    }

    /// Get all captured messages (just the text).
    pub fn messages(&self) -> Vec<String> {
        self.read().iter().map(|e| e.message.clone()).collect()
    }

    /// Get messages at a specific level.
    pub fn messages_at_level(&self, level: Level) -> Vec<String> {
        self.read()
            .iter()
            .filter(|e| e.level == level)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Check if any message contains the given substring.
    pub fn contains(&self, substring: &str) -> bool {
        self.read().iter().any(|e| e.message.contains(substring))
    }

    /// Check if a message at `level` contains the given substring.
    pub fn contains_at(&self, level: Level, substring: &str) -> bool {
        self.read()
            .iter()
            .any(|e| e.level == level && e.message.contains(substring))
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }
}

impl Logger for MockLogger {
    fn log(&self, level: Level, message: &str) {
        self.write().push(LogEntry {
            level,
            message: message.to_string(),
        });
    }
}

/// A no-op logger that discards all messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl NullLogger {
    pub fn new() -> Self {
        Self
    }
}

impl Logger for NullLogger {
    fn log(&self, _level: Level, _message: &str) {}
}
