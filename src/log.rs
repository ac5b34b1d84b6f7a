//! Logging Infrastructure
//!
//! Structured, leveled logging for the runtime. Fiber failures that
//! nobody observes, worker panics, and configuration fallbacks are
//! reported through here.
//!
//! # Features
//!
//! - **Log Levels**: Trace, Debug, Info, Warn, Error, with a global
//!   atomic minimum for cheap filtering
//! - **Structured fields**: key-value pairs on every entry
//! - **Output formats**: plain text and JSON, to stderr
//!
//! # Example
//!
//! ```rust,ignore
//! use fibra::log::{self, LogBuilder, LogLevel};
//!
//! fibra::info!("runtime started");
//!
//! LogBuilder::new(LogLevel::Warn)
//!     .message("fiber failed unobserved")
//!     .field("fiber", 42)
//!     .emit();
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level (default).
    #[default]
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text format (human readable).
    #[default]
    Plain,
    /// JSON format (machine readable).
    Json,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// A log entry with structured fields.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Structured fields, formatted at construction.
    pub fields: Vec<(String, String)>,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
    /// Thread name (if available).
    pub thread_name: Option<String>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
            thread_name: std::thread::current().name().map(|s| s.to_string()),
        }
    }

    /// Format as plain text.
    pub fn format_plain(&self) -> String {
        let mut output = format!(
            "[{}.{:03}] {:<5} ",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level.as_str()
        );

        if let Some(thread) = &self.thread_name {
            output.push_str(&format!("({thread}) "));
        }

        output.push_str(&self.message);

        if !self.fields.is_empty() {
            output.push_str(" {");
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    output.push_str(", ");
                }
                output.push_str(&format!("{key}={value}"));
            }
            output.push('}');
        }

        output
    }

    /// Format as JSON.
    pub fn format_json(&self) -> String {
        let mut output = format!(
            "{{\"timestamp\":{},\"level\":\"{}\"",
            self.timestamp,
            self.level.as_str()
        );

        if let Some(thread) = &self.thread_name {
            output.push_str(&format!(",\"thread\":\"{}\"", escape_json(thread)));
        }

        output.push_str(&format!(",\"message\":\"{}\"", escape_json(&self.message)));

        if !self.fields.is_empty() {
            output.push_str(",\"fields\":{");
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                output.push_str(&format!(
                    "\"{}\":\"{}\"",
                    escape_json(key),
                    escape_json(value)
                ));
            }
            output.push('}');
        }

        output.push('}');
        output
    }

    /// Format according to the given format.
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.format_plain(),
            LogFormat::Json => self.format_json(),
        }
    }
}

/// Escape a string for JSON output.
fn escape_json(s: &str) -> String {
    let mut output = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if c.is_control() => output.push_str(&format!("\\u{:04x}", c as u32)),
            c => output.push(c),
        }
    }
    output
}

/// Minimum log level (atomic for fast checking).
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Output format.
static FORMAT: Mutex<LogFormat> = Mutex::new(LogFormat::Plain);

/// Set the minimum log level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current minimum log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::SeqCst)).unwrap_or(LogLevel::Info)
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    *FORMAT.lock() = format;
}

/// Check if a log level would be logged.
pub fn would_log(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 >= MIN_LEVEL.load(Ordering::SeqCst)
}

/// Emit a log entry to stderr.
pub fn emit(entry: &LogEntry) {
    if !would_log(entry.level) {
        return;
    }
    let output = entry.format(*FORMAT.lock());
    let _ = writeln!(std::io::stderr(), "{output}");
}

/// Builder for log entries.
#[derive(Debug)]
pub struct LogBuilder {
    entry: LogEntry,
}

impl LogBuilder {
    /// Create a new log builder.
    pub fn new(level: LogLevel) -> Self {
        Self {
            entry: LogEntry::new(level, ""),
        }
    }

    /// Set the message.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.entry.message = msg.into();
        self
    }

    /// Add a field.
    pub fn field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.entry.fields.push((key.into(), value.to_string()));
        self
    }

    /// Emit the log entry.
    pub fn emit(self) {
        emit(&self.entry);
    }
}

/// Log a message at the given level.
pub fn log(level: LogLevel, message: impl Into<String>) {
    if !would_log(level) {
        return;
    }
    emit(&LogEntry::new(level, message));
}

/// Log a trace message.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        if $crate::log::would_log($crate::log::LogLevel::Trace) {
            $crate::log::log($crate::log::LogLevel::Trace, format!($($arg)*));
        }
    };
}

/// Log a debug message.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if $crate::log::would_log($crate::log::LogLevel::Debug) {
            $crate::log::log($crate::log::LogLevel::Debug, format!($($arg)*));
        }
    };
}

/// Log an info message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        if $crate::log::would_log($crate::log::LogLevel::Info) {
            $crate::log::log($crate::log::LogLevel::Info, format!($($arg)*));
        }
    };
}

/// Log a warning message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        if $crate::log::would_log($crate::log::LogLevel::Warn) {
            $crate::log::log($crate::log::LogLevel::Warn, format!($($arg)*));
        }
    };
}

/// Log an error message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        if $crate::log::would_log($crate::log::LogLevel::Error) {
            $crate::log::log($crate::log::LogLevel::Error, format!($($arg)*));
        }
    };
}

// ============================================================================
// Tests
// ============================================================================
