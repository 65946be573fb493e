// Unified logger - forwards to the `log` facade AND optionally persists to file
//
// Usage (no handle needed, callable from any module):
//      ulog_info!("[feishu] Token refreshed");
//      ulog_warn!("[telegram] sendPhoto failed: {}", err);
//
// Features:
// - Routes every entry through `log` so the host picks the backend
// - Persists to {log_dir}/unified-{YYYY-MM-DD}.log once `init_log_dir` was called

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// One persisted log line
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
}

/// Directory for unified log files. Unset means "log facade only".
static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Enable file persistence. Call once during host setup.
pub fn init_log_dir(dir: impl Into<PathBuf>) {
    if LOG_DIR.set(dir.into()).is_err() {
        log::warn!("Unified log directory already initialized");
    }
}

/// Get today's unified log file path inside `dir`
fn log_file_path(dir: &Path) -> PathBuf {
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    dir.join(format!("unified-{}.log", today))
}

/// Render an entry the way it is written to disk
fn format_line(entry: &LogEntry) -> String {
    format!(
        "{} [RUST ] [{}] {}\n",
        entry.timestamp,
        entry.level.as_str(),
        entry.message
    )
}

/// Append log entry to the unified log file
fn persist_log(dir: &Path, entry: &LogEntry) {
    if let Err(e) = fs::create_dir_all(dir) {
        log::error!("Failed to create logs directory: {}", e);
        return;
    }

    let path = log_file_path(dir);
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(mut file) => {
            if let Err(e) = file.write_all(format_line(entry).as_bytes()) {
                log::error!("Failed to write to log file: {}", e);
            }
        }
        Err(e) => {
            log::error!("Failed to open log file: {}", e);
        }
    }
}

/// Create a log entry with current timestamp
pub fn create_log_entry(level: LogLevel, message: String) -> LogEntry {
    LogEntry {
        level,
        message,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// Log via the facade, then persist when a log directory is configured.
pub fn unified_log(level: LogLevel, message: String) {
    match level {
        LogLevel::Info => log::info!("{}", message),
        LogLevel::Warn => log::warn!("{}", message),
        LogLevel::Error => log::error!("{}", message),
        LogLevel::Debug => log::debug!("{}", message),
    }
    if let Some(dir) = LOG_DIR.get() {
        let entry = create_log_entry(level, message);
        persist_log(dir, &entry);
    }
}

/// Global unified log macros.
/// Usage: ulog_info!("[module] message {}", arg);
#[macro_export]
macro_rules! ulog_info {
    ($($arg:tt)*) => {{
        $crate::logger::unified_log($crate::logger::LogLevel::Info, format!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ulog_warn {
    ($($arg:tt)*) => {{
        $crate::logger::unified_log($crate::logger::LogLevel::Warn, format!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ulog_error {
    ($($arg:tt)*) => {{
        $crate::logger::unified_log($crate::logger::LogLevel::Error, format!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ulog_debug {
    ($($arg:tt)*) => {{
        $crate::logger::unified_log($crate::logger::LogLevel::Debug, format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_layout() {
        let entry = LogEntry {
            level: LogLevel::Warn,
            message: "[telegram] sendPhoto failed".to_string(),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
        };
        assert_eq!(
            format_line(&entry),
            "2026-01-01T00:00:00+00:00 [RUST ] [WARN ] [telegram] sendPhoto failed\n"
        );
    }

    #[test]
    fn test_persist_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        persist_log(dir.path(), &create_log_entry(LogLevel::Info, "one".to_string()));
        persist_log(dir.path(), &create_log_entry(LogLevel::Error, "two".to_string()));

        let content = fs::read_to_string(log_file_path(dir.path())).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO ] one"));
        assert!(lines[1].ends_with("[ERROR] two"));
    }
}
