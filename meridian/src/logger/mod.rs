use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
pub enum LogLevel {
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => LogLevel::ERROR,
            log::Level::Warn => LogLevel::WARN,
            log::Level::Info => LogLevel::INFO,
            log::Level::Debug => LogLevel::DEBUG,
            log::Level::Trace => LogLevel::TRACE,
        }
    }
}

/// One structured log line.
#[derive(Debug, Serialize)]
pub struct LogEntry<'a> {
    timestamp: String,
    level: LogLevel,
    component: &'a str,
    thread: Option<&'a str>,
    file: Option<&'a str>,
    line: Option<u32>,
    message: String,
}

impl<'a> LogEntry<'a> {
    pub fn from_record(record: &'a log::Record<'a>, thread: Option<&'a str>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: record.level().into(),
            component: record.target(),
            thread,
            file: record.file(),
            line: record.line(),
            message: record.args().to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or(String::from("Error serializing log entry"))
    }
}

/// Installs the JSON logger, filtered through `RUST_LOG` (default `info`).
///
/// Calling it again after a logger is installed has no effect.
pub fn init() {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let thread = std::thread::current();
            let entry = LogEntry::from_record(record, thread.name());
            writeln!(buf, "{}", entry.to_json())
        })
        .try_init();
    if result.is_err() {
        log::debug!("Logger already installed");
    }
}

/// Installs a plain logger that writes through the test harness.
pub fn init_for_tests() {
    let _ = env_logger::builder().is_test(true).try_init();
}
