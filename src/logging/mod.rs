use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::LoggingConfig;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn label(self, colored: bool) -> &'static str {
        match (self, colored) {
            (Self::Error, false) => "ERROR",
            (Self::Warn, false) => "WARN",
            (Self::Info, false) => "INFO",
            (Self::Debug, false) => "DEBUG",
            (Self::Verbose, false) => "VERBOSE",
            (Self::Error, true) => "\x1b[31mERROR\x1b[0m",
            (Self::Warn, true) => "\x1b[33mWARN\x1b[0m",
            (Self::Info, true) => "\x1b[32mINFO\x1b[0m",
            (Self::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
            (Self::Verbose, true) => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoggingError {
    InvalidLevel { value: String },
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLevel { value } => write!(
                f,
                "invalid logging.level '{value}'. Allowed values: error, warn, info, debug, verbose"
            ),
        }
    }
}

impl std::error::Error for LoggingError {}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl LoggerConfig {
    pub fn from_app_config(config: &LoggingConfig) -> Result<Self, LoggingError> {
        let min_level = LogLevel::from_config_value(&config.level).ok_or_else(|| {
            LoggingError::InvalidLevel {
                value: config.level.clone(),
            }
        })?;

        Ok(Self {
            min_level,
            human_friendly: config.human_friendly,
        })
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            human_friendly: false,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Line-oriented logger shared by every worker thread.
///
/// Lines look like `<rfc3339> [LEVEL] <thread> [context] message payload={json}`;
/// the thread name tells worker loops apart.
pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn verbose(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Verbose, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let line = self.format_line(level, context, message, payload.as_ref());
        self.sink.write_line(&line);
    }

    /// Lets callers skip building expensive payloads for filtered levels.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    fn format_line(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let mut line = format!(
            "{} [{}] <{}>",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level.label(self.config.human_friendly),
            thread::current().name().unwrap_or("unnamed"),
        );
        if let Some(context) = context.filter(|context| !context.is_empty()) {
            line.push_str(&format!(" [{context}]"));
        }
        line.push(' ');
        line.push_str(message);
        if let Some(payload) = payload {
            line.push_str(&format!(" payload={payload}"));
        }
        line
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::config::LoggingConfig;

    use super::memory::MemorySink;
    use super::{LogLevel, Logger, LoggerConfig, LoggingError};

    #[test]
    fn parses_config_levels_case_insensitively() {
        assert_eq!(LogLevel::from_config_value("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_config_value(" verbose "), Some(LogLevel::Verbose));
        assert_eq!(LogLevel::from_config_value("loud"), None);
    }

    #[test]
    fn logger_config_rejects_unknown_level() {
        let err = LoggerConfig::from_app_config(&LoggingConfig {
            level: "chatty".to_owned(),
            human_friendly: false,
        })
        .expect_err("unknown level should fail");

        assert_eq!(
            err,
            LoggingError::InvalidLevel {
                value: "chatty".to_owned()
            }
        );
    }

    #[test]
    fn debug_threshold_excludes_verbose_logs() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(LoggerConfig::default(), sink.clone());

        logger.debug(Some("worker::rds_commands"), "debug message");
        logger.verbose(Some("worker::rds_commands"), "verbose message");

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[DEBUG]"));
        assert!(!logger.enabled(LogLevel::Verbose));
    }

    #[test]
    fn log_supports_optional_json_payload() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(LoggerConfig::default(), sink.clone());

        logger.log(
            LogLevel::Info,
            Some("channel::gui_requests"),
            "peer connected",
            Some(json!({"peer":"127.0.0.1:4572","attempt":2})),
        );

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[INFO]"));
        assert!(lines[0].contains("[channel::gui_requests]"));
        assert!(lines[0].contains("payload={\"attempt\":2,\"peer\":\"127.0.0.1:4572\"}"));
        assert!(lines[0].starts_with("20"));
    }

    #[test]
    fn lines_carry_the_emitting_thread_name() {
        let sink = Arc::new(MemorySink::default());
        let logger = Arc::new(Logger::with_sink(LoggerConfig::default(), sink.clone()));
        let worker_logger = Arc::clone(&logger);

        std::thread::Builder::new()
            .name("worker-gui_requests".to_owned())
            .spawn(move || worker_logger.info(Some("worker::gui_requests"), "worker started"))
            .expect("thread should spawn")
            .join()
            .expect("thread should finish");

        assert!(sink.contains("<worker-gui_requests> [worker::gui_requests] worker started"));
    }

    #[test]
    fn human_friendly_mode_colors_level() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(
            LoggerConfig {
                min_level: LogLevel::Info,
                human_friendly: true,
            },
            sink.clone(),
        );

        logger.error(None, "boom");

        assert!(sink.contains("\x1b[31mERROR\x1b[0m"));
    }
}
