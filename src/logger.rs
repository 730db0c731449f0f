/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file logger.rs
 * @brief Structured logging on top of tracing
 */

use crate::config::LoggingConfig;
use crate::error::{FauxGateError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;
use tracing::{Level, Subscriber};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO "),
            LogLevel::Warning => write!(f, "WARN "),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE | Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warning,
            Level::ERROR => LogLevel::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = FauxGateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" | "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(FauxGateError::Config(format!("Unknown log level: {}", other))),
        }
    }
}

impl LogLevel {
    fn filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            LogLevel::Debug => "•",
            LogLevel::Info => "✓",
            LogLevel::Warning => "⚠",
            LogLevel::Error => "✗",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FauxGateLogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub pid: u32,
    pub message: String,
    /// Structured fields other than `message`, already rendered as `key=value`.
    pub fields: Vec<(String, String)>,
    pub target: String,
    pub line: Option<u32>,
}

impl FauxGateLogEvent {
    pub fn new(level: LogLevel, message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            pid: std::process::id(),
            message,
            fields: Vec::new(),
            target: "fauxgate".to_string(),
            line: None,
        }
    }

    fn render_fields(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            let _ = write!(out, " {}={}", key, value);
        }
        out
    }

    pub fn format_compact(&self) -> String {
        format!(
            "{} {} {} : FauxGate [{}]{}",
            self.level.symbol(),
            self.pid,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.message,
            self.render_fields()
        )
    }

    pub fn format_detailed(&self) -> String {
        let location = match self.line {
            Some(line) => format!(" {}:{}", self.target, line),
            None => format!(" {}", self.target),
        };

        format!(
            "{} {} {} {} : FauxGate [{}]{}{}",
            self.level.symbol(),
            self.pid,
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.message,
            self.render_fields(),
            location
        )
    }
}

/// Formats every tracing event as one FauxGate log line on stderr.
pub struct FauxGateTracingLayer {
    detailed: bool,
}

impl FauxGateTracingLayer {
    pub fn new(detailed: bool) -> Self {
        Self { detailed }
    }
}

impl<S> tracing_subscriber::Layer<S> for FauxGateTracingLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let mut log_event = FauxGateLogEvent::new(
            LogLevel::from(*metadata.level()),
            visitor
                .message
                .unwrap_or_else(|| metadata.name().to_string()),
        );
        log_event.fields = visitor.fields;
        log_event.target = metadata.target().to_string();
        log_event.line = metadata.line();

        let formatted = if self.detailed {
            log_event.format_detailed()
        } else {
            log_event.format_compact()
        };
        eprintln!("{}", formatted);
    }
}

#[derive(Default)]
struct LogVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields
                .push((field.name().to_string(), format!("{:?}", value)));
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing_logger(config: &LoggingConfig) -> Result<()> {
    let level: LogLevel = config.level.parse()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.filter_directive()));

    Registry::default()
        .with(filter)
        .with(FauxGateTracingLayer::new(config.format == "detailed"))
        .try_init()
        .map_err(|e| FauxGateError::Config(format!("Failed to install logger: {}", e)))
}
