//! Logging configuration and initialization
//!
//! Every tabload binary routes its output through `tracing`. This module owns
//! the subscriber setup so the CLI and tests agree on formats and targets:
//! console and/or a daily-rotated file, text or JSON lines, with the level
//! and extra filter directives taken from the environment.
//!
//! Library code should only use the `tracing` macros with structured fields:
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! # let partition = "CA"; let rows = 1000;
//! info!(partition, rows, "Batch written");
//! warn!(partition, attempt = 2, "Batch write timed out");
//! ```

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    #[serde(alias = "stdout")]
    Console,
    File,
    #[serde(alias = "all")]
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    #[serde(alias = "pretty")]
    Text,
    Json,
}

/// Parse a case-insensitive setting such as `LOG_LEVEL=Warning`
pub fn parse_setting<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let value = serde_json::Value::String(raw.trim().to_lowercase());
    serde_json::from_value(value).with_context(|| format!("Unrecognised value '{}'", raw))
}

fn env_setting<T: DeserializeOwned>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => parse_setting(&raw)
            .map(Some)
            .with_context(|| format!("Invalid {}", key)),
        Err(_) => Ok(None),
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for rotated log files
    pub log_dir: PathBuf,
    /// File name prefix, e.g. "tabload" -> "tabload.2026-01-18"
    pub log_file_prefix: String,
    /// Extra directives such as "sqlx=warn,tabload_ingest=debug"
    pub filter_directives: Option<String>,
    /// Source file and line on every event
    pub source_location: bool,
    pub thread_ids: bool,
    /// Module path of the emitting code
    pub targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "tabload".to_string(),
            filter_directives: None,
            source_location: false,
            thread_ids: false,
            targets: true,
        }
    }
}

impl LogConfig {
    /// Defaults overridden by `LOG_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Apply `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_FILTER` and the `LOG_INCLUDE_*` flags on top of
    /// this configuration
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_setting("LOG_LEVEL")? {
            self.level = level;
        }
        if let Some(output) = env_setting("LOG_OUTPUT")? {
            self.output = output;
        }
        if let Some(format) = env_setting("LOG_FORMAT")? {
            self.format = format;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Ok(filter) = std::env::var("LOG_FILTER") {
            self.filter_directives = Some(filter).filter(|f| !f.trim().is_empty());
        }
        self.source_location = env_flag("LOG_INCLUDE_LOCATION").unwrap_or(self.source_location);
        self.thread_ids = env_flag("LOG_INCLUDE_THREAD_IDS").unwrap_or(self.thread_ids);
        self.targets = env_flag("LOG_INCLUDE_TARGETS").unwrap_or(self.targets);
        Ok(self)
    }

    /// Defaults at the given level
    pub fn at_level(level: LogLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// `RUST_LOG` first, then the configured level and directives
    fn filter(&self) -> Result<EnvFilter> {
        let base = EnvFilter::builder()
            .with_default_directive(LevelFilter::from(self.level).into())
            .from_env_lossy();

        self.filter_directives
            .iter()
            .flat_map(|d| d.split(','))
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .try_fold(base, |filter, directive| {
                let parsed = directive
                    .parse::<Directive>()
                    .with_context(|| format!("Failed to parse filter directive '{}'", directive))?;
                Ok(filter.add_directive(parsed))
            })
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(self.targets)
            .with_thread_ids(self.thread_ids)
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_span_events(FmtSpan::CLOSE);

        match self.format {
            LogFormat::Text => layer.boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

/// Keeps the non-blocking file writer flushing until dropped
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global tracing subscriber
///
/// Call once at startup and hold on to the returned guard for the lifetime of
/// the process.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = config.filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.output.console() {
        layers.push(config.layer(std::io::stdout, true));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Cannot create log directory {}", config.log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(config.layer(writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _file: file_guard })
}
