//! Structured logging: process-wide subscriber setup and the `Logger` instance
//! handed to the observer.

use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn, Dispatch};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ErrorChain, ObsError, ObsResult};
use crate::errtrack::RequestInfo;

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    fn as_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact format
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub service_name: String,
    pub include_line_numbers: bool,
    pub include_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            service_name: "obs-service".to_string(),
            include_line_numbers: false,
            include_thread_ids: false,
        }
    }
}

/// Install the process-wide subscriber. Fails if one is already set.
pub fn init_logging(config: LogConfig) -> ObsResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tfmt::layer()
                        .with_target(true)
                        .with_thread_ids(config.include_thread_ids)
                        .with_line_number(config.include_line_numbers)
                        .pretty(),
                )
                .try_init()
                .map_err(|e| ObsError::Logging(e.to_string()))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tfmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_target(true)
                        .with_current_span(true)
                        .with_thread_ids(config.include_thread_ids)
                        .with_line_number(config.include_line_numbers),
                )
                .try_init()
                .map_err(|e| ObsError::Logging(e.to_string()))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tfmt::layer()
                        .compact()
                        .with_target(true)
                        .with_thread_ids(config.include_thread_ids),
                )
                .try_init()
                .map_err(|e| ObsError::Logging(e.to_string()))?;
        }
    }

    info!(
        service = %config.service_name,
        level = %config.level.as_str(),
        "Logging initialized"
    );

    Ok(())
}

/// Leveled, structured logger owned by an [`Observer`](crate::Observer).
///
/// A logger either carries its own subscriber, in which case every line is
/// written through it regardless of the process-wide default, or forwards to
/// whatever subscriber is globally installed ([`Logger::global`]).
#[derive(Clone)]
pub struct Logger {
    dispatch: Option<Dispatch>,
    service: Option<Arc<str>>,
}

impl Logger {
    /// JSON lines with timestamps on stderr.
    pub fn new() -> Self {
        Self::with_writer(std::io::stderr)
    }

    /// JSON lines with timestamps on the given writer.
    pub fn with_writer<W>(writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let subscriber = tfmt()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_max_level(LevelFilter::TRACE)
            .with_writer(writer)
            .finish();

        Self {
            dispatch: Some(Dispatch::new(subscriber)),
            service: None,
        }
    }

    /// Logger writing to stderr in the configured format and level.
    pub fn from_config(config: &LogConfig) -> Self {
        let level = config.level.as_filter();
        let dispatch = match config.format {
            LogFormat::Json => Dispatch::new(
                tfmt()
                    .json()
                    .flatten_event(true)
                    .with_max_level(level)
                    .with_line_number(config.include_line_numbers)
                    .with_thread_ids(config.include_thread_ids)
                    .with_writer(std::io::stderr)
                    .finish(),
            ),
            LogFormat::Pretty => Dispatch::new(
                tfmt()
                    .pretty()
                    .with_max_level(level)
                    .with_line_number(config.include_line_numbers)
                    .with_thread_ids(config.include_thread_ids)
                    .with_writer(std::io::stderr)
                    .finish(),
            ),
            LogFormat::Compact => Dispatch::new(
                tfmt()
                    .compact()
                    .with_max_level(level)
                    .with_thread_ids(config.include_thread_ids)
                    .with_writer(std::io::stderr)
                    .finish(),
            ),
        };

        Self {
            dispatch: Some(dispatch),
            service: Some(Arc::from(config.service_name.as_str())),
        }
    }

    /// Disabled logger, every operation is a no-op.
    pub fn nop() -> Self {
        Self {
            dispatch: Some(Dispatch::none()),
            service: None,
        }
    }

    /// Forwards to the process-wide default subscriber.
    pub fn global() -> Self {
        Self {
            dispatch: None,
            service: None,
        }
    }

    /// Adds a `service` field to every line.
    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(Arc::from(service));
        self
    }

    pub fn info(&self, msg: &str) {
        self.emit(|| info!(service = self.service(), "{}", msg));
    }

    pub fn infof(&self, args: fmt::Arguments<'_>) {
        self.emit(|| info!(service = self.service(), "{}", args));
    }

    pub fn warn(&self, msg: &str, err: &dyn StdError) {
        self.emit(|| {
            warn!(
                service = self.service(),
                error = %ErrorChain(err),
                "{}",
                msg
            )
        });
    }

    pub fn error(&self, msg: &str, err: &dyn StdError) {
        self.emit(|| {
            error!(
                service = self.service(),
                error = %ErrorChain(err),
                "{}",
                msg
            )
        });
    }

    /// Error line for a failure that happened while serving `request`.
    pub fn request_error(&self, request: &RequestInfo, err: &dyn StdError) {
        self.emit(|| {
            error!(
                service = self.service(),
                method = %request.method(),
                url = %request.uri(),
                user_id = request.header(crate::errtrack::USER_ID_HEADER),
                error = %ErrorChain(err),
                "request failed"
            )
        });
    }

    pub fn request_warn(&self, request: &RequestInfo, err: &dyn StdError) {
        self.emit(|| {
            warn!(
                service = self.service(),
                method = %request.method(),
                url = %request.uri(),
                user_id = request.header(crate::errtrack::USER_ID_HEADER),
                error = %ErrorChain(err),
                "request degraded"
            )
        });
    }

    /// Writes an ERROR line tagged `fatal = true`. Does not exit.
    pub fn fatal(&self, msg: &str, err: &dyn StdError) {
        self.emit(|| {
            error!(
                service = self.service(),
                error = %ErrorChain(err),
                fatal = true,
                "{}",
                msg
            )
        });
    }

    fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    fn emit(&self, f: impl FnOnce()) {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("global", &self.dispatch.is_none())
            .field("service", &self.service)
            .finish()
    }
}
