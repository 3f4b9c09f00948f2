//! Structured logging and multi-backend error tracking for server
//! applications.
//!
//! The entry point is [`Observer`]: every error handed to it is written to
//! the local log and fanned out to the configured error-tracking backends
//! (Sentry, Google Cloud Error Reporting). Backends that fail to initialize
//! are logged and skipped, and reporting never returns errors to the caller.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! let config = obs::ObserverConfig::from_env()?;
//! obs::init_logging(config.logging.clone())?;
//!
//! let observer = Arc::new(obs::Observer::new(&config));
//! obs::install_panic_hook(&observer);
//!
//! # let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
//! observer.error("failed to load cart", &err);
//! observer.close();
//! # Ok::<(), obs::ObsError>(())
//! ```

pub mod config;
pub mod error;
pub mod errtrack;
pub mod logging;
pub mod middleware;
mod observer;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, GCloudConfig, ObserverConfig, SentryConfig};
pub use error::{ErrorChain, ObsError, ObsResult, PanicError};
pub use errtrack::{
    tags, Context, ErrorExporter, ErrorReport, ErrorTracker, RequestInfo, Severity, Tags, User,
    UserExtractor,
};
pub use logging::{init_logging, LogConfig, LogFormat, LogLevel, Logger};
pub use observer::{install_panic_hook, ExitHook, Observer, ObserverBuilder};
