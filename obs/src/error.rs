//! Error types for the observer

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ObsError {
    #[error("Logging setup error: {0}")]
    Logging(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type ObsResult<T> = Result<T, ObsError>;

/// Error synthesized from a recovered panic payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("panic: {message}")]
pub struct PanicError {
    message: String,
}

impl PanicError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Renders the payload handed to `panic!` or a panic hook.
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Displays an error followed by its chain of sources, joined by `": "`.
pub struct ErrorChain<'a>(pub &'a dyn StdError);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {}", err)?;
            source = err.source();
        }

        Ok(())
    }
}
