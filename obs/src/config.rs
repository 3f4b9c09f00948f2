use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::errtrack::{gcp, UserExtractor};
use crate::logging::{LogConfig, LogFormat, LogLevel};

/// Observer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    pub service_name: String,
    pub service_version: String,
    pub sentry: SentryConfig,
    pub gcloud: GCloudConfig,
    pub logging: LogConfig,
}

/// Sentry backend. Left out entirely when no DSN is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentryConfig {
    pub dsn: Option<String>,
    /// Falls back to the service version.
    pub release: Option<String>,
    pub environment: Option<String>,
    #[serde(skip)]
    pub on_get_user: Option<UserExtractor>,
}

impl SentryConfig {
    pub fn is_configured(&self) -> bool {
        self.dsn
            .as_deref()
            .map(|dsn| !dsn.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Google Cloud Error Reporting backend. Disabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GCloudConfig {
    pub enabled: bool,
    pub project_id: Option<String>,
    pub api_key: Option<String>,
    pub endpoint: String,
    pub timeout_secs: u64,
    #[serde(skip)]
    pub on_get_user: Option<UserExtractor>,
}

impl Default for GCloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            project_id: None,
            api_key: None,
            endpoint: gcp::DEFAULT_ENDPOINT.to_string(),
            timeout_secs: 5,
            on_get_user: None,
        }
    }
}

impl GCloudConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if blank(&self.project_id) {
            return Err(ConfigError::MissingField("GCLOUD_PROJECT_ID".to_string()));
        }
        if blank(&self.api_key) {
            return Err(ConfigError::MissingField("GCLOUD_API_KEY".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "GCLOUD_TIMEOUT_SECS must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or_default().is_empty()
}

impl ObserverConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let service_name = get("SERVICE_NAME").unwrap_or(defaults.service_name);
        let config = ObserverConfig {
            service_version: get("SERVICE_VERSION").unwrap_or(defaults.service_version),
            sentry: SentryConfig {
                dsn: get("SENTRY_DSN"),
                release: get("SENTRY_RELEASE"),
                environment: get("SENTRY_ENVIRONMENT"),
                on_get_user: None,
            },
            gcloud: GCloudConfig {
                enabled: parse_or(&get, "GCLOUD_ENABLED", defaults.gcloud.enabled)?,
                project_id: get("GCLOUD_PROJECT_ID"),
                api_key: get("GCLOUD_API_KEY"),
                endpoint: get("GCLOUD_ERROR_REPORTING_ENDPOINT")
                    .unwrap_or(defaults.gcloud.endpoint),
                timeout_secs: parse_or(&get, "GCLOUD_TIMEOUT_SECS", defaults.gcloud.timeout_secs)?,
                on_get_user: None,
            },
            logging: LogConfig {
                level: parse_or(&get, "LOG_LEVEL", defaults.logging.level)?,
                format: parse_or(&get, "LOG_FORMAT", defaults.logging.format)?,
                service_name: service_name.clone(),
                ..defaults.logging
            },
            service_name,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Backend sections are validated by the backends
    /// themselves so that one bad section only disables that backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::MissingField("SERVICE_NAME".to_string()));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", key, value))),
        None => Ok(default),
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            service_name: "obs-service".to_string(),
            service_version: String::new(),
            sentry: SentryConfig::default(),
            gcloud: GCloudConfig::default(),
            logging: LogConfig {
                level: LogLevel::Info,
                format: LogFormat::Json,
                ..LogConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("{backend} backend initialization failed: {reason}")]
    Backend { backend: String, reason: String },
}

impl ConfigError {
    pub fn backend(backend: impl Into<String>, reason: impl ToString) -> Self {
        ConfigError::Backend {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }
}
