//! Sentry backend

use std::net::IpAddr;
use std::time::Duration;

use ::sentry::integrations::backtrace::{current_stacktrace, AttachStacktraceIntegration};
use ::sentry::protocol::{Context as SentryContext, Event, IpAddress, Request as SentryRequest};
use ::sentry::types::Dsn;
use ::sentry::{ClientOptions, Level};
use tracing::debug;

use super::{extract_user, ErrorExporter, ErrorReport, RequestInfo, Severity, User, UserExtractor};
use crate::config::{ConfigError, SentryConfig};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends reports to Sentry through a dedicated client, so several exporters
/// (or the host application's own Sentry setup) do not share a hub.
pub struct SentryExporter {
    client: ::sentry::Client,
    on_get_user: Option<UserExtractor>,
}

impl SentryExporter {
    /// Fails when the DSN is missing or malformed. `service_version` is the
    /// release used when the config does not name one.
    pub fn new(config: &SentryConfig, service_version: &str) -> Result<Self, ConfigError> {
        let dsn = config
            .dsn
            .as_deref()
            .map(str::trim)
            .filter(|dsn| !dsn.is_empty())
            .ok_or_else(|| ConfigError::backend("sentry", "DSN is not set"))?;
        let dsn: Dsn = dsn
            .parse()
            .map_err(|err| ConfigError::backend("sentry", format!("invalid DSN: {}", err)))?;

        let release = config
            .release
            .clone()
            .or_else(|| Some(service_version.to_string()).filter(|v| !v.is_empty()));

        // no default integrations: their panic hook would report to the global
        // hub, panics reach us through install_panic_hook instead
        let options = ::sentry::apply_defaults(
            ClientOptions {
                dsn: Some(dsn),
                release: release.map(Into::into),
                environment: config.environment.clone().map(Into::into),
                attach_stacktrace: true,
                default_integrations: false,
                ..Default::default()
            }
            .add_integration(AttachStacktraceIntegration::new()),
        );

        Ok(Self {
            client: ::sentry::Client::with_options(options),
            on_get_user: config.on_get_user.clone(),
        })
    }

    fn send(&self, report: &ErrorReport<'_>, request: Option<&RequestInfo>) {
        let user = extract_user(request, self.on_get_user.as_ref());
        self.client
            .capture_event(build_event(report, request, user), None);
    }
}

impl ErrorExporter for SentryExporter {
    fn capture_error(&self, report: &ErrorReport<'_>) {
        self.send(report, None);
    }

    fn capture_http_error(&self, report: &ErrorReport<'_>, request: &RequestInfo) {
        self.send(report, Some(request));
    }

    fn close(&self) {
        if !self.client.close(Some(FLUSH_TIMEOUT)) {
            debug!("sentry queue not drained before close");
        }
    }
}

fn build_event(report: &ErrorReport<'_>, request: Option<&RequestInfo>, user: User) -> Event<'static> {
    let mut event = ::sentry::event_from_error(report.error());
    event.level = level(report.severity());
    event.tags = report.tags().clone();

    if let Some(exception) = event.exception.values.last_mut() {
        if exception.stacktrace.is_none() {
            exception.stacktrace = current_stacktrace();
        }
    }

    if !report.context().is_empty() {
        event.contexts.insert(
            "context".to_string(),
            SentryContext::Other(report.context().clone()),
        );
    }
    if !user.is_empty() {
        event.user = Some(sentry_user(user));
    }
    if let Some(request) = request {
        event.request = Some(sentry_request(request));
    }
    if let Some(location) = report.location() {
        event.extra.insert(
            "location".to_string(),
            format!("{}:{}", location.file, location.line).into(),
        );
    }

    event
}

fn level(severity: Severity) -> Level {
    match severity {
        Severity::Warning => Level::Warning,
        Severity::Error => Level::Error,
        Severity::Fatal => Level::Fatal,
    }
}

fn sentry_user(user: User) -> ::sentry::User {
    ::sentry::User {
        ip_address: user
            .ip
            .as_deref()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .map(IpAddress::Exact),
        id: user.id,
        email: user.email,
        ..Default::default()
    }
}

fn sentry_request(request: &RequestInfo) -> SentryRequest {
    SentryRequest {
        url: request.absolute_url().parse().ok(),
        method: Some(request.method().to_string()),
        data: request
            .body()
            .map(|body| String::from_utf8_lossy(body).into_owned()),
        query_string: request.uri().query().map(str::to_string),
        headers: request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect(),
        ..Default::default()
    }
}
