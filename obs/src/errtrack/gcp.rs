//! Google Cloud Error Reporting backend.
//!
//! Events are posted to the `events:report` REST endpoint from a dedicated
//! delivery thread, so capture calls never wait on the network. Closing the
//! exporter drains the queue before returning.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use reqwest::{Client, Url};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::{extract_user, ErrorExporter, ErrorReport, RequestInfo, User, UserExtractor};
use crate::config::{ConfigError, GCloudConfig};
use crate::error::ErrorChain;

pub const DEFAULT_ENDPOINT: &str = "https://clouderrorreporting.googleapis.com/v1beta1";

const BACKEND: &str = "gcloud";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportedErrorEvent {
    event_time: String,
    service_context: ServiceContext,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<ErrorContext>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceContext {
    service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    http_request: Option<HttpRequestContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_location: Option<SourceLocation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequestContext {
    method: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceLocation {
    file_path: String,
    line_number: u32,
}

pub struct GCloudExporter {
    service: ServiceContext,
    on_get_user: Option<UserExtractor>,
    sender: Mutex<Option<UnboundedSender<ReportedErrorEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GCloudExporter {
    pub fn new(
        config: &GCloudConfig,
        service_name: &str,
        service_version: &str,
    ) -> Result<Self, ConfigError> {
        config
            .validate()
            .map_err(|err| ConfigError::backend(BACKEND, err))?;

        let project_id = config.project_id.as_deref().unwrap_or_default().trim();
        let api_key = config
            .api_key
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        let url = Url::parse(&format!(
            "{}/projects/{}/events:report",
            config.endpoint.trim_end_matches('/'),
            project_id
        ))
        .map_err(|err| ConfigError::backend(BACKEND, format!("invalid endpoint: {}", err)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("obs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ConfigError::backend(BACKEND, err))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ConfigError::backend(BACKEND, err))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name("obs-gcloud".to_string())
            .spawn(move || {
                runtime.block_on(deliver_all(client, url, api_key, receiver));
            })
            .map_err(|err| ConfigError::backend(BACKEND, err))?;

        Ok(Self {
            service: ServiceContext {
                service: service_name.to_string(),
                version: Some(service_version.to_string()).filter(|v| !v.is_empty()),
            },
            on_get_user: config.on_get_user.clone(),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn enqueue(&self, report: &ErrorReport<'_>, request: Option<&RequestInfo>) {
        let user = extract_user(request, self.on_get_user.as_ref());
        let event = build_event(report, request, user, &self.service, Utc::now());

        match self.sender.lock().as_ref() {
            Some(sender) => {
                if sender.send(event).is_err() {
                    warn!("gcloud delivery thread is gone, dropping event");
                }
            }
            None => debug!("gcloud exporter closed, dropping event"),
        }
    }
}

impl ErrorExporter for GCloudExporter {
    fn capture_error(&self, report: &ErrorReport<'_>) {
        self.enqueue(report, None);
    }

    fn capture_http_error(&self, report: &ErrorReport<'_>, request: &RequestInfo) {
        self.enqueue(report, Some(request));
    }

    fn close(&self) {
        // dropping the sender ends the delivery loop once the queue is empty
        drop(self.sender.lock().take());

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("gcloud delivery thread panicked");
            }
        }
    }
}

async fn deliver_all(
    client: Client,
    url: Url,
    api_key: String,
    mut receiver: UnboundedReceiver<ReportedErrorEvent>,
) {
    while let Some(event) = receiver.recv().await {
        let result = client
            .post(url.clone())
            .query(&[("key", api_key.as_str())])
            .json(&event)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(message = %event.message, "error reported to google cloud");
            }
            Ok(response) => {
                warn!(status = %response.status(), "google cloud error reporting rejected event");
            }
            Err(err) => {
                warn!(error = %err, "failed to send event to google cloud error reporting");
            }
        }
    }
}

fn build_event(
    report: &ErrorReport<'_>,
    request: Option<&RequestInfo>,
    user: User,
    service: &ServiceContext,
    now: DateTime<Utc>,
) -> ReportedErrorEvent {
    let context = ErrorContext {
        http_request: request.map(|request| HttpRequestContext {
            method: request.method().to_string(),
            url: request.absolute_url(),
            user_agent: request.user_agent().map(str::to_string),
            referrer: request.referer().map(str::to_string),
            remote_ip: request.remote_ip().map(str::to_string),
        }),
        user: user.id.or(user.email),
        report_location: report.location().map(|location| SourceLocation {
            file_path: location.file.to_string(),
            line_number: location.line,
        }),
    };

    let has_context = context.http_request.is_some()
        || context.user.is_some()
        || context.report_location.is_some();

    ReportedErrorEvent {
        event_time: now.to_rfc3339_opts(SecondsFormat::Micros, true),
        service_context: service.clone(),
        message: ErrorChain(report.error()).to_string(),
        context: has_context.then_some(context),
    }
}
