//! Error tracking.
//!
//! [`ErrorTracker`] fans every captured error out to the configured backends
//! ([`ErrorExporter`] implementations). Backends are registered once, in
//! configuration order, and a backend whose construction fails is logged and
//! left out; it never takes the others down with it. Reporting is best-effort
//! throughout: nothing on this path returns an error to the caller.

pub mod gcp;
pub mod noop;
mod report;
mod request;
pub mod sentry;
mod user;

use std::any::Any;
use std::cell::Cell;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ObserverConfig};
use crate::error::PanicError;

pub use report::{tags, CallSite, Context, ErrorReport, Severity, Tags};
pub use request::{BufferedBody, RequestInfo};
pub use user::{extract_user, User, UserExtractor, USER_ID_HEADER};

pub use self::gcp::GCloudExporter;
pub use self::noop::NoopExporter;
pub use self::sentry::SentryExporter;

/// Contract every error-tracking backend satisfies.
///
/// Implementations are called from request-handling threads and must not
/// block for long or panic. Delivery failures stay inside the implementation.
pub trait ErrorExporter: Send + Sync {
    /// Records an error that is not tied to a request.
    fn capture_error(&self, report: &ErrorReport<'_>);

    /// Records an error raised while serving `request`.
    fn capture_http_error(&self, report: &ErrorReport<'_>, request: &RequestInfo);

    /// Flushes and releases the backend. Called exactly once, by the tracker.
    fn close(&self);
}

/// A backend that was configured but could not be constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBackend {
    pub name: String,
    pub reason: String,
}

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside a fan-out. The panic hook uses this
/// to stay out of panics raised by an exporter.
pub(crate) fn is_dispatching() -> bool {
    DISPATCHING.with(Cell::get)
}

struct DispatchGuard {
    previous: bool,
}

impl DispatchGuard {
    fn enter() -> Self {
        Self {
            previous: DISPATCHING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        DISPATCHING.with(|flag| flag.set(previous));
    }
}

/// Collects backends before the tracker goes live.
#[derive(Default)]
pub struct ErrorTrackerBuilder {
    exporters: Vec<(String, Box<dyn ErrorExporter>)>,
    failed: Vec<FailedBackend>,
}

impl ErrorTrackerBuilder {
    /// Registers an already constructed backend.
    pub fn exporter<E>(mut self, name: impl Into<String>, exporter: E) -> Self
    where
        E: ErrorExporter + 'static,
    {
        self.exporters.push((name.into(), Box::new(exporter)));
        self
    }

    /// Constructs and registers a backend. A construction error is logged and
    /// recorded, and the backend is skipped.
    pub fn try_exporter<E, F>(mut self, name: impl Into<String>, init: F) -> Self
    where
        E: ErrorExporter + 'static,
        F: FnOnce() -> Result<E, ConfigError>,
    {
        let name = name.into();
        match init() {
            Ok(exporter) => {
                debug!(backend = %name, "error tracking backend initialized");
                self.exporters.push((name, Box::new(exporter)));
            }
            Err(err) => {
                warn!(backend = %name, error = %err, "error tracking backend disabled");
                self.failed.push(FailedBackend {
                    name,
                    reason: err.to_string(),
                });
            }
        }
        self
    }

    pub fn build(self) -> ErrorTracker {
        let tracker = ErrorTracker {
            exporters: self.exporters,
            failed: self.failed,
            closed: AtomicBool::new(false),
        };

        info!(
            backends = ?tracker.backends(),
            failed = tracker.failed.len(),
            "error tracker ready"
        );

        tracker
    }
}

/// Fan-out dispatcher over the registered backends.
///
/// The backend list is fixed at build time, so capture calls take `&self`
/// and can run concurrently from any number of threads without locking.
/// Within one call, backends are invoked sequentially in registration order.
///
/// Capturing after [`close`](Self::close) is a caller error; such reports are
/// dropped and logged at DEBUG. Dropping a tracker that was not closed
/// closes it.
pub struct ErrorTracker {
    exporters: Vec<(String, Box<dyn ErrorExporter>)>,
    failed: Vec<FailedBackend>,
    closed: AtomicBool,
}

impl ErrorTracker {
    pub fn builder() -> ErrorTrackerBuilder {
        ErrorTrackerBuilder::default()
    }

    /// Tracker with no backends: every capture is a no-op.
    pub fn disabled() -> Self {
        Self::builder().build()
    }

    /// Builds the backends described by `config`.
    ///
    /// Sentry is registered when a DSN is set, Google Cloud Error Reporting
    /// when enabled. Either may fail to initialize without affecting the
    /// other.
    pub fn from_config(config: &ObserverConfig) -> Self {
        let mut builder = Self::builder();

        if config.sentry.is_configured() {
            builder = builder.try_exporter("sentry", || {
                SentryExporter::new(&config.sentry, &config.service_version)
            });
        } else {
            debug!("sentry DSN not set, sentry backend skipped");
        }

        if config.gcloud.enabled {
            builder = builder.try_exporter("gcloud", || {
                GCloudExporter::new(
                    &config.gcloud,
                    &config.service_name,
                    &config.service_version,
                )
            });
        }

        builder.build()
    }

    /// Names of the registered backends, in registration order.
    pub fn backends(&self) -> Vec<&str> {
        self.exporters.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Backends that were configured but failed to initialize.
    pub fn failed_backends(&self) -> &[FailedBackend] {
        &self.failed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[track_caller]
    pub fn capture_error(&self, err: &dyn StdError, tags: Tags, context: Context) {
        let report = ErrorReport::new(err, Severity::Error)
            .with_tags(tags)
            .with_context(context)
            .with_location(Location::caller());
        self.dispatch(&report, None);
    }

    #[track_caller]
    pub fn capture_warning(&self, err: &dyn StdError, tags: Tags, context: Context) {
        let report = ErrorReport::new(err, Severity::Warning)
            .with_tags(tags)
            .with_context(context)
            .with_location(Location::caller());
        self.dispatch(&report, None);
    }

    #[track_caller]
    pub fn capture_http_error(
        &self,
        err: &dyn StdError,
        request: &RequestInfo,
        tags: Tags,
        context: Context,
    ) {
        let report = ErrorReport::new(err, Severity::Error)
            .with_tags(tags)
            .with_context(context)
            .with_location(Location::caller());
        self.dispatch(&report, Some(request));
    }

    /// Same as [`capture_http_error`](Self::capture_http_error) at warning
    /// severity.
    #[track_caller]
    pub fn capture_http_warning(
        &self,
        err: &dyn StdError,
        request: &RequestInfo,
        tags: Tags,
        context: Context,
    ) {
        let report = ErrorReport::new(err, Severity::Warning)
            .with_tags(tags)
            .with_context(context)
            .with_location(Location::caller());
        self.dispatch(&report, Some(request));
    }

    /// Reports a recovered panic payload at fatal severity.
    #[track_caller]
    pub fn capture_panic(
        &self,
        payload: &(dyn Any + Send),
        request: Option<&RequestInfo>,
        tags: Tags,
    ) {
        let err = PanicError::from_payload(payload);
        let report = ErrorReport::new(&err, Severity::Fatal)
            .with_tags(tags)
            .with_location(Location::caller());
        self.dispatch(&report, request);
    }

    /// Hands `report` to every backend, `capture_http_error` when a request
    /// is given and `capture_error` otherwise.
    pub fn dispatch(&self, report: &ErrorReport<'_>, request: Option<&RequestInfo>) {
        if self.is_closed() {
            debug!(
                error = %report.error(),
                "error tracker closed, dropping report"
            );
            return;
        }

        match request {
            Some(request) => self.each_exporter("capture_http_error", |exporter| {
                exporter.capture_http_error(report, request)
            }),
            None => self.each_exporter("capture_error", |exporter| exporter.capture_error(report)),
        }
    }

    /// Closes every backend once, in registration order. Later calls are
    /// no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("error tracker already closed");
            return;
        }

        self.each_exporter("close", |exporter| exporter.close());
        info!(backends = self.exporters.len(), "error tracker closed");
    }

    fn each_exporter(&self, operation: &'static str, f: impl Fn(&dyn ErrorExporter)) {
        let _guard = DispatchGuard::enter();

        for (name, exporter) in &self.exporters {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(exporter.as_ref())));
            if outcome.is_err() {
                error!(backend = %name, operation, "error tracking backend panicked");
            }
        }
    }
}

impl Drop for ErrorTracker {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

impl std::fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("backends", &self.backends())
            .field("failed", &self.failed)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GCloudConfig, SentryConfig};
    use crate::testing::{Call, Journal, RecordingExporter};
    use http::{Method, Uri};
    use pretty_assertions::assert_eq;
    use std::io;
    use std::sync::Arc;
    use std::thread;

    fn boom() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "boom")
    }

    fn recording(names: &[&str], journal: &Journal) -> ErrorTracker {
        names
            .iter()
            .fold(ErrorTracker::builder(), |builder, name| {
                builder.exporter(*name, RecordingExporter::new(name, journal))
            })
            .build()
    }

    #[test]
    fn test_zero_backends_is_a_noop() {
        let tracker = ErrorTracker::disabled();
        let request = RequestInfo::new(Method::GET, Uri::from_static("/"));

        tracker.capture_error(&boom(), Tags::new(), Context::new());
        tracker.capture_http_error(&boom(), &request, Tags::new(), Context::new());
        tracker.capture_panic(&"oops", None, Tags::new());
        tracker.close();

        assert!(tracker.backends().is_empty());
        assert!(tracker.is_closed());
    }

    #[test]
    fn test_failing_backend_is_omitted() {
        let journal = Journal::default();
        let tracker = ErrorTracker::builder()
            .try_exporter("first", || Ok(RecordingExporter::new("first", &journal)))
            .try_exporter("broken", || -> Result<RecordingExporter, ConfigError> {
                Err(ConfigError::backend("broken", "invalid credentials"))
            })
            .try_exporter("second", || Ok(RecordingExporter::new("second", &journal)))
            .build();

        assert_eq!(tracker.backends(), vec!["first", "second"]);
        assert_eq!(tracker.failed_backends().len(), 1);
        assert_eq!(tracker.failed_backends()[0].name, "broken");
        assert!(tracker.failed_backends()[0]
            .reason
            .contains("invalid credentials"));
    }

    #[test]
    fn test_boom_reaches_the_healthy_backend() {
        let journal = Journal::default();
        let tracker = ErrorTracker::builder()
            .try_exporter("mock", || Ok(RecordingExporter::new("mock", &journal)))
            .try_exporter("failing", || -> Result<RecordingExporter, ConfigError> {
                Err(ConfigError::backend("failing", "unreachable endpoint"))
            })
            .build();

        tracker.capture_error(&boom(), tags([("k", "v")]), Context::new());

        assert_eq!(
            journal.calls(),
            vec![Call::Error {
                backend: "mock".to_string(),
                message: "boom".to_string(),
                tags: tags([("k", "v")]),
                context: serde_json::json!({}),
                severity: Severity::Error,
            }]
        );
    }

    #[test]
    fn test_every_backend_gets_the_same_report_once() {
        let journal = Journal::default();
        let tracker = recording(&["a", "b", "c"], &journal);
        let context = Context::from([("payload".to_string(), serde_json::json!({"id": 9}))]);

        tracker.capture_warning(&boom(), tags([("env", "test")]), context);

        for name in ["a", "b", "c"] {
            assert_eq!(
                journal.calls_for(name),
                vec![Call::Error {
                    backend: name.to_string(),
                    message: "boom".to_string(),
                    tags: tags([("env", "test")]),
                    context: serde_json::json!({"payload": {"id": 9}}),
                    severity: Severity::Warning,
                }]
            );
        }
    }

    #[test]
    fn test_fan_out_follows_registration_order() {
        let journal = Journal::default();
        let tracker = recording(&["sentry", "gcloud", "noop"], &journal);

        for _ in 0..3 {
            tracker.capture_error(&boom(), Tags::new(), Context::new());
        }

        assert_eq!(
            journal.order(),
            ["sentry", "gcloud", "noop"].repeat(3)
        );
    }

    #[test]
    fn test_http_error_carries_request_and_user() {
        let journal = Journal::default();
        let tracker = ErrorTracker::builder()
            .exporter("default", RecordingExporter::new("default", &journal))
            .exporter(
                "custom",
                RecordingExporter::new("custom", &journal)
                    .with_extractor(UserExtractor::new(|_| User::with_id("from-session"))),
            )
            .build();
        let request = RequestInfo::new(Method::POST, Uri::from_static("/checkout"))
            .with_header("X-User-Id", "abc123");

        tracker.capture_http_error(&boom(), &request, Tags::new(), Context::new());

        let users: Vec<_> = journal
            .calls()
            .into_iter()
            .map(|call| match call {
                Call::HttpError { uri, user, .. } => (uri, user.id),
                other => panic!("unexpected call {:?}", other),
            })
            .collect();
        assert_eq!(
            users,
            vec![
                ("/checkout".to_string(), Some("abc123".to_string())),
                ("/checkout".to_string(), Some("from-session".to_string())),
            ]
        );
    }

    #[test]
    fn test_http_warning_keeps_request_at_warning_severity() {
        let journal = Journal::default();
        let tracker = recording(&["a"], &journal);
        let request = RequestInfo::new(Method::GET, Uri::from_static("/cart"))
            .with_header("X-User-Id", "abc123");

        tracker.capture_http_warning(&boom(), &request, tags([("k", "v")]), Context::new());

        match journal.calls().as_slice() {
            [Call::HttpError {
                uri,
                user,
                tags: sent,
                severity,
                ..
            }] => {
                assert_eq!(uri, "/cart");
                assert_eq!(user.id.as_deref(), Some("abc123"));
                assert_eq!(sent, &tags([("k", "v")]));
                assert_eq!(severity, &Severity::Warning);
            }
            other => panic!("unexpected calls {:?}", other),
        }
    }

    #[test]
    fn test_capture_panic_is_fatal() {
        let journal = Journal::default();
        let tracker = recording(&["a"], &journal);

        let payload: Box<dyn Any + Send> = Box::new("index out of bounds");
        tracker.capture_panic(payload.as_ref(), None, tags([("thread", "worker-1")]));

        match &journal.calls()[0] {
            Call::Error {
                message, severity, ..
            } => {
                assert_eq!(message, "panic: index out of bounds");
                assert_eq!(*severity, Severity::Fatal);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_close_reaches_every_backend_once() {
        let journal = Journal::default();
        let tracker = ErrorTracker::builder()
            .exporter("flaky", RecordingExporter::new("flaky", &journal).panicking_on_close())
            .exporter("a", RecordingExporter::new("a", &journal))
            .exporter("b", RecordingExporter::new("b", &journal))
            .build();

        tracker.close();
        tracker.close();
        drop(tracker);

        assert_eq!(
            journal.calls(),
            vec![
                Call::Close {
                    backend: "a".to_string()
                },
                Call::Close {
                    backend: "b".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_capture_after_close_is_dropped() {
        let journal = Journal::default();
        let tracker = recording(&["a"], &journal);

        tracker.close();
        tracker.capture_error(&boom(), Tags::new(), Context::new());

        assert_eq!(journal.calls().len(), 1);
        assert!(matches!(journal.calls()[0], Call::Close { .. }));
    }

    #[test]
    fn test_drop_closes_backends() {
        let journal = Journal::default();
        drop(recording(&["a", "b"], &journal));

        assert_eq!(journal.order(), vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_captures() {
        let journal = Journal::default();
        let tracker = Arc::new(recording(&["a", "b"], &journal));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..25 {
                        tracker.capture_error(
                            &boom(),
                            tags([("worker", worker.to_string())]),
                            Context::new(),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(journal.calls_for("a").len(), 200);
        assert_eq!(journal.calls_for("b").len(), 200);
    }

    #[test]
    fn test_from_default_config_has_no_backends() {
        let tracker = ErrorTracker::from_config(&ObserverConfig::default());
        assert!(tracker.backends().is_empty());
        assert!(tracker.failed_backends().is_empty());
    }

    #[test]
    fn test_from_config_records_bad_backends() {
        let config = ObserverConfig {
            sentry: SentryConfig {
                dsn: Some("not a dsn".to_string()),
                ..Default::default()
            },
            gcloud: GCloudConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let tracker = ErrorTracker::from_config(&config);
        assert!(tracker.backends().is_empty());
        let failed: Vec<_> = tracker
            .failed_backends()
            .iter()
            .map(|backend| backend.name.as_str())
            .collect();
        assert_eq!(failed, vec!["sentry", "gcloud"]);
    }
}
