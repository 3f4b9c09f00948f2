//! Logging and error tracking behind a single handle.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, Location};
use std::sync::{Arc, Weak};

use http::Request;

use crate::config::ObserverConfig;
use crate::error::PanicError;
use crate::errtrack::{self, CallSite, Context, ErrorReport, ErrorTracker, RequestInfo, Severity, Tags};
use crate::logging::Logger;

/// Called by [`Observer::fatal`] with the exit code once the fatal report has
/// been flushed. Defaults to [`std::process::exit`].
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

fn exit_process(code: i32) {
    std::process::exit(code)
}

/// Writes every error to the local log and hands it to the error tracker.
///
/// An `Observer` is meant to be created once at startup and shared (usually
/// behind an `Arc`) by everything that reports errors. Call
/// [`close`](Self::close) on shutdown to flush the backends.
pub struct Observer {
    logger: Logger,
    tracker: ErrorTracker,
    exit: ExitHook,
}

impl Observer {
    /// Logger and backends built from `config`. Backends that fail to
    /// initialize are logged and left out.
    pub fn new(config: &ObserverConfig) -> Self {
        Self::builder()
            .logger(Logger::from_config(&config.logging))
            .tracker(ErrorTracker::from_config(config))
            .build()
    }

    pub fn builder() -> ObserverBuilder {
        ObserverBuilder::default()
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn tracker(&self) -> &ErrorTracker {
        &self.tracker
    }

    pub fn info(&self, msg: &str) {
        self.logger.info(msg);
    }

    pub fn infof(&self, args: fmt::Arguments<'_>) {
        self.logger.infof(args);
    }

    #[track_caller]
    pub fn warn(&self, msg: &str, err: &dyn StdError) {
        self.logger.warn(msg, err);
        self.tracker.capture_warning(err, Tags::new(), Context::new());
    }

    #[track_caller]
    pub fn error(&self, msg: &str, err: &dyn StdError) {
        self.error_tags_and_context(msg, Tags::new(), Context::new(), err);
    }

    #[track_caller]
    pub fn error_tags(&self, msg: &str, tags: Tags, err: &dyn StdError) {
        self.error_tags_and_context(msg, tags, Context::new(), err);
    }

    #[track_caller]
    pub fn error_tags_and_context(
        &self,
        msg: &str,
        tags: Tags,
        context: Context,
        err: &dyn StdError,
    ) {
        self.logger.error(msg, err);
        self.tracker.capture_error(err, tags, context);
    }

    #[track_caller]
    pub fn http_error<B>(&self, request: &Request<B>, err: &dyn StdError) {
        self.http_error_tags_and_context(request, Tags::new(), Context::new(), err);
    }

    #[track_caller]
    pub fn http_error_tags<B>(&self, request: &Request<B>, tags: Tags, err: &dyn StdError) {
        self.http_error_tags_and_context(request, tags, Context::new(), err);
    }

    #[track_caller]
    pub fn http_error_tags_and_context<B>(
        &self,
        request: &Request<B>,
        tags: Tags,
        context: Context,
        err: &dyn StdError,
    ) {
        let request = RequestInfo::from_request(request);
        self.logger.request_error(&request, err);
        self.tracker
            .capture_http_error(err, &request, tags, context);
    }

    #[track_caller]
    pub fn http_warn<B>(&self, request: &Request<B>, err: &dyn StdError) {
        self.http_warn_tags(request, Tags::new(), err);
    }

    #[track_caller]
    pub fn http_warn_tags<B>(&self, request: &Request<B>, tags: Tags, err: &dyn StdError) {
        let request = RequestInfo::from_request(request);
        self.logger.request_warn(&request, err);
        self.tracker
            .capture_http_warning(err, &request, tags, Context::new());
    }

    /// Logs and reports a recovered panic payload.
    #[track_caller]
    pub fn panic(&self, payload: &(dyn Any + Send), request: Option<&RequestInfo>) {
        let err = PanicError::from_payload(payload);
        self.logger.error("panic recovered", &err);
        self.tracker.capture_panic(payload, request, Tags::new());
    }

    /// Logs and reports `err`, closes the tracker so the report is flushed,
    /// then runs the exit hook with code 1. Returns only if the hook does.
    #[track_caller]
    pub fn fatal(&self, msg: &str, err: &dyn StdError) {
        self.logger.fatal(msg, err);

        let report = ErrorReport::new(err, Severity::Fatal).with_location(Location::caller());
        self.tracker.dispatch(&report, None);
        self.tracker.close();

        (self.exit)(1);
    }

    /// Flushes and closes every backend. Safe to call more than once.
    pub fn close(&self) {
        self.tracker.close();
    }

    fn report_panic(&self, err: &PanicError, location: Option<CallSite<'_>>) {
        self.logger.error("panic", err);

        let mut report = ErrorReport::new(err, Severity::Fatal);
        if let Some(location) = location {
            report = report.with_location(location);
        }
        self.tracker.dispatch(&report, None);
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("logger", &self.logger)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ObserverBuilder {
    logger: Option<Logger>,
    tracker: Option<ErrorTracker>,
    exit: Option<ExitHook>,
}

impl ObserverBuilder {
    /// Defaults to [`Logger::global`].
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Defaults to [`ErrorTracker::disabled`].
    pub fn tracker(mut self, tracker: ErrorTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn exit_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.exit = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Observer {
        Observer {
            logger: self.logger.unwrap_or_else(Logger::global),
            tracker: self.tracker.unwrap_or_else(ErrorTracker::disabled),
            exit: self.exit.unwrap_or_else(|| Arc::new(exit_process)),
        }
    }
}

/// Reports every panic in the process through `observer` before running the
/// previously installed hook.
///
/// Only a weak reference is kept: once the observer is dropped the hook just
/// forwards. Panics raised by a backend while it is being called are not
/// reported again.
pub fn install_panic_hook(observer: &Arc<Observer>) {
    let observer: Weak<Observer> = Arc::downgrade(observer);
    let previous = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        if !errtrack::is_dispatching() {
            if let Some(observer) = observer.upgrade() {
                let err = PanicError::from_payload(info.payload());
                observer.report_panic(&err, info.location().map(CallSite::from));
            }
        }
        previous(info);
    }));
}
