use super::{ErrorExporter, ErrorReport, RequestInfo};

/// Backend that drops every report. Useful in tests and local development.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExporter;

impl NoopExporter {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorExporter for NoopExporter {
    fn capture_error(&self, _report: &ErrorReport<'_>) {}

    fn capture_http_error(&self, _report: &ErrorReport<'_>, _request: &RequestInfo) {}

    fn close(&self) {}
}
