//! Test doubles shared by the unit tests.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use crate::errtrack::{
    extract_user, ErrorExporter, ErrorReport, RequestInfo, Severity, Tags, User, UserExtractor,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Error {
        backend: String,
        message: String,
        tags: Tags,
        context: serde_json::Value,
        severity: Severity,
    },
    HttpError {
        backend: String,
        message: String,
        tags: Tags,
        severity: Severity,
        uri: String,
        user: User,
    },
    Close {
        backend: String,
    },
    Exit(i32),
}

impl Call {
    pub(crate) fn backend(&self) -> Option<&str> {
        match self {
            Call::Error { backend, .. }
            | Call::HttpError { backend, .. }
            | Call::Close { backend } => Some(backend),
            Call::Exit(_) => None,
        }
    }
}

/// Ordered record of every call made on any recording exporter sharing it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {
    pub(crate) fn push(&self, call: Call) {
        self.0.lock().push(call);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }

    pub(crate) fn calls_for(&self, backend: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.backend() == Some(backend))
            .collect()
    }

    pub(crate) fn order(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|call| call.backend().map(str::to_string))
            .collect()
    }
}

pub(crate) struct RecordingExporter {
    name: String,
    journal: Journal,
    extractor: Option<UserExtractor>,
    panic_on_close: bool,
}

impl RecordingExporter {
    pub(crate) fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            extractor: None,
            panic_on_close: false,
        }
    }

    pub(crate) fn with_extractor(mut self, extractor: UserExtractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub(crate) fn panicking_on_close(mut self) -> Self {
        self.panic_on_close = true;
        self
    }
}

impl ErrorExporter for RecordingExporter {
    fn capture_error(&self, report: &ErrorReport<'_>) {
        self.journal.push(Call::Error {
            backend: self.name.clone(),
            message: report.error().to_string(),
            tags: report.tags().clone(),
            context: serde_json::to_value(report.context()).unwrap(),
            severity: report.severity(),
        });
    }

    fn capture_http_error(&self, report: &ErrorReport<'_>, request: &RequestInfo) {
        self.journal.push(Call::HttpError {
            backend: self.name.clone(),
            message: report.error().to_string(),
            tags: report.tags().clone(),
            severity: report.severity(),
            uri: request.uri().to_string(),
            user: extract_user(Some(request), self.extractor.as_ref()),
        });
    }

    fn close(&self) {
        if self.panic_on_close {
            panic!("{} failed to flush", self.name);
        }
        self.journal.push(Call::Close {
            backend: self.name.clone(),
        });
    }
}

/// In-memory log sink for `Logger::with_writer`.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub(crate) fn lines(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedBuffer {
    type Writer = SharedBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
