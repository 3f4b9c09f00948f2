use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};

/// Caller-supplied string tags attached to a single report.
pub type Tags = BTreeMap<String, String>;

/// Free-form structured diagnostics attached to a single report.
pub type Context = BTreeMap<String, serde_json::Value>;

/// Builds [`Tags`] from string pairs.
pub fn tags<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Tags
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source position a report was issued from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite<'a> {
    pub file: &'a str,
    pub line: u32,
    pub column: u32,
}

impl<'a> From<&'a Location<'a>> for CallSite<'a> {
    fn from(location: &'a Location<'a>) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

/// One error on its way to the backends.
///
/// Built once per capture call and handed by reference to every exporter, so
/// all of them observe the same error, tags, context and severity.
#[derive(Debug, Clone)]
pub struct ErrorReport<'a> {
    error: &'a (dyn StdError + 'a),
    tags: Tags,
    context: Context,
    severity: Severity,
    location: Option<CallSite<'a>>,
}

impl<'a> ErrorReport<'a> {
    pub fn new(error: &'a (dyn StdError + 'a), severity: Severity) -> Self {
        Self {
            error,
            tags: Tags::new(),
            context: Context::new(),
            severity,
            location: None,
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_location(mut self, location: impl Into<CallSite<'a>>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn error(&self) -> &(dyn StdError + 'a) {
        self.error
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn location(&self) -> Option<CallSite<'a>> {
        self.location
    }
}
