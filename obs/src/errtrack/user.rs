use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::RequestInfo;

/// Header read for the user id when no custom extractor is configured.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Identity attached to a report. All fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "ip_address", skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl User {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.email.is_none() && self.ip.is_none()
    }
}

/// Caller-supplied identity lookup for the request an error was raised on.
#[derive(Clone)]
pub struct UserExtractor(Arc<dyn Fn(&RequestInfo) -> User + Send + Sync>);

impl UserExtractor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RequestInfo) -> User + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn extract(&self, request: &RequestInfo) -> User {
        (self.0)(request)
    }
}

impl fmt::Debug for UserExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserExtractor(..)")
    }
}

/// Derive the identity for a report.
///
/// Errors not tied to a request carry no identity. Otherwise a configured
/// extractor fully determines the result, and without one the id comes from
/// `X-User-Id` and the address from the first `X-Forwarded-For` hop.
pub fn extract_user(request: Option<&RequestInfo>, extractor: Option<&UserExtractor>) -> User {
    let Some(request) = request else {
        return User::default();
    };

    if let Some(extractor) = extractor {
        return extractor.extract(request);
    }

    User {
        id: request.header(USER_ID_HEADER).map(str::to_string),
        email: None,
        ip: request.forwarded_for().map(str::to_string),
    }
}
