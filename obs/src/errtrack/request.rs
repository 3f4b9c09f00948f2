//! Snapshot of the inbound request an error is attached to

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, HOST, REFERER, USER_AGENT};
use http::{HeaderMap, Method, Request, Uri, Version};

/// Request body captured by [`buffer_request_body`](crate::middleware::buffer_request_body).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedBody(pub Bytes);

const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Method, URL, headers and (when buffered) body of the request that failed.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl RequestInfo {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Copies the request metadata. The body is only picked up when an
    /// earlier middleware stored it as a [`BufferedBody`] extension, the
    /// body stream itself is never read here.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
            body: request
                .extensions()
                .get::<BufferedBody>()
                .map(|body| body.0.clone()),
        }
    }

    /// Adds a header, ignoring names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// First value of `name`, if present, valid UTF-8 and not blank.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header(USER_AGENT.as_str())
    }

    pub fn referer(&self) -> Option<&str> {
        self.header(REFERER.as_str())
    }

    /// Client address as reported by the first `X-Forwarded-For` hop.
    pub fn forwarded_for(&self) -> Option<&str> {
        self.header(X_FORWARDED_FOR)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Client address from proxy headers: `X-Real-IP`, then `X-Forwarded-For`.
    pub fn remote_ip(&self) -> Option<&str> {
        self.header(X_REAL_IP).or_else(|| self.forwarded_for())
    }

    /// Absolute URL, rebuilt from the `Host` header when the request line
    /// only carried a path.
    pub fn absolute_url(&self) -> String {
        if self.uri.scheme().is_some() {
            return self.uri.to_string();
        }

        let path = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        match self.header(HOST.as_str()) {
            Some(host) => format!("http://{}{}", host, path),
            None => path.to_string(),
        }
    }
}
