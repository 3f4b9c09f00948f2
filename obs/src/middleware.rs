//! axum middleware that feeds the error tracker and the access log.
//!
//! Install with [`axum::middleware::from_fn`]. Layer order matters: put
//! [`request_id`] outermost, then [`buffer_request_body`], then
//! [`access_log`], so the access line and error reports see both the id and
//! the captured body.

use std::net::SocketAddr;
use std::time::Instant;

use axum::body::{self, Body, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderValue, StatusCode};
use tracing::debug;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errtrack::{BufferedBody, RequestInfo};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Largest body [`buffer_request_body`] keeps in memory.
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Request ID wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body size limit for [`buffer_request_body_with_limit`].
#[derive(Debug, Clone, Copy)]
pub struct BodyLimit(pub usize);

/// Reuses the caller's `X-Request-Id` or generates one, stores it as a
/// [`RequestId`] extension and echoes it on the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Reads the body into a [`BufferedBody`] extension so error reports can
/// include it, then hands the handler an identical body.
///
/// Bodies that may exceed [`DEFAULT_BODY_LIMIT`] (declared larger, or of
/// unknown length) are not captured and reach the handler untouched.
pub async fn buffer_request_body(request: Request, next: Next) -> Response {
    buffer(request, next, DEFAULT_BODY_LIMIT).await
}

/// [`buffer_request_body`] with a custom limit, for
/// [`axum::middleware::from_fn_with_state`].
pub async fn buffer_request_body_with_limit(
    State(BodyLimit(limit)): State<BodyLimit>,
    request: Request,
    next: Next,
) -> Response {
    buffer(request, next, limit).await
}

async fn buffer(request: Request, next: Next, limit: usize) -> Response {
    let limit_bytes = limit as u64;
    let declared = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let upper = request.body().size_hint().upper();

    let fits = upper.map_or(false, |len| len <= limit_bytes)
        && declared.map_or(true, |len| len <= limit_bytes);
    if !fits {
        debug!(
            url = %request.uri(),
            limit,
            declared,
            "request body not captured, it may exceed the limit"
        );
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let bytes = match body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            // the stream is consumed and cannot be replayed
            warn!(
                method = %parts.method,
                url = %parts.uri,
                error = %err,
                "failed to read request body"
            );
            return (StatusCode::BAD_REQUEST, "failed to read request body\n").into_response();
        }
    };

    if !bytes.is_empty() {
        parts.extensions.insert(BufferedBody(bytes.clone()));
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// One structured line per request, at a level following the status class.
pub async fn access_log(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let info = RequestInfo::from_request(&request);
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let request_body = info.body().map(|body| render_body(body));
    let remote_ip = info.remote_ip().map(str::to_string).or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    });

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;

    match status {
        500..=599 => {
            error!(
                request_id = %request_id,
                method = %info.method(),
                url = %info.uri(),
                protocol = ?info.version(),
                status,
                latency_ms,
                user_agent = info.user_agent(),
                referer = info.referer(),
                remote_ip = remote_ip.as_deref(),
                request_body = request_body.as_deref(),
                "request failed"
            );
        }
        400..=499 => {
            warn!(
                request_id = %request_id,
                method = %info.method(),
                url = %info.uri(),
                protocol = ?info.version(),
                status,
                latency_ms,
                user_agent = info.user_agent(),
                referer = info.referer(),
                remote_ip = remote_ip.as_deref(),
                request_body = request_body.as_deref(),
                "request rejected"
            );
        }
        _ => {
            info!(
                request_id = %request_id,
                method = %info.method(),
                url = %info.uri(),
                protocol = ?info.version(),
                status,
                latency_ms,
                user_agent = info.user_agent(),
                referer = info.referer(),
                remote_ip = remote_ip.as_deref(),
                request_body = request_body.as_deref(),
                "request completed"
            );
        }
    }

    response
}

/// Compact JSON when the body parses as JSON, lossy UTF-8 otherwise.
fn render_body(body: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(json) => json.to_string(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SharedBuffer;
    use axum::http::Request as HttpRequest;
    use axum::middleware::{from_fn, from_fn_with_state};
    use axum::routing::{get, post};
    use axum::{Extension, Router};
    use tower::ServiceExt;

    async fn body_string(response: Response) -> String {
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn echo_id_app() -> Router {
        Router::new()
            .route(
                "/",
                get(|Extension(id): Extension<RequestId>| async move { id.to_string() }),
            )
            .layer(from_fn(request_id))
    }

    #[tokio::test]
    async fn test_request_id_is_generated() {
        let response = echo_id_app()
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let header = response.headers()[REQUEST_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&header).is_ok());
        assert_eq!(body_string(response).await, header);
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let request = HttpRequest::builder()
            .uri("/")
            .header(REQUEST_ID_HEADER, "req-42")
            .body(Body::empty())
            .unwrap();

        let response = echo_id_app().oneshot(request).await.unwrap();

        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");
        assert_eq!(body_string(response).await, "req-42");
    }

    #[tokio::test]
    async fn test_buffered_body_is_replayed_to_handler() {
        let app = Router::new()
            .route(
                "/orders",
                post(
                    |Extension(buffered): Extension<BufferedBody>, body: String| async move {
                        format!("{}|{}", buffered.0.len(), body)
                    },
                ),
            )
            .layer(from_fn(buffer_request_body));
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/orders")
            .body(Body::from("{\"sku\":\"A-1\"}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "13|{\"sku\":\"A-1\"}");
    }

    #[tokio::test]
    async fn test_empty_body_is_not_stored() {
        let app = Router::new()
            .route(
                "/",
                get(|buffered: Option<Extension<BufferedBody>>| async move {
                    buffered.is_some().to_string()
                }),
            )
            .layer(from_fn(buffer_request_body));

        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(body_string(response).await, "false");
    }

    #[tokio::test]
    async fn test_oversized_body_passes_through_uncaptured() {
        let app = Router::new()
            .route(
                "/",
                post(
                    |buffered: Option<Extension<BufferedBody>>, body: String| async move {
                        format!("{}|{}", buffered.is_some(), body)
                    },
                ),
            )
            .layer(from_fn_with_state(BodyLimit(16), buffer_request_body_with_limit));

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/")
            .body(Body::from("this body is way too long"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "false|this body is way too long");

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/")
            .header("content-length", "4096")
            .body(Body::from("short"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "false|short");
    }

    #[tokio::test]
    async fn test_access_log_includes_buffered_body() {
        let buffer = SharedBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_writer(buffer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = Router::new()
            .route("/orders", post(|| async { StatusCode::CREATED }))
            .layer(from_fn(access_log))
            .layer(from_fn(buffer_request_body));
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/orders")
            .body(Body::from("{ \"sku\": \"A-1\" }"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let lines = buffer.lines();
        let line = lines
            .iter()
            .find(|line| line["message"] == "request completed")
            .unwrap();
        assert_eq!(line["request_body"], "{\"sku\":\"A-1\"}");
    }

    #[tokio::test]
    async fn test_access_log_line_follows_status() {
        let buffer = SharedBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_writer(buffer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = Router::new()
            .route("/boom", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .layer(from_fn(access_log))
            .layer(from_fn(request_id));
        let request = HttpRequest::builder()
            .uri("/boom")
            .header(REQUEST_ID_HEADER, "req-7")
            .header("user-agent", "curl/8.0")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let lines = buffer.lines();
        let line = lines
            .iter()
            .find(|line| line["message"] == "request failed")
            .unwrap();
        assert_eq!(line["level"], "ERROR");
        assert_eq!(line["status"], 500);
        assert_eq!(line["url"], "/boom");
        assert_eq!(line["request_id"], "req-7");
        assert_eq!(line["user_agent"], "curl/8.0");
        assert_eq!(line["remote_ip"], "203.0.113.7");
    }
}
