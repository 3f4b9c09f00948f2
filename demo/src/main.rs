use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::from_fn,
    routing::get,
    Router,
};
use obs::middleware::{access_log, buffer_request_body, request_id};
use obs::{tags, ErrorTracker, Logger, Observer, ObserverConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};

async fn root() -> &'static str {
    "OK\n"
}

// Logs the failure and reports it, with the request, to every backend
async fn error(
    State(observer): State<Arc<Observer>>,
    request: Request,
) -> (StatusCode, &'static str) {
    let err = io::Error::new(io::ErrorKind::Other, "demo: ups, that was an error");
    observer.http_error_tags(&request, tags([("key", "value")]), &err);

    (StatusCode::INTERNAL_SERVER_ERROR, "ups\n")
}

// The panic hook reports this one
async fn panic() -> StatusCode {
    let outcome = tokio::spawn(async { panic!("demo: the handler panicked") }).await;

    match outcome {
        Err(err) if err.is_panic() => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    }
}

fn create_router(observer: Arc<Observer>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/error", get(error).post(error))
        .route("/panic", get(panic))
        .layer(from_fn(access_log))
        .layer(from_fn(buffer_request_body))
        .layer(from_fn(request_id))
        .with_state(observer)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = ObserverConfig::from_env().context("Failed to load configuration")?;
    obs::init_logging(config.logging.clone()).context("Failed to initialize logging")?;

    let observer = Arc::new(
        Observer::builder()
            .logger(Logger::global().with_service(&config.service_name))
            .tracker(ErrorTracker::from_config(&config))
            .build(),
    );
    obs::install_panic_hook(&observer);

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .context("Invalid PORT")?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    observer.infof(format_args!("{} listening on http://{}", config.service_name, addr));

    axum::serve(
        listener,
        create_router(observer.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    observer.close();
    info!("{} shut down gracefully", config.service_name);
    Ok(())
}
