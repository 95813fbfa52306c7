//! The HTTP surface of the service.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use crate::api;
use crate::config::Config;
use crate::diskcache::DiskCache;
use crate::downloader::HttpDownloader;
use crate::symbolication::Symbolicator;

/// Shared state of all request handlers.
pub struct AppState {
    /// The symbolication service.
    pub symbolicator: Symbolicator,
    /// The disk cache, probed by the heartbeat endpoint.
    pub diskcache: DiskCache,
    /// Maximum jobs accepted per v5 request.
    pub max_jobs: usize,
    /// Maximum accepted request body size, in bytes.
    pub max_body_bytes: usize,
}

/// Builds the service router.
///
/// Bodies beyond the configured size cap are rejected before any parsing;
/// the handlers turn that rejection into a 400 with the `too_large` reason.
pub fn router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/symbolicate/v4", post(api::v4::handle))
        .route("/symbolicate/v5", post(api::v5::handle))
        .route("/__heartbeat__", get(heartbeat))
        .route("/__lbheartbeat__", get(lbheartbeat))
        .route("/__version__", get(version))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Readiness: verifies that the cache directory is still writable.
async fn heartbeat(State(state): State<Arc<AppState>>) -> Response {
    let probe = state
        .diskcache
        .root()
        .join("tmp")
        .join(format!("heartbeat-{}", uuid::Uuid::new_v4()));

    let healthy = tokio::task::spawn_blocking(move || {
        std::fs::write(&probe, b"ok")
            .and_then(|()| std::fs::remove_file(&probe))
            .is_ok()
    })
    .await
    .unwrap_or(false);

    if healthy {
        (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "cache directory not writable" })),
        )
            .into_response()
    }
}

/// Liveness: always succeeds while the process is up.
async fn lbheartbeat() -> StatusCode {
    StatusCode::OK
}

/// Build metadata for deploy tooling.
async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "source": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("SYMSERVER_COMMIT").unwrap_or(""),
    }))
}

/// Builds all service components from the configuration and serves until
/// shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let diskcache = DiskCache::open(
        &config.diskcache_root,
        symserver_symcache::SYMCACHE_VERSION,
        config.diskcache_max_bytes,
        config.diskcache_low_water_bytes,
        config.diskcache_negative_ttl,
    )?;

    let downloader = Arc::new(HttpDownloader::new(&config)?);
    let symbolicator = Symbolicator::new(
        diskcache.clone(),
        downloader,
        config.fetch_concurrency,
        config.request_deadline,
    );

    let state = Arc::new(AppState {
        symbolicator,
        diskcache,
        max_jobs: config.max_jobs,
        max_body_bytes: config.max_body_bytes,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "symserver listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown requested");
}
