//! Downloader tests against local stub symbol stores.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use symserver_common::ModuleKey;
use symserver_service::config::Config;
use symserver_service::downloader::{DownloadError, HttpDownloader, ObjectDownloader};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn config(symbol_urls: Vec<String>, retries: u32, timeout: Duration) -> Config {
    Config {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        symbol_urls,
        diskcache_root: PathBuf::from("/nonexistent"),
        diskcache_max_bytes: 0,
        diskcache_low_water_bytes: 0,
        diskcache_negative_ttl: Duration::ZERO,
        downloader_timeout: timeout,
        downloader_retries: retries,
        downloader_module_budget: Duration::from_secs(10),
        max_jobs: 10,
        max_body_bytes: 1024 * 1024,
        request_deadline: Duration::from_secs(10),
        fetch_concurrency: 4,
        statsd_addr: None,
    }
}

fn module() -> ModuleKey {
    ModuleKey::new("xul.pdb", "44E4EC8C2F41492B9369D6B9A059577C2").unwrap()
}

#[tokio::test]
async fn downloads_from_the_first_source() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/:file/:id/:sym",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "MODULE Linux x86_64 44E4EC8C2F41492B9369D6B9A059577C2 xul.pdb\n"
            }),
        )
        .with_state(hits.clone());
    let source = serve(app).await;

    let downloader =
        HttpDownloader::new(&config(vec![source], 3, Duration::from_secs(2))).unwrap();
    let bytes = downloader.download(&module()).await.unwrap();

    assert!(bytes.starts_with(b"MODULE "));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn requests_the_expected_sym_path() {
    let app = Router::new().route(
        "/xul.pdb/44E4EC8C2F41492B9369D6B9A059577C2/xul.sym",
        get(|| async { "sym body" }),
    );
    let source = serve(app).await;

    let downloader =
        HttpDownloader::new(&config(vec![source], 0, Duration::from_secs(2))).unwrap();
    let bytes = downloader.download(&module()).await.unwrap();
    assert_eq!(bytes, b"sym body");
}

#[tokio::test]
async fn falls_through_404_to_the_next_source() {
    let first_hits = Arc::new(AtomicUsize::new(0));
    let first = Router::new()
        .route(
            "/:file/:id/:sym",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::NOT_FOUND
            }),
        )
        .with_state(first_hits.clone());
    let second = Router::new().route("/:file/:id/:sym", get(|| async { "from second" }));

    let sources = vec![serve(first).await, serve(second).await];
    let downloader = HttpDownloader::new(&config(sources, 3, Duration::from_secs(2))).unwrap();

    let bytes = downloader.download(&module()).await.unwrap();
    assert_eq!(bytes, b"from second");
    // A 404 advances immediately, without retries.
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn not_found_when_all_sources_miss() {
    let app = Router::new().route("/:file/:id/:sym", get(|| async { StatusCode::NOT_FOUND }));
    let sources = vec![serve(app.clone()).await, serve(app).await];

    let downloader = HttpDownloader::new(&config(sources, 3, Duration::from_secs(2))).unwrap();
    let error = downloader.download(&module()).await.unwrap_err();
    assert!(matches!(error, DownloadError::NotFound));
}

#[tokio::test]
async fn retries_server_errors_until_success() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/:file/:id/:sym",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StatusCode::INTERNAL_SERVER_ERROR)
                } else {
                    Ok("recovered")
                }
            }),
        )
        .with_state(hits.clone());
    let source = serve(app).await;

    let downloader =
        HttpDownloader::new(&config(vec![source], 3, Duration::from_secs(2))).unwrap();
    let bytes = downloader.download(&module()).await.unwrap();

    assert_eq!(bytes, b"recovered");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transient_error_after_exhausting_retries() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/:file/:id/:sym",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::BAD_GATEWAY
            }),
        )
        .with_state(hits.clone());
    let source = serve(app).await;

    let downloader =
        HttpDownloader::new(&config(vec![source], 2, Duration::from_secs(2))).unwrap();
    let error = downloader.download(&module()).await.unwrap_err();

    assert!(matches!(error, DownloadError::Transient(_)));
    // the first attempt plus two retries
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transient_beats_not_found_across_sources() {
    let failing = Router::new().route(
        "/:file/:id/:sym",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let missing = Router::new().route("/:file/:id/:sym", get(|| async { StatusCode::NOT_FOUND }));

    let sources = vec![serve(failing).await, serve(missing).await];
    let downloader = HttpDownloader::new(&config(sources, 0, Duration::from_secs(2))).unwrap();

    let error = downloader.download(&module()).await.unwrap_err();
    assert!(matches!(error, DownloadError::Transient(_)));
}

#[tokio::test]
async fn slow_responses_time_out_as_transient() {
    let app = Router::new().route(
        "/:file/:id/:sym",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "too late"
        }),
    );
    let source = serve(app).await;

    let downloader =
        HttpDownloader::new(&config(vec![source], 0, Duration::from_millis(200))).unwrap();
    let error = downloader.download(&module()).await.unwrap_err();
    assert!(matches!(error, DownloadError::Transient(_)));
}
