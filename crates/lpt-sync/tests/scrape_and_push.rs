use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{response::Html, routing::get, Router};
use chrono::Utc;
use lpt_core::ListingQuery;
use lpt_storage::{ListingStore, MemoryListingStore};
use lpt_sync::{IngestClient, IngestClientError, SyncConfig, SyncPipeline};
use lpt_web::AppState;
use tokio::net::TcpListener;

const PAGE: &str = r#"
<html><body>
  <article class="listing" data-id="r-1">
    <h2>Corner Flat</h2><span class="price">$310,000</span><span class="area">Old Town</span>
    <a href="/homes/r-1">view</a>
  </article>
  <article class="listing" data-id="r-2">
    <h2>Terrace House</h2><span class="price">$520,000</span><span class="area">Hillside</span>
  </article>
</body></html>
"#;

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn spawn_api(store: Arc<MemoryListingStore>, secret: Option<&str>) -> SocketAddr {
    let state = AppState::new(store).with_ingest_secret(secret.map(str::to_string));
    spawn(lpt_web::app(state)).await
}

fn config(page: SocketAddr, api: Option<SocketAddr>, secret: Option<&str>) -> SyncConfig {
    SyncConfig {
        api_ingest_url: api.map(|addr| format!("http://{addr}")),
        api_ingest_secret: secret.map(str::to_string),
        scrape_base_url: format!("http://{page}/search"),
        scrape_delay: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn scraped_listings_land_in_the_store() {
    let page = spawn(Router::new().route("/search", get(|| async { Html(PAGE) }))).await;
    let store = Arc::new(MemoryListingStore::new());
    let api = spawn_api(store.clone(), Some("s3cret")).await;

    let pipeline = SyncPipeline::new(config(page, Some(api), Some("s3cret"))).unwrap();
    let summary = pipeline.run_once().await.unwrap();

    assert!(summary.pushed);
    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.inserted, 2);

    let rows = store.list_snapshots(&ListingQuery::default()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.recorded_at == Utc::now().date_naive()));
    assert!(rows
        .iter()
        .any(|r| r.url.as_deref() == Some(&format!("http://{page}/homes/r-1")[..])));
}

#[tokio::test]
async fn missing_ingest_url_is_a_dry_run() {
    let page = spawn(Router::new().route("/search", get(|| async { Html(PAGE) }))).await;

    let summary = SyncPipeline::new(config(page, None, None)).unwrap().run_once().await.unwrap();

    assert!(!summary.pushed);
    assert_eq!(summary.extracted, 2);
    assert_eq!(summary.inserted, 0);
}

#[tokio::test]
async fn empty_page_fails_the_run() {
    let page = spawn(Router::new().route("/search", get(|| async { Html("<p>nothing today</p>") }))).await;

    let err = SyncPipeline::new(config(page, None, None)).unwrap().run_once().await.unwrap_err();
    assert!(format!("{err:#}").contains("no listings extracted"));
}

#[tokio::test]
async fn disallowed_page_is_not_scraped_or_pushed() {
    let page = spawn(
        Router::new()
            .route("/search", get(|| async { Html(PAGE) }))
            .route("/robots.txt", get(|| async { "User-agent: *\nDisallow: /search\n" })),
    )
    .await;
    let store = Arc::new(MemoryListingStore::new());
    let api = spawn_api(store.clone(), None).await;

    let err = SyncPipeline::new(config(page, Some(api), None)).unwrap().run_once().await.unwrap_err();
    assert!(format!("{err:#}").contains("robots.txt disallows"));
    assert_eq!(store.write_count().await, 0);
}

#[tokio::test]
async fn wrong_secret_is_reported_without_retry() {
    let store = Arc::new(MemoryListingStore::new());
    let api = spawn_api(store.clone(), Some("right")).await;
    let client = IngestClient::new(reqwest::Client::new(), &format!("http://{api}/"), Some("wrong".into()));

    let (_dir, path) = write_batch();
    let batch = lpt_sync::load_batch_file(&path).await.unwrap();
    match client.push(&batch).await {
        Err(IngestClientError::Status { status, message }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "Unauthorized");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(store.write_count().await, 0);
}

fn write_batch() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.json");
    std::fs::write(
        &path,
        r#"{"recorded_at":"2026-04-02","listings":[{"source_id":"x","source":"file","title":"From file","price":1}]}"#,
    )
    .unwrap();
    (dir, path)
}
