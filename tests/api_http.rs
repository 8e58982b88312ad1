// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - POST /feeds (valid + invalid sort mode)
// - POST /feeds/{id}/more (unknown, not ready, ok)
// - GET /feeds/{id} and /feeds/{id}/buffered
// - GET /metrics

use std::sync::Arc;

use axum::{
    body::{self, Body},
    Router,
};
use http::{Request, StatusCode};
use serde_json::{json, Value as Json};
use tower::ServiceExt as _; // for `oneshot`

use community_feed::api::{create_router, AppState};
use community_feed::assembler::FeedAssembler;
use community_feed::cache::store::MemoryStoreFactory;
use community_feed::cache::PageCache;
use community_feed::fetcher::PageChainFetcher;
use community_feed::metrics::Metrics;
use community_feed::providers::fixture::FixtureSources;
use community_feed::{FeedsService, SortMode};

const BODY_LIMIT: usize = 1024 * 1024;

async fn test_app(src: Arc<FixtureSources>) -> (Router, Arc<FeedsService>) {
    let cache = Arc::new(PageCache::open("api", 100, &MemoryStoreFactory::new()).await);
    let fetcher = Arc::new(PageChainFetcher::new(src.clone(), cache));
    let feeds = Arc::new(FeedsService::new(fetcher, src, FeedAssembler::default()));
    let state = AppState {
        feeds: feeds.clone(),
        page_size: 5,
        buffer_low_water_mark: 50,
    };
    (create_router(state, &Metrics::detached()), feeds)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Json) {
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, body)
}

fn post_json(uri: &str, payload: Json) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("build POST")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("build GET")
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _) = test_app(Arc::new(FixtureSources::new())).await;
    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn invalid_sort_mode_is_400() {
    let (app, _) = test_app(Arc::new(FixtureSources::new())).await;
    let (status, body) = send(
        &app,
        post_json("/feeds", json!({"account_id": "acc", "source_ids": ["a"], "sort_mode": "best"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap_or_default().contains("best"));
}

#[tokio::test]
async fn unknown_feed_is_404() {
    let (app, _) = test_app(Arc::new(FixtureSources::new())).await;
    let (status, _) = send(&app, post_json("/feeds/deadbeef/more", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, get("/feeds/deadbeef")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn declare_load_and_page_through_a_feed() {
    let src = Arc::new(FixtureSources::new());
    let (app, feeds) = test_app(src.clone()).await;

    let (status, body) = send(
        &app,
        post_json("/feeds", json!({"account_id": "acc", "source_ids": ["a"], "sort_mode": "new"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let feed_id = body["feed_id"].as_str().expect("feed_id").to_string();
    let key = feeds.key_for_id(&feed_id).expect("declared");
    assert_eq!(key.sort_mode, SortMode::New);

    // no listing yet: loading more is premature
    feeds.sync(&key).await.unwrap();
    let (status, _) = send(&app, post_json(&format!("/feeds/{feed_id}/more"), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (_, view) = send(&app, get(&format!("/feeds/{feed_id}"))).await;
    assert_eq!(view["state"], "fetching");

    src.add_chain("a", SortMode::New, 1, 8);
    feeds.sync(&key).await.unwrap();
    let (_, view) = send(&app, get(&format!("/feeds/{feed_id}"))).await;
    assert_eq!(view["items"].as_array().map(Vec::len), Some(5));
    assert_eq!(view["has_more"], true);

    let (status, _) = send(&app, post_json(&format!("/feeds/{feed_id}/more"), json!({}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, view) = send(&app, get(&format!("/feeds/{feed_id}"))).await;
    assert_eq!(view["items"].as_array().map(Vec::len), Some(8));
    assert_eq!(view["has_more"], false);
    assert_eq!(view["state"], "succeeded");

    let (_, buffered) = send(&app, get(&format!("/feeds/{feed_id}/buffered"))).await;
    assert_eq!(buffered, json!([]));
}

#[tokio::test]
async fn default_sort_mode_is_hot() {
    let (app, feeds) = test_app(Arc::new(FixtureSources::new())).await;
    let (_, body) = send(&app, post_json("/feeds", json!({"account_id": "acc", "source_ids": ["b", "a", "b"]}))).await;
    let key = feeds.key_for_id(body["feed_id"].as_str().unwrap()).unwrap();
    assert_eq!(key.sort_mode, SortMode::Hot);
    assert_eq!(key.source_ids.len(), 2);
    assert_eq!(key.page_size, 5);
}

#[tokio::test]
async fn metrics_route_is_mounted() {
    let (app, _) = test_app(Arc::new(FixtureSources::new())).await;
    let resp = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
