use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::error::FeedError;
use crate::feeds::FeedsService;
use crate::metrics::Metrics;
use crate::model::{FeedDefinition, FeedKey, Post, SortMode};

#[derive(Clone)]
pub struct AppState {
    pub feeds: Arc<FeedsService>,
    pub page_size: usize,
    pub buffer_low_water_mark: usize,
}

pub fn create_router(state: AppState, metrics: &Metrics) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/feeds", post(declare_feed))
        .route("/feeds/{feed_id}", get(read_feed))
        .route("/feeds/{feed_id}/more", post(request_more))
        .route("/feeds/{feed_id}/buffered", get(read_buffered))
        .route("/feeds/{feed_id}/errors", get(read_errors))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
        .merge(metrics.router())
}

struct ApiError(FeedError);

impl From<FeedError> for ApiError {
    fn from(e: FeedError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FeedError::InvalidSortMode(_) => StatusCode::BAD_REQUEST,
            FeedError::UnknownFeed { .. } => StatusCode::NOT_FOUND,
            FeedError::NotReady { .. } | FeedError::CacheSizeConflict { .. } => StatusCode::CONFLICT,
            FeedError::SourceNotReady { .. } | FeedError::PageFetchFailed { .. } => StatusCode::BAD_GATEWAY,
            FeedError::CacheWriteFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[derive(serde::Deserialize)]
struct DeclareReq {
    account_id: String,
    source_ids: Vec<String>,
    #[serde(default)]
    sort_mode: Option<String>,
    #[serde(default)]
    page_size: Option<usize>,
    /// prefetch only, nothing gets loaded
    #[serde(default)]
    buffered: bool,
}

#[derive(serde::Serialize)]
struct DeclareResp {
    feed_id: String,
}

async fn declare_feed(
    State(state): State<AppState>,
    Json(body): Json<DeclareReq>,
) -> Result<Json<DeclareResp>, ApiError> {
    let sort = match body.sort_mode.as_deref() {
        Some(raw) => raw.parse::<SortMode>()?,
        None => SortMode::default(),
    };
    let page_size = body.page_size.unwrap_or(state.page_size).max(1);
    let key = FeedKey::new(body.account_id, sort, body.source_ids, page_size);
    let def = FeedDefinition::new(key, state.buffer_low_water_mark);

    let key = if body.buffered {
        state.feeds.declare_buffered_feed(def)
    } else {
        state.feeds.declare_feed(def)
    };
    let feed_id = key.feed_id();
    tracing::info!(target: "api", %feed_id, feed = %key, "feed declared");

    let feeds = state.feeds.clone();
    tokio::spawn(async move {
        if let Err(e) = feeds.sync(&key).await {
            tracing::warn!(target: "api", error = %e, "initial sync failed");
        }
    });
    Ok(Json(DeclareResp { feed_id }))
}

fn resolve(state: &AppState, feed_id: &str) -> Result<FeedKey, ApiError> {
    state.feeds.key_for_id(feed_id).ok_or_else(|| {
        ApiError(FeedError::UnknownFeed {
            feed: feed_id.to_string(),
        })
    })
}

async fn request_more(
    State(state): State<AppState>,
    Path(feed_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = resolve(&state, &feed_id)?;
    state.feeds.request_more(&key)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Serialize)]
struct FeedView {
    items: Vec<Post>,
    has_more: bool,
    /// "succeeded" once nothing more can load, else "fetching"
    state: &'static str,
}

async fn read_feed(
    State(state): State<AppState>,
    Path(feed_id): Path<String>,
) -> Result<Json<FeedView>, ApiError> {
    let key = resolve(&state, &feed_id)?;
    let items = state.feeds.current_items(&key)?;
    let has_more = state.feeds.has_more(&key)?;
    Ok(Json(FeedView {
        items,
        has_more,
        state: if has_more { "fetching" } else { "succeeded" },
    }))
}

async fn read_buffered(
    State(state): State<AppState>,
    Path(feed_id): Path<String>,
) -> Result<Json<Vec<Post>>, ApiError> {
    let key = resolve(&state, &feed_id)?;
    Ok(Json(state.feeds.buffered_feed(&key)?))
}

async fn read_errors(
    State(state): State<AppState>,
    Path(feed_id): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let key = resolve(&state, &feed_id)?;
    Ok(Json(state.feeds.errors(&key).iter().map(ToString::to_string).collect()))
}
