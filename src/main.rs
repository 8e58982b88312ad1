//! Community Feed Service: binary entrypoint.
//! Boots the Axum HTTP server: configuration, page cache, source providers,
//! the background feed driver and the routes.

use shuttle_axum::ShuttleAxum;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use community_feed::api::{create_router, AppState};
use community_feed::config::FeedsConfig;
use community_feed::feeds::FeedsService;
use community_feed::metrics::Metrics;
use community_feed::providers::fixture::FixtureSources;
use community_feed::providers::http_json::HttpJsonProvider;
use community_feed::providers::{ListingProvider, PageProvider};

/// Compact tracing logs, enabled with FEEDS_LOG=1.
/// The filter comes from RUST_LOG, defaulting to feed targets at info.
fn enable_tracing() {
    let on = std::env::var("FEEDS_LOG").ok().is_some_and(|v| v == "1");
    if !on {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feeds=info,fetcher=info,cache=info,api=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    enable_tracing();

    let cfg = FeedsConfig::load_default()?;
    let metrics = Metrics::init(&cfg)?;

    let (listings, pages): (Arc<dyn ListingProvider>, Arc<dyn PageProvider>) =
        match cfg.provider.base_url.as_deref() {
            Some(url) => {
                let http = Arc::new(HttpJsonProvider::new(url)?.with_timeout(cfg.provider.timeout_secs));
                (http.clone() as Arc<dyn ListingProvider>, http as Arc<dyn PageProvider>)
            }
            None => {
                tracing::warn!("provider.base_url not set, serving without remote sources");
                let empty = Arc::new(FixtureSources::new());
                (empty.clone() as Arc<dyn ListingProvider>, empty as Arc<dyn PageProvider>)
            }
        };

    let feeds = FeedsService::from_config(&cfg, listings, pages)
        .await
        .map_err(anyhow::Error::from)?;
    let feeds = Arc::new(feeds);
    feeds
        .clone()
        .spawn_driver(Duration::from_secs(cfg.sync_interval_secs.max(1)));

    let state = AppState {
        feeds,
        page_size: cfg.page_size,
        buffer_low_water_mark: cfg.buffer_low_water_mark,
    };
    let router = create_router(state, &metrics);

    Ok(router.into())
}
