// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod assembler;
pub mod cache;
pub mod config;
pub mod error;
pub mod feeds;
pub mod fetcher;
pub mod metrics;
pub mod model;
pub mod providers;
pub mod ranking;
pub mod window;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::error::FeedError;
pub use crate::feeds::FeedsService;
pub use crate::model::{FeedDefinition, FeedFilter, FeedKey, Page, Post, SortMode, SourceListing};
