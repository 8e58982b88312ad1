use thiserror::Error;

/// Errors of the feed engine.
///
/// Only `InvalidSortMode`, `NotReady`, `UnknownFeed` and `CacheSizeConflict`
/// ever reach a consumer; the transient fetch/cache variants are logged and
/// absorbed where they happen.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("sort mode '{0}' doesn't exist")]
    InvalidSortMode(String),

    #[error("source '{source_id}' has no listing yet")]
    SourceNotReady { source_id: String },

    #[error("fetching page '{page_key}' of source '{source_id}' failed: {reason}")]
    PageFetchFailed {
        source_id: String,
        page_key: String,
        reason: String,
    },

    #[error("cache write for '{key}' failed: {reason}")]
    CacheWriteFailed { key: String, reason: String },

    #[error("feed '{feed}' cannot load more before its first page has loaded")]
    NotReady { feed: String },

    #[error("feed '{feed}' was never declared")]
    UnknownFeed { feed: String },

    #[error("cache '{name}' already exists with another size")]
    CacheSizeConflict { name: String },
}

/// Raised by a persistence substrate that has run out of room.
#[derive(Debug, Clone, Error)]
#[error("storage quota has been exceeded")]
pub struct QuotaExceeded;
