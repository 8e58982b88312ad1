// src/providers/mod.rs
//! External collaborators of the feed engine: listing metadata, page fetches
//! and correlation of locally published posts.

pub mod fixture;
pub mod http_json;

use anyhow::Result;

use crate::model::{Page, Post, SourceListing};

/// Current listing metadata of a source.
#[async_trait::async_trait]
pub trait ListingProvider: Send + Sync {
    /// `Ok(None)` while the source hasn't resolved yet.
    async fn listing(&self, source_id: &str) -> Result<Option<SourceListing>>;
}

/// Fetches one page of a source by key.
#[async_trait::async_trait]
pub trait PageProvider: Send + Sync {
    async fn fetch_page(&self, source_id: &str, page_key: &str) -> Result<Page>;
}

/// Receives newly fetched posts written by the local user, so pending local
/// publications can learn their ids. Fire-and-forget.
#[async_trait::async_trait]
pub trait PublicationCorrelator: Send + Sync {
    fn is_local(&self, post: &Post) -> bool;
    async fn correlate(&self, posts: Vec<Post>) -> Result<()>;
}

/// Correlator for deployments without local publishing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCorrelator;

#[async_trait::async_trait]
impl PublicationCorrelator for NoopCorrelator {
    fn is_local(&self, _post: &Post) -> bool {
        false
    }

    async fn correlate(&self, _posts: Vec<Post>) -> Result<()> {
        Ok(())
    }
}
