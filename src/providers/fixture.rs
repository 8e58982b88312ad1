// src/providers/fixture.rs
//! In-memory sources for tests and demos. Every page fetch is counted so
//! callers can assert how much network traffic a scenario caused.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::{ListingProvider, PageProvider, PublicationCorrelator};
use crate::model::{Page, Post, SortMode, SourceListing};

#[derive(Default)]
pub struct FixtureSources {
    listings: Mutex<HashMap<String, SourceListing>>,
    pages: Mutex<HashMap<(String, String), Page>>,
    failing: Mutex<HashSet<String>>,
    fetches: Mutex<Vec<(String, String)>>,
    latency: Option<Duration>,
}

impl FixtureSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every page fetch, to widen race windows in tests.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn set_listing(&self, listing: SourceListing) {
        self.listings
            .lock()
            .expect("fixture mutex poisoned")
            .insert(listing.source_id.clone(), listing);
    }

    pub fn add_page(&self, source_id: &str, page_key: &str, page: Page) {
        self.pages
            .lock()
            .expect("fixture mutex poisoned")
            .insert((source_id.to_string(), page_key.to_string()), page);
    }

    /// Build a chain `<source>-<sort>-1 .. -n` where every page holds
    /// `per_page` posts with descending timestamps, and list its first key.
    pub fn add_chain(&self, source_id: &str, sort: SortMode, pages: usize, per_page: usize) {
        let key = |i: usize| format!("{source_id}-{sort}-{i}");
        let total = (pages * per_page) as i64;
        for i in 1..=pages {
            let items = (0..per_page)
                .map(|j| {
                    let n = ((i - 1) * per_page + j) as i64;
                    Post::new(format!("{source_id}-{}", n + 1), source_id, total - n)
                })
                .collect();
            let next = (i < pages).then(|| key(i + 1));
            self.add_page(source_id, &key(i), Page::new(items, next));
        }
        let mut listings = self.listings.lock().expect("fixture mutex poisoned");
        listings
            .entry(source_id.to_string())
            .or_insert_with(|| SourceListing::new(source_id))
            .first_page_keys
            .insert(sort, key(1));
    }

    pub fn fail_page(&self, page_key: &str) {
        self.failing
            .lock()
            .expect("fixture mutex poisoned")
            .insert(page_key.to_string());
    }

    pub fn heal_page(&self, page_key: &str) {
        self.failing
            .lock()
            .expect("fixture mutex poisoned")
            .remove(page_key);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().expect("fixture mutex poisoned").len()
    }

    pub fn fetches_of(&self, page_key: &str) -> usize {
        self.fetches
            .lock()
            .expect("fixture mutex poisoned")
            .iter()
            .filter(|(_, k)| k == page_key)
            .count()
    }
}

#[async_trait]
impl ListingProvider for FixtureSources {
    async fn listing(&self, source_id: &str) -> Result<Option<SourceListing>> {
        Ok(self
            .listings
            .lock()
            .expect("fixture mutex poisoned")
            .get(source_id)
            .cloned())
    }
}

#[async_trait]
impl PageProvider for FixtureSources {
    async fn fetch_page(&self, source_id: &str, page_key: &str) -> Result<Page> {
        self.fetches
            .lock()
            .expect("fixture mutex poisoned")
            .push((source_id.to_string(), page_key.to_string()));
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
        if self
            .failing
            .lock()
            .expect("fixture mutex poisoned")
            .contains(page_key)
        {
            return Err(anyhow!("page '{page_key}' unavailable"));
        }
        self.pages
            .lock()
            .expect("fixture mutex poisoned")
            .get(&(source_id.to_string(), page_key.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("no page '{page_key}' for source '{source_id}'"))
    }
}

/// Records posts authored by one of `authors`.
#[derive(Default)]
pub struct RecordingCorrelator {
    authors: HashSet<String>,
    pub seen: Mutex<Vec<Post>>,
}

impl RecordingCorrelator {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(authors: I) -> Self {
        Self {
            authors: authors.into_iter().map(Into::into).collect(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen_ids(&self) -> Vec<String> {
        self.seen
            .lock()
            .expect("correlator mutex poisoned")
            .iter()
            .map(|p| p.id.clone())
            .collect()
    }
}

#[async_trait]
impl PublicationCorrelator for RecordingCorrelator {
    fn is_local(&self, post: &Post) -> bool {
        post.author
            .as_deref()
            .is_some_and(|a| self.authors.contains(a))
    }

    async fn correlate(&self, posts: Vec<Post>) -> Result<()> {
        self.seen
            .lock()
            .expect("correlator mutex poisoned")
            .extend(posts);
        Ok(())
    }
}
