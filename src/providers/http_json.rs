// src/providers/http_json.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;

use super::{ListingProvider, PageProvider};
use crate::model::{Page, SourceListing};

/// Reads listings and pages from a JSON endpoint:
/// `GET {base}/sources/{id}/listing` and `GET {base}/sources/{id}/pages/{key}`.
/// A 404 on the listing means the source hasn't resolved yet.
#[derive(Clone)]
pub struct HttpJsonProvider {
    base_url: Url,
    client: Client,
    timeout: Duration,
}

impl HttpJsonProvider {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("invalid provider base url '{base_url}'"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("provider base url '{base_url}' cannot hold a path"));
        }
        Ok(Self {
            base_url,
            client: Client::new(),
            timeout: Duration::from_secs(10),
        })
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// `{base}/sources/{id}/...`, every segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("sources").extend(segments);
        }
        url
    }

    fn listing_url(&self, source_id: &str) -> Url {
        self.url(&[source_id, "listing"])
    }

    fn page_url(&self, source_id: &str, page_key: &str) -> Url {
        self.url(&[source_id, "pages", page_key])
    }
}

#[async_trait]
impl ListingProvider for HttpJsonProvider {
    async fn listing(&self, source_id: &str) -> Result<Option<SourceListing>> {
        let url = self.listing_url(source_id);
        let resp = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("listing http get {url}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let listing = resp
            .error_for_status()
            .with_context(|| format!("listing status {url}"))?
            .json::<SourceListing>()
            .await
            .with_context(|| format!("decoding listing {url}"))?;
        Ok(Some(listing))
    }
}

#[async_trait]
impl PageProvider for HttpJsonProvider {
    async fn fetch_page(&self, source_id: &str, page_key: &str) -> Result<Page> {
        let url = self.page_url(source_id, page_key);
        self.client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("page http get {url}"))?
            .error_for_status()
            .with_context(|| format!("page status {url}"))?
            .json::<Page>()
            .await
            .with_context(|| format!("decoding page {url}"))
    }
}
