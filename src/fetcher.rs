//! # Page Chain Fetcher
//! Walks the linked page chain of every `(source, sort mode)` forward, going
//! through the page cache and only reaching the network on a miss.
//!
//! - Pages are kept per `(source, sort mode)` by page key and never removed;
//!   the chain is whatever is reachable from the current first page key.
//! - A process-wide pending set keyed by `(source, page key)` guarantees at
//!   most one in-flight fetch per page. Late callers wait for the owner and
//!   then read its result from memory or cache.
//! - Every change to a chain is announced on a broadcast channel so feeds can
//!   recompute.

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

use crate::cache::PageCache;
use crate::error::FeedError;
use crate::model::{Page, Post, SortMode, SourceListing};
use crate::providers::{NoopCorrelator, PageProvider, PublicationCorrelator};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("page_fetch_total", "Pages requested from a page provider.");
        describe_counter!("page_fetch_errors_total", "Page provider failures.");
        describe_counter!(
            "page_fetch_deduped_total",
            "Page loads that waited on an in-flight fetch instead of starting one."
        );
    });
}

/// Mutation notification for chain consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    PagesChanged { source_id: String, sort_mode: SortMode },
}

/// What is currently known about one source's chain for one sort mode.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainSnapshot {
    /// No listing has been seen for the source.
    Unlisted,
    /// The listing has no first page for this sort mode.
    Unsorted,
    Pages { pages: Vec<Page>, exhausted: bool },
}

impl ChainSnapshot {
    pub fn pages(&self) -> &[Page] {
        match self {
            ChainSnapshot::Pages { pages, .. } => pages,
            _ => &[],
        }
    }
}

#[derive(Debug, Default)]
struct SourceSortState {
    first_page_key: Option<String>,
    pages: HashMap<String, Page>,
}

impl SourceSortState {
    fn chain(&self) -> Vec<&Page> {
        let mut out = Vec::new();
        let mut next = self.first_page_key.as_deref();
        while let Some(key) = next {
            let Some(page) = self.pages.get(key) else { break };
            if out.len() == self.pages.len() {
                break;
            }
            out.push(page);
            next = page.next_page_key.as_deref();
        }
        out
    }

    /// Key of the first page not loaded yet, or `None` when the chain is
    /// exhausted (or loops back on itself).
    fn next_missing(&self) -> Option<String> {
        let chain = self.chain();
        let next = match chain.last() {
            None => self.first_page_key.as_ref(),
            Some(last) => last.next_page_key.as_ref(),
        }?;
        if self.pages.contains_key(next) {
            tracing::warn!(target: "fetcher", page_key = %next, "page chain loops, treating as exhausted");
            return None;
        }
        Some(next.clone())
    }
}

/// Result of an in-flight page load as seen by waiters.
#[derive(Debug, Clone, Default)]
enum Landed {
    #[default]
    Pending,
    Page(Page),
    Failed,
}

type PendingKey = (String, String);
type PendingMap = Mutex<HashMap<PendingKey, watch::Receiver<Landed>>>;

struct PendingGuard<'a> {
    pending: &'a PendingMap,
    key: PendingKey,
    done: watch::Sender<Landed>,
}

impl PendingGuard<'_> {
    fn publish(&self, page: &Page) {
        self.done.send_replace(Landed::Page(page.clone()));
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.done.send_if_modified(|landed| {
            if matches!(landed, Landed::Pending) {
                *landed = Landed::Failed;
                return true;
            }
            false
        });
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(&self.key);
    }
}

enum Claim<'a> {
    Owner(PendingGuard<'a>),
    Waiter(watch::Receiver<Landed>),
}

pub struct PageChainFetcher {
    pages: Arc<dyn PageProvider>,
    cache: Arc<PageCache>,
    correlator: Arc<dyn PublicationCorrelator>,
    states: Mutex<HashMap<(String, SortMode), SourceSortState>>,
    pending: PendingMap,
    events: broadcast::Sender<StoreEvent>,
}

impl PageChainFetcher {
    pub fn new(pages: Arc<dyn PageProvider>, cache: Arc<PageCache>) -> Self {
        ensure_metrics_described();
        let (events, _) = broadcast::channel(256);
        Self {
            pages,
            cache,
            correlator: Arc::new(NoopCorrelator),
            states: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn with_correlator(mut self, correlator: Arc<dyn PublicationCorrelator>) -> Self {
        self.correlator = correlator;
        self
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Record the listing of a source for `sort`. A changed first page key
    /// re-roots the chain; an embedded first page is taken as is, without a
    /// fetch and without a cache write. Returns whether the chain changed.
    pub fn apply_listing(&self, listing: &SourceListing, sort: SortMode) -> bool {
        let first = listing.first_page_keys.get(&sort).cloned();
        let mut changed = false;
        {
            let mut states = self.states.lock().expect("states mutex poisoned");
            let st = states
                .entry((listing.source_id.clone(), sort))
                .or_insert_with(|| {
                    changed = true;
                    SourceSortState::default()
                });
            if st.first_page_key != first {
                if st.first_page_key.is_some() {
                    tracing::debug!(target: "fetcher", source_id = %listing.source_id, %sort, "first page key changed");
                }
                st.first_page_key = first.clone();
                changed = true;
            }
            if let (Some(key), Some(page)) = (first, listing.preloaded_pages.get(&sort)) {
                if !st.pages.contains_key(&key) {
                    st.pages.insert(key, page.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.emit(&listing.source_id, sort);
        }
        changed
    }

    pub fn snapshot(&self, source_id: &str, sort: SortMode) -> ChainSnapshot {
        let states = self.states.lock().expect("states mutex poisoned");
        let Some(st) = states.get(&(source_id.to_string(), sort)) else {
            return ChainSnapshot::Unlisted;
        };
        if st.first_page_key.is_none() {
            return ChainSnapshot::Unsorted;
        }
        let chain = st.chain();
        let exhausted = chain.last().is_some_and(|p| p.next_page_key.is_none());
        ChainSnapshot::Pages {
            pages: chain.into_iter().cloned().collect(),
            exhausted,
        }
    }

    /// Loaded pages of the chain, in chain order.
    pub fn chain(&self, source_id: &str, sort: SortMode) -> Vec<Page> {
        self.snapshot(source_id, sort).pages().to_vec()
    }

    /// Load pages along the chain until it has `min_depth` pages or ends.
    /// Without a listing this is a no-op. A failed fetch stops the walk and
    /// leaves the page free to be retried by a later call.
    pub async fn ensure_pages(
        &self,
        source_id: &str,
        sort: SortMode,
        min_depth: usize,
    ) -> Result<(), FeedError> {
        loop {
            let next = {
                let states = self.states.lock().expect("states mutex poisoned");
                let Some(st) = states.get(&(source_id.to_string(), sort)) else {
                    tracing::debug!(target: "fetcher", %source_id, %sort, "source not ready");
                    return Ok(());
                };
                if st.chain().len() >= min_depth {
                    return Ok(());
                }
                match st.next_missing() {
                    Some(key) => key,
                    None => return Ok(()),
                }
            };
            self.load_page(source_id, sort, &next).await?;
        }
    }

    /// Forget every chain. Cached pages stay.
    pub fn reset(&self) {
        self.states.lock().expect("states mutex poisoned").clear();
        tracing::info!(target: "fetcher", "source state reset");
    }

    pub async fn reset_with_cache(&self) {
        self.reset();
        self.cache.clear().await;
    }

    fn claim(&self, key: PendingKey) -> Claim<'_> {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        if let Some(rx) = pending.get(&key) {
            return Claim::Waiter(rx.clone());
        }
        let (done, rx) = watch::channel(Landed::Pending);
        pending.insert(key.clone(), rx);
        Claim::Owner(PendingGuard {
            pending: &self.pending,
            key,
            done,
        })
    }

    async fn load_page(&self, source_id: &str, sort: SortMode, page_key: &str) -> Result<(), FeedError> {
        match self.claim((source_id.to_string(), page_key.to_string())) {
            Claim::Waiter(mut rx) => {
                counter!("page_fetch_deduped_total").increment(1);
                let landed = match rx.wait_for(|l| !matches!(l, Landed::Pending)).await {
                    Ok(l) => (*l).clone(),
                    Err(_) => Landed::Failed,
                };
                if self.has_page(source_id, sort, page_key) {
                    return Ok(());
                }
                // the owner may have loaded it for another sort mode
                let page = match landed {
                    Landed::Page(page) => Some(page),
                    _ => self.cache.get(page_key).await,
                };
                match page {
                    Some(page) => {
                        self.insert_page(source_id, sort, page_key, page);
                        Ok(())
                    }
                    None => Err(FeedError::PageFetchFailed {
                        source_id: source_id.to_string(),
                        page_key: page_key.to_string(),
                        reason: "in-flight fetch did not produce the page".into(),
                    }),
                }
            }
            Claim::Owner(guard) => {
                if let Some(page) = self.loaded_page(source_id, sort, page_key) {
                    guard.publish(&page);
                    return Ok(());
                }
                let page = match self.cache.get(page_key).await {
                    Some(page) => page,
                    None => self.fetch_remote(source_id, page_key).await?,
                };
                guard.publish(&page);
                self.insert_page(source_id, sort, page_key, page);
                Ok(())
            }
        }
    }

    async fn fetch_remote(&self, source_id: &str, page_key: &str) -> Result<Page, FeedError> {
        counter!("page_fetch_total").increment(1);
        let page = match self.pages.fetch_page(source_id, page_key).await {
            Ok(page) => page,
            Err(e) => {
                counter!("page_fetch_errors_total").increment(1);
                tracing::warn!(target: "fetcher", %source_id, %page_key, error = ?e, "page fetch failed");
                return Err(FeedError::PageFetchFailed {
                    source_id: source_id.to_string(),
                    page_key: page_key.to_string(),
                    reason: format!("{e:#}"),
                });
            }
        };
        tracing::debug!(target: "fetcher", %source_id, %page_key, items = page.items.len(), "page fetched");
        if let Err(e) = self.cache.set(page_key, &page).await {
            tracing::debug!(target: "fetcher", %page_key, error = %e, "page not cached");
        }
        self.report_local_posts(&page);
        Ok(page)
    }

    fn report_local_posts(&self, page: &Page) {
        let local: Vec<Post> = page
            .items
            .iter()
            .filter(|p| self.correlator.is_local(p))
            .cloned()
            .collect();
        if local.is_empty() {
            return;
        }
        let correlator = self.correlator.clone();
        tokio::spawn(async move {
            if let Err(e) = correlator.correlate(local).await {
                tracing::warn!(target: "fetcher", error = ?e, "publication correlation failed");
            }
        });
    }

    fn loaded_page(&self, source_id: &str, sort: SortMode, page_key: &str) -> Option<Page> {
        self.states
            .lock()
            .expect("states mutex poisoned")
            .get(&(source_id.to_string(), sort))
            .and_then(|st| st.pages.get(page_key).cloned())
    }

    fn has_page(&self, source_id: &str, sort: SortMode, page_key: &str) -> bool {
        self.states
            .lock()
            .expect("states mutex poisoned")
            .get(&(source_id.to_string(), sort))
            .is_some_and(|st| st.pages.contains_key(page_key))
    }

    fn insert_page(&self, source_id: &str, sort: SortMode, page_key: &str, page: Page) {
        self.states
            .lock()
            .expect("states mutex poisoned")
            .entry((source_id.to_string(), sort))
            .or_default()
            .pages
            .entry(page_key.to_string())
            .or_insert(page);
        self.emit(source_id, sort);
    }

    fn emit(&self, source_id: &str, sort: SortMode) {
        // no subscribers is fine
        let _ = self.events.send(StoreEvent::PagesChanged {
            source_id: source_id.to_string(),
            sort_mode: sort,
        });
    }
}
