//! # Feeds Service
//! Single logical owner of every declared feed: its definition, its loaded
//! window and the last buffered feed computed for it.
//!
//! - `declare_*`, `request_more`, `current_items` and `has_more` are the
//!   consumer operations.
//! - `sync` is the effectful step: refresh listings, run the refill plan,
//!   recompute. Recomputation itself never fetches.
//! - `spawn_driver` recomputes on chain mutations and refreshes listings on a
//!   timer. A timer tick only refills a feed whose low-water check is due:
//!   after a declaration, a window request, a listing change, or growth of
//!   one of its chains since the last refill. A failed fetch alone never
//!   makes a feed due again.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};

use crate::assembler::{FeedAssembler, SourceChain};
use crate::cache::CacheRegistry;
use crate::config::FeedsConfig;
use crate::error::FeedError;
use crate::fetcher::{ChainSnapshot, PageChainFetcher, StoreEvent};
use crate::model::{FeedDefinition, FeedKey, Post, SortMode};
use crate::providers::{ListingProvider, PageProvider};
use crate::ranking::RankingEngine;
use crate::window::LoadedFeedWindow;

/// Errors kept per feed for `errors()`.
const MAX_FEED_ERRORS: usize = 50;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feed_recompute_total", "Buffered feed recomputations.");
        describe_gauge!("feeds_registered", "Feeds currently declared.");
        describe_gauge!("feed_sync_last_run_ts", "Unix ts when feeds were last synced.");
    });
}

struct FeedEntry {
    def: FeedDefinition,
    window: LoadedFeedWindow,
    buffered: Vec<Post>,
    has_more: bool,
    errors: Vec<FeedError>,
    refill_due: bool,
    /// Chain lengths seen by the last refill plan.
    refilled_at: Option<Vec<Option<usize>>>,
}

impl FeedEntry {
    fn record_error(&mut self, e: FeedError) {
        self.errors.push(e);
        if self.errors.len() > MAX_FEED_ERRORS {
            let overflow = self.errors.len() - MAX_FEED_ERRORS;
            self.errors.drain(..overflow);
        }
    }
}

pub struct FeedsService {
    fetcher: Arc<PageChainFetcher>,
    listings: Arc<dyn ListingProvider>,
    assembler: FeedAssembler,
    feeds: Mutex<HashMap<FeedKey, FeedEntry>>,
    by_id: Mutex<HashMap<String, FeedKey>>,
}

impl FeedsService {
    pub fn new(
        fetcher: Arc<PageChainFetcher>,
        listings: Arc<dyn ListingProvider>,
        assembler: FeedAssembler,
    ) -> Self {
        ensure_metrics_described();
        Self {
            fetcher,
            listings,
            assembler,
            feeds: Mutex::new(HashMap::new()),
            by_id: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the named page cache, fetcher and ranking from configuration.
    pub async fn from_config(
        cfg: &FeedsConfig,
        listings: Arc<dyn ListingProvider>,
        pages: Arc<dyn PageProvider>,
    ) -> Result<Self, FeedError> {
        let factory = cfg.cache.store_factory();
        let cache = CacheRegistry::global()
            .open(&cfg.cache.name, Some(cfg.cache.max_entries), factory.as_ref())
            .await?;
        let fetcher = Arc::new(PageChainFetcher::new(pages, cache));
        let assembler = FeedAssembler::new(RankingEngine::new(cfg.ranking));
        Ok(Self::new(fetcher, listings, assembler))
    }

    pub fn fetcher(&self) -> &Arc<PageChainFetcher> {
        &self.fetcher
    }

    /// Register a feed that loads its first page. Declaring a known key is a
    /// no-op, except that a prefetch-only feed gets upgraded.
    pub fn declare_feed(&self, def: FeedDefinition) -> FeedKey {
        self.declare(def, 1)
    }

    /// Register a prefetch-only feed: pages get fetched and ranked but nothing
    /// is loaded until the same key is declared with [`Self::declare_feed`].
    pub fn declare_buffered_feed(&self, def: FeedDefinition) -> FeedKey {
        self.declare(def, 0)
    }

    fn declare(&self, def: FeedDefinition, pages: usize) -> FeedKey {
        let key = def.key.clone();
        {
            let mut feeds = self.feeds.lock().expect("feeds mutex poisoned");
            match feeds.get_mut(&key) {
                Some(entry) => {
                    if pages == 0 || !entry.window.upgrade() {
                        return key;
                    }
                    entry.refill_due = true;
                    tracing::debug!(target: "feeds", feed = %key, "prefetch feed upgraded");
                }
                None => {
                    let window = LoadedFeedWindow::new(def.page_size(), pages);
                    feeds.insert(
                        key.clone(),
                        FeedEntry {
                            def,
                            window,
                            buffered: Vec::new(),
                            has_more: true,
                            errors: Vec::new(),
                            refill_due: true,
                            refilled_at: None,
                        },
                    );
                    gauge!("feeds_registered").set(feeds.len() as f64);
                    self.by_id
                        .lock()
                        .expect("feed ids mutex poisoned")
                        .insert(key.feed_id(), key.clone());
                    tracing::info!(target: "feeds", feed = %key, buffered_only = pages == 0, "feed declared");
                }
            }
        }
        self.recompute(&key);
        key
    }

    /// Ask for one more page of items. Repeated calls while the previous
    /// request is still unsatisfied don't stack up.
    pub fn request_more(&self, key: &FeedKey) -> Result<(), FeedError> {
        {
            let mut feeds = self.feeds.lock().expect("feeds mutex poisoned");
            let entry = feeds.get_mut(key).ok_or_else(|| FeedError::UnknownFeed {
                feed: key.to_string(),
            })?;
            entry.refill_due = true;
            let chains = self.assembler.chains(&entry.def, &self.fetcher);
            if !self.assembler.any_page_loaded(&chains) {
                let e = FeedError::NotReady {
                    feed: key.to_string(),
                };
                entry.record_error(e.clone());
                return Err(e);
            }
            if !entry.window.is_satisfied() {
                tracing::debug!(target: "feeds", feed = %key, "previous request still pending");
                return Ok(());
            }
            entry.window.request_more();
        }
        self.recompute(key);
        Ok(())
    }

    pub fn current_items(&self, key: &FeedKey) -> Result<Vec<Post>, FeedError> {
        self.with_entry(key, |e| e.window.items().to_vec())
    }

    pub fn has_more(&self, key: &FeedKey) -> Result<bool, FeedError> {
        self.with_entry(key, |e| e.has_more)
    }

    pub fn buffered_feed(&self, key: &FeedKey) -> Result<Vec<Post>, FeedError> {
        self.with_entry(key, |e| e.buffered.clone())
    }

    pub fn requested_page_count(&self, key: &FeedKey) -> Result<usize, FeedError> {
        self.with_entry(key, |e| e.window.requested_page_count())
    }

    /// Errors reported for a feed, oldest first.
    pub fn errors(&self, key: &FeedKey) -> Vec<FeedError> {
        self.with_entry(key, |e| e.errors.clone()).unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<FeedKey> {
        self.feeds
            .lock()
            .expect("feeds mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Look a feed up by its hex id.
    pub fn key_for_id(&self, feed_id: &str) -> Option<FeedKey> {
        self.by_id
            .lock()
            .expect("feed ids mutex poisoned")
            .get(feed_id)
            .cloned()
    }

    fn with_entry<R>(&self, key: &FeedKey, f: impl FnOnce(&FeedEntry) -> R) -> Result<R, FeedError> {
        let feeds = self.feeds.lock().expect("feeds mutex poisoned");
        feeds.get(key).map(f).ok_or_else(|| FeedError::UnknownFeed {
            feed: key.to_string(),
        })
    }

    /// Rebuild the buffered feed from the current chains and grow the window
    /// toward its target. Pure apart from updating the entry.
    pub fn recompute(&self, key: &FeedKey) {
        let mut feeds = self.feeds.lock().expect("feeds mutex poisoned");
        if let Some(entry) = feeds.get_mut(key) {
            self.recompute_entry(entry);
        }
    }

    fn recompute_entry(&self, entry: &mut FeedEntry) {
        counter!("feed_recompute_total").increment(1);
        let chains = self.assembler.chains(&entry.def, &self.fetcher);
        let mut buffered =
            self.assembler
                .compute_buffered_feed(&entry.def, &chains, entry.window.loaded_ids());
        let added = entry.window.advance(&buffered);
        if added > 0 {
            let loaded = entry.window.loaded_ids();
            buffered.retain(|p| !loaded.contains(&p.id));
        }
        entry.has_more = self.assembler.compute_has_more(&chains, &buffered);
        entry.buffered = buffered;
    }

    /// Recompute every feed reading `source_id` under `sort`.
    pub fn recompute_source(&self, source_id: &str, sort: SortMode) {
        let mut feeds = self.feeds.lock().expect("feeds mutex poisoned");
        for entry in feeds.values_mut() {
            if entry.def.sort_mode() == sort && entry.def.key.source_ids.contains(source_id) {
                self.recompute_entry(entry);
            }
        }
    }

    pub fn recompute_all(&self) {
        let mut feeds = self.feeds.lock().expect("feeds mutex poisoned");
        for entry in feeds.values_mut() {
            self.recompute_entry(entry);
        }
    }

    /// Refresh listings of the feed's sources, fetch one more page for every
    /// source at or below the low-water mark, then recompute.
    pub async fn sync(&self, key: &FeedKey) -> Result<(), FeedError> {
        self.sync_with(key, true).await
    }

    /// Timer-driven sync: listings are always refreshed, the refill step only
    /// runs when the feed's low-water check is due.
    pub async fn tick(&self, key: &FeedKey) -> Result<(), FeedError> {
        self.sync_with(key, false).await
    }

    async fn sync_with(&self, key: &FeedKey, force_refill: bool) -> Result<(), FeedError> {
        let def = self.with_entry(key, |e| e.def.clone())?;
        let sort = def.sort_mode();

        let mut relisted = false;
        for source_id in def.source_ids() {
            match self.listings.listing(source_id).await {
                Ok(Some(listing)) => relisted |= self.fetcher.apply_listing(&listing, sort),
                Ok(None) => {
                    tracing::debug!(target: "feeds", %source_id, "{}", FeedError::SourceNotReady { source_id: source_id.to_string() })
                }
                Err(e) => tracing::warn!(target: "feeds", %source_id, error = ?e, "listing unavailable"),
            }
        }

        let plan = {
            let mut feeds = self.feeds.lock().expect("feeds mutex poisoned");
            let entry = feeds.get_mut(key).ok_or_else(|| FeedError::UnknownFeed {
                feed: key.to_string(),
            })?;
            self.recompute_entry(entry);
            let chains = self.assembler.chains(&entry.def, &self.fetcher);
            let marks = chain_marks(&chains);
            let grown = entry.refilled_at.as_ref() != Some(&marks);
            let due = std::mem::take(&mut entry.refill_due) || force_refill || relisted || grown;
            if !due {
                return Ok(());
            }
            entry.refilled_at = Some(marks);
            self.assembler.refill_plan(&entry.def, &chains, &entry.buffered)
        };

        let mut tasks = JoinSet::new();
        for req in plan {
            let fetcher = self.fetcher.clone();
            tasks.spawn(async move { fetcher.ensure_pages(&req.source_id, sort, req.min_depth).await });
        }
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(e) => tracing::warn!(target: "feeds", feed = %key, error = ?e, "refill task failed"),
            }
        }

        let mut feeds = self.feeds.lock().expect("feeds mutex poisoned");
        if let Some(entry) = feeds.get_mut(key) {
            for e in failures {
                entry.record_error(e);
            }
            self.recompute_entry(entry);
        }
        Ok(())
    }

    /// [`Self::tick`] every declared feed.
    pub async fn sync_all(&self) {
        for key in self.keys() {
            if let Err(e) = self.tick(&key).await {
                tracing::debug!(target: "feeds", feed = %key, error = %e, "sync skipped");
            }
        }
        gauge!("feed_sync_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
    }

    /// Background loop: recompute on chain mutations, tick every `interval`.
    pub fn spawn_driver(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mut events = self.fetcher.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sync_all().await;
                        tracing::debug!(target: "feeds", feeds = self.keys().len(), "sync tick");
                    }
                    ev = events.recv() => match ev {
                        Ok(StoreEvent::PagesChanged { source_id, sort_mode }) => {
                            self.recompute_source(&source_id, sort_mode);
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::debug!(target: "feeds", skipped = n, "store events lagged");
                            self.recompute_all();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

/// Loaded pages per source, `None` while a source has no first page key.
fn chain_marks(chains: &[SourceChain]) -> Vec<Option<usize>> {
    chains
        .iter()
        .map(|c| match &c.snapshot {
            ChainSnapshot::Pages { pages, .. } => Some(pages.len()),
            _ => None,
        })
        .collect()
}
