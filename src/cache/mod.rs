//! # Page Cache
//! Size-bounded, durable page cache approximating LRU with two rotating
//! generations instead of per-entry access times.
//!
//! - Two backing stores `<name>` and `<name>2`. Writes go to the active one.
//! - Reads check the active store first; a hit in the standby store is copied
//!   into the active store (promotion). Plain reads share the generations
//!   lock; promotion, writes and rotation take it exclusively.
//! - When the active store has received `max_entries` new keys, the roles swap
//!   and the new active store is cleared. At most `2 * max_entries` entries
//!   exist, and every value survives at least one full rotation.
//! - A backing store rejecting a write is an advisory cache failure: quota
//!   errors are swallowed, anything else is logged and reported as
//!   [`FeedError::CacheWriteFailed`].

pub mod store;

use metrics::{counter, describe_counter};
use once_cell::sync::{Lazy, OnceCell};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use crate::error::{FeedError, QuotaExceeded};
use crate::model::Page;
use store::{KvStore, StoreFactory};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("page_cache_hits_total", "Page cache reads served from either generation.");
        describe_counter!("page_cache_misses_total", "Page cache reads found in neither generation.");
        describe_counter!("page_cache_rotations_total", "Generation swaps of the page cache.");
        describe_counter!(
            "page_cache_write_errors_total",
            "Writes rejected by the backing store (quota errors included)."
        );
    });
}

struct Generations {
    active: Arc<dyn KvStore>,
    standby: Arc<dyn KvStore>,
    /// Unique keys written to `active` since it was last cleared.
    active_len: usize,
}

/// Two-generation cache of serde values keyed by string.
pub struct TwoGenerationCache<T> {
    name: String,
    max_entries: usize,
    gens: RwLock<Generations>,
    _value: PhantomData<fn() -> T>,
}

/// The cache used for fetched pages.
pub type PageCache = TwoGenerationCache<Page>;

impl<T> TwoGenerationCache<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open both generations. The store holding fewer keys becomes active.
    pub async fn open(name: &str, max_entries: usize, factory: &dyn StoreFactory) -> Self {
        ensure_metrics_described();
        let first = factory.open(name);
        let second = factory.open(&format!("{name}2"));
        let first_len = first.len().await.unwrap_or(0);
        let second_len = second.len().await.unwrap_or(0);

        let gens = if first_len > second_len {
            Generations {
                active: second,
                standby: first,
                active_len: second_len,
            }
        } else {
            Generations {
                active: first,
                standby: second,
                active_len: first_len,
            }
        };
        tracing::debug!(target: "cache", %name, max_entries, active_len = gens.active_len, "page cache opened");

        Self {
            name: name.to_string(),
            max_entries: max_entries.max(1),
            gens: RwLock::new(gens),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        {
            let gens = self.gens.read().await;
            if let Some(v) = read(&*gens.active, key).await {
                counter!("page_cache_hits_total").increment(1);
                return Some(v);
            }
            if self.read_raw(&*gens.standby, key).await.is_none() {
                counter!("page_cache_misses_total").increment(1);
                return None;
            }
        }
        self.promote(key).await
    }

    /// Copy `key` from standby into active. Repeats the lookup under the write
    /// guard, since the entry may have been promoted or overwritten meanwhile.
    async fn promote(&self, key: &str) -> Option<T> {
        let mut gens = self.gens.write().await;
        if let Some(v) = read(&*gens.active, key).await {
            counter!("page_cache_hits_total").increment(1);
            return Some(v);
        }
        let Some(raw) = self.read_raw(&*gens.standby, key).await else {
            counter!("page_cache_misses_total").increment(1);
            return None;
        };
        let value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "cache", cache = %self.name, %key, error = %e, "undecodable cache entry");
                counter!("page_cache_misses_total").increment(1);
                return None;
            }
        };
        counter!("page_cache_hits_total").increment(1);
        if let Err(e) = self.write_new(&mut gens, key, raw).await {
            tracing::warn!(target: "cache", %key, error = %e, "promotion failed");
        }
        Some(value)
    }

    async fn read_raw(&self, store: &dyn KvStore, key: &str) -> Option<String> {
        match store.get_item(key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "cache", cache = %self.name, %key, error = ?e, "standby read failed");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &T) -> Result<(), FeedError> {
        let raw = serde_json::to_string(value).map_err(|e| FeedError::CacheWriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let mut gens = self.gens.write().await;

        let in_active = matches!(gens.active.get_item(key).await, Ok(Some(_)));
        if in_active {
            return gens
                .active
                .set_item(key, raw)
                .await
                .or_else(|e| self.absorb_write_error(key, e));
        }
        self.write_new(&mut gens, key, raw).await
    }

    /// Remove `key` from both generations.
    pub async fn remove(&self, key: &str) {
        let gens = self.gens.write().await;
        for s in [&gens.active, &gens.standby] {
            if let Err(e) = s.remove_item(key).await {
                tracing::warn!(target: "cache", cache = %self.name, %key, error = ?e, "remove failed");
            }
        }
    }

    pub async fn clear(&self) {
        let mut gens = self.gens.write().await;
        for s in [&gens.active, &gens.standby] {
            if let Err(e) = s.clear().await {
                tracing::warn!(target: "cache", cache = %self.name, error = ?e, "clear failed");
            }
        }
        gens.active_len = 0;
    }

    /// Unique keys across both generations.
    pub async fn keys(&self) -> Vec<String> {
        let gens = self.gens.read().await;
        let mut out = BTreeSet::new();
        for s in [&gens.active, &gens.standby] {
            match s.keys().await {
                Ok(keys) => out.extend(keys),
                Err(e) => {
                    tracing::warn!(target: "cache", cache = %self.name, error = ?e, "listing keys failed")
                }
            }
        }
        out.into_iter().collect()
    }

    /// Write a key not yet counted in the active generation, rotating when full.
    async fn write_new(&self, gens: &mut Generations, key: &str, raw: String) -> Result<(), FeedError> {
        if let Err(e) = gens.active.set_item(key, raw).await {
            return self.absorb_write_error(key, e);
        }
        gens.active_len += 1;
        if gens.active_len >= self.max_entries {
            std::mem::swap(&mut gens.active, &mut gens.standby);
            gens.active_len = 0;
            if let Err(e) = gens.active.clear().await {
                tracing::warn!(target: "cache", cache = %self.name, error = ?e, "clearing new generation failed");
            }
            counter!("page_cache_rotations_total").increment(1);
            tracing::debug!(target: "cache", cache = %self.name, "generations rotated");
        }
        Ok(())
    }

    fn absorb_write_error(&self, key: &str, e: anyhow::Error) -> Result<(), FeedError> {
        counter!("page_cache_write_errors_total").increment(1);
        if e.downcast_ref::<QuotaExceeded>().is_some() {
            tracing::debug!(target: "cache", cache = %self.name, %key, "quota exceeded, entry not persisted");
            return Ok(());
        }
        tracing::warn!(target: "cache", cache = %self.name, %key, error = ?e, "cache write failed");
        Err(FeedError::CacheWriteFailed {
            key: key.to_string(),
            reason: format!("{e:#}"),
        })
    }
}

async fn read<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Option<T> {
    match store.get_item(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(target: "cache", %key, error = %e, "undecodable cache entry");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(target: "cache", %key, error = ?e, "active read failed");
            None
        }
    }
}

/// Process-wide page caches by name. A name keeps its size for the lifetime of
/// the registry.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<HashMap<String, Arc<PageCache>>>,
}

static GLOBAL_REGISTRY: Lazy<CacheRegistry> = Lazy::new(CacheRegistry::default);

impl CacheRegistry {
    pub fn global() -> &'static CacheRegistry {
        &GLOBAL_REGISTRY
    }

    /// Get or create the cache `name`. Passing `Some(size)` for an already
    /// open cache of a different size fails.
    pub async fn open(
        &self,
        name: &str,
        size: Option<usize>,
        factory: &dyn StoreFactory,
    ) -> Result<Arc<PageCache>, FeedError> {
        if let Some(existing) = self.lookup(name) {
            return match size {
                Some(s) if s != existing.max_entries() => Err(FeedError::CacheSizeConflict {
                    name: name.to_string(),
                }),
                _ => Ok(existing),
            };
        }
        let size = size.unwrap_or(crate::config::DEFAULT_CACHE_MAX_ENTRIES);
        let cache = Arc::new(PageCache::open(name, size, factory).await);
        let mut caches = self.caches.lock().expect("cache registry mutex poisoned");
        // another task may have opened it meanwhile; the first one wins
        Ok(caches.entry(name.to_string()).or_insert(cache).clone())
    }

    fn lookup(&self, name: &str) -> Option<Arc<PageCache>> {
        self.caches
            .lock()
            .expect("cache registry mutex poisoned")
            .get(name)
            .cloned()
    }
}
