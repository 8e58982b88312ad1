// src/config.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::store::{FileStoreFactory, MemoryStoreFactory, NullStore, StoreFactory};
use crate::ranking::HotConstants;

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const DEFAULT_BUFFER_LOW_WATER_MARK: usize = 50;
pub const DEFAULT_CACHE_NAME: &str = "sourcePages";
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 500;
pub const DEFAULT_CACHE_DIR: &str = "state/cache";
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;

pub const ENV_CONFIG_PATH: &str = "FEEDS_CONFIG_PATH";
pub const ENV_PAGE_SIZE: &str = "FEEDS_PAGE_SIZE";
pub const ENV_NO_CACHE: &str = "FEEDS_NO_CACHE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    #[default]
    File,
    None,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub name: String,
    pub max_entries: usize,
    pub backend: CacheBackend,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CACHE_NAME.to_string(),
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            backend: CacheBackend::default(),
            dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

impl CacheConfig {
    pub fn store_factory(&self) -> Arc<dyn StoreFactory> {
        match self.backend {
            CacheBackend::Memory => Arc::new(MemoryStoreFactory::new()),
            CacheBackend::File => Arc::new(FileStoreFactory::new(&self.dir)),
            CacheBackend::None => Arc::new(NullStore),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Root of the HTTP JSON source endpoint. Unset means no remote sources.
    pub base_url: Option<String>,
    /// Per-request timeout for listing and page fetches.
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FeedsConfig {
    pub page_size: usize,
    pub buffer_low_water_mark: usize,
    pub cache: CacheConfig,
    pub ranking: HotConstants,
    pub sync_interval_secs: u64,
    pub provider: ProviderConfig,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_low_water_mark: DEFAULT_BUFFER_LOW_WATER_MARK,
            cache: CacheConfig::default(),
            ranking: HotConstants::default(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            provider: ProviderConfig::default(),
        }
    }
}

impl FeedsConfig {
    /// Load from an explicit path. TOML or JSON.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading feeds config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg = parse(&content, &ext).with_context(|| format!("parsing {}", path.display()))?;
        cfg.validated()
    }

    /// Load using env var + fallbacks, then apply env overrides:
    /// 1) $FEEDS_CONFIG_PATH
    /// 2) config/feeds.toml
    /// 3) config/feeds.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut cfg = Self::load_file_default()?;
        cfg.apply_env_overrides()?;
        cfg.validated()
    }

    fn load_file_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        for candidate in ["config/feeds.toml", "config/feeds.json"] {
            let p = PathBuf::from(candidate);
            if p.exists() {
                return Self::load_from(&p);
            }
        }
        Ok(Self::default())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var(ENV_PAGE_SIZE) {
            self.page_size = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PAGE_SIZE}='{v}' is not a number"))?;
        }
        if std::env::var(ENV_NO_CACHE).ok().as_deref() == Some("1") {
            self.cache.backend = CacheBackend::None;
        }
        Ok(())
    }

    fn validated(self) -> Result<Self> {
        if self.page_size == 0 {
            bail!("page_size must be at least 1");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be at least 1");
        }
        if self.ranking.hot_decay_secs <= 0.0 {
            bail!("ranking.hot_decay_secs must be positive");
        }
        if self.provider.timeout_secs == 0 {
            bail!("provider.timeout_secs must be at least 1");
        }
        Ok(self)
    }
}

fn parse(s: &str, hint_ext: &str) -> Result<FeedsConfig> {
    if hint_ext == "toml" {
        return toml::from_str(s).context("invalid toml");
    }
    match serde_json::from_str(s) {
        Ok(cfg) => Ok(cfg),
        Err(json_err) => toml::from_str(s)
            .map_err(|_| anyhow!(json_err))
            .context("unsupported feeds config format"),
    }
}
