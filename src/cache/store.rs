//! Persistence substrate for [`super::PageCache`]: a named key/value store
//! with get/set/remove/clear/keys. Values are opaque strings (JSON).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;

use crate::error::QuotaExceeded;

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;
    async fn set_item(&self, key: &str, value: String) -> Result<()>;
    async fn remove_item(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;

    async fn len(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }
}

/// Creates the named backing stores of a cache.
pub trait StoreFactory: Send + Sync {
    fn open(&self, name: &str) -> Arc<dyn KvStore>;
}

/// In-process store. An optional quota rejects writes of new keys once full.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.lock().expect("memory store mutex poisoned");
        Ok(items.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<()> {
        let mut items = self.items.lock().expect("memory store mutex poisoned");
        if let Some(q) = self.quota {
            if items.len() >= q && !items.contains_key(key) {
                return Err(QuotaExceeded.into());
            }
        }
        items.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items
            .lock()
            .expect("memory store mutex poisoned")
            .remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.items.lock().expect("memory store mutex poisoned").clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let items = self.items.lock().expect("memory store mutex poisoned");
        Ok(items.keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.lock().expect("memory store mutex poisoned").len())
    }
}

/// Hands out one shared [`MemoryStore`] per name, so reopening a cache in the
/// same process sees earlier writes.
#[derive(Default)]
pub struct MemoryStoreFactory {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
    quota: Option<usize>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn open(&self, name: &str) -> Arc<dyn KvStore> {
        let mut stores = self.stores.lock().expect("store factory mutex poisoned");
        let quota = self.quota;
        stores
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(match quota {
                    Some(q) => MemoryStore::with_quota(q),
                    None => MemoryStore::new(),
                })
            })
            .clone()
    }
}

/// One JSON file per entry under `<root>/<store name>/`. File names are the
/// sha256 of the key so arbitrary keys are safe on disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct FileEntry {
    key: String,
    value: String,
}

impl FileStore {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            dir: root.join(name),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(69);
        for b in digest.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut name, "{:02x}", b);
        }
        name.push_str(".json");
        self.dir.join(name)
    }

    async fn read_entry(path: &Path) -> Result<Option<FileEntry>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let entry = serde_json::from_slice(&bytes)
                    .with_context(|| format!("decoding cache entry {}", path.display()))?;
                Ok(Some(entry))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

#[async_trait::async_trait]
impl KvStore for FileStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let entry = Self::read_entry(&self.entry_path(key)).await?;
        // a hash collision would hand back a foreign key
        Ok(entry.filter(|e| e.key == key).map(|e| e.value))
    }

    async fn set_item(&self, key: &str, value: String) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let bytes = serde_json::to_vec(&FileEntry {
            key: key.to_string(),
            value,
        })?;
        let path = self.entry_path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {}", tmp.display()))?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("clearing {}", self.dir.display())),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut rd = match fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(ent) = rd.next_entry().await? {
            let path = ent.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Ok(Some(entry)) = Self::read_entry(&path).await {
                out.push(entry.key);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct FileStoreFactory {
    root: PathBuf,
}

impl FileStoreFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StoreFactory for FileStoreFactory {
    fn open(&self, name: &str) -> Arc<dyn KvStore> {
        Arc::new(FileStore::new(&self.root, name))
    }
}

/// Stores nothing. Backs a disabled cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait::async_trait]
impl KvStore for NullStore {
    async fn get_item(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set_item(&self, _key: &str, _value: String) -> Result<()> {
        Ok(())
    }

    async fn remove_item(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

impl StoreFactory for NullStore {
    fn open(&self, _name: &str) -> Arc<dyn KvStore> {
        Arc::new(NullStore)
    }
}
