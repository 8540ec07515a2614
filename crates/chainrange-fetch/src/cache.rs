//! Cache stores: where fetched values live between runs.
//!
//! Values are stored as JSON with their write time. Three stores ship here:
//! - [`MemoryCache`]: per-process map (tests, short-lived jobs)
//! - [`FileCache`]: one JSON file per key, the file mtime is the write time
//! - [`LayeredCache`]: a fast local store in front of a shared one

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CacheError;

/// A cached value and when it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub written_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry written now.
    pub fn now(value: Value) -> Self {
        Self {
            value,
            written_at: Utc::now(),
        }
    }

    /// Time elapsed since the entry was written (zero if written in the future).
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.written_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// An entry is fresh while its age is within `ttl`. No TTL means
    /// always fresh.
    pub fn is_fresh(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        ttl.map_or(true, |ttl| self.age(now) <= ttl)
    }
}

/// Key/value store for fetched values. Last writer wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store `entry` under `key`, keeping its `written_at`.
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;
}

// ─── Memory ──────────────────────────────────────────────────────────────────

/// In-process cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.lock().unwrap().insert(key.to_string(), entry);
        Ok(())
    }
}

// ─── File ────────────────────────────────────────────────────────────────────

/// One JSON file per key under a directory.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Cache rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `key`. Characters outside `[A-Za-z0-9._-]` become `_`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl CacheStore for FileCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified = tokio::fs::metadata(&path).await?.modified()?;
        let value = serde_json::from_slice(&bytes)?;
        Ok(Some(CacheEntry {
            value,
            written_at: DateTime::<Utc>::from(modified),
        }))
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));

        tokio::fs::write(&tmp, serde_json::to_vec(&entry.value)?).await?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&tmp)
            .await?
            .into_std()
            .await;
        file.set_modified(SystemTime::from(entry.written_at))?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "cache file written");
        Ok(())
    }
}

// ─── Layered ─────────────────────────────────────────────────────────────────

/// Reads the local store first, then the shared one, back-filling local.
/// Writes go to both.
pub struct LayeredCache<L, S> {
    local: L,
    shared: S,
}

impl<L: CacheStore, S: CacheStore> LayeredCache<L, S> {
    pub fn new(local: L, shared: S) -> Self {
        Self { local, shared }
    }
}

#[async_trait]
impl<L: CacheStore, S: CacheStore> CacheStore for LayeredCache<L, S> {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.local.get(key).await? {
            return Ok(Some(entry));
        }
        let Some(entry) = self.shared.get(key).await? else {
            return Ok(None);
        };
        if let Err(e) = self.local.put(key, entry.clone()).await {
            warn!(key, error = %e, "failed to back-fill local cache");
        }
        Ok(Some(entry))
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.local.put(key, entry.clone()).await?;
        self.shared.put(key, entry).await
    }
}
