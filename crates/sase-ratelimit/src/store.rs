//! Entry Store
//!
//! Persistence of the address → entry mapping. Stores are pure data access:
//! whole-map load and save, no business rules. Callers serialize
//! read-modify-write cycles themselves.

use crate::{RateLimitError, Result, Tier};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Persisted state of one limited address
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Current tier
    pub queue: Tier,
    /// Epoch seconds at which the address entered `queue`
    pub timestamp: f64,
}

impl Entry {
    pub fn new(queue: Tier, timestamp: f64) -> Self {
        Self { queue, timestamp }
    }

    /// Seconds spent in the current tier
    pub fn age(&self, now: f64) -> f64 {
        now - self.timestamp
    }
}

/// All limited addresses, keyed by address
pub type EntryMap = BTreeMap<IpAddr, Entry>;

/// Entry store interface
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Load the full mapping
    async fn load(&self) -> Result<EntryMap>;

    /// Replace the full mapping
    async fn save(&self, entries: &EntryMap) -> Result<()>;
}

/// JSON file store
///
/// Layout: `{ "<address>": { "queue": "<tier>", "timestamp": <epoch secs> } }`.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Open the store, creating an empty mapping if the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if !tokio::fs::try_exists(&path).await.map_err(|e| persistence(&path, e))? {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| persistence(parent, e))?;
            }
            tracing::info!(path = %path.display(), "Initializing empty entry store");
            let store = Self { path };
            store.save(&EntryMap::new()).await?;
            return Ok(store);
        }

        Ok(Self { path })
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl EntryStore for JsonFileStore {
    async fn load(&self) -> Result<EntryMap> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| persistence(&self.path, e))?;
        serde_json::from_str(&content).map_err(|e| persistence(&self.path, e))
    }

    async fn save(&self, entries: &EntryMap) -> Result<()> {
        let content =
            serde_json::to_string_pretty(entries).map_err(|e| persistence(&self.path, e))?;

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| persistence(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| persistence(&self.path, e))
    }
}

fn persistence(path: &Path, err: impl std::fmt::Display) -> RateLimitError {
    RateLimitError::Persistence(format!("{}: {}", path.display(), err))
}

/// In-memory store (for testing and development)
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<EntryMap>,
    fail_io: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the given mapping
    pub fn with_entries(entries: EntryMap) -> Self {
        Self {
            entries: RwLock::new(entries),
            fail_io: AtomicBool::new(false),
        }
    }

    /// Make every subsequent load and save fail
    pub fn set_failing(&self, failing: bool) {
        self.fail_io.store(failing, Ordering::SeqCst);
    }

    /// Current contents
    pub fn snapshot(&self) -> EntryMap {
        self.entries.read().clone()
    }

    fn check(&self) -> Result<()> {
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(RateLimitError::Persistence("store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntryStore for InMemoryStore {
    async fn load(&self) -> Result<EntryMap> {
        self.check()?;
        Ok(self.entries.read().clone())
    }

    async fn save(&self, entries: &EntryMap) -> Result<()> {
        self.check()?;
        *self.entries.write() = entries.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EntryMap {
        let mut entries = EntryMap::new();
        entries.insert(
            "10.0.0.5".parse().unwrap(),
            Entry::new(Tier::Suspicious, 1_700_000_000.25),
        );
        entries.insert(
            "2001:db8::1".parse().unwrap(),
            Entry::new(Tier::Malicious, 1_700_000_123.0),
        );
        entries
    }

    #[tokio::test]
    async fn test_open_initializes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("limited_ips.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "{}");
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("limited_ips.json"))
            .await
            .unwrap();

        let entries = sample();
        store.save(&entries).await.unwrap();
        assert_eq!(store.load().await.unwrap(), entries);

        // Reopening keeps existing content
        let reopened = JsonFileStore::open(store.path()).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), entries);
    }

    #[tokio::test]
    async fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("limited_ips.json"))
            .await
            .unwrap();
        store.save(&sample()).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["10.0.0.5"]["queue"], "suspicious");
        assert_eq!(raw["10.0.0.5"]["timestamp"], 1_700_000_000.25);
        assert_eq!(raw["2001:db8::1"]["queue"], "malicious");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limited_ips.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::open(&path).await.unwrap();
        assert!(matches!(
            store.load().await,
            Err(RateLimitError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();
        assert!(store.load().await.unwrap().is_empty());

        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), sample());

        store.set_failing(true);
        assert!(store.load().await.is_err());
        assert!(store.save(&EntryMap::new()).await.is_err());
        assert_eq!(store.snapshot(), sample());
    }
}
