//! Content-addressed response cache with expiry and bounded-size eviction.
//!
//! The cache is an optimization, never a correctness dependency: any backend
//! read error degrades to a miss, and write errors are logged and dropped.
//! Entries past `expires_at` are filtered on read even before a sweep runs.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use thiserror::Error;

use crate::config::CacheConfig;
use crate::fingerprint::Fingerprint;

/// Internal cache-layer error. Never crosses the store boundary: reads
/// degrade to miss, writes are logged and dropped.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("backend I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend encoding: {0}")]
    Encoding(String),
}

/// One cached response plus the metadata the eviction policy needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub value: JsonValue,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Updated on every read hit, not on write. Drives LRU eviction.
    pub last_accessed: DateTime<Utc>,
    pub size_bytes: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Counters surfaced through the facade's `cache_stats()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub total_size_bytes: u64,
    pub hit_count: u64,
    pub miss_count: u64,
}

/// Key-value persistence boundary for cache entries.
///
/// The store owns policy (TTL, eviction, stats); a backend only holds bytes.
/// Implementations must be safe for concurrent use.
pub trait CacheBackend: Send + Sync {
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;
    fn store(&self, entry: CacheEntry) -> Result<(), CacheError>;
    fn remove(&self, fingerprint: &Fingerprint) -> Result<(), CacheError>;
    /// Snapshot of all entries, for sweeps. Order is unspecified.
    fn entries(&self) -> Result<Vec<CacheEntry>, CacheError>;
}

/// Default in-process backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().get(fingerprint).cloned())
    }

    fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.write().insert(entry.fingerprint.clone(), entry);
        Ok(())
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        self.entries.write().remove(fingerprint);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self.entries.read().values().cloned().collect())
    }
}

/// File-backed backend: the whole map serialized as one JSON document.
/// Suits the CLI maintenance hooks, where sweeps must outlive the process.
pub struct JsonFileBackend {
    path: PathBuf,
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl JsonFileBackend {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<CacheEntry>>(&raw) {
                Ok(list) => list
                    .into_iter()
                    .map(|e| (e.fingerprint.clone(), e))
                    .collect(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable cache file, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    fn flush(&self, entries: &HashMap<Fingerprint, CacheEntry>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let list: Vec<&CacheEntry> = entries.values().collect();
        let raw = serde_json::to_string(&list).map_err(|e| CacheError::Encoding(e.to_string()))?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl CacheBackend for JsonFileBackend {
    fn load(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().get(fingerprint).cloned())
    }

    fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write();
        entries.insert(entry.fingerprint.clone(), entry);
        self.flush(&entries)
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        let mut entries = self.entries.write();
        entries.remove(fingerprint);
        self.flush(&entries)
    }

    fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self.entries.read().values().cloned().collect())
    }
}

/// The cache store: TTL stamping, lazy expiry, LRU eviction under a size
/// ceiling, and hit/miss accounting over a pluggable backend.
pub struct CacheStore {
    backend: Box<dyn CacheBackend>,
    default_ttl: Duration,
    size_ceiling_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Build a store from configuration, choosing the file backend when a
    /// storage path is configured. Runs an initial expiry sweep.
    pub fn from_config(config: &CacheConfig) -> Self {
        let backend: Box<dyn CacheBackend> = match &config.storage_path {
            Some(path) => Box::new(JsonFileBackend::open(path)),
            None => Box::new(MemoryBackend::new()),
        };
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: &CacheConfig, backend: Box<dyn CacheBackend>) -> Self {
        let store = Self {
            backend,
            default_ttl: config.ttl,
            size_ceiling_bytes: config.size_ceiling_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };

        let removed = store.invalidate_expired();
        if removed > 0 {
            tracing::info!(removed, "Initial cache sweep removed expired entries");
        }
        store
    }

    /// Look up a fingerprint. A hit refreshes the entry's access timestamp.
    /// Backend failures and expired entries both read as a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<JsonValue> {
        let entry = match self.backend.load(fingerprint) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cache read failed, treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let now = Utc::now();
        if entry.is_expired(now) {
            if let Err(e) = self.backend.remove(fingerprint) {
                tracing::warn!(error = %e, "Failed to drop expired entry");
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let value = entry.value.clone();
        let refreshed = CacheEntry {
            last_accessed: now,
            ..entry
        };
        if let Err(e) = self.backend.store(refreshed) {
            tracing::warn!(error = %e, "Failed to refresh access timestamp");
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Write an entry, stamping `expires_at = now + ttl` (store default when
    /// `ttl` is `None`). May trigger an eviction sweep if the write pushes
    /// total size past the ceiling.
    pub fn put(&self, fingerprint: Fingerprint, value: JsonValue, ttl: Option<Duration>) {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let size_bytes = serde_json::to_vec(&value).map(|b| b.len() as u64).unwrap_or(0);

        let entry = CacheEntry {
            fingerprint,
            value,
            created_at: now,
            expires_at: now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero()),
            last_accessed: now,
            size_bytes,
        };

        if let Err(e) = self.backend.store(entry) {
            tracing::warn!(error = %e, "Cache write failed, entry dropped");
            return;
        }

        self.evict_to_ceiling();
    }

    /// Remove every entry whose expiry has passed. Returns the removal count.
    pub fn invalidate_expired(&self) -> usize {
        let entries = match self.backend.entries() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Expiry sweep could not list entries");
                return 0;
            }
        };

        let now = Utc::now();
        let mut removed = 0;
        for entry in entries.iter().filter(|e| e.is_expired(now)) {
            if self.backend.remove(&entry.fingerprint).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let (entry_count, total_size_bytes) = match self.backend.entries() {
            Ok(entries) => (
                entries.len() as u64,
                entries.iter().map(|e| e.size_bytes).sum(),
            ),
            Err(_) => (0, 0),
        };

        CacheStats {
            entry_count,
            total_size_bytes,
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop least-recently-accessed entries until total size fits the ceiling.
    fn evict_to_ceiling(&self) {
        let mut entries = match self.backend.entries() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Eviction sweep could not list entries");
                return;
            }
        };

        let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if total <= self.size_ceiling_bytes {
            return;
        }

        entries.sort_by_key(|e| e.last_accessed);
        for entry in entries {
            if total <= self.size_ceiling_bytes {
                break;
            }
            if self.backend.remove(&entry.fingerprint).is_ok() {
                total = total.saturating_sub(entry.size_bytes);
                tracing::debug!(
                    fingerprint = %entry.fingerprint,
                    size_bytes = entry.size_bytes,
                    "Evicted least-recently-accessed entry"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{fingerprint, FingerprintScope};
    use serde_json::json;

    fn fp(label: &str) -> Fingerprint {
        fingerprint(label, &json!({}), &[], FingerprintScope::Operation)
    }

    fn store_with(ceiling: u64, ttl: Duration) -> CacheStore {
        let config = CacheConfig {
            ttl,
            size_ceiling_bytes: ceiling,
            ..CacheConfig::default()
        };
        CacheStore::from_config(&config)
    }

    #[test]
    fn test_round_trip() {
        let store = store_with(u64::MAX, Duration::from_secs(60));
        let key = fp("op");
        let value = json!({"answer": 42});

        assert!(store.get(&key).is_none());
        store.put(key.clone(), value.clone(), None);
        assert_eq!(store.get(&key), Some(value));
    }

    #[test]
    fn test_expired_entry_never_returned() {
        let store = store_with(u64::MAX, Duration::from_secs(60));
        let key = fp("op");

        // Zero TTL expires the entry immediately; no sweep has run.
        store.put(key.clone(), json!("stale"), Some(Duration::ZERO));
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_lru_eviction_prefers_oldest_access() {
        let store = store_with(70, Duration::from_secs(60));
        let refreshed = fp("refreshed");
        let stale = fp("stale");

        // Two entries of ~26 bytes each fit under the 70-byte ceiling.
        store.put(refreshed.clone(), json!({"payload": "aaaaaaaaaaaa"}), None);
        std::thread::sleep(Duration::from_millis(5));
        store.put(stale.clone(), json!({"payload": "bbbbbbbbbbbb"}), None);
        std::thread::sleep(Duration::from_millis(5));

        // Touch the older entry so its recency beats the newer one's.
        assert!(store.get(&stale).is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get(&refreshed).is_some());
        std::thread::sleep(Duration::from_millis(5));

        // Third insert overflows the ceiling; `stale` is now the LRU victim.
        store.put(fp("new"), json!({"payload": "cccccccccccc"}), None);

        assert!(store.get(&refreshed).is_some());
        assert!(store.get(&stale).is_none());
    }

    #[test]
    fn test_cleanup_expired_is_idempotent() {
        let store = store_with(u64::MAX, Duration::from_secs(60));
        store.put(fp("a"), json!(1), Some(Duration::ZERO));
        store.put(fp("b"), json!(2), Some(Duration::ZERO));

        assert_eq!(store.invalidate_expired(), 2);
        assert_eq!(store.invalidate_expired(), 0);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let store = store_with(u64::MAX, Duration::from_secs(60));
        let key = fp("op");

        assert!(store.get(&key).is_none());
        store.put(key.clone(), json!("v"), None);
        assert!(store.get(&key).is_some());

        let stats = store.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert!(stats.total_size_bytes > 0);
    }

    struct FailingBackend;

    impl CacheBackend for FailingBackend {
        fn load(&self, _: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Encoding("backend down".into()))
        }
        fn store(&self, _: CacheEntry) -> Result<(), CacheError> {
            Err(CacheError::Encoding("backend down".into()))
        }
        fn remove(&self, _: &Fingerprint) -> Result<(), CacheError> {
            Err(CacheError::Encoding("backend down".into()))
        }
        fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
            Err(CacheError::Encoding("backend down".into()))
        }
    }

    #[test]
    fn test_backend_failure_degrades_to_miss() {
        let store =
            CacheStore::with_backend(&CacheConfig::default(), Box::new(FailingBackend));

        // Reads are misses, writes are swallowed, sweeps report zero.
        assert!(store.get(&fp("op")).is_none());
        store.put(fp("op"), json!("v"), None);
        assert_eq!(store.invalidate_expired(), 0);
        assert_eq!(store.stats().miss_count, 1);
    }
}
