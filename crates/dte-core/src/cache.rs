//! Versioned in-memory cache shared by every loader and evaluator
//!
//! Namespaces are independent keyed stores. Two fixed namespaces hold parsed
//! configurations and source-file fingerprints; each model identifier owns a
//! namespace of key to score entries reloaded wholesale every refresh cycle.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use dte_config::{ExperimentConfiguration, ModelConfiguration};

pub const CACHE_NAME_CONFIGURATION: &str = "Configuration";
pub const CACHE_NAME_FILE_IDENTIFIER: &str = "FileIdentifier";
pub const CACHE_KEY_MODEL: &str = "Model";
pub const CACHE_KEY_EXPERIMENT: &str = "Experiment";
pub const CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER: &str =
    "ModelConfigurationFileIdentifier";
pub const CACHE_KEY_EXPERIMENT_CONFIGURATION_FILE_IDENTIFIER: &str =
    "ExperimentConfigurationFileIdentifier";
pub const CACHE_KEY_MODEL_RESULT_FILE_IDENTIFIER: &str = "ModelResultFileIdentifier";

/// Entries written without an explicit TTL lapse after this long. Model rule
/// tables and their fingerprints age out together.
pub const DEFAULT_TTL: Duration = Duration::from_secs(70 * 60);

/// Values storable in the cache. Fingerprints are text, model rule entries
/// are scores, and the two parsed configurations are shared behind `Arc` so
/// readers never copy them.
#[derive(Debug, Clone)]
pub enum CacheValue {
    Text(String),
    Score(f32),
    ModelConfig(Arc<ModelConfiguration>),
    ExperimentConfig(Arc<ExperimentConfiguration>),
}

impl CacheValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_score(&self) -> Option<f32> {
        match self {
            CacheValue::Score(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct Entry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: CacheValue, ttl: Option<Duration>) -> Self {
        Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

type Namespace = Arc<DashMap<String, Entry>>;

/// Registry of named cache namespaces. Writes are visible to subsequent
/// reads as soon as the call returns; loaders rely on `provide` succeeding
/// immediately after `put`.
pub struct LocalCacheRegistry {
    namespaces: DashMap<String, Namespace>,
}

impl LocalCacheRegistry {
    pub fn new() -> Self {
        LocalCacheRegistry {
            namespaces: DashMap::new(),
        }
    }

    fn namespace(&self, cache_name: &str) -> Namespace {
        if let Some(existing) = self.namespaces.get(cache_name) {
            return existing.clone();
        }
        self.namespaces
            .entry(cache_name.to_string())
            .or_insert_with(|| {
                debug!(cache = cache_name, "cache not found, creating a new one");
                Arc::new(DashMap::new())
            })
            .clone()
    }

    pub fn get(&self, cache_name: &str, key: &str) -> Option<CacheValue> {
        let namespace = self.namespace(cache_name);
        let now = Instant::now();
        if let Some(entry) = namespace.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        // Expired entries are evicted lazily on read.
        namespace.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Store a value with the default TTL.
    pub fn put(&self, cache_name: &str, key: &str, value: CacheValue) {
        self.put_entry(cache_name, key, value, Some(DEFAULT_TTL));
    }

    /// Store a value with an explicit TTL. A TTL of zero seconds means the
    /// entry never expires.
    pub fn put_with_ttl(&self, cache_name: &str, key: &str, value: CacheValue, ttl_seconds: u64) {
        let ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));
        self.put_entry(cache_name, key, value, ttl);
    }

    fn put_entry(&self, cache_name: &str, key: &str, value: CacheValue, ttl: Option<Duration>) {
        let namespace = self.namespace(cache_name);
        namespace.insert(key.to_string(), Entry::new(value, ttl));
    }

    /// Drop every entry of a namespace.
    pub fn clear(&self, cache_name: &str) {
        let namespace = self.namespace(cache_name);
        namespace.clear();
        debug!(cache = cache_name, "local cache cleared");
    }

    /// True iff the cached fingerprint is absent, expired, or different from
    /// the one passed in. A stale fingerprint is replaced as part of the same
    /// call, so two racing refresh checks resolve to one refresh: the loser's
    /// next check sees the fingerprint the winner installed.
    pub fn should_refresh(&self, fingerprint_key: &str, fingerprint: &str) -> bool {
        let namespace = self.namespace(CACHE_NAME_FILE_IDENTIFIER);
        let now = Instant::now();
        // Model rule tables age out with the default TTL, so their
        // fingerprint does too. Configuration fingerprints never expire.
        let ttl = (fingerprint_key == CACHE_KEY_MODEL_RESULT_FILE_IDENTIFIER)
            .then_some(DEFAULT_TTL);
        let result = match namespace.entry(fingerprint_key.to_string()) {
            MapEntry::Occupied(mut slot) => {
                let current = slot.get();
                let stale = current.is_expired(now)
                    || current.value.as_text() != Some(fingerprint);
                if stale {
                    slot.insert(Entry::new(CacheValue::Text(fingerprint.to_string()), ttl));
                }
                stale
            }
            MapEntry::Vacant(slot) => {
                slot.insert(Entry::new(CacheValue::Text(fingerprint.to_string()), ttl));
                true
            }
        };
        result
    }

    /// Fingerprint-check a local file by its modification time. A file that
    /// cannot be stat-ed is treated as unchanged.
    pub fn should_refresh_local(&self, fingerprint_key: &str, file: &File) -> bool {
        let modified = file.metadata().and_then(|meta| meta.modified());
        match modified {
            Ok(mtime) => self.should_refresh(fingerprint_key, &format!("{mtime:?}")),
            Err(error) => {
                warn!(%error, "error getting file info");
                false
            }
        }
    }
}

impl Default for LocalCacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn put_is_immediately_visible() {
        let cache = LocalCacheRegistry::new();
        cache.put("models", "key-a", CacheValue::Score(0.25));
        assert_eq!(cache.get("models", "key-a").and_then(|v| v.as_score()), Some(0.25));
    }

    #[test]
    fn namespaces_are_independent() {
        let cache = LocalCacheRegistry::new();
        cache.put("model-a", "k", CacheValue::Score(0.0));
        cache.put("model-b", "k", CacheValue::Score(1.0));
        assert_eq!(cache.get("model-a", "k").and_then(|v| v.as_score()), Some(0.0));
        assert_eq!(cache.get("model-b", "k").and_then(|v| v.as_score()), Some(1.0));
        cache.clear("model-a");
        assert!(cache.get("model-a", "k").is_none());
        assert!(cache.get("model-b", "k").is_some());
    }

    #[test]
    fn zero_ttl_never_expires() {
        let cache = LocalCacheRegistry::new();
        cache.put_with_ttl("ns", "forever", CacheValue::Text("v".to_string()), 0);
        assert!(cache.get("ns", "forever").is_some());
    }

    #[test]
    fn short_ttl_expires() {
        let cache = LocalCacheRegistry::new();
        cache.put_with_ttl("ns", "brief", CacheValue::Text("v".to_string()), 1);
        assert!(cache.get("ns", "brief").is_some());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get("ns", "brief").is_none());
    }

    #[test]
    fn should_refresh_installs_fingerprint() {
        let cache = LocalCacheRegistry::new();
        assert!(cache.should_refresh(CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER, "etag-1"));
        assert!(!cache.should_refresh(CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER, "etag-1"));
        assert!(cache.should_refresh(CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER, "etag-2"));
        assert!(!cache.should_refresh(CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER, "etag-2"));
    }

    #[test]
    fn should_refresh_local_tracks_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{}").unwrap();

        let cache = LocalCacheRegistry::new();
        let file = File::open(&path).unwrap();
        assert!(cache.should_refresh_local(CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER, &file));
        let file = File::open(&path).unwrap();
        assert!(!cache.should_refresh_local(CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER, &file));

        // A rewrite bumps the modification time and triggers a refresh.
        std::thread::sleep(Duration::from_millis(20));
        let mut writable = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        writable.write_all(b"{\"updated\":true}").unwrap();
        writable.sync_all().unwrap();
        let file = File::open(&path).unwrap();
        assert!(cache.should_refresh_local(CACHE_KEY_MODEL_CONFIGURATION_FILE_IDENTIFIER, &file));
    }

    #[test]
    fn type_mismatch_reads_as_none_through_accessors() {
        let cache = LocalCacheRegistry::new();
        cache.put("ns", "text", CacheValue::Text("not a score".to_string()));
        let value = cache.get("ns", "text").unwrap();
        assert!(value.as_score().is_none());
        assert_eq!(value.as_text(), Some("not a score"));
    }
}
