//! TTL result cache for remote read operations.
//!
//! Entries are keyed by `(operation, hostname, path, extra params)` and hold
//! either a successful payload or a failure descriptor (negative caching).
//! Failures default to a longer TTL than successes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::error::{ErrorKind, RemoteError};
use super::path;
use super::types::CachedData;
use crate::config::CacheSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOperation {
    ListDirectory,
    Stat,
}

impl CacheOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOperation::ListDirectory => "list_directory",
            CacheOperation::Stat => "stat",
        }
    }
}

/// What a cache entry remembers: a result, or the error that was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CacheOutcome {
    Success { data: CachedData },
    Failure { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone)]
struct CacheEntry {
    outcome: CacheOutcome,
    created: Instant,
    last_access: Instant,
    ttl: Duration,
    hostname: String,
    path: String,
    operation: CacheOperation,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) > self.ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    /// Expired entries not yet swept by a lookup.
    pub expired_entries: usize,
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    pub error_ttl_secs: u64,
    pub operation_counts: BTreeMap<CacheOperation, usize>,
}

#[derive(Debug)]
pub struct ResultCache {
    default_ttl: Duration,
    error_ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}

impl ResultCache {
    pub fn new(default_ttl: Duration, error_ttl: Duration, max_entries: usize) -> Self {
        Self {
            default_ttl,
            error_ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.ttl(), settings.error_ttl(), settings.max_entries)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn error_ttl(&self) -> Duration {
        self.error_ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deterministic fixed-size key: SHA-256 over the parameters serialised
    /// in sorted order.
    fn cache_key(
        operation: CacheOperation,
        hostname: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> String {
        let mut fields: BTreeMap<&str, &str> = params.iter().copied().collect();
        fields.insert("operation", operation.as_str());
        fields.insert("hostname", hostname);
        fields.insert("path", path);

        // A BTreeMap of strings always serialises; the fallback keeps the
        // function total without an unwrap.
        let canonical = serde_json::to_string(&fields)
            .unwrap_or_else(|_| format!("{:?}", fields));
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Look up a cached outcome.
    ///
    /// `None` is a miss (absent or expired). `Some(Err(_))` replays a cached
    /// failure with the same variant and message.
    pub fn get(
        &self,
        operation: CacheOperation,
        hostname: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> Option<Result<CachedData, RemoteError>> {
        let key = Self::cache_key(operation, hostname, path, params);
        let now = Instant::now();
        let mut entries = self.lock();

        let entry = entries.get_mut(&key)?;
        if entry.is_expired(now) {
            entries.remove(&key);
            debug!("Cache expired for {} on {}:{}", operation.as_str(), hostname, path);
            return None;
        }

        entry.last_access = now;
        match &entry.outcome {
            CacheOutcome::Success { data } => {
                debug!("Cache hit for {} on {}:{}", operation.as_str(), hostname, path);
                Some(Ok(data.clone()))
            }
            CacheOutcome::Failure { kind, message } => {
                debug!("Cache hit (error) for {} on {}:{}", operation.as_str(), hostname, path);
                Some(Err(RemoteError::from_kind(*kind, message.clone())))
            }
        }
    }

    /// Store a successful result. `ttl: None` uses the default TTL.
    pub fn put_data(
        &self,
        operation: CacheOperation,
        hostname: &str,
        path: &str,
        data: CachedData,
        ttl: Option<Duration>,
        params: &[(&str, &str)],
    ) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.insert(operation, hostname, path, CacheOutcome::Success { data }, ttl, params);
        debug!(
            "Cached {} for {}:{} (TTL: {}s)",
            operation.as_str(),
            hostname,
            path,
            ttl.as_secs()
        );
    }

    /// Store a failure for negative caching. `ttl: None` uses the error TTL.
    pub fn put_error(
        &self,
        operation: CacheOperation,
        hostname: &str,
        path: &str,
        error: &RemoteError,
        ttl: Option<Duration>,
        params: &[(&str, &str)],
    ) {
        let ttl = ttl.unwrap_or(self.error_ttl);
        let outcome = CacheOutcome::Failure {
            kind: error.kind(),
            message: error.message().to_string(),
        };
        self.insert(operation, hostname, path, outcome, ttl, params);
        debug!(
            "Cached error for {} on {}:{}: {:?} (TTL: {}s)",
            operation.as_str(),
            hostname,
            path,
            error.kind(),
            ttl.as_secs()
        );
    }

    fn insert(
        &self,
        operation: CacheOperation,
        hostname: &str,
        path: &str,
        outcome: CacheOutcome,
        ttl: Duration,
        params: &[(&str, &str)],
    ) {
        let key = Self::cache_key(operation, hostname, path, params);
        let now = Instant::now();
        let mut entries = self.lock();

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            Self::evict_lru(&mut entries);
        }

        entries.insert(
            key,
            CacheEntry {
                outcome,
                created: now,
                last_access: now,
                ttl,
                hostname: hostname.to_string(),
                path: path.to_string(),
                operation,
            },
        );
    }

    fn evict_lru(entries: &mut HashMap<String, CacheEntry>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            if let Some(entry) = entries.remove(&key) {
                info!("Evicted LRU cache entry for {}:{}", entry.hostname, entry.path);
            }
        }
    }

    /// Remove entries matching `predicate` for `hostname`, returning how many
    /// went away.
    fn remove_where(&self, hostname: &str, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !(entry.hostname == hostname && predicate(entry)));
        before - entries.len()
    }

    pub fn invalidate_hostname(&self, hostname: &str) {
        let removed = self.remove_where(hostname, |_| true);
        if removed > 0 {
            info!("Invalidated {} cache entries for {}", removed, hostname);
        }
    }

    /// Forget everything that a change to `path` may have made stale: the
    /// path itself, its parent's listing and anything cached beneath it.
    pub fn invalidate_path(&self, hostname: &str, path: &str) {
        let normalized = path::normalize(path);
        let parent = path::parent(&normalized);

        let removed = self.remove_where(hostname, |entry| {
            entry.path == normalized
                || (entry.operation == CacheOperation::ListDirectory && entry.path == parent)
                || path::is_descendant(&entry.path, &normalized)
        });

        if removed > 0 {
            info!("Invalidated {} cache entries for {}:{}", removed, hostname, path);
        }
    }

    /// Forget a directory and its whole subtree.
    pub fn invalidate_directory(&self, hostname: &str, directory: &str) {
        let normalized = path::normalize(directory);

        let removed = self.remove_where(hostname, |entry| {
            entry.path == normalized || path::is_descendant(&entry.path, &normalized)
        });

        if removed > 0 {
            info!(
                "Invalidated {} cache entries for directory {}:{}",
                removed, hostname, directory
            );
        }
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        if count > 0 {
            info!("Cleared {} cache entries", count);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.lock();

        let mut operation_counts = BTreeMap::new();
        for entry in entries.values() {
            *operation_counts.entry(entry.operation).or_insert(0) += 1;
        }

        CacheStats {
            total_entries: entries.len(),
            expired_entries: entries.values().filter(|e| e.is_expired(now)).count(),
            max_entries: self.max_entries,
            default_ttl_secs: self.default_ttl.as_secs(),
            error_ttl_secs: self.error_ttl.as_secs(),
            operation_counts,
        }
    }

    /// TTL recorded for an entry, if present. Used by diagnostics and tests.
    pub fn entry_ttl(
        &self,
        operation: CacheOperation,
        hostname: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> Option<Duration> {
        let key = Self::cache_key(operation, hostname, path, params);
        self.lock().get(&key).map(|entry| entry.ttl)
    }
}

static INSTANCE: Mutex<Option<Arc<ResultCache>>> = Mutex::new(None);

fn lock_instance() -> MutexGuard<'static, Option<Arc<ResultCache>>> {
    INSTANCE.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResultCache {
    /// Create the shared cache from configuration. Fails if one is already
    /// installed.
    pub fn install(settings: &CacheSettings) -> Result<Arc<Self>, RemoteError> {
        let mut slot = lock_instance();
        if slot.is_some() {
            return Err(RemoteError::Operation(
                "Result cache is already initialised".to_string(),
            ));
        }

        let cache = Arc::new(Self::from_settings(settings));
        *slot = Some(cache.clone());
        Ok(cache)
    }

    /// The shared cache created by [`ResultCache::install`].
    pub fn instance() -> Result<Arc<Self>, RemoteError> {
        lock_instance()
            .clone()
            .ok_or_else(|| RemoteError::Operation("Result cache is not initialised".to_string()))
    }

    /// Empty and drop the shared cache so a fresh one can be installed.
    pub fn reset() {
        if let Some(cache) = lock_instance().take() {
            cache.clear();
        }
    }
}
