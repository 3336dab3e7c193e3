//! Per-phase result cache.
//!
//! The cache is the only state shared between concurrent requests. Entries
//! are stored behind `Arc` and replaced wholesale on every write, so a reader
//! never observes a partially updated value.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// How often writes also reclaim expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Key/value store with per-entry TTL.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a live entry; expired entries behave as misses.
    async fn get(&self, key: &str) -> Option<Arc<serde_json::Value>>;

    /// Insert or replace an entry.
    async fn set(&self, key: String, value: serde_json::Value, ttl: Duration);
}

/// A stored value and its deadline.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Arc<serde_json::Value>,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process TTL cache backed by `DashMap`.
///
/// Expired entries are dropped when read, and swept from the whole map by the
/// first write after each sweep interval, so keys that are never read again
/// do not accumulate.
#[derive(Debug)]
pub struct TtlCache {
    entries: DashMap<String, CacheEntry>,
    sweep_interval: Duration,
    next_sweep: Mutex<Instant>,
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            sweep_interval,
            next_sweep: Mutex::new(Instant::now() + sweep_interval),
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }

    /// Purge if the sweep interval has passed. Concurrent writers skip the
    /// sweep rather than wait for it.
    fn maybe_sweep(&self) {
        let now = Instant::now();
        let due = match self.next_sweep.try_lock() {
            Ok(mut next) if now >= *next => {
                *next = now + self.sweep_interval;
                true
            }
            _ => false,
        };
        if due {
            let removed = self.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, remaining = self.entries.len(), "cache swept");
            }
        }
    }
}

#[async_trait::async_trait]
impl CacheStore for TtlCache {
    async fn get(&self, key: &str) -> Option<Arc<serde_json::Value>> {
        let value = {
            let entry = self.entries.get(key)?;
            if entry.is_expired() {
                None
            } else {
                Some(entry.value.clone())
            }
        };

        if value.is_none() {
            // Only remove if nobody replaced it in the meantime.
            self.entries.remove_if(key, |_, entry| entry.is_expired());
        }
        value
    }

    async fn set(&self, key: String, value: serde_json::Value, ttl: Duration) {
        let entry = CacheEntry {
            key: key.clone(),
            value: Arc::new(value),
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key, entry);
        self.maybe_sweep();
    }
}

/// Typed view of a cache store for one phase.
#[derive(Clone)]
pub struct PhaseCache {
    store: Arc<dyn CacheStore>,
    namespace: &'static str,
    ttl: Duration,
}

impl PhaseCache {
    pub fn new(store: Arc<dyn CacheStore>, namespace: &'static str, ttl: Duration) -> Self {
        Self {
            store,
            namespace,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Derive this phase's key from its semantically relevant inputs.
    pub fn key(&self, parts: &[&str]) -> String {
        cache_key(self.namespace, parts)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.store.get(key).await?;
        match T::deserialize(value.as_ref()) {
            Ok(decoded) => {
                tracing::debug!(namespace = self.namespace, "cache hit");
                Some(decoded)
            }
            Err(e) => {
                tracing::warn!(namespace = self.namespace, "discarding undecodable cache entry: {}", e);
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, key: String, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => self.store.set(key, json, self.ttl).await,
            Err(e) => tracing::warn!(namespace = self.namespace, "not caching value: {}", e),
        }
    }
}

/// Hex SHA-256 over the parts, prefixed with the namespace.
pub fn cache_key(namespace: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        // Unit separator keeps ["ab","c"] and ["a","bc"] apart.
        hasher.update([0x1f]);
    }
    format!("{}:{:x}", namespace, hasher.finalize())
}

/// Case, whitespace and trailing-punctuation insensitive form of a query.
pub fn normalize_query(query: &str) -> String {
    let collapsed = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(['?', '!', '.'])
        .trim_end()
        .to_string()
}

/// Sorted, lowercased, deduplicated join of a set of terms.
pub fn normalize_terms<'a>(terms: impl IntoIterator<Item = &'a String>) -> String {
    let mut normalized: Vec<String> = terms
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized.join("\u{1f}")
}
