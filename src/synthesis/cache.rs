//! TTL cache for synthesized answers.
//!
//! Entries remember the revision and content fingerprint of every
//! contributing item. The cache itself only enforces TTL and capacity; the
//! synthesizer checks the recorded stamps against the stores before
//! serving a hit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::Result;
use crate::memory::{normalize, Scope, SourceRef};

use super::synthesizer::SynthesisResult;

/// Cache key for a (query, scope) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Fingerprint a query; case and whitespace differences collapse.
    pub fn generate(query: &str, scope: &Scope) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"scope:");
        hasher.update(scope.as_str().as_bytes());
        hasher.update(b"\nquery:");
        hasher.update(normalize(query).as_bytes());
        CacheKey(format!("{:x}", hasher.finalize()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16.min(self.0.len())])
    }
}

/// State of a contributing item at caching time.
///
/// `revision` orders changes in time; `fingerprint` catches changes made
/// within the same instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributorStamp {
    pub source: SourceRef,
    pub revision: DateTime<Utc>,
    pub fingerprint: String,
}

/// SHA-256 of an item's serialized form.
pub fn content_fingerprint<T: Serialize>(item: &T) -> Result<String> {
    let bytes = serde_json::to_vec(item)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// A cached synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub result: SynthesisResult,
    pub contributors: Vec<ContributorStamp>,
    pub created_at: DateTime<Utc>,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn new(
        key: CacheKey,
        result: SynthesisResult,
        contributors: Vec<ContributorStamp>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            result,
            contributors,
            created_at,
            hit_count: 0,
        }
    }

    /// Latest contributor revision covered by the entry.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.contributors.iter().map(|c| c.revision).max()
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at >= ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because a contributor changed or on request
    pub invalidations: u64,
    /// Entries dropped for capacity
    pub evictions: u64,
    /// Entries dropped for age
    pub expirations: u64,
    /// Number of live entries
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded synthesis cache.
pub struct SynthesisCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    stats: RwLock<CacheStats>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl SynthesisCache {
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            ttl,
            capacity: capacity.max(1),
            clock,
        }
    }

    /// Unexpired entry for a key. Does not count as a hit.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(self.ttl, now) => {
                entries.remove(key);
                let mut stats = self.stats.write().await;
                stats.expirations += 1;
                stats.entry_count = entries.len() as u64;
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Record that an entry was served.
    pub async fn record_hit(&self, key: &CacheKey) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.hit_count += 1;
        }
        self.stats.write().await.hits += 1;
    }

    pub async fn record_miss(&self) {
        self.stats.write().await.misses += 1;
    }

    /// Insert an entry, evicting the oldest when full.
    pub async fn insert(&self, entry: CacheEntry) {
        let mut entries = self.entries.write().await;
        let mut evicted = 0;
        while !entries.contains_key(&entry.key) && entries.len() >= self.capacity {
            let oldest = entries
                .values()
                .min_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.key.0.cmp(&b.key.0))
                })
                .map(|e| e.key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        entries.insert(entry.key.clone(), entry);

        let mut stats = self.stats.write().await;
        stats.evictions += evicted;
        stats.entry_count = entries.len() as u64;
    }

    /// Drop one entry. Returns whether it existed.
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(key).is_some();
        if removed {
            let mut stats = self.stats.write().await;
            stats.invalidations += 1;
            stats.entry_count = entries.len() as u64;
        }
        removed
    }

    /// Drop every entry of a scope. Returns the number removed.
    pub async fn invalidate_scope(&self, scope: &Scope) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| &e.result.scope != scope);
        let removed = before - entries.len();

        let mut stats = self.stats.write().await;
        stats.invalidations += removed as u64;
        stats.entry_count = entries.len() as u64;
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Clear all entries; statistics are kept.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.stats.write().await.entry_count = 0;
    }
}
