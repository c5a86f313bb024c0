use crate::types::ExecutionResult;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// TTL classes. Schema-derived entries outlive result entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCategory {
    Result,
    Schema,
}

/// Masked execution results keyed by query fingerprint
pub type ResultCache = TtlCache<Arc<ExecutionResult>>;

/// Validated query text keyed by [`plan_key`]
pub type PlanCache = TtlCache<String>;

/// SHA-256 over (data source, canonical query, bound parameters)
pub fn fingerprint(data_source_id: &str, sql: &str, params: &[serde_json::Value]) -> String {
    let params = serde_json::Value::Array(params.to_vec()).to_string();

    let mut hasher = Sha256::new();
    hasher.update(data_source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(sql.as_bytes());
    hasher.update([0u8]);
    hasher.update(params.as_bytes());
    hex::encode(hasher.finalize())
}

/// Key for the plan cache: the question is whitespace- and case-normalized,
/// prior context is kept in order.
pub fn plan_key(data_source_id: &str, question: &str, prior_context: &[String]) -> String {
    let normalize = |text: &str| {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    };

    let mut hasher = Sha256::new();
    hasher.update(data_source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(question).as_bytes());
    for item in prior_context {
        hasher.update([0u8]);
        hasher.update(normalize(item).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Cache entry with expiration time
#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    data_source_id: String,
    cached_at: DateTime<Utc>,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Time-based cache keyed by fingerprint and scoped by data source.
///
/// Bounded by `max_entries`: when full, expired entries are purged first and
/// then the entry closest to expiry is evicted.
pub struct TtlCache<V>
where
    V: Clone,
{
    entries: Arc<RwLock<HashMap<String, CacheEntry<V>>>>,
    max_entries: usize,
}

impl<V> TtlCache<V>
where
    V: Clone,
{
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_entries: max_entries.max(1),
        }
    }

    /// Get a value if it exists and is not expired
    pub async fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().await;
        let now = Instant::now();

        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Live value together with the wall-clock time it was stored
    pub async fn get_stamped(&self, key: &str) -> Option<(V, DateTime<Utc>)> {
        let entries = self.entries.read().await;
        let now = Instant::now();

        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| (entry.value.clone(), entry.cached_at))
    }

    pub async fn put(&self, key: String, data_source_id: &str, value: V, ttl: Duration) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            entries.retain(|_, entry| !entry.is_expired(now));

            if entries.len() >= self.max_entries {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(key, _)| key.clone());
                if let Some(victim) = victim {
                    debug!("Cache full, evicting entry closest to expiry");
                    entries.remove(&victim);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                data_source_id: data_source_id.to_string(),
                cached_at: Utc::now(),
                expires_at: now + ttl,
            },
        );
    }

    /// Remove a single entry
    pub async fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(key).is_some()
    }

    /// Remove every entry belonging to a data source; returns how many were dropped
    pub async fn invalidate(&self, data_source_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.data_source_id != data_source_id);
        let removed = before - entries.len();

        if removed > 0 {
            debug!(
                "Invalidated {} cache entries for data source {}",
                removed, data_source_id
            );
        }
        removed
    }

    /// Remove all expired entries from the cache
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Get the number of entries in the cache (including expired)
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        let entries = self.entries.read().await;
        entries.is_empty()
    }
}
