//! Bounded LRU + TTL cache in front of the retrieval engine.
//!
//! Keyed by a stable fingerprint over (normalized query, top_k,
//! recency_weight, non-empty filter fields). Concurrent identical
//! misses are not single-flighted: both compute and both populate, last
//! writer wins. The cache never surfaces errors; a corrupt or expired
//! entry is dropped and counted as a miss.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::retrieval::RetrievalEngine;
use crate::types::{DocumentFilters, RetrievalCandidate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub total_queries: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_queries as f64
        }
    }
}

struct CacheEntry {
    results: Vec<RetrievalCandidate>,
    /// Original query string, kept for debugging.
    query: String,
    inserted_at: Instant,
    access_count: u64,
}

pub struct QueryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    metrics: Mutex<CacheMetrics>,
}

impl QueryCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            metrics: Mutex::new(CacheMetrics::default()),
        }
    }

    /// Stable fingerprint: SHA-256 over a sorted-key JSON rendering of
    /// every parameter that affects results. The query is lowercased
    /// with whitespace collapsed, so inner-whitespace variants of the
    /// same query share an entry.
    pub fn fingerprint(
        query: &str,
        top_k: usize,
        filters: Option<&DocumentFilters>,
        recency_weight: f32,
    ) -> String {
        let normalized_query = query
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        // serde_json::Map preserves insertion order; insert keys sorted.
        let mut params = serde_json::Map::new();
        match filters {
            Some(f) if !f.is_empty() => {
                params.insert("filters".to_string(), f.canonical_json());
            }
            _ => {}
        }
        params.insert("query".to_string(), normalized_query.into());
        params.insert(
            "recency_weight".to_string(),
            serde_json::json!(recency_weight),
        );
        params.insert("top_k".to_string(), (top_k as u64).into());

        let rendered = serde_json::Value::Object(params).to_string();
        let digest = Sha256::digest(rendered.as_bytes());
        format!("{:x}", digest)
    }

    pub fn get(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&DocumentFilters>,
        recency_weight: f32,
    ) -> Option<Vec<RetrievalCandidate>> {
        let key = Self::fingerprint(query, top_k, filters, recency_weight);
        let mut entries = self.entries.lock();
        let mut metrics = self.metrics.lock();
        metrics.total_queries += 1;

        if let Some(entry) = entries.get_mut(&key) {
            if entry.inserted_at.elapsed() <= self.ttl {
                entry.access_count += 1;
                metrics.hits += 1;
                return Some(entry.results.clone());
            }
        }

        // Absent, or present but expired: drop and count a miss.
        let expired = entries.pop(&key).is_some();
        metrics.misses += 1;
        if expired {
            metrics.evictions += 1;
            tracing::debug!(query = query, "cache miss (expired)");
        }
        None
    }

    pub fn put(
        &self,
        query: &str,
        results: Vec<RetrievalCandidate>,
        top_k: usize,
        filters: Option<&DocumentFilters>,
        recency_weight: f32,
    ) {
        let key = Self::fingerprint(query, top_k, filters, recency_weight);
        let mut entries = self.entries.lock();

        let evicted = entries.push(
            key.clone(),
            CacheEntry {
                results,
                query: query.to_string(),
                inserted_at: Instant::now(),
                access_count: 0,
            },
        );
        // push returns the displaced LRU entry when the cache is full,
        // or the old value under the same key, which is not an eviction.
        if let Some((old_key, _)) = evicted {
            if old_key != key {
                self.metrics.lock().evictions += 1;
            }
        }
    }

    /// Clear the table. Called after every successful document insert or
    /// delete so stale results never outlive a corpus change.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock();
        let cleared = entries.len() as u64;
        entries.clear();
        self.metrics.lock().invalidations += cleared;
        tracing::info!(cleared = cleared, "query cache invalidated");
    }

    /// Drop expired entries eagerly. Optional maintenance; gets also
    /// drop expired entries on access.
    pub fn cleanup_expired(&self) {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut metrics = self.metrics.lock();
        for key in &expired {
            entries.pop(key);
            metrics.evictions += 1;
        }
        tracing::debug!(removed = expired.len(), "cache cleanup removed expired entries");
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        *self.metrics.lock()
    }

    /// Most-recently-used entries as (original query, access count),
    /// for the stats surface.
    pub fn entry_stats(&self, limit: usize) -> Vec<(String, u64)> {
        self.entries
            .lock()
            .iter()
            .take(limit)
            .map(|(_, e)| (e.query.clone(), e.access_count))
            .collect()
    }
}

/// Cache-fronted retrieval with the same signature as the engine.
pub struct CachedRetrieval {
    engine: Arc<RetrievalEngine>,
    cache: Option<Arc<QueryCache>>,
}

impl CachedRetrieval {
    pub fn new(engine: Arc<RetrievalEngine>, cache: Option<Arc<QueryCache>>) -> Self {
        Self { engine, cache }
    }

    pub fn cache(&self) -> Option<&Arc<QueryCache>> {
        self.cache.as_ref()
    }

    pub fn engine(&self) -> &Arc<RetrievalEngine> {
        &self.engine
    }

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&DocumentFilters>,
        recency_weight: f32,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievalCandidate>> {
        let Some(cache) = &self.cache else {
            return self
                .engine
                .retrieve(query, top_k, filters, recency_weight, cancel)
                .await;
        };

        if let Some(hit) = cache.get(query, top_k, filters, recency_weight) {
            return Ok(hit);
        }

        let results = self
            .engine
            .retrieve(query, top_k, filters, recency_weight, cancel)
            .await?;

        // Cancelled or failed retrievals return above and never
        // populate the cache.
        cache.put(query, results.clone(), top_k, filters, recency_weight);
        Ok(results)
    }

    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkPayload;

    fn candidate(doc_id: &str, index: u32) -> RetrievalCandidate {
        let payload = ChunkPayload {
            chunk_id: format!("{}_{}", doc_id, index),
            doc_id: doc_id.to_string(),
            chunk_index: index,
            text: "text".into(),
            filename: "f.pdf".into(),
            doc_type: "Grant Proposal".into(),
            year: Some(2024),
            programs: vec![],
            outcome: None,
            chunking_strategy: "sentence".into(),
            char_count: 4,
            word_count: 1,
            created_at: 0,
        };
        RetrievalCandidate::from_payload(&payload, 0.9)
    }

    #[test]
    fn fingerprint_ignores_inner_whitespace_and_case() {
        let a = QueryCache::fingerprint("Education   Grant Outcomes", 5, None, 0.3);
        let b = QueryCache::fingerprint("education grant outcomes", 5, None, 0.3);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_varies_with_parameters() {
        let base = QueryCache::fingerprint("education", 5, None, 0.3);
        assert_ne!(base, QueryCache::fingerprint("education", 6, None, 0.3));
        assert_ne!(base, QueryCache::fingerprint("education", 5, None, 0.5));

        let filters = DocumentFilters {
            year: Some(2024),
            ..Default::default()
        };
        assert_ne!(base, QueryCache::fingerprint("education", 5, Some(&filters), 0.3));
    }

    #[test]
    fn empty_filters_fingerprint_like_none() {
        let empty = DocumentFilters::default();
        assert_eq!(
            QueryCache::fingerprint("education", 5, None, 0.3),
            QueryCache::fingerprint("education", 5, Some(&empty), 0.3)
        );
    }

    #[test]
    fn hit_miss_accounting() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        assert!(cache.get("education", 5, None, 0.0).is_none());

        cache.put("education", vec![candidate("a", 0)], 5, None, 0.0);
        let hit = cache.get("education", 5, None, 0.0).unwrap();
        assert_eq!(hit.len(), 1);

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.total_queries, 2);
        assert_eq!(metrics.hits + metrics.misses, metrics.total_queries);
    }

    #[test]
    fn ttl_expiry_counts_as_miss_and_eviction() {
        let cache = QueryCache::new(10, Duration::from_millis(0));
        cache.put("education", vec![candidate("a", 0)], 5, None, 0.0);
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get("education", 5, None, 0.0).is_none());
        let metrics = cache.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.evictions, 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = QueryCache::new(2, Duration::from_secs(60));
        cache.put("one", vec![candidate("a", 0)], 5, None, 0.0);
        cache.put("two", vec![candidate("b", 0)], 5, None, 0.0);
        // Touch "one" so "two" becomes the LRU victim.
        assert!(cache.get("one", 5, None, 0.0).is_some());
        cache.put("three", vec![candidate("c", 0)], 5, None, 0.0);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("two", 5, None, 0.0).is_none());
        assert!(cache.get("one", 5, None, 0.0).is_some());
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn invalidate_all_makes_next_query_a_miss() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        cache.put("education", vec![candidate("a", 0)], 5, None, 0.0);
        assert!(cache.get("education", 5, None, 0.0).is_some());

        cache.invalidate_all();
        assert!(cache.get("education", 5, None, 0.0).is_none());
        assert_eq!(cache.metrics().invalidations, 1);
    }

    #[test]
    fn same_key_overwrite_is_not_an_eviction() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        cache.put("education", vec![candidate("a", 0)], 5, None, 0.0);
        cache.put("education", vec![candidate("b", 0)], 5, None, 0.0);
        assert_eq!(cache.metrics().evictions, 0);
        let results = cache.get("education", 5, None, 0.0).unwrap();
        assert_eq!(results[0].doc_id, "b");
    }
}
