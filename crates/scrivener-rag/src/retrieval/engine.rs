//! Hybrid retrieval: dense and sparse legs run concurrently, fuse by
//! normalized weighted score, then pass through recency decay,
//! per-document diversification, truncation, and an optional
//! cross-encoder rerank.
//!
//! Ordering is strictly by score descending; equal scores order by
//! (doc_id, chunk_index) so results are deterministic.

use chrono::Datelike;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::query::normalize_query;
use crate::config::RetrievalConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::reranking::Reranker;
use crate::search::KeywordIndex;
use crate::storage::{filters_to_exprs, VectorIndex};
use crate::telemetry::Telemetry;
use crate::types::{ChunkPayload, DocumentFilters, RetrievalCandidate};

pub struct RetrievalEngine {
    vector_index: Arc<dyn VectorIndex>,
    keyword_index: Arc<KeywordIndex>,
    embeddings: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    telemetry: Arc<dyn Telemetry>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        vector_index: Arc<dyn VectorIndex>,
        keyword_index: Arc<KeywordIndex>,
        embeddings: Arc<dyn EmbeddingProvider>,
        reranker: Option<Arc<dyn Reranker>>,
        telemetry: Arc<dyn Telemetry>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            vector_index,
            keyword_index,
            embeddings,
            reranker,
            telemetry,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Run the full pipeline. `recency_weight` of 0 disables decay.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&DocumentFilters>,
        recency_weight: f32,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievalCandidate>> {
        let started = Instant::now();
        self.telemetry.incr("retrieval.requests", 1);

        let normalized = normalize_query(query);
        if normalized.is_empty() {
            // Zero results, zero provider calls.
            return Ok(Vec::new());
        }

        let fetch_k = top_k.max(1) * self.config.over_fetch;
        let exprs = filters.map(filters_to_exprs).unwrap_or_default();

        // Dense and sparse legs run concurrently; cancellation aborts
        // both before fusion.
        let dense_fut = async {
            let dense_started = Instant::now();
            let vectors = self.embeddings.embed(&[normalized.clone()]).await?;
            let query_vector = vectors.into_iter().next().ok_or_else(|| {
                RagError::dependency("embedding_provider", "empty embedding batch")
            })?;
            let hits = self.vector_index.search(&query_vector, fetch_k, &exprs).await?;
            self.telemetry.record_latency("retrieval.dense", dense_started.elapsed());
            Ok::<_, RagError>(hits)
        };
        let sparse_fut = async {
            let sparse_started = Instant::now();
            let hits = self.keyword_index.search(&normalized, fetch_k, filters);
            self.telemetry.record_latency("retrieval.sparse", sparse_started.elapsed());
            hits
        };

        let (dense_hits, sparse_hits) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.telemetry.event("retrieval_cancelled", &[("query", normalized.clone())]);
                return Err(RagError::cancelled("retrieval"));
            }
            joined = async { tokio::join!(dense_fut, sparse_fut) } => {
                let (dense, sparse) = joined;
                (dense?, sparse)
            }
        };

        tracing::debug!(
            query = %normalized,
            fetch_k = fetch_k,
            dense_hits = dense_hits.len(),
            sparse_hits = sparse_hits.len(),
            "hybrid search candidates"
        );

        let mut candidates = self.fuse(
            dense_hits.into_iter().map(|h| (h.payload, h.score)).collect(),
            sparse_hits,
        );

        if recency_weight > 0.0 {
            apply_recency_decay(&mut candidates, recency_weight);
        }
        sort_candidates(&mut candidates);

        let mut diversified = diversify(candidates, self.config.max_per_doc);
        diversified.truncate(top_k);

        let final_candidates = self.maybe_rerank(&normalized, diversified);

        self.telemetry.record_latency("retrieval.total", started.elapsed());
        Ok(final_candidates)
    }

    /// Stages (d) + (e): min-max normalize each list independently, then
    /// merge by chunk_id with the configured weights. A chunk present in
    /// only one list contributes 0 for the missing sub-score. Raw
    /// sub-scores are preserved in candidate metadata.
    fn fuse(
        &self,
        dense: Vec<(ChunkPayload, f32)>,
        sparse: Vec<(ChunkPayload, f32)>,
    ) -> Vec<RetrievalCandidate> {
        let (vector_weight, keyword_weight) = self.config.normalized_weights();

        let dense_norm = normalize_scores(dense.iter().map(|(_, s)| *s).collect());
        let sparse_norm = normalize_scores(sparse.iter().map(|(_, s)| *s).collect());

        struct Fused {
            payload: ChunkPayload,
            raw_dense: Option<f32>,
            raw_sparse: Option<f32>,
            norm_dense: f32,
            norm_sparse: f32,
        }

        let mut by_id: HashMap<String, Fused> = HashMap::new();

        for (i, (payload, raw)) in dense.into_iter().enumerate() {
            by_id.insert(
                payload.chunk_id.clone(),
                Fused {
                    payload,
                    raw_dense: Some(raw),
                    raw_sparse: None,
                    norm_dense: dense_norm[i],
                    norm_sparse: 0.0,
                },
            );
        }

        for (i, (payload, raw)) in sparse.into_iter().enumerate() {
            match by_id.get_mut(&payload.chunk_id) {
                Some(existing) => {
                    existing.raw_sparse = Some(raw);
                    existing.norm_sparse = sparse_norm[i];
                }
                None => {
                    by_id.insert(
                        payload.chunk_id.clone(),
                        Fused {
                            payload,
                            raw_dense: None,
                            raw_sparse: Some(raw),
                            norm_dense: 0.0,
                            norm_sparse: sparse_norm[i],
                        },
                    );
                }
            }
        }

        by_id
            .into_values()
            .map(|fused| {
                let score = vector_weight * fused.norm_dense + keyword_weight * fused.norm_sparse;
                let mut candidate = RetrievalCandidate::from_payload(&fused.payload, score);
                if let Some(raw) = fused.raw_dense {
                    candidate
                        .metadata
                        .insert("_vector_score".to_string(), json_f32(raw));
                }
                if let Some(raw) = fused.raw_sparse {
                    candidate
                        .metadata
                        .insert("_keyword_score".to_string(), json_f32(raw));
                }
                candidate
            })
            .collect()
    }

    /// Stage (i): replace scores with cross-encoder scores when a
    /// reranker is configured and available. Failures degrade to the
    /// fused ordering and never fail the request.
    fn maybe_rerank(
        &self,
        query: &str,
        mut candidates: Vec<RetrievalCandidate>,
    ) -> Vec<RetrievalCandidate> {
        let Some(reranker) = &self.reranker else {
            return candidates;
        };
        if candidates.len() < 2 {
            return candidates;
        }

        let pairs: Vec<(String, String)> = candidates
            .iter()
            .map(|c| (c.chunk_id.clone(), c.text.clone()))
            .collect();

        match reranker.rerank(query, &pairs, pairs.len()) {
            Ok(scored) => {
                let scores: HashMap<String, f32> = scored.into_iter().collect();
                for candidate in &mut candidates {
                    if let Some(&score) = scores.get(&candidate.chunk_id) {
                        candidate.score = score;
                        candidate
                            .metadata
                            .insert("_reranked".to_string(), true.into());
                        candidate.metadata.insert(
                            "_reranker_model".to_string(),
                            reranker.model_name().to_string().into(),
                        );
                    }
                }
                sort_candidates(&mut candidates);
                self.telemetry.incr("retrieval.reranked", 1);
                candidates
            }
            Err(e) => {
                tracing::warn!(error = %e, "reranker failed, keeping fused ordering");
                self.telemetry.incr("retrieval.rerank_failures", 1);
                candidates
            }
        }
    }
}

/// Min-max rescale so max maps to 1.0 and min to 0.0. When all scores
/// are equal every score maps to 1.0.
fn normalize_scores(scores: Vec<f32>) -> Vec<f32> {
    if scores.is_empty() {
        return scores;
    }
    let max = scores.iter().copied().fold(f32::MIN, f32::max);
    let min = scores.iter().copied().fold(f32::MAX, f32::min);
    if (max - min).abs() < 1e-9 {
        return vec![1.0; scores.len()];
    }
    let range = max - min;
    scores.into_iter().map(|s| (s - min) / range).collect()
}

/// Stepped age multiplier: this year 1.00, one year back 0.95, two 0.90,
/// three or four 0.88, five-plus 0.85. Missing years are treated as old
/// (0.85); future years as current (1.00).
fn age_multiplier(current_year: i32, year: Option<i32>) -> f32 {
    let Some(year) = year else {
        return 0.85;
    };
    let age = current_year - year;
    if age < 0 {
        return 1.0;
    }
    match age {
        0 => 1.00,
        1 => 0.95,
        2 => 0.90,
        3 | 4 => 0.88,
        _ => 0.85,
    }
}

fn apply_recency_decay(candidates: &mut [RetrievalCandidate], recency_weight: f32) {
    let current_year = chrono::Utc::now().year();
    for candidate in candidates.iter_mut() {
        let multiplier = age_multiplier(current_year, candidate.year());
        let effective = 1.0 + recency_weight * (multiplier - 1.0);
        candidate
            .metadata
            .insert("_original_score".to_string(), json_f32(candidate.score));
        candidate
            .metadata
            .insert("_age_multiplier".to_string(), json_f32(multiplier));
        candidate.score *= effective;
    }
}

/// Score descending; ties by (doc_id, chunk_index) ascending.
fn sort_candidates(candidates: &mut [RetrievalCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tie_key().cmp(&b.tie_key()))
    });
}

/// Greedy per-document cap: walk the sorted list and accept a candidate
/// only while its document has fewer than `max_per_doc` accepted.
fn diversify(candidates: Vec<RetrievalCandidate>, max_per_doc: usize) -> Vec<RetrievalCandidate> {
    let mut per_doc: HashMap<String, usize> = HashMap::new();
    let mut accepted = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let count = per_doc.entry(candidate.doc_id.clone()).or_insert(0);
        if *count < max_per_doc {
            *count += 1;
            accepted.push(candidate);
        }
    }
    accepted
}

fn json_f32(value: f32) -> serde_json::Value {
    serde_json::Number::from_f64(value as f64)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RagConfig;
    use crate::search::Bm25Params;
    use crate::storage::FilterExpr;
    use crate::telemetry::TracingTelemetry;
    use crate::types::{ChunkRecord, ScoredPoint};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn payload(doc_id: &str, index: u32, text: &str, year: Option<i32>) -> ChunkPayload {
        ChunkPayload {
            chunk_id: format!("{}_{}", doc_id, index),
            doc_id: doc_id.to_string(),
            chunk_index: index,
            text: text.to_string(),
            filename: format!("{}.pdf", doc_id),
            doc_type: "Grant Proposal".into(),
            year,
            programs: vec!["Education".into()],
            outcome: None,
            chunking_strategy: "sentence".into(),
            char_count: text.len() as u32,
            word_count: text.split_whitespace().count() as u32,
            created_at: 0,
        }
    }

    /// In-memory vector index scoring by pre-assigned similarity.
    struct FakeVectorIndex {
        hits: Mutex<Vec<ScoredPoint>>,
    }

    impl FakeVectorIndex {
        fn with_hits(hits: Vec<(ChunkPayload, f32)>) -> Self {
            Self {
                hits: Mutex::new(
                    hits.into_iter()
                        .map(|(payload, score)| ScoredPoint {
                            id: payload.chunk_id.clone(),
                            score,
                            payload,
                        })
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl VectorIndex for FakeVectorIndex {
        async fn ensure_collection(&self, _dimension: usize) -> Result<()> {
            Ok(())
        }
        async fn upsert(&self, _chunks: Vec<ChunkRecord>) -> Result<()> {
            Ok(())
        }
        async fn search(
            &self,
            _vector: &[f32],
            k: usize,
            filter: &[FilterExpr],
        ) -> Result<Vec<ScoredPoint>> {
            let mut hits: Vec<ScoredPoint> = self
                .hits
                .lock()
                .iter()
                .filter(|h| expr_matches(filter, &h.payload))
                .cloned()
                .collect();
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
            hits.truncate(k);
            Ok(hits)
        }
        async fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize> {
            let mut hits = self.hits.lock();
            let before = hits.len();
            hits.retain(|h| h.payload.doc_id != doc_id);
            Ok(before - hits.len())
        }
        async fn update_doc_metadata(
            &self,
            doc_id: &str,
            doc_type: &str,
            year: Option<i32>,
            programs: &[String],
            outcome: Option<&str>,
        ) -> Result<()> {
            for hit in self.hits.lock().iter_mut() {
                if hit.payload.doc_id == doc_id {
                    hit.payload.doc_type = doc_type.to_string();
                    hit.payload.year = year;
                    hit.payload.programs = programs.to_vec();
                    hit.payload.outcome = outcome.map(|o| o.to_string());
                }
            }
            Ok(())
        }
        async fn scroll(&self, _batch_size: usize) -> Result<Vec<ChunkPayload>> {
            Ok(self.hits.lock().iter().map(|h| h.payload.clone()).collect())
        }
        async fn count(&self) -> Result<usize> {
            Ok(self.hits.lock().len())
        }
        async fn count_for_doc(&self, doc_id: &str) -> Result<usize> {
            Ok(self
                .hits
                .lock()
                .iter()
                .filter(|h| h.payload.doc_id == doc_id)
                .count())
        }
        async fn health(&self) -> Result<()> {
            Ok(())
        }
    }

    fn expr_matches(exprs: &[FilterExpr], payload: &ChunkPayload) -> bool {
        use crate::storage::FilterValue;
        exprs.iter().all(|expr| match expr {
            FilterExpr::Eq(field, value) => field_value(payload, field)
                .map(|v| &v == value)
                .unwrap_or(false),
            FilterExpr::InSet(field, values) if field == "programs" => values.iter().any(|v| {
                matches!(v, FilterValue::Str(s) if payload.programs.iter().any(|p| p.eq_ignore_ascii_case(s)))
            }),
            FilterExpr::InSet(field, values) => field_value(payload, field)
                .map(|v| values.contains(&v))
                .unwrap_or(false),
            FilterExpr::NotInSet(field, values) => field_value(payload, field)
                .map(|v| !values.contains(&v))
                .unwrap_or(true),
            FilterExpr::Between(field, lo, hi) => match field_value(payload, field) {
                Some(FilterValue::Int(v)) => v >= *lo && v <= *hi,
                _ => false,
            },
        })
    }

    fn field_value(payload: &ChunkPayload, field: &str) -> Option<crate::storage::FilterValue> {
        use crate::storage::FilterValue;
        match field {
            "doc_type" => Some(FilterValue::Str(payload.doc_type.clone())),
            "year" => payload.year.map(|y| FilterValue::Int(y as i64)),
            "outcome" => payload.outcome.clone().map(FilterValue::Str),
            "filename" => Some(FilterValue::Str(payload.filename.clone())),
            _ => None,
        }
    }

    /// Deterministic embedding: constant vector. The fake index ignores
    /// the query vector anyway.
    struct FakeEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for FakeEmbeddings {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1; 8]).collect())
        }
        fn dimension(&self) -> usize {
            8
        }
    }

    struct FailingReranker;

    impl Reranker for FailingReranker {
        fn model_name(&self) -> &str {
            "failing-reranker"
        }
        fn rerank(
            &self,
            _query: &str,
            _candidates: &[(String, String)],
            _top_k: usize,
        ) -> Result<Vec<(String, f32)>> {
            Err(RagError::dependency("reranker", "boom"))
        }
    }

    struct ReversingReranker;

    impl Reranker for ReversingReranker {
        fn model_name(&self) -> &str {
            "reversing-reranker"
        }
        fn rerank(
            &self,
            _query: &str,
            candidates: &[(String, String)],
            _top_k: usize,
        ) -> Result<Vec<(String, f32)>> {
            // Score inversely to input position.
            Ok(candidates
                .iter()
                .enumerate()
                .map(|(i, (id, _))| (id.clone(), i as f32))
                .collect())
        }
    }

    async fn engine_with(
        dense: Vec<(ChunkPayload, f32)>,
        sparse_corpus: Vec<ChunkPayload>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> RetrievalEngine {
        let vector_index = Arc::new(FakeVectorIndex::with_hits(dense));
        let keyword_index = Arc::new(KeywordIndex::new(Bm25Params::default()));
        if !sparse_corpus.is_empty() {
            let corpus_index = FakeVectorIndex::with_hits(
                sparse_corpus.into_iter().map(|p| (p, 0.0)).collect(),
            );
            keyword_index.rebuild(&corpus_index).await.unwrap();
        }
        RetrievalEngine::new(
            vector_index,
            keyword_index,
            Arc::new(FakeEmbeddings),
            reranker,
            Arc::new(TracingTelemetry::new()),
            RagConfig::default().retrieval,
        )
    }

    #[tokio::test]
    async fn empty_query_returns_zero_results() {
        let engine = engine_with(vec![], vec![], None).await;
        let cancel = CancellationToken::new();
        let results = engine.retrieve("  ?! ", 5, None, 0.0, &cancel).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn fusion_combines_both_legs_and_records_subscores() {
        let shared = payload("a", 0, "education grant outcomes", Some(2024));
        let dense_only = payload("b", 0, "strategic plan overview", Some(2023));
        let sparse_only = payload("c", 0, "education grant budget", Some(2022));

        let engine = engine_with(
            vec![(shared.clone(), 0.9), (dense_only.clone(), 0.7)],
            vec![shared.clone(), sparse_only.clone()],
            None,
        )
        .await;

        let cancel = CancellationToken::new();
        let results = engine
            .retrieve("education grant", 5, None, 0.0, &cancel)
            .await
            .unwrap();

        assert!(!results.is_empty());
        // The chunk present in both legs wins.
        assert_eq!(results[0].chunk_id, "a_0");
        assert!(results[0].metadata.contains_key("_vector_score"));
        assert!(results[0].metadata.contains_key("_keyword_score"));

        // Every chunk_id appears at most once.
        let mut seen = std::collections::HashSet::new();
        for r in &results {
            assert!(seen.insert(r.chunk_id.clone()));
        }
        // Scores are monotonically non-increasing.
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn recency_weight_orders_equal_scores_by_year() {
        let current_year = chrono::Utc::now().year();
        let recent = payload("recent", 0, "identical text", Some(current_year));
        let old = payload("older", 0, "identical text", Some(current_year - 5));

        // Identical cosine scores.
        let dense = vec![(old.clone(), 0.80), (recent.clone(), 0.80)];

        let engine = engine_with(dense.clone(), vec![], None).await;
        let cancel = CancellationToken::new();

        let weighted = engine
            .retrieve("identical text", 5, None, 1.0, &cancel)
            .await
            .unwrap();
        assert_eq!(weighted[0].doc_id, "recent");
        let multiplier = weighted[1].metadata.get("_age_multiplier").unwrap();
        assert!((multiplier.as_f64().unwrap() - 0.85).abs() < 1e-6);
        assert!(weighted[0].metadata.contains_key("_original_score"));

        // Without recency the tie breaks by (doc_id, chunk_index).
        let engine = engine_with(dense, vec![], None).await;
        let unweighted = engine
            .retrieve("identical text", 5, None, 0.0, &cancel)
            .await
            .unwrap();
        assert_eq!(unweighted[0].doc_id, "older");
    }

    #[tokio::test]
    async fn future_year_uses_multiplier_one() {
        let current_year = chrono::Utc::now().year();
        let future = payload("future", 0, "planned work", Some(current_year + 1));
        let engine = engine_with(vec![(future, 0.8)], vec![], None).await;
        let cancel = CancellationToken::new();

        let results = engine
            .retrieve("planned work", 5, None, 1.0, &cancel)
            .await
            .unwrap();
        let multiplier = results[0].metadata.get("_age_multiplier").unwrap();
        assert!((multiplier.as_f64().unwrap() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn diversification_caps_candidates_per_document() {
        let mut dense = Vec::new();
        for i in 0..6 {
            dense.push((
                payload("long", i, &format!("education chunk {}", i), Some(2024)),
                0.9 - i as f32 * 0.01,
            ));
        }
        dense.push((payload("short", 0, "education summary", Some(2024)), 0.5));

        let engine = engine_with(dense, vec![], None).await;
        let cancel = CancellationToken::new();
        let results = engine
            .retrieve("education", 10, None, 0.0, &cancel)
            .await
            .unwrap();

        let from_long = results.iter().filter(|r| r.doc_id == "long").count();
        assert_eq!(from_long, 3);
        assert!(results.iter().any(|r| r.doc_id == "short"));
    }

    #[tokio::test]
    async fn filters_restrict_both_legs() {
        let in_range = payload("a", 0, "education grant", Some(2021));
        let excluded = payload("b", 0, "education grant", Some(2019));

        let engine = engine_with(
            vec![(in_range.clone(), 0.9), (excluded.clone(), 0.95)],
            vec![in_range, excluded],
            None,
        )
        .await;

        let filters = DocumentFilters {
            years: Some(vec![2021, 2024]),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let results = engine
            .retrieve("education grant", 5, Some(&filters), 0.0, &cancel)
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.year() != Some(2019)));
    }

    #[tokio::test]
    async fn reranker_failure_degrades_to_fused_list() {
        let dense = vec![
            (payload("a", 0, "education grant", Some(2024)), 0.9),
            (payload("b", 0, "education budget", Some(2023)), 0.8),
        ];
        let engine = engine_with(dense, vec![], Some(Arc::new(FailingReranker))).await;
        let cancel = CancellationToken::new();
        let results = engine
            .retrieve("education", 5, None, 0.0, &cancel)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, "a_0");
        assert!(results.iter().all(|r| !r.metadata.contains_key("_reranked")));
    }

    #[tokio::test]
    async fn reranker_success_replaces_scores_and_tags() {
        let dense = vec![
            (payload("a", 0, "education grant", Some(2024)), 0.9),
            (payload("b", 0, "education budget", Some(2023)), 0.8),
        ];
        let engine = engine_with(dense, vec![], Some(Arc::new(ReversingReranker))).await;
        let cancel = CancellationToken::new();
        let results = engine
            .retrieve("education", 5, None, 0.0, &cancel)
            .await
            .unwrap();

        // ReversingReranker scores the second input higher.
        assert_eq!(results[0].chunk_id, "b_0");
        assert!(results[0].metadata.get("_reranked").unwrap().as_bool().unwrap());
        assert_eq!(
            results[0].metadata.get("_reranker_model").unwrap().as_str().unwrap(),
            "reversing-reranker"
        );
    }

    #[tokio::test]
    async fn cancellation_aborts_before_fusion() {
        let engine = engine_with(
            vec![(payload("a", 0, "education", Some(2024)), 0.9)],
            vec![],
            None,
        )
        .await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .retrieve("education", 5, None, 0.0, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn normalize_scores_handles_uniform_lists() {
        assert_eq!(normalize_scores(vec![0.5, 0.5, 0.5]), vec![1.0, 1.0, 1.0]);
        let normalized = normalize_scores(vec![1.0, 3.0, 2.0]);
        assert_eq!(normalized[0], 0.0);
        assert_eq!(normalized[1], 1.0);
        assert!((normalized[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn age_multiplier_table() {
        let year = 2025;
        assert_eq!(age_multiplier(year, Some(2025)), 1.00);
        assert_eq!(age_multiplier(year, Some(2024)), 0.95);
        assert_eq!(age_multiplier(year, Some(2023)), 0.90);
        assert_eq!(age_multiplier(year, Some(2022)), 0.88);
        assert_eq!(age_multiplier(year, Some(2021)), 0.88);
        assert_eq!(age_multiplier(year, Some(2020)), 0.85);
        assert_eq!(age_multiplier(year, Some(2010)), 0.85);
        assert_eq!(age_multiplier(year, None), 0.85);
        assert_eq!(age_multiplier(year, Some(2026)), 1.00);
    }

    #[test]
    fn equal_scores_order_by_doc_then_index() {
        let mut candidates = vec![
            RetrievalCandidate::from_payload(&payload("b", 1, "x", None), 0.5),
            RetrievalCandidate::from_payload(&payload("a", 2, "x", None), 0.5),
            RetrievalCandidate::from_payload(&payload("a", 0, "x", None), 0.5),
        ];
        sort_candidates(&mut candidates);
        let order: Vec<(&str, u32)> = candidates.iter().map(|c| c.tie_key()).collect();
        assert_eq!(order, vec![("a", 0), ("a", 2), ("b", 1)]);
    }
}
