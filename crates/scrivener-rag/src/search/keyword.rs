//! In-process BM25 keyword index over the chunk corpus.
//!
//! The vector index is the source of truth; this index is rebuilt from
//! its scroll on cold start and after writes. A rebuild constructs a
//! fresh snapshot off to the side and swaps it in atomically, so queries
//! observe either the pre-swap or post-swap state, never a partial one.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::Result;
use crate::storage::VectorIndex;
use crate::types::{ChunkPayload, DocumentFilters};

#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// Lowercase, split on non-alphanumeric runs, keep numeric tokens,
/// drop empties. No stemming.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

struct IndexedChunk {
    payload: ChunkPayload,
    length: u32,
}

/// Immutable index state. BTreeMap keeps term iteration deterministic,
/// so two rebuilds over the same corpus produce identical snapshots.
struct Bm25Snapshot {
    chunks: Vec<IndexedChunk>,
    /// term -> [(chunk ordinal, term frequency)]
    postings: BTreeMap<String, Vec<(u32, u32)>>,
    avg_doc_len: f32,
}

impl Bm25Snapshot {
    fn build(payloads: Vec<ChunkPayload>) -> Self {
        let mut chunks = Vec::with_capacity(payloads.len());
        let mut postings: BTreeMap<String, Vec<(u32, u32)>> = BTreeMap::new();
        let mut total_len = 0u64;

        let mut sorted = payloads;
        sorted.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));

        for (ordinal, payload) in sorted.into_iter().enumerate() {
            let tokens = tokenize(&payload.text);
            let length = tokens.len() as u32;
            total_len += length as u64;

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for (term, count) in tf {
                postings.entry(term).or_default().push((ordinal as u32, count));
            }
            chunks.push(IndexedChunk { payload, length });
        }

        let avg_doc_len = if chunks.is_empty() {
            0.0
        } else {
            total_len as f32 / chunks.len() as f32
        };

        Self {
            chunks,
            postings,
            avg_doc_len,
        }
    }

    fn score(&self, query_tokens: &[String], params: Bm25Params) -> Vec<(u32, f32)> {
        let n = self.chunks.len() as f32;
        let mut scores: HashMap<u32, f32> = HashMap::new();

        for term in query_tokens {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for &(ordinal, tf) in posting {
                let len = self.chunks[ordinal as usize].length as f32;
                let tf = tf as f32;
                let denom = tf + params.k1 * (1.0 - params.b + params.b * len / self.avg_doc_len.max(1.0));
                let term_score = idf * tf * (params.k1 + 1.0) / denom;
                *scores.entry(ordinal).or_insert(0.0) += term_score;
            }
        }

        let mut scored: Vec<(u32, f32)> = scores.into_iter().collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }
}

pub struct KeywordIndex {
    params: Bm25Params,
    snapshot: RwLock<Option<Arc<Bm25Snapshot>>>,
    /// Serializes rebuilds; readers never wait on this.
    rebuild_lock: tokio::sync::Mutex<()>,
}

impl KeywordIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            snapshot: RwLock::new(None),
            rebuild_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_built(&self) -> bool {
        self.snapshot.read().is_some()
    }

    pub fn len(&self) -> usize {
        self.snapshot
            .read()
            .as_ref()
            .map(|s| s.chunks.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scroll the vector index and swap in a fresh snapshot. Queries in
    /// flight keep reading the previous snapshot until the swap.
    pub async fn rebuild(&self, index: &dyn VectorIndex) -> Result<usize> {
        let _guard = self.rebuild_lock.lock().await;
        let payloads = index.scroll(256).await?;
        let count = payloads.len();
        let fresh = Arc::new(Bm25Snapshot::build(payloads));
        *self.snapshot.write() = Some(fresh);
        tracing::info!(chunks = count, "keyword index rebuilt");
        Ok(count)
    }

    /// BM25 top-k with payload-side metadata filtering. An empty or
    /// whitespace-only query returns zero results without scoring; an
    /// unbuilt index returns zero results and lets the dense leg carry
    /// the query.
    pub fn search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&DocumentFilters>,
    ) -> Vec<(ChunkPayload, f32)> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || k == 0 {
            return Vec::new();
        }

        let snapshot = match self.snapshot.read().clone() {
            Some(s) => s,
            None => return Vec::new(),
        };

        let scored = snapshot.score(&query_tokens, self.params);
        let mut out = Vec::with_capacity(k);
        for (ordinal, score) in scored {
            let payload = &snapshot.chunks[ordinal as usize].payload;
            if let Some(f) = filters {
                if !f.matches(payload) {
                    continue;
                }
            }
            out.push((payload.clone(), score));
            if out.len() >= k {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn built_index(payloads: Vec<ChunkPayload>) -> KeywordIndex {
        let index = KeywordIndex::new(Bm25Params::default());
        let snapshot = Bm25Snapshot::build(payloads);
        *index.snapshot.write() = Some(Arc::new(snapshot));
        index
    }

    #[test]
    fn tokenizer_matches_contract() {
        assert_eq!(
            tokenize("Hello World! How are you?"),
            vec!["hello", "world", "how", "are", "you"]
        );
        let tokens = tokenize("RFP-2024: Grant funding for $100,000");
        assert!(tokens.contains(&"rfp".to_string()));
        assert!(tokens.contains(&"2024".to_string()));
        assert!(tokens.contains(&"100".to_string()));
        assert!(tokens.contains(&"grant".to_string()));
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn empty_query_returns_nothing_without_scoring() {
        let index = built_index(vec![payload("a", 0, "education grant outcomes", None)]);
        assert!(index.search("", 5, None).is_empty());
        assert!(index.search("  \t ", 5, None).is_empty());
    }

    #[test]
    fn unbuilt_index_returns_empty() {
        let index = KeywordIndex::new(Bm25Params::default());
        assert!(!index.is_built());
        assert!(index.search("education", 5, None).is_empty());
    }

    #[test]
    fn relevant_chunk_ranks_first() {
        let index = built_index(vec![
            payload("a", 0, "education grant outcomes for after-school programs", None),
            payload("b", 0, "facility maintenance schedule for the gym", None),
            payload("c", 0, "annual education budget overview", None),
        ]);
        let results = index.search("education grant", 3, None);
        assert!(!results.is_empty());
        assert_eq!(results[0].0.doc_id, "a");
        // Scores are non-increasing.
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn filters_apply_by_payload() {
        let index = built_index(vec![
            payload("a", 0, "education grant", Some(2019)),
            payload("b", 0, "education grant", Some(2021)),
            payload("c", 0, "education grant", Some(2024)),
        ]);
        let filters = DocumentFilters {
            years: Some(vec![2021, 2024]),
            ..Default::default()
        };
        let results = index.search("education grant", 10, Some(&filters));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(p, _)| p.year != Some(2019)));
    }

    #[test]
    fn rebuild_is_deterministic() {
        let corpus = vec![
            payload("a", 0, "education grant outcomes", None),
            payload("a", 1, "after-school program attendance", None),
            payload("b", 0, "capital campaign for the library", None),
        ];
        let one = Bm25Snapshot::build(corpus.clone());
        let two = Bm25Snapshot::build(corpus);

        assert_eq!(one.chunks.len(), two.chunks.len());
        assert_eq!(one.avg_doc_len, two.avg_doc_len);
        let terms_one: Vec<&String> = one.postings.keys().collect();
        let terms_two: Vec<&String> = two.postings.keys().collect();
        assert_eq!(terms_one, terms_two);
        for (term, posting) in &one.postings {
            assert_eq!(posting, two.postings.get(term).unwrap());
        }

        let query = tokenize("education program library");
        assert_eq!(
            one.score(&query, Bm25Params::default()),
            two.score(&query, Bm25Params::default())
        );
    }

    #[test]
    fn rare_terms_outweigh_common_terms() {
        let mut corpus = Vec::new();
        for i in 0..20 {
            corpus.push(payload(&format!("common{}", i), 0, "grant grant grant funding", None));
        }
        corpus.push(payload("rare", 0, "grant zirconium funding", None));

        let index = built_index(corpus);
        let results = index.search("zirconium", 5, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.doc_id, "rare");
    }
}
