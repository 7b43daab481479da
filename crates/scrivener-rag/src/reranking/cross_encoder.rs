//! ONNX cross-encoder reranker (ms-marco MiniLM family).
//!
//! Each (query, candidate) pair is scored jointly and the raw logit is
//! mapped through a sigmoid, so reranked scores land in the same [0, 1]
//! range as the fused retrieval scores they replace. Pair scores are
//! memoized: a repeated query rescoring the same chunks skips
//! inference entirely. The rerank set is already truncated to top_k
//! upstream, so inference runs one pair at a time.

use anyhow::anyhow;
use lru::LruCache;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use super::Reranker;
use crate::error::{RagError, Result};

const SCORE_CACHE_CAPACITY: usize = 2048;

pub struct CrossEncoderReranker {
    session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    model_name: String,
    max_length: usize,
    /// Memoized sigmoid scores keyed by a (query, text) pair hash.
    scores: Mutex<LruCache<u64, f32>>,
}

impl CrossEncoderReranker {
    pub fn new(model_dir: &Path, model_name: &str) -> Result<Self> {
        let model_path = Self::find_model(model_dir)?;
        let tokenizer_path = model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(RagError::dependency(
                "reranker",
                format!("tokenizer not found at {}", tokenizer_path.display()),
            ));
        }

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| RagError::dependency("reranker", format!("tokenizer load failed: {:?}", e)))?;

        let model_bytes = std::fs::read(&model_path)
            .map_err(|e| RagError::dependency("reranker", e.to_string()))?;
        let session = Session::builder()
            .map_err(|e| RagError::dependency("reranker", format!("{:?}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| RagError::dependency("reranker", format!("{:?}", e)))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| RagError::dependency("reranker", format!("{:?}", e)))?;

        let capacity = NonZeroUsize::new(SCORE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model_name: model_name.to_string(),
            max_length: 512,
            scores: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn find_model(model_dir: &Path) -> Result<PathBuf> {
        let candidates = [model_dir.join("model_O4.onnx"), model_dir.join("model.onnx")];
        for path in &candidates {
            if path.exists() {
                return Ok(path.clone());
            }
        }
        Err(RagError::dependency(
            "reranker",
            format!("no ONNX model found in {}", model_dir.display()),
        ))
    }

    /// Joint relevance of one (query, text) pair as sigmoid(logit).
    fn score_pair(&self, query: &str, text: &str) -> Result<f32> {
        let encoding = self
            .tokenizer
            .encode((query, text), true)
            .map_err(|e| anyhow!("tokenization failed: {:?}", e))?;

        let length = encoding.get_ids().len().min(self.max_length);
        if length == 0 {
            return Err(anyhow!("pair tokenized to nothing").into());
        }
        let token_ids: Vec<i64> = encoding.get_ids()[..length].iter().map(|&v| v as i64).collect();
        let attention: Vec<i64> = encoding.get_attention_mask()[..length]
            .iter()
            .map(|&v| v as i64)
            .collect();
        let segments: Vec<i64> = encoding.get_type_ids()[..length]
            .iter()
            .map(|&v| v as i64)
            .collect();

        let shape = vec![1usize, length];
        let inputs = ort::inputs![
            "input_ids" => Value::from_array((shape.clone(), token_ids))
                .map_err(|e| anyhow!("input_ids: {:?}", e))?,
            "attention_mask" => Value::from_array((shape.clone(), attention))
                .map_err(|e| anyhow!("attention_mask: {:?}", e))?,
            "token_type_ids" => Value::from_array((shape, segments))
                .map_err(|e| anyhow!("token_type_ids: {:?}", e))?,
        ];

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| anyhow!("cross-encoder inference failed: {:?}", e))?;
        let (_, first) = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("cross-encoder produced no outputs"))?;
        let (_shape, logits) = first
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("failed to extract logits: {:?}", e))?;
        let logit = logits
            .first()
            .copied()
            .ok_or_else(|| anyhow!("cross-encoder returned an empty logits tensor"))?;
        Ok(sigmoid(logit))
    }
}

fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

fn pair_key(query: &str, text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    text.hash(&mut hasher);
    hasher.finish()
}

impl Reranker for CrossEncoderReranker {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn rerank(
        &self,
        query: &str,
        candidates: &[(String, String)],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(String, f32)> = Vec::with_capacity(candidates.len());
        for (chunk_id, text) in candidates {
            let key = pair_key(query, text);
            if let Some(&score) = self.scores.lock().get(&key) {
                scored.push((chunk_id.clone(), score));
                continue;
            }
            match self.score_pair(query, text) {
                Ok(score) => {
                    self.scores.lock().put(key, score);
                    scored.push((chunk_id.clone(), score));
                }
                Err(e) => {
                    // An unscored candidate keeps its fused score upstream.
                    tracing::debug!(chunk_id = %chunk_id, error = %e, "candidate left unscored");
                }
            }
        }

        if scored.is_empty() {
            return Err(RagError::dependency(
                "reranker",
                "no candidate could be scored",
            ));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_maps_logits_into_unit_interval() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(8.0) > 0.99);
        assert!(sigmoid(-8.0) < 0.01);
        assert!(sigmoid(2.0) > sigmoid(1.0));
    }

    #[test]
    fn pair_keys_distinguish_query_and_text() {
        let base = pair_key("education grant", "chunk text");
        assert_eq!(base, pair_key("education grant", "chunk text"));
        assert_ne!(base, pair_key("education grant", "other chunk"));
        assert_ne!(base, pair_key("health grant", "chunk text"));
        // Swapping the halves must not collide.
        assert_ne!(pair_key("a", "b"), pair_key("b", "a"));
    }
}
