pub mod cross_encoder;

pub use cross_encoder::CrossEncoderReranker;

use crate::error::Result;

/// Cross-encoder scoring over a small candidate set. Implementations
/// score each (query, text) pair jointly; higher is more relevant.
/// Failures never fail a request: the retrieval engine degrades to the
/// fused ordering.
pub trait Reranker: Send + Sync {
    fn model_name(&self) -> &str;

    /// Rerank `(chunk_id, text)` pairs, returning `(chunk_id, score)`
    /// sorted descending, truncated to `top_k`.
    fn rerank(&self, query: &str, candidates: &[(String, String)], top_k: usize)
        -> Result<Vec<(String, f32)>>;
}
