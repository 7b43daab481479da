//! Chunking strategies: sentence-aware, fixed-token, and semantic
//! similarity, with a deterministic character-window fallback so
//! ingestion can never fail on a chunker fault.
//!
//! Sizes are configured in whitespace tokens. A sentence-aware chunk
//! never ends mid-sentence unless a single sentence alone exceeds the
//! budget.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::embeddings::EmbeddingProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    Sentence,
    Token,
    Semantic,
}

impl ChunkingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sentence => "sentence",
            Self::Token => "token",
            Self::Semantic => "semantic",
        }
    }
}

/// Strategy tag recorded on chunks produced by the error-path splitter.
pub const FALLBACK_STRATEGY: &str = "fallback";

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: u32,
    pub char_count: u32,
    pub word_count: u32,
    pub strategy: String,
}

pub struct Chunker {
    strategy: ChunkingStrategy,
    chunk_size: usize,
    chunk_overlap: usize,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
}

impl Chunker {
    /// Build a chunker. A semantic chunker without an embedding provider
    /// degrades to sentence-aware at construction time.
    pub fn new(
        strategy: ChunkingStrategy,
        chunk_size: usize,
        chunk_overlap: usize,
        embeddings: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        let strategy = if strategy == ChunkingStrategy::Semantic && embeddings.is_none() {
            tracing::warn!("semantic chunking requested without embedding provider, using sentence strategy");
            ChunkingStrategy::Sentence
        } else {
            strategy
        };
        Self {
            strategy,
            chunk_size,
            chunk_overlap,
            embeddings,
        }
    }

    pub fn strategy(&self) -> ChunkingStrategy {
        self.strategy
    }

    /// Chunk text. Empty or whitespace-only input yields zero chunks.
    /// Any strategy failure falls back to the deterministic
    /// character-window split.
    pub async fn chunk(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let result = match self.strategy {
            ChunkingStrategy::Sentence => Ok(self.chunk_sentences(text)),
            ChunkingStrategy::Token => Ok(self.chunk_tokens(text)),
            ChunkingStrategy::Semantic => self.chunk_semantic(text).await,
        };

        match result {
            Ok(chunks) if !chunks.is_empty() => chunks,
            Ok(_) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, strategy = self.strategy.as_str(), "chunking failed, using character-window fallback");
                fallback_chunks(text)
            }
        }
    }

    fn chunk_sentences(&self, text: &str) -> Vec<TextChunk> {
        let sentences = split_sentences(text);
        self.pack_sentences(&sentences, self.strategy.as_str())
    }

    /// Greedy sentence packing with trailing-sentence overlap. Oversized
    /// single sentences get hard token windows.
    fn pack_sentences(&self, sentences: &[String], tag: &str) -> Vec<TextChunk> {
        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;

        let flush =
            |current: &mut Vec<&str>, current_tokens: &mut usize, chunks: &mut Vec<String>| {
                if !current.is_empty() {
                    chunks.push(current.join(" "));
                    current.clear();
                    *current_tokens = 0;
                }
            };

        for sentence in sentences {
            let tokens = token_count(sentence);

            if tokens > self.chunk_size {
                // A sentence bigger than the whole budget: close the
                // running chunk, then window the sentence itself.
                flush(&mut current, &mut current_tokens, &mut chunks);
                chunks.extend(window_tokens(sentence, self.chunk_size, self.chunk_overlap));
                continue;
            }

            if current_tokens + tokens > self.chunk_size && !current.is_empty() {
                chunks.push(current.join(" "));
                // Carry trailing sentences forward as overlap.
                let mut overlap: Vec<&str> = Vec::new();
                let mut overlap_tokens = 0usize;
                for s in current.iter().rev() {
                    let t = token_count(s);
                    if overlap_tokens + t > self.chunk_overlap {
                        break;
                    }
                    overlap.push(*s);
                    overlap_tokens += t;
                }
                overlap.reverse();
                current = overlap;
                current_tokens = overlap_tokens;
            }

            current.push(sentence);
            current_tokens += tokens;
        }
        flush(&mut current, &mut current_tokens, &mut chunks);

        finalize(chunks, tag)
    }

    fn chunk_tokens(&self, text: &str) -> Vec<TextChunk> {
        finalize(
            window_tokens(text, self.chunk_size, self.chunk_overlap),
            self.strategy.as_str(),
        )
    }

    /// Split on drops in embedding similarity between adjacent
    /// sentences: a breakpoint opens wherever the adjacent-pair
    /// similarity falls below the 5th percentile of all pair
    /// similarities. Oversized groups are re-packed sentence-wise.
    async fn chunk_semantic(&self, text: &str) -> Result<Vec<TextChunk>, crate::error::RagError> {
        let provider = self
            .embeddings
            .as_ref()
            .ok_or_else(|| crate::error::RagError::internal("semantic chunker has no embedding provider"))?;

        let sentences = split_sentences(text);
        if sentences.len() < 3 {
            return Ok(self.pack_sentences(&sentences, ChunkingStrategy::Semantic.as_str()));
        }

        let vectors = provider.embed(&sentences).await?;
        if vectors.len() != sentences.len() {
            return Err(crate::error::RagError::internal(
                "embedding provider returned a mismatched vector count",
            ));
        }

        let mut similarities: Vec<f32> = Vec::with_capacity(vectors.len() - 1);
        for pair in vectors.windows(2) {
            similarities.push(cosine(&pair[0], &pair[1]));
        }

        let mut sorted = similarities.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let cut_index = (sorted.len() as f32 * 0.05).floor() as usize;
        let threshold = sorted[cut_index.min(sorted.len() - 1)];

        let mut groups: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<String> = vec![sentences[0].clone()];
        for (i, sentence) in sentences.iter().enumerate().skip(1) {
            if similarities[i - 1] <= threshold && !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
            current.push(sentence.clone());
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let tag = ChunkingStrategy::Semantic.as_str();
        let mut out: Vec<String> = Vec::new();
        for group in groups {
            let joined = group.join(" ");
            if token_count(&joined) > self.chunk_size {
                out.extend(
                    self.pack_sentences(&group, tag)
                        .into_iter()
                        .map(|c| c.text),
                );
            } else {
                out.push(joined);
            }
        }

        Ok(finalize(out, tag))
    }
}

/// Deterministic character-window split used when a strategy fails.
pub fn fallback_chunks(text: &str) -> Vec<TextChunk> {
    const WINDOW: usize = 1000;
    const OVERLAP: usize = 100;

    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + WINDOW).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        if !piece.trim().is_empty() {
            out.push(piece);
        }
        if end == chars.len() {
            break;
        }
        start = end - OVERLAP;
    }
    finalize(out, FALLBACK_STRATEGY)
}

fn finalize(texts: Vec<String>, strategy: &str) -> Vec<TextChunk> {
    texts
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .enumerate()
        .map(|(i, text)| TextChunk {
            char_count: text.chars().count() as u32,
            word_count: token_count(&text) as u32,
            chunk_index: i as u32,
            strategy: strategy.to_string(),
            text,
        })
        .collect()
}

fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn window_tokens(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }
    let step = size.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < tokens.len() {
        let end = (start + size).min(tokens.len());
        out.push(tokens[start..end].join(" "));
        if end == tokens.len() {
            break;
        }
        start += step;
    }
    out
}

/// Sentence segmentation on `.`/`!`/`?` + whitespace, guarded against
/// common abbreviations and decimals. Page separators and blank lines
/// are hard boundaries.
pub fn split_sentences(text: &str) -> Vec<String> {
    const ABBREVIATIONS: &[&str] = &[
        "mr.", "mrs.", "ms.", "dr.", "jr.", "sr.", "st.", "no.", "vs.", "e.g.", "i.e.", "etc.",
        "u.s.", "inc.", "approx.",
    ];

    let mut sentences = Vec::new();
    for block in text.split(|c| c == '\u{c}').flat_map(|b| b.split("\n\n")) {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }

        let chars: Vec<char> = block.chars().collect();
        let mut start = 0usize;
        let mut i = 0usize;
        while i < chars.len() {
            let c = chars[i];
            if matches!(c, '.' | '!' | '?') {
                let followed_by_space = chars.get(i + 1).map_or(true, |n| n.is_whitespace());
                if followed_by_space {
                    let candidate: String = chars[start..=i].iter().collect();
                    let tail = candidate
                        .rsplit(char::is_whitespace)
                        .next()
                        .unwrap_or("")
                        .to_lowercase();
                    let is_abbrev = c == '.'
                        && (ABBREVIATIONS.contains(&tail.as_str())
                            || tail.trim_end_matches('.').chars().all(|c| c.is_ascii_digit()));
                    if !is_abbrev {
                        let trimmed = candidate.trim();
                        if !trimmed.is_empty() {
                            sentences.push(trimmed.to_string());
                        }
                        start = i + 1;
                    }
                }
            }
            i += 1;
        }
        if start < chars.len() {
            let rest: String = chars[start..].iter().collect();
            let trimmed = rest.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
        }
    }
    sentences
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence_chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkingStrategy::Sentence, size, overlap, None)
    }

    #[tokio::test]
    async fn empty_text_yields_zero_chunks() {
        let chunker = sentence_chunker(100, 10);
        assert!(chunker.chunk("").await.is_empty());
        assert!(chunker.chunk("   \n\t  ").await.is_empty());
    }

    #[tokio::test]
    async fn indices_are_dense_and_counts_match() {
        let text = "One two three. Four five six. Seven eight nine. Ten eleven twelve.";
        let chunker = sentence_chunker(6, 0);
        let chunks = chunker.chunk(text).await;
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(chunk.word_count as usize, chunk.text.split_whitespace().count());
            assert_eq!(chunk.char_count as usize, chunk.text.chars().count());
            assert_eq!(chunk.strategy, "sentence");
        }
    }

    #[tokio::test]
    async fn sentence_chunks_end_on_sentence_boundaries() {
        let text = "Alpha beta gamma delta. Epsilon zeta eta theta. Iota kappa lambda mu.";
        let chunker = sentence_chunker(8, 0);
        let chunks = chunker.chunk(text).await;
        for chunk in &chunks {
            assert!(
                chunk.text.ends_with('.'),
                "chunk does not end at a sentence boundary: {:?}",
                chunk.text
            );
        }
    }

    #[tokio::test]
    async fn oversized_sentence_is_windowed() {
        let long_sentence = (0..50).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let chunker = sentence_chunker(10, 2);
        let chunks = chunker.chunk(&long_sentence).await;
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.word_count <= 10));
    }

    #[tokio::test]
    async fn token_strategy_produces_fixed_windows() {
        let text = (0..100).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let chunker = Chunker::new(ChunkingStrategy::Token, 20, 5, None);
        let chunks = chunker.chunk(&text).await;
        assert!(!chunks.is_empty());
        assert!(chunks[..chunks.len() - 1].iter().all(|c| c.word_count == 20));
        assert_eq!(chunks[0].strategy, "token");
    }

    #[test]
    fn semantic_without_provider_degrades_to_sentence() {
        let chunker = Chunker::new(ChunkingStrategy::Semantic, 100, 10, None);
        assert_eq!(chunker.strategy(), ChunkingStrategy::Sentence);
    }

    #[test]
    fn sentence_split_guards_abbreviations() {
        let sentences = split_sentences("Dr. Smith met Mr. Jones. They agreed on terms.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].starts_with("Dr. Smith"));
    }

    #[test]
    fn fallback_is_deterministic() {
        let text = "x".repeat(2500);
        let a = fallback_chunks(&text);
        let b = fallback_chunks(&text);
        assert_eq!(a.len(), b.len());
        assert!(a.iter().zip(&b).all(|(x, y)| x.text == y.text));
        assert!(a.iter().all(|c| c.strategy == FALLBACK_STRATEGY));
    }

    #[test]
    fn overlap_carries_trailing_sentences() {
        let text = "First sentence here now. Second sentence here now. Third sentence here now.";
        let chunker = sentence_chunker(8, 4);
        let chunks = futures::executor::block_on(chunker.chunk(text));
        assert!(chunks.len() >= 2);
        // The overlap repeats the previous chunk's trailing sentence.
        assert!(chunks[1].text.starts_with("Second sentence")
            || chunks[1].text.starts_with("First sentence"));
    }
}
