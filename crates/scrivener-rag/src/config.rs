use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::processing::chunker::ChunkingStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub reranker: RerankerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL; defaults to a sqlite file under data_dir.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

/// Wire format spoken by the configured LLM endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmWireFormat {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub endpoint: String,
    pub wire: LlmWireFormat,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub strategy: ChunkingStrategy,
    /// Target chunk size in tokens.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks in tokens.
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    /// Both search legs fetch top_k * over_fetch before fusion.
    pub over_fetch: usize,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    /// Per-document candidate cap applied during diversification.
    pub max_per_doc: usize,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl RetrievalConfig {
    /// Fusion weights must sum to 1.0; normalize if the config drifted.
    pub fn normalized_weights(&self) -> (f32, f32) {
        let sum = self.vector_weight + self.keyword_weight;
        if sum <= 0.0 {
            return (0.7, 0.3);
        }
        if (sum - 1.0).abs() < 1e-6 {
            (self.vector_weight, self.keyword_weight)
        } else {
            (self.vector_weight / sum, self.keyword_weight / sum)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    pub enabled: bool,
    /// Directory holding the cross-encoder ONNX model + tokenizer.json.
    pub model_dir: PathBuf,
    pub model_name: String,
}

impl RagConfig {
    /// Validate config values, returning errors for clearly broken
    /// configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.chunking.chunk_size < 32 {
            return Err("chunking.chunk_size must be >= 32 tokens".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err("chunking.chunk_overlap must be < chunk_size".into());
        }
        if self.retrieval.default_top_k == 0 {
            return Err("retrieval.default_top_k must be > 0".into());
        }
        if self.retrieval.over_fetch == 0 {
            return Err("retrieval.over_fetch must be > 0".into());
        }
        if self.retrieval.max_per_doc == 0 {
            return Err("retrieval.max_per_doc must be > 0".into());
        }
        if self.retrieval.vector_weight < 0.0 || self.retrieval.keyword_weight < 0.0 {
            return Err("retrieval fusion weights must be non-negative".into());
        }
        if self.cache.max_size == 0 {
            return Err("cache.max_size must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn database_url(&self) -> String {
        self.database.url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                self.data_dir.join("scrivener.db").display()
            )
        })
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scrivener");

        Self {
            data_dir: data_dir.clone(),
            database: DatabaseConfig { url: None },
            embedding: EmbeddingConfig {
                endpoint: "https://api.openai.com/v1/embeddings".to_string(),
                model: "text-embedding-3-small".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                dimension: 1536,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                endpoint: "https://api.anthropic.com/v1/messages".to_string(),
                wire: LlmWireFormat::Anthropic,
                model: "claude-sonnet-4-20250514".to_string(),
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                temperature: 0.7,
                max_tokens: 4096,
                timeout_secs: 120,
            },
            chunking: ChunkingConfig {
                strategy: ChunkingStrategy::Sentence,
                chunk_size: 512,
                chunk_overlap: 50,
            },
            retrieval: RetrievalConfig {
                default_top_k: 5,
                over_fetch: 4,
                vector_weight: 0.7,
                keyword_weight: 0.3,
                max_per_doc: 3,
                bm25_k1: 1.5,
                bm25_b: 0.75,
            },
            cache: CacheConfig {
                enabled: true,
                max_size: 1000,
                ttl_seconds: 3600,
            },
            reranker: RerankerConfig {
                enabled: false,
                model_dir: data_dir.join("models").join("ms-marco-MiniLM-L6-v2"),
                model_name: "ms-marco-MiniLM-L6-v2".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RagConfig::default().validate().is_ok());
    }

    #[test]
    fn weight_normalization() {
        let mut config = RagConfig::default();
        config.retrieval.vector_weight = 1.4;
        config.retrieval.keyword_weight = 0.6;
        let (v, k) = config.retrieval.normalized_weights();
        assert!((v - 0.7).abs() < 1e-6);
        assert!((k - 0.3).abs() < 1e-6);
        assert!((v + k - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_overlap_at_least_chunk_size() {
        let mut config = RagConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        assert!(config.validate().is_err());
    }
}
