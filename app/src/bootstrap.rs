//! Wires the service graph: storage adapters, providers, indexes,
//! cache, and the two engines, all owned by one `AppState`.

use std::sync::Arc;
use std::time::Duration;

use scrivener_rag::cache::{CachedRetrieval, QueryCache};
use scrivener_rag::chat::QueryService;
use scrivener_rag::embeddings::{EmbeddingProvider, HttpEmbeddingProvider};
use scrivener_rag::error::{RagError, Result};
use scrivener_rag::generation::GenerationEngine;
use scrivener_rag::ingest::DocumentProcessor;
use scrivener_rag::llm::{GenerationParams, HttpLlmProvider};
use scrivener_rag::processing::Chunker;
use scrivener_rag::reranking::{CrossEncoderReranker, Reranker};
use scrivener_rag::retrieval::RetrievalEngine;
use scrivener_rag::search::{Bm25Params, KeywordIndex};
use scrivener_rag::storage::{
    LanceVectorIndex, MetadataStore, SqliteMetadataStore, VectorIndex,
};
use scrivener_rag::telemetry::{Telemetry, TracingTelemetry};
use scrivener_rag::RagConfig;

pub struct AppState {
    pub config: RagConfig,
    pub processor: DocumentProcessor,
    pub query_service: QueryService,
    pub cache: Arc<QueryCache>,
    pub store: Arc<dyn MetadataStore>,
    pub vector_index: Arc<dyn VectorIndex>,
    pub telemetry: Arc<TracingTelemetry>,
}

pub async fn build(config: RagConfig) -> Result<AppState> {
    config
        .validate()
        .map_err(|e| RagError::validation_field("config", e, "Fix the configuration file"))?;
    std::fs::create_dir_all(&config.data_dir).ok();

    let telemetry = Arc::new(TracingTelemetry::new());

    let lance_path = config.data_dir.join("lance_data");
    let vector_index: Arc<dyn VectorIndex> = Arc::new(
        LanceVectorIndex::connect(
            lance_path.to_str().unwrap_or("./lance_data"),
            config.embedding.dimension,
        )
        .await?,
    );

    let store: Arc<dyn MetadataStore> =
        Arc::new(SqliteMetadataStore::connect(&config.database_url()).await?);

    let embeddings: Arc<dyn EmbeddingProvider> =
        Arc::new(HttpEmbeddingProvider::new(&config.embedding)?);

    let keyword_index = Arc::new(KeywordIndex::new(Bm25Params {
        k1: config.retrieval.bm25_k1,
        b: config.retrieval.bm25_b,
    }));

    let cache = Arc::new(QueryCache::new(
        config.cache.max_size,
        Duration::from_secs(config.cache.ttl_seconds),
    ));
    let cache_for_writers = config.cache.enabled.then(|| Arc::clone(&cache));

    // A missing reranker model is a degraded mode, not a startup error.
    let reranker: Option<Arc<dyn Reranker>> = if config.reranker.enabled {
        match CrossEncoderReranker::new(&config.reranker.model_dir, &config.reranker.model_name) {
            Ok(reranker) => {
                tracing::info!(model = %config.reranker.model_name, "cross-encoder reranker loaded");
                Some(Arc::new(reranker))
            }
            Err(e) => {
                tracing::warn!(error = %e, "reranker unavailable, continuing without reranking");
                None
            }
        }
    } else {
        None
    };

    let chunker = Chunker::new(
        config.chunking.strategy,
        config.chunking.chunk_size,
        config.chunking.chunk_overlap,
        Some(Arc::clone(&embeddings)),
    );

    let processor = DocumentProcessor::new(
        chunker,
        Arc::clone(&embeddings),
        Arc::clone(&vector_index),
        Arc::clone(&store),
        Arc::clone(&keyword_index),
        cache_for_writers.clone(),
        Arc::clone(&telemetry) as Arc<dyn Telemetry>,
    );

    let retrieval_engine = Arc::new(RetrievalEngine::new(
        Arc::clone(&vector_index),
        Arc::clone(&keyword_index),
        Arc::clone(&embeddings),
        reranker,
        Arc::clone(&telemetry) as Arc<dyn Telemetry>,
        config.retrieval.clone(),
    ));
    let cached_retrieval = CachedRetrieval::new(retrieval_engine, cache_for_writers);

    let llm = Arc::new(HttpLlmProvider::new(&config.llm)?);
    let generation = GenerationEngine::new(
        llm,
        GenerationParams {
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        },
        Arc::clone(&telemetry) as Arc<dyn Telemetry>,
    );

    let query_service = QueryService::new(
        cached_retrieval,
        generation,
        Arc::clone(&store),
        Arc::clone(&telemetry) as Arc<dyn Telemetry>,
        config.retrieval.default_top_k,
    );

    Ok(AppState {
        config,
        processor,
        query_service,
        cache,
        store,
        vector_index,
        telemetry,
    })
}
