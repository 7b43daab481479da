//! Retrieval-augmented generation engine for grounded long-form
//! writing: document processing, hybrid dense+BM25 retrieval with a
//! bounded query cache, and citation-validated generation.

pub mod cache;
pub mod chat;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod llm;
pub mod processing;
pub mod reranking;
pub mod retrieval;
pub mod search;
pub mod storage;
pub mod telemetry;
pub mod types;

// Re-export the primary surface for convenience.
pub use cache::{CachedRetrieval, QueryCache};
pub use chat::{QueryService, TurnOutcome, TurnRequest};
pub use config::RagConfig;
pub use error::{RagError, Result};
pub use generation::{GenerationEngine, GenerationResult, Source};
pub use ingest::DocumentProcessor;
pub use retrieval::RetrievalEngine;
pub use types::{
    DocType, DocumentFilters, DocumentRecord, Outcome, Program, RetrievalCandidate,
};
