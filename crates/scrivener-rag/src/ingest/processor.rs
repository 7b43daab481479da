//! Document processing orchestration: extract, chunk, embed, index,
//! record, then schedule the keyword rebuild and cache invalidation.
//!
//! The operation is effectively atomic from a reader's perspective:
//! chunks are written to the vector index first and the metadata record
//! second, so a reader that sees the document record also sees its
//! chunks. On a partial failure the already-written chunks are removed
//! by a best-effort compensation pass. Delete runs in the reverse
//! order: metadata record first, then vectors.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::cache::QueryCache;
use crate::embeddings::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::processing::{Chunker, ExtractorRegistry, MetadataExtractor, UserMetadata};
use crate::search::KeywordIndex;
use crate::storage::{MetadataStore, VectorIndex};
use crate::telemetry::Telemetry;
use crate::types::{
    AuditEvent, ChunkPayload, ChunkRecord, DocumentRecord, DocumentUpdate,
};

pub struct DocumentProcessor {
    registry: ExtractorRegistry,
    chunker: Chunker,
    metadata_extractor: MetadataExtractor,
    embeddings: Arc<dyn EmbeddingProvider>,
    vector_index: Arc<dyn VectorIndex>,
    metadata_store: Arc<dyn MetadataStore>,
    keyword_index: Arc<KeywordIndex>,
    cache: Option<Arc<QueryCache>>,
    telemetry: Arc<dyn Telemetry>,
}

#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub record: DocumentRecord,
    pub warnings: Vec<String>,
}

impl DocumentProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chunker: Chunker,
        embeddings: Arc<dyn EmbeddingProvider>,
        vector_index: Arc<dyn VectorIndex>,
        metadata_store: Arc<dyn MetadataStore>,
        keyword_index: Arc<KeywordIndex>,
        cache: Option<Arc<QueryCache>>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            registry: ExtractorRegistry::new(),
            chunker,
            metadata_extractor: MetadataExtractor::new(),
            embeddings,
            vector_index,
            metadata_store,
            keyword_index,
            cache,
            telemetry,
        }
    }

    pub async fn process_document(
        &self,
        bytes: &[u8],
        filename: &str,
        user_metadata: &UserMetadata,
        principal: &str,
    ) -> Result<ProcessedDocument> {
        let started = Instant::now();

        if bytes.is_empty() {
            return Err(RagError::validation_field(
                "file",
                "Uploaded file is empty",
                "Upload a file with content",
            ));
        }
        if !user_metadata.sensitivity_confirmed {
            return Err(RagError::validation_field(
                "sensitivity_confirmed",
                "Sensitivity review must be confirmed before ingest",
                "Review the document for sensitive content and confirm",
            ));
        }

        // C1: detect type, validate, extract.
        let extractor = self.registry.for_filename(filename)?;
        if let Err(reason) = extractor.validate(bytes) {
            return Err(RagError::validation_field(
                "file",
                format!("File failed {} validation: {}", extractor.format_name(), reason),
                "Check the file is intact and of the declared type",
            ));
        }
        let text = extractor.extract(bytes, filename)?;
        let format_metadata = extractor.metadata(bytes);

        // C3: merge metadata sources; validate programs against the live
        // table before any expensive work.
        let metadata = self.metadata_extractor.extract(
            user_metadata,
            bytes,
            filename,
            &text,
            format_metadata,
        );
        let programs = self
            .metadata_store
            .resolve_program_names(&metadata.programs)
            .await?;

        // C2: chunk.
        let chunks = self.chunker.chunk(&text).await;
        if chunks.is_empty() {
            return Err(RagError::validation_field(
                "file",
                "Document produced no chunks (empty after extraction)",
                "Check that the document contains real text",
            ));
        }

        // One batch embedding call for the whole document. Provider
        // failures surface here; nothing has been written yet.
        let chunk_texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embeddings.embed(&chunk_texts).await?;
        if vectors.len() != chunks.len() {
            return Err(RagError::dependency(
                "embedding_provider",
                format!("expected {} vectors, got {}", chunks.len(), vectors.len()),
            ));
        }

        let doc_id = metadata.doc_id;
        let now = Utc::now();
        let outcome_str = metadata.outcome.map(|o| o.as_str().to_string());
        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| ChunkRecord {
                payload: ChunkPayload {
                    chunk_id: ChunkPayload::chunk_id_for(&doc_id, chunk.chunk_index),
                    doc_id: doc_id.to_string(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text.clone(),
                    filename: filename.to_string(),
                    doc_type: metadata.doc_type.as_str().to_string(),
                    year: metadata.year,
                    programs: programs.clone(),
                    outcome: outcome_str.clone(),
                    chunking_strategy: chunk.strategy.clone(),
                    char_count: chunk.char_count,
                    word_count: chunk.word_count,
                    created_at: now.timestamp(),
                },
                vector,
            })
            .collect();
        let chunk_count = records.len() as u32;

        // C4 first. Compensate on failure so no orphan vectors remain.
        if let Err(e) = self.vector_index.upsert(records).await {
            self.compensate_vectors(&doc_id).await;
            return Err(e);
        }

        let record = DocumentRecord {
            doc_id,
            filename: filename.to_string(),
            doc_type: metadata.doc_type,
            year: metadata.year,
            programs,
            tags: metadata.tags.clone(),
            outcome: metadata.outcome,
            notes: metadata.notes.clone(),
            is_sensitive: false,
            sensitivity_confirmed_at: Some(now),
            created_by: principal.to_string(),
            chunk_count,
            word_count: metadata.word_count,
            file_size: metadata.file_size,
            created_at: now,
            updated_at: now,
        };

        // Metadata record second: a reader that sees the record is
        // guaranteed to see the chunks.
        if let Err(e) = self.metadata_store.insert_document(&record).await {
            self.compensate_vectors(&doc_id).await;
            return Err(e);
        }

        self.schedule_reindex();

        self.metadata_store
            .record_audit(&AuditEvent::new(
                "document.processed",
                principal,
                &doc_id.to_string(),
                serde_json::json!({
                    "filename": filename,
                    "chunks": chunk_count,
                    "warnings": metadata.warnings.clone(),
                }),
            ))
            .await
            .ok();
        self.telemetry.incr("ingest.documents", 1);
        self.telemetry.event(
            "document_processed",
            &[
                ("doc_id", doc_id.to_string()),
                ("chunks", chunk_count.to_string()),
            ],
        );
        self.telemetry.record_latency("ingest.total", started.elapsed());

        tracing::info!(
            doc_id = %doc_id,
            filename = filename,
            chunks = chunk_count,
            "document processed"
        );

        Ok(ProcessedDocument {
            record,
            warnings: metadata.warnings,
        })
    }

    /// Delete in the reverse of the write order: metadata record first,
    /// then vectors, so readers never see a document without chunks.
    pub async fn delete_document(&self, doc_id: Uuid, principal: &str) -> Result<usize> {
        let existed = self.metadata_store.delete_document(doc_id).await?;
        if !existed {
            return Err(RagError::NotFound {
                resource: "document",
                id: doc_id.to_string(),
            });
        }

        let removed = self.vector_index.delete_by_doc_id(&doc_id.to_string()).await?;
        self.schedule_reindex();

        self.metadata_store
            .record_audit(&AuditEvent::new(
                "document.deleted",
                principal,
                &doc_id.to_string(),
                serde_json::json!({ "chunks_removed": removed }),
            ))
            .await
            .ok();
        self.telemetry.event("document_deleted", &[("doc_id", doc_id.to_string())]);

        tracing::info!(doc_id = %doc_id, chunks_removed = removed, "document deleted");
        Ok(removed)
    }

    /// Explicit metadata update path. Re-flattens the filterable fields
    /// onto the document's chunk payloads and invalidates caches.
    pub async fn update_metadata(
        &self,
        doc_id: Uuid,
        update: &DocumentUpdate,
        principal: &str,
    ) -> Result<DocumentRecord> {
        let record = self.metadata_store.update_document(doc_id, update).await?;

        self.vector_index
            .update_doc_metadata(
                &doc_id.to_string(),
                record.doc_type.as_str(),
                record.year,
                &record.programs,
                record.outcome.map(|o| o.as_str()),
            )
            .await?;
        self.schedule_reindex();

        self.metadata_store
            .record_audit(&AuditEvent::new(
                "document.updated",
                principal,
                &doc_id.to_string(),
                serde_json::to_value(update).unwrap_or_default(),
            ))
            .await
            .ok();

        Ok(record)
    }

    /// Rebuild the keyword index from the vector index immediately.
    /// Used by cold start and the reindex command.
    pub async fn rebuild_keyword_index(&self) -> Result<usize> {
        self.keyword_index.rebuild(self.vector_index.as_ref()).await
    }

    async fn compensate_vectors(&self, doc_id: &Uuid) {
        // Compensation is attempted once; failures leave reconciliation
        // to the background scan.
        if let Err(e) = self.vector_index.delete_by_doc_id(&doc_id.to_string()).await {
            tracing::error!(doc_id = %doc_id, error = %e, "compensation delete failed, orphan chunks may remain");
            self.telemetry.incr("ingest.compensation_failures", 1);
        }
    }

    /// Non-blocking: the keyword rebuild and cache invalidation run off
    /// the request path. The completion counter makes the background
    /// pass observable to callers that need to wait for freshness.
    fn schedule_reindex(&self) {
        let keyword_index = Arc::clone(&self.keyword_index);
        let vector_index = Arc::clone(&self.vector_index);
        let cache = self.cache.clone();
        let telemetry = Arc::clone(&self.telemetry);
        tokio::spawn(async move {
            if let Err(e) = keyword_index.rebuild(vector_index.as_ref()).await {
                tracing::warn!(error = %e, "scheduled keyword rebuild failed");
            }
            if let Some(cache) = cache {
                cache.invalidate_all();
            }
            telemetry.incr("ingest.reindex_completed", 1);
        });
    }
}
