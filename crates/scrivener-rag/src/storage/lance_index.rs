//! LanceDB-backed implementation of the `VectorIndex` contract.
//!
//! The chunk collection is the source of truth for retrieval: every
//! chunk's vector and its flattened filterable payload live here. The
//! neutral filter algebra is translated into LanceDB SQL predicates.

use anyhow::Context;
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

use super::{FilterExpr, FilterValue, VectorIndex};
use crate::error::{RagError, Result};
use crate::types::{ChunkPayload, ChunkRecord, ScoredPoint};

const TABLE_NAME: &str = "chunks";
const SEED_ID: &str = "__seed__";

pub struct LanceVectorIndex {
    db: lancedb::Connection,
    dimension: usize,
}

impl LanceVectorIndex {
    pub async fn connect(path: &str, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path)
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;

        let index = Self { db, dimension };
        index.ensure_collection(dimension).await?;
        Ok(index)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("filename", DataType::Utf8, false),
            Field::new("doc_type", DataType::Utf8, false),
            Field::new("year", DataType::Int32, true),
            Field::new("programs_json", DataType::Utf8, false),
            Field::new("outcome", DataType::Utf8, true),
            Field::new("chunking_strategy", DataType::Utf8, false),
            Field::new("char_count", DataType::UInt32, false),
            Field::new("word_count", DataType::UInt32, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
            Field::new("created_at", DataType::Int64, false),
        ]))
    }

    fn build_batch(&self, chunks: &[ChunkRecord]) -> Result<RecordBatch> {
        let schema = self.schema();

        let chunk_ids: Vec<&str> = chunks.iter().map(|c| c.payload.chunk_id.as_str()).collect();
        let doc_ids: Vec<&str> = chunks.iter().map(|c| c.payload.doc_id.as_str()).collect();
        let chunk_indices: Vec<u32> = chunks.iter().map(|c| c.payload.chunk_index).collect();
        let texts: Vec<&str> = chunks.iter().map(|c| c.payload.text.as_str()).collect();
        let filenames: Vec<&str> = chunks.iter().map(|c| c.payload.filename.as_str()).collect();
        let doc_types: Vec<&str> = chunks.iter().map(|c| c.payload.doc_type.as_str()).collect();
        let years: Vec<Option<i32>> = chunks.iter().map(|c| c.payload.year).collect();
        let programs_jsons: Vec<String> = chunks
            .iter()
            .map(|c| serde_json::to_string(&c.payload.programs).unwrap_or_else(|_| "[]".to_string()))
            .collect();
        let outcomes: Vec<Option<&str>> = chunks
            .iter()
            .map(|c| c.payload.outcome.as_deref())
            .collect();
        let strategies: Vec<&str> = chunks
            .iter()
            .map(|c| c.payload.chunking_strategy.as_str())
            .collect();
        let char_counts: Vec<u32> = chunks.iter().map(|c| c.payload.char_count).collect();
        let word_counts: Vec<u32> = chunks.iter().map(|c| c.payload.word_count).collect();
        let created_ats: Vec<i64> = chunks.iter().map(|c| c.payload.created_at).collect();

        let flat_vectors: Vec<f32> = chunks.iter().flat_map(|c| c.vector.iter().copied()).collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(chunk_ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(doc_ids)),
                Arc::new(UInt32Array::from(chunk_indices)),
                Arc::new(StringArray::from(texts)),
                Arc::new(StringArray::from(filenames)),
                Arc::new(StringArray::from(doc_types)),
                Arc::new(Int32Array::from(years)),
                Arc::new(StringArray::from(
                    programs_jsons.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(outcomes)),
                Arc::new(StringArray::from(strategies)),
                Arc::new(UInt32Array::from(char_counts)),
                Arc::new(UInt32Array::from(word_counts)),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(created_ats)),
            ],
        )
        .context("Failed to build chunk RecordBatch")
        .map_err(RagError::Internal)
    }
}

/// Translate a conjunction of filter expressions into a LanceDB SQL
/// predicate. The `programs` field is stored as a JSON array string, so
/// set membership becomes an OR of quoted-substring matches.
pub fn translate_predicate(exprs: &[FilterExpr]) -> Option<String> {
    if exprs.is_empty() {
        return None;
    }

    let mut clauses = Vec::with_capacity(exprs.len());
    for expr in exprs {
        match expr {
            FilterExpr::Eq(field, value) => {
                clauses.push(format!("{} = {}", field, sql_value(value)));
            }
            FilterExpr::InSet(field, values) if field == "programs" => {
                let likes: Vec<String> = values
                    .iter()
                    .map(|v| {
                        let name = match v {
                            FilterValue::Str(s) => s.clone(),
                            FilterValue::Int(i) => i.to_string(),
                        };
                        format!("programs_json LIKE '%\"{}\"%'", escape(&name))
                    })
                    .collect();
                clauses.push(format!("({})", likes.join(" OR ")));
            }
            FilterExpr::InSet(field, values) => {
                let rendered: Vec<String> = values.iter().map(sql_value).collect();
                clauses.push(format!("{} IN ({})", field, rendered.join(", ")));
            }
            FilterExpr::NotInSet(field, values) => {
                let rendered: Vec<String> = values.iter().map(sql_value).collect();
                clauses.push(format!("{} NOT IN ({})", field, rendered.join(", ")));
            }
            FilterExpr::Between(field, lo, hi) => {
                clauses.push(format!("{} >= {} AND {} <= {}", field, lo, field, hi));
            }
        }
    }
    Some(clauses.join(" AND "))
}

fn sql_value(value: &FilterValue) -> String {
    match value {
        FilterValue::Str(s) => format!("'{}'", escape(s)),
        FilterValue::Int(i) => i.to_string(),
    }
}

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        if dimension != self.dimension {
            return Err(RagError::internal(format!(
                "vector index opened with dimension {} but caller expects {}",
                self.dimension, dimension
            )));
        }

        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;
        if names.contains(&TABLE_NAME.to_string()) {
            return Ok(());
        }

        // LanceDB infers the table schema from a first batch; seed with
        // one placeholder row and delete it.
        let seed = ChunkRecord {
            payload: ChunkPayload {
                chunk_id: SEED_ID.to_string(),
                doc_id: SEED_ID.to_string(),
                chunk_index: 0,
                text: String::new(),
                filename: String::new(),
                doc_type: String::new(),
                year: None,
                programs: Vec::new(),
                outcome: None,
                chunking_strategy: String::new(),
                char_count: 0,
                word_count: 0,
                created_at: 0,
            },
            vector: vec![0.0; self.dimension],
        };
        let batch = self.build_batch(&[seed])?;
        let schema = self.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db
            .create_table(TABLE_NAME, Box::new(batches))
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;
        table
            .delete(&format!("chunk_id = '{}'", SEED_ID))
            .await
            .ok();
        Ok(())
    }

    async fn upsert(&self, chunks: Vec<ChunkRecord>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        for chunk in &chunks {
            if chunk.vector.len() != self.dimension {
                return Err(RagError::validation_field(
                    "vector",
                    format!(
                        "chunk {} has vector dimension {} (expected {})",
                        chunk.payload.chunk_id,
                        chunk.vector.len(),
                        self.dimension
                    ),
                    "Re-embed the document with the configured model",
                ));
            }
        }

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;

        // Delete-then-add keeps re-ingest idempotent for the same ids.
        let ids: Vec<String> = chunks
            .iter()
            .map(|c| format!("'{}'", escape(&c.payload.chunk_id)))
            .collect();
        for id_group in ids.chunks(64) {
            table
                .delete(&format!("chunk_id IN ({})", id_group.join(", ")))
                .await
                .ok();
        }

        let len = chunks.len();
        let batch = self.build_batch(&chunks)?;
        let schema = self.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;

        tracing::debug!(chunks = len, "upserted chunks into vector index");
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &[FilterExpr],
    ) -> Result<Vec<ScoredPoint>> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;

        let mut query = table
            .query()
            .nearest_to(vector)
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k);

        if let Some(predicate) = translate_predicate(filter) {
            query = query.only_if(predicate);
        }

        let results = query
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .context("vector search stream failed")?;

        Ok(extract_points(&batches))
    }

    async fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;
        let before = table.count_rows(None).await.unwrap_or(0);
        let predicate = format!("doc_id = '{}'", escape(doc_id));
        table
            .delete(&predicate)
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;
        let after = table.count_rows(None).await.unwrap_or(0);
        Ok(before.saturating_sub(after))
    }

    async fn update_doc_metadata(
        &self,
        doc_id: &str,
        doc_type: &str,
        year: Option<i32>,
        programs: &[String],
        outcome: Option<&str>,
    ) -> Result<()> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;

        let programs_json =
            serde_json::to_string(programs).unwrap_or_else(|_| "[]".to_string());
        let mut update = table
            .update()
            .only_if(format!("doc_id = '{}'", escape(doc_id)))
            .column("doc_type", format!("'{}'", escape(doc_type)))
            .column("programs_json", format!("'{}'", escape(&programs_json)))
            .column(
                "year",
                year.map(|y| y.to_string()).unwrap_or_else(|| "NULL".to_string()),
            );
        update = update.column(
            "outcome",
            outcome
                .map(|o| format!("'{}'", escape(o)))
                .unwrap_or_else(|| "NULL".to_string()),
        );
        update
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;
        Ok(())
    }

    async fn scroll(&self, batch_size: usize) -> Result<Vec<ChunkPayload>> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;

        let total = table.count_rows(None).await.unwrap_or(0);
        let mut payloads = Vec::with_capacity(total);
        let mut offset = 0usize;

        loop {
            let results = table
                .query()
                .limit(batch_size)
                .offset(offset)
                .execute()
                .await
                .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;
            let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
                .await
                .context("scroll stream failed")?;

            let points = extract_points(&batches);
            if points.is_empty() {
                break;
            }
            let fetched = points.len();
            payloads.extend(points.into_iter().map(|p| p.payload));
            if fetched < batch_size {
                break;
            }
            offset += fetched;
        }

        Ok(payloads)
    }

    async fn count(&self) -> Result<usize> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;
        table
            .count_rows(None)
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))
    }

    async fn count_for_doc(&self, doc_id: &str) -> Result<usize> {
        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))?;
        table
            .count_rows(Some(format!("doc_id = '{}'", escape(doc_id))))
            .await
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))
    }

    async fn health(&self) -> Result<()> {
        self.db
            .table_names()
            .execute()
            .await
            .map(|_| ())
            .map_err(|e| RagError::dependency("vector_index", e.to_string()))
    }
}

/// Pull `ScoredPoint`s out of Arrow batches. LanceDB reports cosine
/// distance in `_distance`; similarity is `1 - distance`.
fn extract_points(batches: &[RecordBatch]) -> Vec<ScoredPoint> {
    let mut points = Vec::new();
    for batch in batches {
        let get_str = |name: &str| {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        };
        let chunk_ids = get_str("chunk_id");
        let doc_ids = get_str("doc_id");
        let texts = get_str("text");
        let filenames = get_str("filename");
        let doc_types = get_str("doc_type");
        let programs_jsons = get_str("programs_json");
        let outcomes = get_str("outcome");
        let strategies = get_str("chunking_strategy");
        let chunk_indices = batch
            .column_by_name("chunk_index")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let years = batch
            .column_by_name("year")
            .and_then(|c| c.as_any().downcast_ref::<Int32Array>());
        let char_counts = batch
            .column_by_name("char_count")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let word_counts = batch
            .column_by_name("word_count")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let created_ats = batch
            .column_by_name("created_at")
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(chunk_ids), Some(doc_ids), Some(texts)) = (chunk_ids, doc_ids, texts) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let chunk_id = chunk_ids.value(i).to_string();
            if chunk_id == SEED_ID {
                continue;
            }
            let score = distances.map(|d| (1.0 - d.value(i)).max(0.0)).unwrap_or(0.0);
            let programs: Vec<String> = programs_jsons
                .map(|p| serde_json::from_str(p.value(i)).unwrap_or_default())
                .unwrap_or_default();
            let year = years.and_then(|y| if y.is_null(i) { None } else { Some(y.value(i)) });
            let outcome = outcomes.and_then(|o| {
                if o.is_null(i) || o.value(i).is_empty() {
                    None
                } else {
                    Some(o.value(i).to_string())
                }
            });

            points.push(ScoredPoint {
                id: chunk_id.clone(),
                score,
                payload: ChunkPayload {
                    chunk_id,
                    doc_id: doc_ids.value(i).to_string(),
                    chunk_index: chunk_indices.map(|c| c.value(i)).unwrap_or(0),
                    text: texts.value(i).to_string(),
                    filename: filenames.map(|f| f.value(i).to_string()).unwrap_or_default(),
                    doc_type: doc_types.map(|d| d.value(i).to_string()).unwrap_or_default(),
                    year,
                    programs,
                    outcome,
                    chunking_strategy: strategies
                        .map(|s| s.value(i).to_string())
                        .unwrap_or_default(),
                    char_count: char_counts.map(|c| c.value(i)).unwrap_or(0),
                    word_count: word_counts.map(|w| w.value(i)).unwrap_or(0),
                    created_at: created_ats.map(|c| c.value(i)).unwrap_or(0),
                },
            });
        }
    }
    points
}
