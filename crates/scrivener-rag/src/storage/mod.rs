//! Storage adapters: the vector index (source of truth for chunks) and
//! the relational metadata store.

pub mod lance_index;
pub mod metadata_store;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChunkPayload, ChunkRecord, DocumentFilters, ScoredPoint};

pub use lance_index::LanceVectorIndex;
pub use metadata_store::{MetadataStore, SqliteMetadataStore};

/// A single comparison in the neutral filter algebra. Adapters translate
/// conjunctions of these into their backend's filter language.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Eq(String, FilterValue),
    InSet(String, Vec<FilterValue>),
    NotInSet(String, Vec<FilterValue>),
    Between(String, i64, i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Str(String),
    Int(i64),
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for FilterValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Lower `DocumentFilters` into the neutral algebra. Program filters
/// are any-of over the flattened program list; tag filters are resolved
/// upstream against the metadata store and do not appear here.
pub fn filters_to_exprs(filters: &DocumentFilters) -> Vec<FilterExpr> {
    let mut exprs = Vec::new();
    if let Some(types) = &filters.doc_types {
        exprs.push(FilterExpr::InSet(
            "doc_type".to_string(),
            types.iter().map(|t| FilterValue::from(t.as_str())).collect(),
        ));
    }
    if let Some(year) = filters.year {
        exprs.push(FilterExpr::Eq("year".to_string(), FilterValue::Int(year as i64)));
    }
    if let Some(years) = &filters.years {
        exprs.push(FilterExpr::InSet(
            "year".to_string(),
            years.iter().map(|y| FilterValue::Int(*y as i64)).collect(),
        ));
    }
    match (filters.year_start, filters.year_end) {
        (Some(start), Some(end)) => {
            exprs.push(FilterExpr::Between("year".to_string(), start as i64, end as i64));
        }
        (Some(start), None) => {
            exprs.push(FilterExpr::Between(
                "year".to_string(),
                start as i64,
                crate::types::max_document_year() as i64,
            ));
        }
        (None, Some(end)) => {
            exprs.push(FilterExpr::Between("year".to_string(), 2000, end as i64));
        }
        (None, None) => {}
    }
    if let Some(programs) = &filters.programs {
        exprs.push(FilterExpr::InSet(
            "programs".to_string(),
            programs.iter().map(|p| FilterValue::from(p.clone())).collect(),
        ));
    }
    if let Some(outcome) = &filters.outcome {
        exprs.push(FilterExpr::Eq(
            "outcome".to_string(),
            FilterValue::from(outcome.as_str()),
        ));
    }
    exprs
}

/// Typed wrapper over an external approximate-nearest-neighbor store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the chunk collection for the given vector dimension if it
    /// does not exist yet.
    async fn ensure_collection(&self, dimension: usize) -> Result<()>;

    /// Upsert chunk records (vector + payload). Records without vectors
    /// are rejected.
    async fn upsert(&self, chunks: Vec<ChunkRecord>) -> Result<()>;

    /// Filtered top-k similarity search. `k` is honored exactly when the
    /// collection holds at least k matching points.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &[FilterExpr],
    ) -> Result<Vec<ScoredPoint>>;

    /// Remove every chunk of one document. Returns the number removed.
    async fn delete_by_doc_id(&self, doc_id: &str) -> Result<usize>;

    /// Rewrite the flattened filterable metadata on every chunk of a
    /// document. Keeps chunk payloads consistent with the document
    /// record after a metadata update, without re-embedding.
    async fn update_doc_metadata(
        &self,
        doc_id: &str,
        doc_type: &str,
        year: Option<i32>,
        programs: &[String],
        outcome: Option<&str>,
    ) -> Result<()>;

    /// Stream all payloads in batches of `batch_size`. Used by the
    /// keyword index rebuild.
    async fn scroll(&self, batch_size: usize) -> Result<Vec<ChunkPayload>>;

    async fn count(&self) -> Result<usize>;

    async fn count_for_doc(&self, doc_id: &str) -> Result<usize>;

    async fn health(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocType;

    #[test]
    fn filters_lower_to_expr_conjunction() {
        let filters = DocumentFilters {
            doc_types: Some(vec![DocType::GrantProposal]),
            years: Some(vec![2021, 2024]),
            programs: Some(vec!["Education".into()]),
            ..Default::default()
        };
        let exprs = filters_to_exprs(&filters);
        assert_eq!(exprs.len(), 3);
        assert!(exprs.iter().any(|e| matches!(e, FilterExpr::InSet(f, _) if f == "doc_type")));
        assert!(exprs.iter().any(|e| matches!(e, FilterExpr::InSet(f, _) if f == "year")));
        assert!(exprs.iter().any(|e| matches!(e, FilterExpr::InSet(f, _) if f == "programs")));
    }

    #[test]
    fn open_year_range_is_clamped() {
        let filters = DocumentFilters {
            year_start: Some(2020),
            ..Default::default()
        };
        let exprs = filters_to_exprs(&filters);
        match &exprs[0] {
            FilterExpr::Between(field, lo, hi) => {
                assert_eq!(field, "year");
                assert_eq!(*lo, 2020);
                assert!(*hi >= 2020);
            }
            other => panic!("unexpected expr: {:?}", other),
        }
    }
}
