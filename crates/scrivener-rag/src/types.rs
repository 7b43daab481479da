use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Closed set of document categories the corpus recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocType {
    #[serde(rename = "Grant Proposal")]
    GrantProposal,
    #[serde(rename = "Annual Report")]
    AnnualReport,
    #[serde(rename = "Program Description")]
    ProgramDescription,
    #[serde(rename = "Impact Report")]
    ImpactReport,
    #[serde(rename = "Strategic Plan")]
    StrategicPlan,
    #[serde(rename = "Other")]
    Other,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GrantProposal => "Grant Proposal",
            Self::AnnualReport => "Annual Report",
            Self::ProgramDescription => "Program Description",
            Self::ImpactReport => "Impact Report",
            Self::StrategicPlan => "Strategic Plan",
            Self::Other => "Other",
        }
    }

    /// Lenient parse used for filename hints and API input. Accepts
    /// display form, snake_case, and glued forms like "GrantProposal".
    pub fn parse(s: &str) -> Option<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "grantproposal" | "grant" | "proposal" => Some(Self::GrantProposal),
            "annualreport" => Some(Self::AnnualReport),
            "programdescription" => Some(Self::ProgramDescription),
            "impactreport" => Some(Self::ImpactReport),
            "strategicplan" => Some(Self::StrategicPlan),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn all() -> &'static [DocType] {
        &[
            Self::GrantProposal,
            Self::AnnualReport,
            Self::ProgramDescription,
            Self::ImpactReport,
            Self::StrategicPlan,
            Self::Other,
        ]
    }
}

/// Funding outcome of a proposal, where known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "Funded")]
    Funded,
    #[serde(rename = "Not Funded")]
    NotFunded,
    #[serde(rename = "Pending")]
    Pending,
    #[serde(rename = "Final Report")]
    FinalReport,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Funded => "Funded",
            Self::NotFunded => "Not Funded",
            Self::Pending => "Pending",
            Self::FinalReport => "Final Report",
        }
    }

    /// Normalize free-form outcome tokens (filename fragments, user
    /// input) to the canonical set. Returns None for unrecognized input.
    pub fn normalize(s: &str) -> Option<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "funded" | "awarded" | "approved" | "won" => Some(Self::Funded),
            "notfunded" | "declined" | "denied" | "rejected" | "unfunded" => Some(Self::NotFunded),
            "pending" | "submitted" => Some(Self::Pending),
            "finalreport" | "final" => Some(Self::FinalReport),
            _ => None,
        }
    }
}

/// Canonical document record held by the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: Uuid,
    pub filename: String,
    pub doc_type: DocType,
    pub year: Option<i32>,
    pub programs: Vec<String>,
    pub tags: Vec<String>,
    pub outcome: Option<Outcome>,
    pub notes: Option<String>,
    pub is_sensitive: bool,
    /// Required non-null at insert time: the uploader confirmed the
    /// document carries no unreviewed sensitive content.
    pub sensitivity_confirmed_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub chunk_count: u32,
    pub word_count: u64,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable subset for the explicit metadata-update path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub doc_type: Option<DocType>,
    pub year: Option<i32>,
    pub programs: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub outcome: Option<Option<Outcome>>,
    pub notes: Option<Option<String>>,
}

/// Admin-maintained program enumeration. Names are unique
/// case-insensitively; canonical case is what's stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub program_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub display_order: i64,
}

/// One chunk's stored payload: everything C4 keeps alongside the vector,
/// and everything C5 needs to score and filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub filename: String,
    pub doc_type: String,
    pub year: Option<i32>,
    pub programs: Vec<String>,
    pub outcome: Option<String>,
    pub chunking_strategy: String,
    pub char_count: u32,
    pub word_count: u32,
    pub created_at: i64,
}

impl ChunkPayload {
    /// Deterministic chunk id from the owning document and position.
    pub fn chunk_id_for(doc_id: &Uuid, chunk_index: u32) -> String {
        format!("{}_{}", doc_id, chunk_index)
    }
}

/// Chunk record ready for the vector index: payload plus dense vector.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub payload: ChunkPayload,
    pub vector: Vec<f32>,
}

/// A scored point returned by a vector search.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
}

/// Transient candidate emitted by the retrieval pipeline toward the
/// generator. `metadata` carries debug fields (`_vector_score`,
/// `_keyword_score`, `_age_multiplier`, `_original_score`, `_reranked`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub score: f32,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RetrievalCandidate {
    pub fn from_payload(payload: &ChunkPayload, score: f32) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("filename".to_string(), payload.filename.clone().into());
        metadata.insert("doc_type".to_string(), payload.doc_type.clone().into());
        if let Some(year) = payload.year {
            metadata.insert("year".to_string(), year.into());
        }
        if let Some(outcome) = &payload.outcome {
            metadata.insert("outcome".to_string(), outcome.clone().into());
        }
        metadata.insert(
            "programs".to_string(),
            serde_json::Value::Array(payload.programs.iter().cloned().map(Into::into).collect()),
        );
        Self {
            chunk_id: payload.chunk_id.clone(),
            doc_id: payload.doc_id.clone(),
            chunk_index: payload.chunk_index,
            text: payload.text.clone(),
            score,
            metadata,
        }
    }

    pub fn year(&self) -> Option<i32> {
        self.metadata
            .get("year")
            .and_then(|v| v.as_i64())
            .map(|y| y as i32)
    }

    /// Tie-break key: equal scores order by (doc_id, chunk_index) so
    /// result lists are deterministic.
    pub fn tie_key(&self) -> (&str, u32) {
        (self.doc_id.as_str(), self.chunk_index)
    }
}

/// Metadata filters applied to both search legs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentFilters {
    pub doc_types: Option<Vec<DocType>>,
    pub year: Option<i32>,
    pub years: Option<Vec<i32>>,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
    pub programs: Option<Vec<String>>,
    pub outcome: Option<Outcome>,
    pub tags: Option<Vec<String>>,
}

impl DocumentFilters {
    pub fn is_empty(&self) -> bool {
        self.doc_types.is_none()
            && self.year.is_none()
            && self.years.is_none()
            && self.year_start.is_none()
            && self.year_end.is_none()
            && self.programs.is_none()
            && self.outcome.is_none()
            && self.tags.is_none()
    }

    /// Canonical JSON of the non-empty fields, keys sorted, used by the
    /// cache fingerprint. `serde_json::Map` preserves insertion order,
    /// so fields are inserted in sorted key order here.
    pub fn canonical_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if let Some(types) = &self.doc_types {
            let mut names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
            names.sort_unstable();
            map.insert("doc_types".into(), names.into());
        }
        if let Some(outcome) = &self.outcome {
            map.insert("outcome".into(), outcome.as_str().into());
        }
        if let Some(programs) = &self.programs {
            let mut sorted = programs.clone();
            sorted.sort_unstable();
            map.insert("programs".into(), sorted.into());
        }
        if let Some(tags) = &self.tags {
            let mut sorted = tags.clone();
            sorted.sort_unstable();
            map.insert("tags".into(), sorted.into());
        }
        if let Some(year) = self.year {
            map.insert("year".into(), year.into());
        }
        if let Some(end) = self.year_end {
            map.insert("year_end".into(), end.into());
        }
        if let Some(start) = self.year_start {
            map.insert("year_start".into(), start.into());
        }
        if let Some(years) = &self.years {
            let mut sorted = years.clone();
            sorted.sort_unstable();
            map.insert("years".into(), sorted.into());
        }
        serde_json::Value::Object(map)
    }

    /// Payload-side filter check used by the keyword index, which has no
    /// query language of its own.
    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        if let Some(types) = &self.doc_types {
            if !types.iter().any(|t| t.as_str() == payload.doc_type) {
                return false;
            }
        }
        if let Some(year) = self.year {
            if payload.year != Some(year) {
                return false;
            }
        }
        if let Some(years) = &self.years {
            match payload.year {
                Some(y) if years.contains(&y) => {}
                _ => return false,
            }
        }
        if let Some(start) = self.year_start {
            match payload.year {
                Some(y) if y >= start => {}
                _ => return false,
            }
        }
        if let Some(end) = self.year_end {
            match payload.year {
                Some(y) if y <= end => {}
                _ => return false,
            }
        }
        if let Some(programs) = &self.programs {
            let any = programs
                .iter()
                .any(|p| payload.programs.iter().any(|q| q.eq_ignore_ascii_case(p)));
            if !any {
                return false;
            }
        }
        if let Some(outcome) = &self.outcome {
            if payload.outcome.as_deref() != Some(outcome.as_str()) {
                return false;
            }
        }
        // Tags are not flattened onto chunk payloads; tag filters are
        // resolved against the metadata store before retrieval.
        true
    }
}

/// Conversation context blob seeding retrieval for every turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    pub writing_style: Option<String>,
    pub audience: Option<String>,
    pub section: Option<String>,
    pub tone: Option<String>,
    pub filters: Option<DocumentFilters>,
}

impl ConversationContext {
    /// Request-level overrides win field by field over the stored blob.
    pub fn merged_with(&self, overrides: &ConversationContext) -> ConversationContext {
        ConversationContext {
            writing_style: overrides
                .writing_style
                .clone()
                .or_else(|| self.writing_style.clone()),
            audience: overrides.audience.clone().or_else(|| self.audience.clone()),
            section: overrides.section.clone().or_else(|| self.section.clone()),
            tone: overrides.tone.clone().or_else(|| self.tone.clone()),
            filters: overrides.filters.clone().or_else(|| self.filters.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Citation numbers the assistant actually used, empty for user turns.
    pub citations: Vec<usize>,
    /// Chunk ids passed to the generator for this turn.
    pub source_chunk_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: Uuid,
    pub title: String,
    pub created_by: String,
    pub context: ConversationContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted generation artifact for downstream success tracking.
/// Not on the retrieval path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    pub output_id: Uuid,
    pub title: String,
    pub content: String,
    pub funder: Option<String>,
    pub amount_requested: Option<f64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    pub created_by: String,
    pub conversation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Structured audit event written through the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub principal: String,
    pub resource: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &str, principal: &str, resource: &str, detail: serde_json::Value) -> Self {
        Self {
            action: action.to_string(),
            principal: principal.to_string(),
            resource: resource.to_string(),
            detail,
            created_at: Utc::now(),
        }
    }
}

/// Upper bound for a plausible document year: next calendar year.
pub fn max_document_year() -> i32 {
    Utc::now().year() + 1
}

pub fn year_in_range(year: i32) -> bool {
    (2000..=max_document_year()).contains(&year)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_type_parse_accepts_filename_forms() {
        assert_eq!(DocType::parse("GrantProposal"), Some(DocType::GrantProposal));
        assert_eq!(DocType::parse("grant_proposal"), Some(DocType::GrantProposal));
        assert_eq!(DocType::parse("Annual Report"), Some(DocType::AnnualReport));
        assert_eq!(DocType::parse("mystery"), None);
    }

    #[test]
    fn outcome_normalization() {
        assert_eq!(Outcome::normalize("funded"), Some(Outcome::Funded));
        assert_eq!(Outcome::normalize("approved"), Some(Outcome::Funded));
        assert_eq!(Outcome::normalize("Not Funded"), Some(Outcome::NotFunded));
        assert_eq!(Outcome::normalize("declined"), Some(Outcome::NotFunded));
        assert_eq!(Outcome::normalize("denied"), Some(Outcome::NotFunded));
        assert_eq!(Outcome::normalize("FinalReport"), Some(Outcome::FinalReport));
        assert_eq!(Outcome::normalize("maybe"), None);
    }

    #[test]
    fn filters_canonical_json_is_order_insensitive() {
        let a = DocumentFilters {
            programs: Some(vec!["Education".into(), "Arts".into()]),
            years: Some(vec![2024, 2021]),
            ..Default::default()
        };
        let b = DocumentFilters {
            programs: Some(vec!["Arts".into(), "Education".into()]),
            years: Some(vec![2021, 2024]),
            ..Default::default()
        };
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn filters_match_payload() {
        let payload = ChunkPayload {
            chunk_id: "d_0".into(),
            doc_id: "d".into(),
            chunk_index: 0,
            text: "t".into(),
            filename: "f.pdf".into(),
            doc_type: "Grant Proposal".into(),
            year: Some(2021),
            programs: vec!["Education".into()],
            outcome: Some("Funded".into()),
            chunking_strategy: "sentence".into(),
            char_count: 1,
            word_count: 1,
            created_at: 0,
        };

        let in_set = DocumentFilters {
            years: Some(vec![2021, 2024]),
            ..Default::default()
        };
        assert!(in_set.matches(&payload));

        let excluded = DocumentFilters {
            years: Some(vec![2019]),
            ..Default::default()
        };
        assert!(!excluded.matches(&payload));

        let program_case_insensitive = DocumentFilters {
            programs: Some(vec!["education".into()]),
            ..Default::default()
        };
        assert!(program_case_insensitive.matches(&payload));

        let range = DocumentFilters {
            year_start: Some(2020),
            year_end: Some(2022),
            ..Default::default()
        };
        assert!(range.matches(&payload));
    }

    #[test]
    fn context_merge_prefers_overrides() {
        let stored = ConversationContext {
            audience: Some("Federal RFP".into()),
            tone: Some("Professional".into()),
            ..Default::default()
        };
        let overrides = ConversationContext {
            tone: Some("Conversational".into()),
            ..Default::default()
        };
        let merged = stored.merged_with(&overrides);
        assert_eq!(merged.audience.as_deref(), Some("Federal RFP"));
        assert_eq!(merged.tone.as_deref(), Some("Conversational"));
    }
}
