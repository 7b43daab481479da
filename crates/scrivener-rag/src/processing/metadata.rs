//! Canonical document metadata assembly.
//!
//! Four sources merge with explicit precedence, highest first:
//! user-supplied, filename-parsed, extractor-reported, derived
//! structure counts. Validation produces warnings, never blocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::types::{year_in_range, DocType, Outcome};

/// Metadata supplied by the uploader alongside the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMetadata {
    pub doc_type: Option<DocType>,
    pub year: Option<i32>,
    #[serde(default)]
    pub programs: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub outcome: Option<Outcome>,
    pub notes: Option<String>,
    /// Uploader's confirmation that sensitivity review happened.
    /// Required for ingest; checked by the document processor.
    #[serde(default)]
    pub sensitivity_confirmed: bool,
}

/// Fully merged metadata for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    pub doc_id: Uuid,
    pub filename: String,
    pub doc_type: DocType,
    pub year: Option<i32>,
    pub programs: Vec<String>,
    pub tags: Vec<String>,
    pub outcome: Option<Outcome>,
    pub notes: Option<String>,
    pub word_count: u64,
    pub char_count: u64,
    pub file_size: u64,
    /// Hints recovered from the filename, kept for debugging.
    pub parsed_from_filename: HashMap<String, String>,
    /// Attributes the extractor reported (page count, encoding, ...).
    pub format_metadata: HashMap<String, String>,
    pub warnings: Vec<String>,
    pub processed_at: DateTime<Utc>,
}

pub struct MetadataExtractor;

impl MetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(
        &self,
        user: &UserMetadata,
        file_content: &[u8],
        filename: &str,
        text: &str,
        format_metadata: HashMap<String, String>,
    ) -> ExtractedMetadata {
        let parsed = parse_filename(filename);

        // Precedence: user first, then filename hints.
        let doc_type = user
            .doc_type
            .or_else(|| parsed.get("doc_type").and_then(|s| DocType::parse(s)))
            .unwrap_or(DocType::Other);

        let year = user
            .year
            .or_else(|| parsed.get("year").and_then(|s| s.parse().ok()));

        // The filename outcome token is only applied when the user left
        // outcome empty.
        let outcome = user
            .outcome
            .or_else(|| parsed.get("outcome").and_then(|s| Outcome::normalize(s)));

        let mut tags = user.tags.clone();
        if let Some(funder) = parsed.get("funder") {
            if !tags.iter().any(|t| t.eq_ignore_ascii_case(funder)) {
                tags.push(funder.clone());
            }
        }

        let word_count = text.split_whitespace().count() as u64;
        let char_count = text.chars().count() as u64;
        let file_size = file_content.len() as u64;

        let mut warnings = Vec::new();
        if word_count < 10 {
            warnings.push(format!(
                "Document has only {} words; extraction may have failed",
                word_count
            ));
        }
        if file_size < 1024 {
            warnings.push(format!("File is unusually small ({} bytes)", file_size));
        }
        if let Some(y) = year {
            if !year_in_range(y) {
                warnings.push(format!("Year {} is outside the plausible range", y));
            }
        }

        ExtractedMetadata {
            doc_id: Uuid::new_v4(),
            filename: filename.to_string(),
            doc_type,
            year,
            programs: user.programs.clone(),
            tags,
            outcome,
            notes: user.notes.clone(),
            word_count,
            char_count,
            file_size,
            parsed_from_filename: parsed,
            format_metadata,
            warnings,
            processed_at: Utc::now(),
        }
    }
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Recognize `TYPE_YEAR_FUNDER[_OUTCOME]` underscore patterns and
/// `SOMETHING YEAR` space patterns. The year anchors the parse: the
/// token before it is a type hint, the tokens after it are funder and
/// outcome.
fn parse_filename(filename: &str) -> HashMap<String, String> {
    let stem = filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename);

    let mut parsed = HashMap::new();

    let tokens: Vec<&str> = if stem.contains('_') {
        stem.split('_').collect()
    } else {
        stem.split_whitespace().collect()
    };

    let year_pos = tokens.iter().position(|t| is_year_token(t));
    let Some(pos) = year_pos else {
        return parsed;
    };

    parsed.insert("year".to_string(), tokens[pos].to_string());

    // Type hint: nearest preceding token that parses as a doc type, or
    // the whole prefix for space-separated names like "Annual Report".
    let prefix = tokens[..pos].join(" ");
    if let Some(t) = DocType::parse(&prefix) {
        parsed.insert("doc_type".to_string(), t.as_str().to_string());
    } else {
        for token in tokens[..pos].iter().rev() {
            if DocType::parse(token).is_some() {
                parsed.insert("doc_type".to_string(), token.to_string());
                break;
            }
        }
    }

    let mut rest = tokens[pos + 1..].iter();
    if let Some(after) = rest.next() {
        if Outcome::normalize(after).is_some() {
            parsed.insert("outcome".to_string(), after.to_string());
        } else {
            parsed.insert("funder".to_string(), after.to_string());
            if let Some(last) = rest.next() {
                if Outcome::normalize(last).is_some() {
                    parsed.insert("outcome".to_string(), last.to_string());
                }
            }
        }
    }

    parsed
}

fn is_year_token(token: &str) -> bool {
    token.len() == 4 && token.parse::<i32>().map(year_in_range).unwrap_or(false)
}
