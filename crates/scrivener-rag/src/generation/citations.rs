//! Citation markers: extraction from generated text and advisory
//! validation against the source list passed to the generator.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("citation regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationReport {
    /// Source ids referenced in the text that exist in the source list.
    pub cited_sources: Vec<usize>,
    /// Source ids passed to the generator but never referenced.
    pub uncited_sources: Vec<usize>,
    /// Referenced ids with no matching source.
    pub invalid_citations: Vec<usize>,
    /// Marker occurrences including repeats.
    pub total_citations: usize,
    /// True iff no invalid citations were found. Advisory only; the
    /// text is never rewritten.
    pub valid: bool,
}

/// Scan text for `[n]` markers and return the sorted unique set.
pub fn extract_citations(text: &str) -> Vec<usize> {
    let mut seen = BTreeSet::new();
    for capture in CITATION_RE.captures_iter(text) {
        if let Some(n) = capture.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) {
            if n > 0 {
                seen.insert(n);
            }
        }
    }
    seen.into_iter().collect()
}

pub fn validate_citations(text: &str, source_ids: &[usize]) -> CitationReport {
    let total_citations = CITATION_RE
        .captures_iter(text)
        .filter(|c| {
            c.get(1)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .map(|n| n > 0)
                .unwrap_or(false)
        })
        .count();
    let extracted = extract_citations(text);
    let known: BTreeSet<usize> = source_ids.iter().copied().collect();

    let cited_sources: Vec<usize> = extracted.iter().copied().filter(|n| known.contains(n)).collect();
    let invalid_citations: Vec<usize> =
        extracted.iter().copied().filter(|n| !known.contains(n)).collect();
    let cited: BTreeSet<usize> = cited_sources.iter().copied().collect();
    let uncited_sources: Vec<usize> = known.iter().copied().filter(|n| !cited.contains(n)).collect();

    CitationReport {
        valid: invalid_citations.is_empty(),
        cited_sources,
        uncited_sources,
        invalid_citations,
        total_citations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_returns_sorted_unique_set() {
        let text = "Strong impact [1]. We served 5,000 youth [2] with a 95% rate [2][3]. \
                    Multiple sources [1][4] confirm this.";
        assert_eq!(extract_citations(text), vec![1, 2, 3, 4]);
    }

    #[test]
    fn extraction_ignores_zero_and_non_numeric_brackets() {
        assert_eq!(extract_citations("see [0] and [note] and [12a]"), Vec::<usize>::new());
    }

    #[test]
    fn validation_partitions_cited_uncited_invalid() {
        let text = "Claim one [1]. Claim two [3]. Claim three [7].";
        let report = validate_citations(text, &[1, 2, 3]);
        assert_eq!(report.cited_sources, vec![1, 3]);
        assert_eq!(report.uncited_sources, vec![2]);
        assert_eq!(report.invalid_citations, vec![7]);
        assert_eq!(report.total_citations, 3);
        assert!(!report.valid);
    }

    #[test]
    fn repeats_count_toward_total_only() {
        let text = "First [1]. Again [1]. And again [1][2].";
        let report = validate_citations(text, &[1, 2]);
        assert_eq!(report.total_citations, 4);
        assert_eq!(report.cited_sources, vec![1, 2]);
        assert!(report.valid);
    }

    #[test]
    fn text_without_markers_is_valid_with_all_uncited() {
        let report = validate_citations("No citations at all.", &[1, 2]);
        assert!(report.valid);
        assert!(report.cited_sources.is_empty());
        assert_eq!(report.uncited_sources, vec![1, 2]);
        assert_eq!(report.total_citations, 0);
    }
}
