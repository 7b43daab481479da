//! Query normalization: character stripping, whitespace collapsing, and
//! abbreviation expansion.
//!
//! Expansion appends the spelled-out form alongside the abbreviation so
//! both the sparse and dense legs can match either surface form.
//! Normalization is a fixed point: running it on already-normalized
//! text changes nothing.

/// Grant-domain abbreviations expanded during normalization.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("rfp", "Request for Proposal"),
    ("loi", "Letter of Intent"),
    ("fte", "Full-Time Equivalent"),
    ("kpi", "Key Performance Indicator"),
    ("mou", "Memorandum of Understanding"),
    ("roi", "Return on Investment"),
];

pub fn normalize_query(raw: &str) -> String {
    // Keep letters, digits, spaces, hyphens, apostrophes.
    let stripped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut normalized = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return normalized;
    }

    let lower = normalized.to_lowercase();
    let tokens: Vec<&str> = lower.split(' ').collect();
    for (abbrev, expansion) in ABBREVIATIONS {
        let present = tokens.iter().any(|t| t == abbrev);
        let already_expanded = lower.contains(&expansion.to_lowercase());
        if present && !already_expanded {
            normalized.push(' ');
            normalized.push_str(expansion);
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_strips_punctuation() {
        assert_eq!(
            normalize_query("  education   grant:  outcomes?! "),
            "education grant outcomes"
        );
    }

    #[test]
    fn keeps_hyphens_and_apostrophes() {
        assert_eq!(
            normalize_query("after-school program's impact"),
            "after-school program's impact"
        );
    }

    #[test]
    fn expands_known_abbreviations() {
        let expanded = normalize_query("What is our RFP response rate?");
        assert!(expanded.contains("RFP"));
        assert!(expanded.contains("Request for Proposal"));

        assert!(normalize_query("LOI guidelines").contains("Letter of Intent"));
        assert!(normalize_query("FTE count").contains("Full-Time Equivalent"));
        assert!(normalize_query("KPI tracking").contains("Key Performance Indicator"));
    }

    #[test]
    fn abbreviation_must_be_a_whole_token() {
        // "lois" should not trigger the LOI expansion.
        let normalized = normalize_query("lois programs");
        assert!(!normalized.contains("Letter of Intent"));
    }

    #[test]
    fn normalization_is_a_fixed_point() {
        let once = normalize_query("RFP deadline  review!");
        let twice = normalize_query(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_and_symbol_only_input_normalizes_to_empty() {
        assert_eq!(normalize_query(""), "");
        assert_eq!(normalize_query("?!&*   @#"), "");
    }
}
