//! Prompt assembly for grounded generation.
//!
//! The system prompt sets the writer role, audience guidance, section
//! requirements, tone, and the citation rule. The user prompt carries
//! the query, one numbered block per source, the citation instructions,
//! and any custom instructions.

use super::Source;

pub fn build_system_prompt(audience: &str, section: &str, tone: &str) -> String {
    let audience_guidance = match audience.to_lowercase().as_str() {
        "federal rfp" => {
            "Write for federal grant reviewers: address every stated requirement \
             directly, use precise compliance language, and quantify outcomes \
             wherever the source material supports it."
        }
        "foundation" => {
            "Write for foundation program officers: lead with mission alignment \
             and community impact, and keep the narrative warm but evidence-based."
        }
        "corporate" => {
            "Write for corporate giving committees: emphasize partnership value, \
             visibility, and measurable return on community investment."
        }
        "individual donors" => {
            "Write for individual donors: favor story-driven narrative grounded \
             in concrete outcomes, and avoid jargon."
        }
        _ => "Write for a general funder audience with clear, direct prose.",
    };

    let section_guidance = match section.to_lowercase().as_str() {
        "organizational capacity" => {
            "Structure the section around staffing, track record, infrastructure, \
             and fiscal management capability."
        }
        "needs statement" => {
            "Open with the strongest data point, establish the gap between need \
             and current services, and localize every statistic."
        }
        "project description" => {
            "Cover goals, activities, timeline, and staffing in that order, with \
             one clear paragraph per element."
        }
        "budget narrative" => {
            "Justify each cost category and tie every line item back to project \
             activities."
        }
        "evaluation" => {
            "Name the outcomes, the measurement tools, the data collection \
             cadence, and who is responsible."
        }
        _ => "Organize the section with a clear opening claim, supporting evidence, and a closing synthesis.",
    };

    format!(
        "You are an experienced grant writer for a nonprofit organization. \
         You draft {section} content for a {audience} submission.\n\n\
         {audience_guidance}\n\n{section_guidance}\n\n\
         Maintain a {tone} tone throughout.\n\n\
         Ground every factual claim in the provided source excerpts and cite \
         the supporting source by its bracketed number, e.g. [1]. Only cite \
         sources that actually support the claim; never invent citations.",
        section = section,
        audience = audience,
        tone = tone,
        audience_guidance = audience_guidance,
        section_guidance = section_guidance,
    )
}

pub fn build_user_prompt(query: &str, sources: &[Source], custom_instructions: Option<&str>) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str("Request:\n");
    prompt.push_str(query);
    prompt.push_str("\n\nSource material:\n");

    for source in sources {
        let year = source
            .year
            .map(|y| y.to_string())
            .unwrap_or_else(|| "year unknown".to_string());
        prompt.push_str(&format!(
            "\n[{}] {} ({}, {})\n{}\n",
            source.id, source.filename, source.doc_type, year, source.excerpt
        ));
    }

    prompt.push_str(
        "\nUse the numbered source material above to answer the request. \
         Add citations in square brackets after each claim they support, \
         like [1] or [2][3]. Do not cite numbers outside the source list.",
    );

    if let Some(instructions) = custom_instructions {
        if !instructions.trim().is_empty() {
            prompt.push_str("\n\nAdditional instructions:\n");
            prompt.push_str(instructions);
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sources() -> Vec<Source> {
        vec![
            Source {
                id: 1,
                chunk_id: "d1_0".into(),
                filename: "grant_2023.pdf".into(),
                doc_type: "Grant Proposal".into(),
                year: Some(2023),
                excerpt: "Our organization has served 5,000 youth through after-school programs.".into(),
                relevance: 0.95,
                chunk_index: 0,
            },
            Source {
                id: 2,
                chunk_id: "d2_5".into(),
                filename: "annual_report_2022.pdf".into(),
                doc_type: "Annual Report".into(),
                year: Some(2022),
                excerpt: "We achieved a 95% college acceptance rate among participants.".into(),
                relevance: 0.89,
                chunk_index: 5,
            },
        ]
    }

    #[test]
    fn system_prompt_carries_role_audience_section_tone() {
        let prompt = build_system_prompt("Federal RFP", "Organizational Capacity", "Professional");
        let lower = prompt.to_lowercase();
        assert!(prompt.contains("Federal RFP"));
        assert!(prompt.contains("Organizational Capacity"));
        assert!(lower.contains("professional"));
        assert!(lower.contains("grant writer"));
        assert!(lower.contains("cite"));
    }

    #[test]
    fn user_prompt_numbers_sources_and_keeps_instructions() {
        let prompt = build_user_prompt(
            "Describe our program outcomes",
            &sample_sources(),
            Some("Focus on quantitative metrics"),
        );
        assert!(prompt.contains("Describe our program outcomes"));
        assert!(prompt.contains("[1] grant_2023.pdf (Grant Proposal, 2023)"));
        assert!(prompt.contains("[2] annual_report_2022.pdf (Annual Report, 2022)"));
        assert!(prompt.contains("5,000 youth"));
        assert!(prompt.to_lowercase().contains("citations"));
        assert!(prompt.contains("Focus on quantitative metrics"));
    }

    #[test]
    fn missing_year_renders_placeholder() {
        let mut sources = sample_sources();
        sources[0].year = None;
        let prompt = build_user_prompt("q", &sources, None);
        assert!(prompt.contains("(Grant Proposal, year unknown)"));
    }
}
