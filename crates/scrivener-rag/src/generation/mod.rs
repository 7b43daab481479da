//! Grounded generation: prompt assembly, the LLM call (streaming or
//! not), and citation extraction/validation over the final text.

pub mod citations;
pub mod prompts;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{RagError, Result};
use crate::llm::{GenerationParams, LlmEvent, LlmProvider};
use crate::telemetry::Telemetry;
use crate::types::RetrievalCandidate;

pub use citations::{extract_citations, validate_citations, CitationReport};

/// One numbered source block passed to the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// 1-based position in this turn's source list; citation markers
    /// refer to this number.
    pub id: usize,
    pub chunk_id: String,
    pub filename: String,
    pub doc_type: String,
    pub year: Option<i32>,
    pub excerpt: String,
    pub relevance: f32,
    pub chunk_index: u32,
}

impl Source {
    pub fn from_candidates(candidates: &[RetrievalCandidate]) -> Vec<Source> {
        candidates
            .iter()
            .enumerate()
            .map(|(i, c)| Source {
                id: i + 1,
                chunk_id: c.chunk_id.clone(),
                filename: c
                    .metadata
                    .get("filename")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                doc_type: c
                    .metadata
                    .get("doc_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Other")
                    .to_string(),
                year: c.year(),
                excerpt: c.text.clone(),
                relevance: c.score,
                chunk_index: c.chunk_index,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub query: String,
    pub audience: String,
    pub section: String,
    pub tone: String,
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub model: String,
    pub output_tokens: Option<u32>,
    pub generation_ms: u64,
    pub citations: CitationReport,
}

/// Streaming generation event: text deltas terminated by one `Done`
/// carrying the full result and citation report.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Delta(String),
    Done(GenerationResult),
    Error(String),
}

pub struct GenerationEngine {
    llm: Arc<dyn LlmProvider>,
    params: GenerationParams,
    telemetry: Arc<dyn Telemetry>,
}

impl GenerationEngine {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        params: GenerationParams,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            llm,
            params,
            telemetry,
        }
    }

    fn build_prompts(&self, request: &GenerationRequest, sources: &[Source]) -> Result<(String, String)> {
        if sources.is_empty() {
            return Err(RagError::validation_field(
                "sources",
                "No sources were retrieved for this request",
                "Broaden the query or relax the document filters",
            ));
        }
        let system = prompts::build_system_prompt(&request.audience, &request.section, &request.tone);
        let user = prompts::build_user_prompt(
            &request.query,
            sources,
            request.custom_instructions.as_deref(),
        );
        Ok((system, user))
    }

    /// Non-streaming generation. Provider failures surface unchanged.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        sources: &[Source],
    ) -> Result<GenerationResult> {
        let (system, user) = self.build_prompts(request, sources)?;
        let started = Instant::now();

        let response = self.llm.generate(&system, &user, &self.params).await?;
        let generation_ms = started.elapsed().as_millis() as u64;

        let source_ids: Vec<usize> = sources.iter().map(|s| s.id).collect();
        let citations = validate_citations(&response.text, &source_ids);
        if !citations.valid {
            tracing::warn!(
                invalid = ?citations.invalid_citations,
                "generated text cites sources outside the provided list"
            );
        }
        self.telemetry.incr("generation.requests", 1);
        self.telemetry
            .record_latency("generation.total", started.elapsed());

        Ok(GenerationResult {
            text: response.text,
            model: if response.model.is_empty() {
                self.params.model.clone()
            } else {
                response.model
            },
            output_tokens: response.output_tokens,
            generation_ms,
            citations,
        })
    }

    /// Streaming generation: yields deltas as the provider produces
    /// them, then a final `Done` with the citation report. Dropping the
    /// receiver or cancelling the token stops the stream.
    pub async fn stream(
        &self,
        request: &GenerationRequest,
        sources: &[Source],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<GenerationEvent>> {
        let (system, user) = self.build_prompts(request, sources)?;
        let started = Instant::now();

        let mut provider_rx = self.llm.stream_generate(&system, &user, &self.params).await?;
        let (tx, rx) = mpsc::channel(256);
        let source_ids: Vec<usize> = sources.iter().map(|s| s.id).collect();
        let fallback_model = self.params.model.clone();

        tokio::spawn(async move {
            let mut text = String::new();

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = tx.send(GenerationEvent::Error("generation cancelled".into())).await;
                        return;
                    }
                    event = provider_rx.recv() => event,
                };

                match event {
                    Some(LlmEvent::Delta(delta)) => {
                        text.push_str(&delta);
                        if tx.send(GenerationEvent::Delta(delta)).await.is_err() {
                            return;
                        }
                    }
                    Some(LlmEvent::Done {
                        model,
                        output_tokens,
                    }) => {
                        let citations = validate_citations(&text, &source_ids);
                        let result = GenerationResult {
                            text,
                            model: if model.is_empty() { fallback_model } else { model },
                            output_tokens,
                            generation_ms: started.elapsed().as_millis() as u64,
                            citations,
                        };
                        let _ = tx.send(GenerationEvent::Done(result)).await;
                        return;
                    }
                    Some(LlmEvent::Error(message)) => {
                        let _ = tx.send(GenerationEvent::Error(message)).await;
                        return;
                    }
                    None => {
                        // Provider hung up without a terminal event.
                        let citations = validate_citations(&text, &source_ids);
                        let result = GenerationResult {
                            text,
                            model: fallback_model,
                            output_tokens: None,
                            generation_ms: started.elapsed().as_millis() as u64,
                            citations,
                        };
                        let _ = tx.send(GenerationEvent::Done(result)).await;
                        return;
                    }
                }
            }
        });

        self.telemetry.incr("generation.stream_requests", 1);
        Ok(rx)
    }
}
