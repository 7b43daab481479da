//! LLM provider interface: one-shot generation and a streaming variant
//! yielding incremental deltas over a channel.
//!
//! The HTTP implementation speaks both OpenAI-compatible and Anthropic
//! wire formats, selected by config. Streaming parses `data: ` lines
//! from the SSE byte stream.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub use http::HttpLlmProvider;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub output_tokens: Option<u32>,
}

/// One event in a streaming generation. The stream is lazy, finite, and
/// non-restartable: zero or more `Delta`s, then exactly one terminal
/// `Done` or `Error`.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Delta(String),
    Done {
        model: String,
        output_tokens: Option<u32>,
    },
    Error(String),
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        params: &GenerationParams,
    ) -> Result<LlmResponse>;

    async fn stream_generate(
        &self,
        system: &str,
        user: &str,
        params: &GenerationParams,
    ) -> Result<mpsc::Receiver<LlmEvent>>;
}

/// Collect a delta stream into a full response. Used by callers that
/// requested streaming internally but need the final text.
pub async fn collect_stream(mut rx: mpsc::Receiver<LlmEvent>) -> Result<LlmResponse> {
    let mut text = String::new();
    let mut model = String::new();
    let mut output_tokens = None;

    while let Some(event) = rx.recv().await {
        match event {
            LlmEvent::Delta(delta) => text.push_str(&delta),
            LlmEvent::Done {
                model: m,
                output_tokens: t,
            } => {
                model = m;
                output_tokens = t;
            }
            LlmEvent::Error(message) => {
                return Err(crate::error::RagError::dependency("llm_provider", message));
            }
        }
    }

    Ok(LlmResponse {
        text,
        model,
        output_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_stream_assembles_deltas() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(LlmEvent::Delta("Our programs ".into())).await.unwrap();
        tx.send(LlmEvent::Delta("served 5,000 youth [1].".into()))
            .await
            .unwrap();
        tx.send(LlmEvent::Done {
            model: "test-model".into(),
            output_tokens: Some(12),
        })
        .await
        .unwrap();
        drop(tx);

        let response = collect_stream(rx).await.unwrap();
        assert_eq!(response.text, "Our programs served 5,000 youth [1].");
        assert_eq!(response.model, "test-model");
        assert_eq!(response.output_tokens, Some(12));
    }

    #[tokio::test]
    async fn collect_stream_surfaces_provider_error() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(LlmEvent::Delta("partial".into())).await.unwrap();
        tx.send(LlmEvent::Error("rate limited".into())).await.unwrap();
        drop(tx);

        let err = collect_stream(rx).await.unwrap_err();
        assert_eq!(err.kind(), "dependency_unavailable");
    }
}
