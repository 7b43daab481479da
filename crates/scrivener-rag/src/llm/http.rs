//! HTTP LLM client speaking OpenAI-compatible or Anthropic wire formats.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{GenerationParams, LlmEvent, LlmProvider, LlmResponse};
use crate::config::{LlmConfig, LlmWireFormat};
use crate::error::{RagError, Result};

pub struct HttpLlmProvider {
    client: reqwest::Client,
    endpoint: String,
    wire: LlmWireFormat,
    /// Resolved at construction; a missing key surfaces as a
    /// dependency error on the first call.
    api_key: Option<String>,
    api_key_env: String,
}

impl HttpLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::dependency("llm_provider", e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            wire: config.wire,
            api_key: std::env::var(&config.api_key_env).ok(),
            api_key_env: config.api_key_env.clone(),
        })
    }

    fn request_body(
        &self,
        system: &str,
        user: &str,
        params: &GenerationParams,
        stream: bool,
    ) -> serde_json::Value {
        match self.wire {
            LlmWireFormat::OpenAi => serde_json::json!({
                "model": params.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user}
                ],
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
                "stream": stream,
            }),
            LlmWireFormat::Anthropic => serde_json::json!({
                "model": params.model,
                "system": system,
                "messages": [
                    {"role": "user", "content": user}
                ],
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
                "stream": stream,
            }),
        }
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        match self.wire {
            LlmWireFormat::OpenAi => {
                request.header("Authorization", format!("Bearer {}", api_key))
            }
            LlmWireFormat::Anthropic => request
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01"),
        }
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            RagError::dependency(
                "llm_provider",
                format!("API key env var {} is not set", self.api_key_env),
            )
        })?;
        let request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(body);

        let response = self.apply_auth(request, api_key).send().await.map_err(|e| {
            if e.is_timeout() {
                RagError::transient("llm_generate", "request timed out")
            } else {
                RagError::dependency("llm_provider", e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RagError::transient(
                "llm_generate",
                format!("provider returned {}", status),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::dependency(
                "llm_provider",
                format!("{}: {}", status, body.chars().take(300).collect::<String>()),
            ));
        }
        Ok(response)
    }

    fn parse_completion(&self, value: &serde_json::Value) -> LlmResponse {
        match self.wire {
            LlmWireFormat::OpenAi => LlmResponse {
                text: value["choices"][0]["message"]["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                model: value["model"].as_str().unwrap_or_default().to_string(),
                output_tokens: value["usage"]["completion_tokens"]
                    .as_u64()
                    .map(|t| t as u32),
            },
            LlmWireFormat::Anthropic => {
                let text = value["content"]
                    .as_array()
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter_map(|b| b["text"].as_str())
                            .collect::<String>()
                    })
                    .unwrap_or_default();
                LlmResponse {
                    text,
                    model: value["model"].as_str().unwrap_or_default().to_string(),
                    output_tokens: value["usage"]["output_tokens"].as_u64().map(|t| t as u32),
                }
            }
        }
    }

    /// Pull the text delta out of one SSE data payload, if present.
    fn parse_delta(wire: LlmWireFormat, value: &serde_json::Value) -> Option<String> {
        match wire {
            LlmWireFormat::OpenAi => value["choices"]
                .as_array()
                .and_then(|c| c.first())
                .and_then(|choice| choice["delta"]["content"].as_str())
                .map(|s| s.to_string()),
            LlmWireFormat::Anthropic => {
                if value["type"].as_str() == Some("content_block_delta") {
                    value["delta"]["text"].as_str().map(|s| s.to_string())
                } else {
                    None
                }
            }
        }
    }

    fn parse_stream_usage(wire: LlmWireFormat, value: &serde_json::Value) -> Option<u32> {
        match wire {
            LlmWireFormat::OpenAi => value["usage"]["completion_tokens"]
                .as_u64()
                .map(|t| t as u32),
            LlmWireFormat::Anthropic => {
                if value["type"].as_str() == Some("message_delta") {
                    value["usage"]["output_tokens"].as_u64().map(|t| t as u32)
                } else {
                    None
                }
            }
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        params: &GenerationParams,
    ) -> Result<LlmResponse> {
        let body = self.request_body(system, user, params, false);
        let response = self.send(&body).await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::dependency("llm_provider", format!("bad response: {}", e)))?;
        Ok(self.parse_completion(&value))
    }

    async fn stream_generate(
        &self,
        system: &str,
        user: &str,
        params: &GenerationParams,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        let body = self.request_body(system, user, params, true);
        let response = self.send(&body).await?;

        let (tx, rx) = mpsc::channel(256);
        let wire = self.wire;
        let model = params.model.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut output_tokens: Option<u32> = None;
            // SSE events may split across TCP chunks; keep a carry buffer.
            let mut pending = String::new();

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(LlmEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = pending.find('\n') {
                    let line = pending[..newline].trim_end_matches('\r').to_string();
                    pending.drain(..=newline);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        let _ = tx
                            .send(LlmEvent::Done {
                                model: model.clone(),
                                output_tokens,
                            })
                            .await;
                        return;
                    }
                    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
                        continue;
                    };
                    if let Some(tokens) = Self::parse_stream_usage(wire, &parsed) {
                        output_tokens = Some(tokens);
                    }
                    if parsed["type"].as_str() == Some("message_stop") {
                        let _ = tx
                            .send(LlmEvent::Done {
                                model: model.clone(),
                                output_tokens,
                            })
                            .await;
                        return;
                    }
                    if let Some(delta) = Self::parse_delta(wire, &parsed) {
                        if tx.send(LlmEvent::Delta(delta)).await.is_err() {
                            // Receiver gone: generation was cancelled.
                            return;
                        }
                    }
                }
            }

            let _ = tx
                .send(LlmEvent::Done {
                    model,
                    output_tokens,
                })
                .await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_delta_parsing() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"hello"}}]}"#).unwrap();
        assert_eq!(
            HttpLlmProvider::parse_delta(LlmWireFormat::OpenAi, &value),
            Some("hello".to_string())
        );
    }

    #[test]
    fn anthropic_delta_parsing() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(
            HttpLlmProvider::parse_delta(LlmWireFormat::Anthropic, &value),
            Some("hi".to_string())
        );
        let other: serde_json::Value =
            serde_json::from_str(r#"{"type":"message_start"}"#).unwrap();
        assert_eq!(HttpLlmProvider::parse_delta(LlmWireFormat::Anthropic, &other), None);
    }

    #[test]
    fn anthropic_usage_parsing() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{"type":"message_delta","usage":{"output_tokens":42}}"#,
        )
        .unwrap();
        assert_eq!(
            HttpLlmProvider::parse_stream_usage(LlmWireFormat::Anthropic, &value),
            Some(42)
        );
    }
}
