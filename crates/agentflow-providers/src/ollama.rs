//! Ollama chat API provider.
//!
//! `POST /api/chat`. Non-streaming returns one JSON object; streaming returns
//! newline-delimited JSON objects with `done=false` until a final `done=true`
//! object. There is no other end sentinel, so EOF also ends the stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use agentflow_core::error::{AgentFlowError, Result};
use agentflow_core::types::{
    CompletionRequest, CompletionResponse, FinishReason, Message, StreamChunk,
};

use crate::stream::{LineEvent, spawn_producer};
use crate::{ChunkReceiver, Provider, http};

const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const PROVIDER_NAME: &str = "ollama";

pub struct OllamaProvider {
    pub base_url: String,
    models: Vec<String>,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: Option<&str>, models: Vec<String>) -> Self {
        Self {
            base_url: base_url
                .filter(|u| !u.is_empty())
                .unwrap_or(OLLAMA_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            models,
            client: http::build_client(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

// --- Ollama request/response types ---

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "is_zero_f64")]
    temperature: f64,
    #[serde(skip_serializing_if = "is_zero_u32")]
    num_predict: u32,
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

impl<'a> OllamaRequest<'a> {
    fn from_request(request: &'a CompletionRequest, stream: bool) -> Self {
        // Options are only sent when the caller set something.
        let options = (request.temperature > 0.0 || request.max_output_tokens > 0).then(|| {
            OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_output_tokens,
            }
        });
        Self {
            model: &request.model,
            messages: &request.messages,
            stream,
            options,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
    /// Set when the server fails after the stream has started.
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaResponse {
    fn into_completion(self) -> Result<CompletionResponse> {
        let message = self.message.ok_or(AgentFlowError::NoChoices)?;
        let finish_reason = match self.done_reason.as_deref() {
            Some(reason) if !reason.is_empty() => FinishReason::from_wire(reason),
            _ => FinishReason::Stop,
        };
        Ok(CompletionResponse {
            content: message.content,
            model: self.model,
            finish_reason,
            // Ollama reports prompt and generated tokens separately.
            tokens_used: self.prompt_eval_count + self.eval_count,
        })
    }
}

/// Parse one NDJSON line of an Ollama stream.
pub(crate) fn parse_stream_line(line: &str) -> LineEvent {
    let line = line.trim();
    if line.is_empty() {
        return LineEvent::Skip;
    }

    let chunk: OllamaResponse = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => return LineEvent::Chunk(StreamChunk::failed(format!("decode stream chunk: {e}"))),
    };

    if let Some(error) = chunk.error {
        return LineEvent::Chunk(StreamChunk::failed(error));
    }

    LineEvent::Chunk(StreamChunk {
        content: chunk.message.map(|m| m.content).unwrap_or_default(),
        done: chunk.done,
        error: None,
    })
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let body = OllamaRequest::from_request(request, false);
        debug!(model = %request.model, base_url = %self.base_url, "Ollama chat request");

        let response = http::send(
            PROVIDER_NAME,
            cancel,
            self.client.post(self.chat_url()).json(&body),
        )
        .await?;

        let parsed: OllamaResponse = http::read_json(cancel, response).await?;
        parsed.into_completion()
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<ChunkReceiver> {
        let body = OllamaRequest::from_request(request, true);
        debug!(model = %request.model, base_url = %self.base_url, "Streaming Ollama chat");

        let response = http::send(
            PROVIDER_NAME,
            cancel,
            self.client.post(self.chat_url()).json(&body),
        )
        .await?;

        Ok(spawn_producer(
            PROVIDER_NAME.to_string(),
            response.bytes_stream(),
            cancel.clone(),
            parse_stream_line,
        ))
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    /// Ollama pulls unknown models on demand, so every model is accepted.
    fn supports_model(&self, _model: &str) -> bool {
        true
    }
}
