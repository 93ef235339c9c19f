//! OpenAI-compatible Chat Completions provider.
//!
//! Implements `POST {base_url}/chat/completions` for any backend speaking the
//! OpenAI wire format (Groq, Together, vLLM, LM Studio, ...). Streaming uses
//! server-sent events terminated by a literal `data: [DONE]` line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use agentflow_core::error::{AgentFlowError, Result};
use agentflow_core::types::{
    CompletionRequest, CompletionResponse, FinishReason, Message, StreamChunk,
};

use crate::stream::{LineEvent, spawn_producer, sse_data};
use crate::{ChunkReceiver, Provider, http};

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const TOGETHER_BASE_URL: &str = "https://api.together.xyz/v1";

pub struct OpenAiCompatProvider {
    pub base_url: String,
    name: String,
    api_key: Option<String>,
    models: Vec<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// A generic OpenAI-compatible backend. `base_url` should include the API
    /// version prefix (e.g. `https://host/v1`).
    pub fn new(name: &str, base_url: &str, api_key: Option<String>, models: Vec<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            name: name.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            models,
            client: http::build_client(),
        }
    }

    pub fn groq(base_url: Option<&str>, api_key: Option<String>, models: Vec<String>) -> Self {
        Self::new(
            "groq",
            base_url.filter(|u| !u.is_empty()).unwrap_or(GROQ_BASE_URL),
            api_key,
            models,
        )
    }

    pub fn together(base_url: Option<&str>, api_key: Option<String>, models: Vec<String>) -> Self {
        Self::new(
            "together",
            base_url.filter(|u| !u.is_empty()).unwrap_or(TOGETHER_BASE_URL),
            api_key,
            models,
        )
    }

    fn post(&self, body: &OpenAiRequest<'_>) -> reqwest::RequestBuilder {
        let mut req_builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(ref api_key) = self.api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
        }
        req_builder.json(body)
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "is_zero_f64")]
    temperature: f64,
    #[serde(skip_serializing_if = "is_zero_u32")]
    max_tokens: u32,
    #[serde(skip_serializing_if = "is_false")]
    stream: bool,
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl<'a> OpenAiRequest<'a> {
    fn from_request(request: &'a CompletionRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    total_tokens: u64,
}

impl ChatCompletion {
    fn into_completion(self) -> Result<CompletionResponse> {
        let choice = self.choices.into_iter().next().ok_or(AgentFlowError::NoChoices)?;
        let message = choice.message.ok_or(AgentFlowError::NoChoices)?;
        Ok(CompletionResponse {
            content: message.content.unwrap_or_default(),
            model: self.model,
            finish_reason: FinishReason::from_wire(choice.finish_reason.as_deref().unwrap_or("")),
            // Reported as a single total, unlike Ollama's split counts.
            tokens_used: self.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse one SSE line of an OpenAI-compatible stream.
///
/// Only `[DONE]` produces the `done` chunk; a `finish_reason` on a delta does not.
pub(crate) fn parse_stream_line(line: &str) -> LineEvent {
    let Some(data) = sse_data(line) else {
        return LineEvent::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return LineEvent::Chunk(StreamChunk::finished(""));
    }
    if data.is_empty() {
        return LineEvent::Skip;
    }

    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => return LineEvent::Chunk(StreamChunk::failed(format!("decode stream chunk: {e}"))),
    };

    match chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
    {
        Some(content) if !content.is_empty() => LineEvent::Chunk(StreamChunk::delta(content)),
        // Role-only, finish_reason-only, and usage-only events
        _ => LineEvent::Skip,
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let body = OpenAiRequest::from_request(request, false);
        debug!(
            provider = %self.name,
            model = %request.model,
            base_url = %self.base_url,
            "Chat completion request"
        );

        let response = http::send(&self.name, cancel, self.post(&body)).await?;
        let parsed: ChatCompletion = http::read_json(cancel, response).await?;
        parsed.into_completion()
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<ChunkReceiver> {
        let body = OpenAiRequest::from_request(request, true);
        debug!(
            provider = %self.name,
            model = %request.model,
            base_url = %self.base_url,
            "Streaming chat completion"
        );

        let req_builder = self.post(&body).header("accept", "text/event-stream");
        let response = http::send(&self.name, cancel, req_builder).await?;

        Ok(spawn_producer(
            self.name.clone(),
            response.bytes_stream(),
            cancel.clone(),
            parse_stream_line,
        ))
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}
