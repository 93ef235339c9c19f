//! LLM provider abstraction.
//!
//! Each backend implements the [`Provider`] trait, translating the uniform
//! [`CompletionRequest`] into its wire format and its responses back into
//! [`CompletionResponse`] / [`StreamChunk`]. Two wire families are supported:
//! Ollama's `/api/chat` (NDJSON streaming) and OpenAI-compatible
//! `/chat/completions` (SSE streaming).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use agentflow_core::config::{Config, ProviderKind};
use agentflow_core::error::{AgentFlowError, Result};
use agentflow_core::types::{CompletionRequest, CompletionResponse, StreamChunk};

mod http;
pub mod ollama;
pub mod openai;
pub mod stream;

pub use ollama::OllamaProvider;
pub use openai::OpenAiCompatProvider;

/// Receiving end of a provider stream.
///
/// Fed by exactly one producer task, which closes it after a terminal chunk
/// (`done` or `error`), on wire EOF, or on cancellation. A channel that closes
/// without a `done` chunk did not finish normally.
pub type ChunkReceiver = mpsc::Receiver<StreamChunk>;

/// The core LLM provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier (e.g., "ollama", "groq").
    fn name(&self) -> &str;

    /// Send a completion request and wait for the full response.
    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse>;

    /// Send a completion request and stream the response.
    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<ChunkReceiver>;

    /// Configured model identifiers.
    fn models(&self) -> &[String];

    /// Whether this provider can serve `model`.
    fn supports_model(&self, model: &str) -> bool;
}

/// Split a `provider/model` spec at the first `/`.
///
/// Model identifiers may themselves contain `/` (e.g.
/// `together/meta-llama/Llama-3-70b`), so only the first separator counts.
pub fn parse_model_spec(spec: &str) -> Option<(&str, &str)> {
    spec.split_once('/')
}

/// Registry of named providers.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build providers for every entry in the config.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for pc in &config.providers {
            let api_key = pc.resolve_api_key();
            let base_url = pc.base_url.as_deref();
            let models = pc.models.clone();
            let provider: Arc<dyn Provider> = match pc.kind() {
                ProviderKind::Ollama => Arc::new(OllamaProvider::new(base_url, models)),
                ProviderKind::Groq => {
                    Arc::new(OpenAiCompatProvider::groq(base_url, api_key, models))
                }
                ProviderKind::Together => {
                    Arc::new(OpenAiCompatProvider::together(base_url, api_key, models))
                }
                ProviderKind::OpenaiCompatible => Arc::new(OpenAiCompatProvider::new(
                    &pc.id,
                    base_url.unwrap_or_default(),
                    api_key,
                    models,
                )),
            };
            // Register under the configured id so "id/model" specs resolve.
            registry.register_as(&pc.id, provider);
        }
        info!(count = registry.providers.len(), "Providers registered");
        registry
    }

    /// Register a provider under its own name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        self.register_as(&name, provider);
    }

    /// Register a provider under an explicit name.
    pub fn register_as(&mut self, name: &str, provider: Arc<dyn Provider>) {
        debug!(name, "Registering provider");
        self.providers.insert(name.to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Sorted provider names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a `provider/model` spec before any network call is made.
    pub fn resolve_model(&self, spec: &str) -> Result<(Arc<dyn Provider>, String)> {
        let (provider, model) =
            parse_model_spec(spec).ok_or_else(|| AgentFlowError::UnknownModel(spec.to_string()))?;
        let provider = self
            .get(provider)
            .ok_or_else(|| AgentFlowError::UnknownModel(spec.to_string()))?;
        Ok((provider, model.to_string()))
    }
}
