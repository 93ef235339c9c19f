//! Scripted provider for agent and pool tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentflow_core::error::{AgentFlowError, Result};
use agentflow_core::types::{CompletionRequest, CompletionResponse, FinishReason, StreamChunk};
use agentflow_providers::{ChunkReceiver, Provider};

pub(crate) struct MockProvider {
    reply: String,
    delay: Duration,
    /// Overrides `delay` for requests whose last message matches.
    delays: HashMap<String, Duration>,
    failure: Option<AgentFlowError>,
    chunks: Option<Vec<StreamChunk>>,
    models: Vec<String>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub(crate) fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            delay: Duration::ZERO,
            delays: HashMap::new(),
            failure: None,
            chunks: None,
            models: vec!["mock-model".into()],
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_delay_for(mut self, message: &str, delay: Duration) -> Self {
        self.delays.insert(message.to_string(), delay);
        self
    }

    pub(crate) fn failing(mut self, error: AgentFlowError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Chunks sent by `stream` instead of the reply split on spaces.
    pub(crate) fn with_chunks(mut self, chunks: Vec<StreamChunk>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> CompletionRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }

    fn delay_for(&self, request: &CompletionRequest) -> Duration {
        request
            .messages
            .last()
            .and_then(|m| self.delays.get(&m.content))
            .copied()
            .unwrap_or(self.delay)
    }

    fn record(&self, request: &CompletionRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
    }

    fn default_chunks(&self) -> Vec<StreamChunk> {
        let mut chunks: Vec<StreamChunk> = self
            .reply
            .split_inclusive(' ')
            .map(StreamChunk::delta)
            .collect();
        chunks.push(StreamChunk::finished(""));
        chunks
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        self.record(request);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentFlowError::Cancelled),
            _ = tokio::time::sleep(self.delay_for(request)) => {}
        }
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        Ok(CompletionResponse {
            content: self.reply.clone(),
            model: request.model.clone(),
            finish_reason: FinishReason::Stop,
            tokens_used: 3,
        })
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<ChunkReceiver> {
        self.record(request);
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        let chunks = self.chunks.clone().unwrap_or_else(|| self.default_chunks());
        let cancel = cancel.clone();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for chunk in chunks {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = tx.send(chunk) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}
