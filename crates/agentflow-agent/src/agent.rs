//! A single conversation bound to one provider and model.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentflow_core::error::{AgentFlowError, Result};
use agentflow_core::skills::SkillSource;
use agentflow_core::types::{CompletionRequest, CompletionResponse, Message, Role, StreamChunk};
use agentflow_providers::{ChunkReceiver, Provider};

/// Construction parameters for an [`Agent`].
#[derive(Clone)]
pub struct AgentConfig {
    /// Empty means generate `agent-<uuid>`.
    pub id: String,
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub skills: Option<Arc<dyn SkillSource>>,
    pub system_prompt: Option<String>,
    pub metadata: HashMap<String, String>,
    /// `0.0` leaves the backend default.
    pub temperature: f64,
    /// `0` leaves the backend default.
    pub max_output_tokens: u32,
}

impl AgentConfig {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            provider,
            model: model.into(),
            skills: None,
            system_prompt: None,
            metadata: HashMap::new(),
            temperature: 0.0,
            max_output_tokens: 0,
        }
    }
}

/// Conversation history plus the provider binding that answers it.
///
/// Not internally synchronized: `run`, `stream` and `add_message` take
/// `&mut self`, so one task drives an agent at a time.
pub struct Agent {
    id: String,
    provider: Arc<dyn Provider>,
    model: String,
    skills: Option<Arc<dyn SkillSource>>,
    system_prompt: Option<String>,
    messages: Vec<Message>,
    metadata: HashMap<String, String>,
    temperature: f64,
    max_output_tokens: u32,
    created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let id = if config.id.is_empty() {
            format!("agent-{}", Uuid::new_v4())
        } else {
            config.id
        };
        let system_prompt = config.system_prompt.filter(|p| !p.is_empty());

        let mut agent = Self {
            id,
            provider: config.provider,
            model: config.model,
            skills: config.skills,
            system_prompt,
            messages: Vec::new(),
            metadata: config.metadata,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            created_at: Utc::now(),
        };
        agent.seed_history();
        debug!(agent_id = %agent.id, model = %agent.model, "Agent created");
        agent
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(Message::new(role, content));
    }

    /// History in conversation order, replayable through [`Agent::add_message`].
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Drop everything but the system prompt.
    pub fn clear_history(&mut self) {
        self.messages.clear();
        self.seed_history();
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Same binding, copied metadata, fresh history.
    ///
    /// An empty `new_id` yields `<id>-clone-<uuid>`.
    pub fn clone_agent(&self, new_id: &str) -> Agent {
        let id = if new_id.is_empty() {
            format!("{}-clone-{}", self.id, Uuid::new_v4())
        } else {
            new_id.to_string()
        };
        Agent::new(AgentConfig {
            id,
            provider: Arc::clone(&self.provider),
            model: self.model.clone(),
            skills: self.skills.clone(),
            system_prompt: self.system_prompt.clone(),
            metadata: self.metadata.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        })
    }

    /// One turn: append `text`, send the whole history, append the reply.
    ///
    /// On failure the user message stays in history with no reply after it.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        text: &str,
    ) -> Result<CompletionResponse> {
        self.add_message(Role::User, text);
        let request = self.build_request(false);
        debug!(agent_id = %self.id, messages = request.messages.len(), "Agent turn");

        match self.provider.complete(cancel, &request).await {
            Ok(response) => {
                self.add_message(Role::Assistant, response.content.clone());
                Ok(response)
            }
            Err(e) => {
                warn!(agent_id = %self.id, error = %e, "Agent turn failed");
                Err(e)
            }
        }
    }

    /// Like [`Agent::run`] with the named skill's instructions prefixed to `text`.
    pub async fn run_with_skill(
        &mut self,
        cancel: &CancellationToken,
        skill_name: &str,
        text: &str,
    ) -> Result<CompletionResponse> {
        let skill = self
            .skills
            .as_ref()
            .and_then(|source| source.get(skill_name))
            .ok_or_else(|| AgentFlowError::SkillNotFound(skill_name.to_string()))?;

        info!(agent_id = %self.id, skill = %skill.name, "Running with skill");
        let prompt = format!("# Skill: {}\n\n{}\n\n---\n\n{}", skill.name, skill.content, text);
        self.run(cancel, &prompt).await
    }

    /// Streaming turn. The reply is appended to history once the returned
    /// handle observes the `done` chunk.
    pub async fn stream(
        &mut self,
        cancel: &CancellationToken,
        text: &str,
    ) -> Result<AgentStream<'_>> {
        self.add_message(Role::User, text);
        let request = self.build_request(true);
        debug!(agent_id = %self.id, messages = request.messages.len(), "Agent streaming turn");

        let rx = self.provider.stream(cancel, &request).await?;
        Ok(AgentStream {
            agent: self,
            rx,
            cancel: cancel.clone(),
            buffer: String::new(),
            completed: false,
            finished: false,
        })
    }

    fn seed_history(&mut self) {
        if let Some(prompt) = &self.system_prompt {
            self.messages.push(Message::system(prompt.clone()));
        }
    }

    fn build_request(&self, streaming: bool) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages: self.messages.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            streaming,
        }
    }
}

/// An in-flight streaming turn.
///
/// Holds the agent mutably until dropped, so history cannot change under it.
pub struct AgentStream<'a> {
    agent: &'a mut Agent,
    rx: ChunkReceiver,
    cancel: CancellationToken,
    buffer: String,
    completed: bool,
    finished: bool,
}

impl AgentStream<'_> {
    /// Next chunk, or `None` once the stream has ended.
    ///
    /// An error chunk is returned and then ends the stream. The first `done`
    /// chunk appends the accumulated reply to the agent's history.
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        if self.finished {
            return None;
        }
        let Some(chunk) = self.rx.recv().await else {
            self.finished = true;
            return None;
        };
        if chunk.is_error() {
            self.finished = true;
            return Some(chunk);
        }

        self.buffer.push_str(&chunk.content);
        if chunk.done {
            self.finished = true;
            self.completed = true;
            let reply = self.buffer.clone();
            self.agent.add_message(Role::Assistant, reply);
        }
        Some(chunk)
    }

    /// Content accumulated so far.
    pub fn content(&self) -> &str {
        &self.buffer
    }

    /// Whether a `done` chunk was seen.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Drain the stream and return the full reply.
    ///
    /// A close without `done` is an error: [`AgentFlowError::Cancelled`] if
    /// the token fired, [`AgentFlowError::Stream`] otherwise. Only a completed
    /// reply is returned, matching what was appended to history.
    pub async fn collect(mut self) -> Result<String> {
        while let Some(chunk) = self.recv().await {
            if let Some(e) = chunk.error {
                return Err(AgentFlowError::Stream(e));
            }
        }
        if !self.completed {
            if self.cancel.is_cancelled() {
                return Err(AgentFlowError::Cancelled);
            }
            warn!(agent_id = %self.agent.id, "Stream closed without done");
            return Err(AgentFlowError::Stream("stream closed without done".into()));
        }
        Ok(self.buffer)
    }
}
