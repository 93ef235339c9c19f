//! Subagent pool: spawns a fresh [`Agent`] per task under a fixed
//! concurrency limit.
//!
//! Admission is a gate, not a queue: when `max_concurrent` agents are already
//! running, `spawn` fails immediately with [`AgentFlowError::PoolExhausted`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentflow_core::error::{AgentFlowError, Result};
use agentflow_core::skills::SkillSource;
use agentflow_core::types::CompletionResponse;
use agentflow_providers::Provider;

use crate::agent::{Agent, AgentConfig};

const DEFAULT_MAX_CONCURRENT: usize = 5;

/// A unit of work for the pool.
#[derive(Debug, Clone, Default)]
pub struct Task {
    /// Caller-chosen key for the stored result.
    pub id: String,
    pub description: String,
    pub skill: Option<String>,
    pub message: String,
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = Some(skill.into());
        self
    }
}

/// Outcome of one task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    /// Empty when the task was never admitted.
    pub agent_id: String,
    pub outcome: Result<CompletionResponse>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl TaskResult {
    fn rejected(task_id: &str, error: AgentFlowError) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: String::new(),
            outcome: Err(error),
            duration: Duration::ZERO,
            started_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn response(&self) -> Option<&CompletionResponse> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&AgentFlowError> {
        self.outcome.as_ref().err()
    }
}

/// Failure from [`Pool::spawn`].
///
/// `result` is the stored [`TaskResult`] when the task was admitted and ran,
/// and `None` when admission was refused.
#[derive(Debug, Clone, Error)]
#[error("{source}")]
pub struct SpawnError {
    pub source: AgentFlowError,
    pub result: Option<TaskResult>,
}

impl SpawnError {
    /// The stored result, or a synthesized one for a refused task.
    pub fn into_result(self, task_id: &str) -> TaskResult {
        match self.result {
            Some(result) => result,
            None => TaskResult::rejected(task_id, self.source),
        }
    }
}

/// Pool construction parameters.
#[derive(Clone)]
pub struct PoolConfig {
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub skills: Option<Arc<dyn SkillSource>>,
    /// `0` means the default of 5.
    pub max_concurrent: usize,
    /// Defaults to a prompt naming the task's description.
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_output_tokens: u32,
}

impl PoolConfig {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            skills: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            system_prompt: None,
            temperature: 0.0,
            max_output_tokens: 0,
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub max: usize,
    pub results: usize,
}

struct PoolState {
    active: usize,
    results: HashMap<String, TaskResult>,
}

struct PoolInner {
    config: PoolConfig,
    max_concurrent: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds one admission slot; releasing it on drop covers cancelled and
/// dropped spawn futures.
struct ActiveSlot {
    inner: Arc<PoolInner>,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.active = state.active.saturating_sub(1);
    }
}

/// Bounded spawner of single-task agents. Cheap to clone; clones share
/// the active count and stored results.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        let max_concurrent = if config.max_concurrent == 0 {
            DEFAULT_MAX_CONCURRENT
        } else {
            config.max_concurrent
        };
        info!(model = %config.model, max_concurrent, "Subagent pool created");
        Self {
            inner: Arc::new(PoolInner {
                config,
                max_concurrent,
                state: Mutex::new(PoolState {
                    active: 0,
                    results: HashMap::new(),
                }),
            }),
        }
    }

    /// Run one task on a fresh agent.
    ///
    /// Fails immediately if the pool is full. Otherwise the result is stored
    /// under `task.id` (replacing any earlier result with that id) and, on
    /// failure, also carried by the returned [`SpawnError`].
    pub async fn spawn(
        &self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> std::result::Result<TaskResult, SpawnError> {
        let _slot = self.admit(&task.id).map_err(|source| SpawnError {
            source,
            result: None,
        })?;

        let mut agent = self.agent_for(task);
        let started_at = Utc::now();
        let start = Instant::now();
        debug!(task_id = %task.id, agent_id = %agent.id(), "Subagent started");

        let outcome = match task.skill.as_deref().filter(|s| !s.is_empty()) {
            Some(skill) => agent.run_with_skill(cancel, skill, &task.message).await,
            None => agent.run(cancel, &task.message).await,
        };

        let result = TaskResult {
            task_id: task.id.clone(),
            agent_id: agent.id().to_string(),
            outcome,
            duration: start.elapsed(),
            started_at,
        };
        match &result.outcome {
            Ok(_) => info!(
                task_id = %task.id,
                elapsed_ms = result.duration.as_millis() as u64,
                "Subagent finished"
            ),
            Err(e) => warn!(task_id = %task.id, error = %e, "Subagent failed"),
        }

        self.inner
            .lock()
            .results
            .insert(task.id.clone(), result.clone());

        match result.error().cloned() {
            None => Ok(result),
            Some(source) => Err(SpawnError {
                source,
                result: Some(result),
            }),
        }
    }

    /// Run a task in the background. The receiver yields exactly one result,
    /// with its error set on failure or refusal.
    pub fn spawn_async(
        &self,
        cancel: &CancellationToken,
        task: Task,
    ) -> oneshot::Receiver<TaskResult> {
        let (tx, rx) = oneshot::channel();
        let pool = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = pool
                .spawn(&cancel, &task)
                .await
                .unwrap_or_else(|e| e.into_result(&task.id));
            let _ = tx.send(result);
        });
        rx
    }

    /// Spawn every task concurrently and wait for all of them.
    ///
    /// Returns one result per task in input order. Tasks beyond the
    /// concurrency limit get a pool-exhausted result rather than waiting.
    pub async fn spawn_batch(&self, cancel: &CancellationToken, tasks: &[Task]) -> Vec<TaskResult> {
        info!(count = tasks.len(), max = self.inner.max_concurrent, "Spawning batch");
        let mut set = JoinSet::new();
        for (index, task) in tasks.iter().cloned().enumerate() {
            let pool = self.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let result = pool
                    .spawn(&cancel, &task)
                    .await
                    .unwrap_or_else(|e| e.into_result(&task.id));
                (index, result)
            });
        }

        let mut slots: Vec<Option<TaskResult>> = vec![None; tasks.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!(%e, "Batch task did not complete"),
            }
        }

        tasks
            .iter()
            .zip(slots)
            .map(|(task, slot)| {
                slot.unwrap_or_else(|| {
                    TaskResult::rejected(&task.id, AgentFlowError::Task("task panicked".into()))
                })
            })
            .collect()
    }

    pub fn get_result(&self, task_id: &str) -> Option<TaskResult> {
        self.inner.lock().results.get(task_id).cloned()
    }

    pub fn clear_results(&self) {
        self.inner.lock().results.clear();
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            active: state.active,
            max: self.inner.max_concurrent,
            results: state.results.len(),
        }
    }

    fn admit(&self, task_id: &str) -> Result<ActiveSlot> {
        let mut state = self.inner.lock();
        if state.active >= self.inner.max_concurrent {
            warn!(task_id, max = self.inner.max_concurrent, "Pool exhausted");
            return Err(AgentFlowError::PoolExhausted {
                max: self.inner.max_concurrent,
            });
        }
        state.active += 1;
        Ok(ActiveSlot {
            inner: Arc::clone(&self.inner),
        })
    }

    fn agent_for(&self, task: &Task) -> Agent {
        let config = &self.inner.config;
        let system_prompt = config
            .system_prompt
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| {
                format!("You are a focused subagent executing task: {}", task.description)
            });

        let suffix = Uuid::new_v4().simple().to_string();
        let mut metadata = task.metadata.clone();
        metadata.insert("task_id".into(), task.id.clone());

        Agent::new(AgentConfig {
            id: format!("subagent-{}-{}", task.id, &suffix[..8]),
            provider: Arc::clone(&config.provider),
            model: config.model.clone(),
            skills: config.skills.clone(),
            system_prompt: Some(system_prompt),
            metadata,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use agentflow_core::skills::{Skill, SkillRegistry};
    use agentflow_core::types::Role;

    use super::*;
    use crate::testing::MockProvider;

    fn pool(provider: Arc<MockProvider>, max_concurrent: usize) -> Pool {
        let mut config = PoolConfig::new(provider, "mock-model");
        config.max_concurrent = max_concurrent;
        Pool::new(config)
    }

    fn slow(reply: &str) -> Arc<MockProvider> {
        Arc::new(MockProvider::new(reply).with_delay(Duration::from_millis(100)))
    }

    async fn wait_for_active(pool: &Pool, n: usize) {
        for _ in 0..200 {
            if pool.active_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("active count never reached {n}");
    }

    #[test]
    fn test_default_max_concurrent() {
        let p = pool(Arc::new(MockProvider::new("x")), 0);
        assert_eq!(p.max_concurrent(), 5);
        assert_eq!(
            p.stats(),
            PoolStats {
                active: 0,
                max: 5,
                results: 0
            }
        );
    }

    #[tokio::test]
    async fn test_spawn_stores_result() {
        let provider = Arc::new(MockProvider::new("hi"));
        let p = pool(provider.clone(), 2);

        let task = Task::new("t1", "hello").with_description("greet");
        let result = p.spawn(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(result.task_id, "t1");
        assert!(result.agent_id.starts_with("subagent-t1-"));
        assert_eq!(result.response().unwrap().content, "hi");
        assert_eq!(p.active_count(), 0);

        let stored = p.get_result("t1").unwrap();
        assert_eq!(stored.agent_id, result.agent_id);

        let request = provider.last_request();
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(
            request.messages[0].content,
            "You are a focused subagent executing task: greet"
        );
        assert_eq!(request.messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_spawn_uses_configured_prompt_and_settings() {
        let provider = Arc::new(MockProvider::new("ok"));
        let mut config = PoolConfig::new(provider.clone(), "mock-model");
        config.system_prompt = Some("You review code.".into());
        config.temperature = 0.2;
        config.max_output_tokens = 512;
        let p = Pool::new(config);

        p.spawn(&CancellationToken::new(), &Task::new("t", "look")).await.unwrap();
        let request = provider.last_request();
        assert_eq!(request.messages[0].content, "You review code.");
        assert_eq!(request.temperature, 0.2);
        assert_eq!(request.max_output_tokens, 512);
    }

    #[tokio::test]
    async fn test_spawn_failure_populates_error_and_result() {
        let provider = Arc::new(MockProvider::new("").failing(AgentFlowError::Status {
            provider: "mock".into(),
            status: 503,
            body: "overloaded".into(),
        }));
        let p = pool(provider, 2);

        let err = p
            .spawn(&CancellationToken::new(), &Task::new("t1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err.source, AgentFlowError::Status { status: 503, .. }));
        assert_eq!(err.to_string(), "mock error 503: overloaded");

        let result = err.result.unwrap();
        assert_eq!(result.error(), Some(&err.source));
        assert!(!result.agent_id.is_empty());
        assert!(!p.get_result("t1").unwrap().is_success());
        assert_eq!(p.active_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_rejects_immediately() {
        let provider = slow("done");
        let p = pool(provider.clone(), 2);
        let cancel = CancellationToken::new();

        let first = p.spawn_async(&cancel, Task::new("a", "1"));
        let second = p.spawn_async(&cancel, Task::new("b", "2"));
        wait_for_active(&p, 2).await;

        let start = Instant::now();
        let err = p.spawn(&cancel, &Task::new("c", "3")).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(err.source, AgentFlowError::PoolExhausted { max: 2 });
        assert_eq!(err.to_string(), "pool exhausted: max 2 agents");
        assert!(err.result.is_none());
        assert!(p.get_result("c").is_none());
        assert_eq!(p.active_count(), 2);

        assert!(first.await.unwrap().is_success());
        assert!(second.await.unwrap().is_success());
        assert_eq!(p.active_count(), 0);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_active_count_never_exceeds_max() {
        let p = pool(slow("x"), 3);
        let cancel = CancellationToken::new();

        let receivers: Vec<_> = (0..10)
            .map(|i| p.spawn_async(&cancel, Task::new(format!("t{i}"), "go")))
            .collect();
        for _ in 0..20 {
            assert!(p.active_count() <= 3);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(p.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_slot() {
        let provider = Arc::new(MockProvider::new("x").with_delay(Duration::from_secs(30)));
        let p = pool(provider, 1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let task = Task::new("t", "x");
        let err = tokio::time::timeout(Duration::from_secs(2), p.spawn(&cancel, &task))
            .await
            .expect("spawn should return soon after cancellation")
            .unwrap_err();
        assert!(err.source.is_cancelled());
        assert_eq!(p.active_count(), 0);

        // The slot is free again: admission succeeds and the fresh token is honored.
        let again = CancellationToken::new();
        again.cancel();
        let err = p.spawn(&again, &Task::new("t2", "x")).await.unwrap_err();
        assert!(err.source.is_cancelled());
        assert!(err.result.is_some());
    }

    #[tokio::test]
    async fn test_dropped_spawn_releases_slot() {
        let provider = Arc::new(MockProvider::new("x").with_delay(Duration::from_secs(30)));
        let p = pool(provider, 1);
        let cancel = CancellationToken::new();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            p.spawn(&cancel, &Task::new("t", "x")),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(p.active_count(), 0);
        assert!(p.get_result("t").is_none());
    }

    #[tokio::test]
    async fn test_spawn_async_reports_refusal() {
        let p = pool(slow("x"), 1);
        let cancel = CancellationToken::new();

        let running = p.spawn_async(&cancel, Task::new("a", "1"));
        wait_for_active(&p, 1).await;
        let refused = p.spawn_async(&cancel, Task::new("b", "2")).await.unwrap();

        assert_eq!(refused.task_id, "b");
        assert!(refused.agent_id.is_empty());
        assert!(refused.error().unwrap().is_capacity());
        assert!(running.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_length() {
        let p = pool(Arc::new(MockProvider::new("ok")), 5);
        let tasks: Vec<Task> = (0..4).map(|i| Task::new(format!("t{i}"), "go")).collect();

        let results = p.spawn_batch(&CancellationToken::new(), &tasks).await;
        let ids: Vec<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t0", "t1", "t2", "t3"]);
        assert!(results.iter().all(TaskResult::is_success));
        assert_eq!(p.stats().results, 4);
    }

    #[tokio::test]
    async fn test_batch_order_ignores_completion_order() {
        let provider = Arc::new(
            MockProvider::new("ok")
                .with_delay_for("m0", Duration::from_millis(120))
                .with_delay_for("m1", Duration::from_millis(80))
                .with_delay_for("m2", Duration::from_millis(40))
                .with_delay_for("m3", Duration::ZERO),
        );
        let p = pool(provider, 4);
        let tasks: Vec<Task> = (0..4)
            .map(|i| Task::new(format!("t{i}"), format!("m{i}")))
            .collect();

        let results = p.spawn_batch(&CancellationToken::new(), &tasks).await;
        let ids: Vec<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t0", "t1", "t2", "t3"]);
        assert!(results.iter().all(TaskResult::is_success));

        // t3 finished first and t0 last, yet each stays at its input index.
        let finished_last = results.iter().max_by_key(|r| r.duration).unwrap();
        let finished_first = results.iter().min_by_key(|r| r.duration).unwrap();
        assert_eq!(finished_last.task_id, "t0");
        assert_eq!(finished_first.task_id, "t3");
    }

    #[tokio::test]
    async fn test_batch_over_capacity_partially_fails() {
        let p = pool(slow("ok"), 2);
        let tasks: Vec<Task> = (0..5).map(|i| Task::new(format!("t{i}"), "go")).collect();

        let results = p.spawn_batch(&CancellationToken::new(), &tasks).await;
        assert_eq!(results.len(), 5);
        for (task, result) in tasks.iter().zip(&results) {
            assert_eq!(result.task_id, task.id);
        }
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let refused = results
            .iter()
            .filter(|r| r.error().is_some_and(AgentFlowError::is_capacity))
            .count();
        assert_eq!(succeeded, 2);
        assert_eq!(refused, 3);
        assert_eq!(p.active_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_isolates_task_failures() {
        let mut registry = SkillRegistry::new();
        registry.insert(Skill {
            name: "review".into(),
            content: "Look for bugs.".into(),
            ..Default::default()
        });
        let mut config = PoolConfig::new(Arc::new(MockProvider::new("ok")), "mock-model");
        config.skills = Some(Arc::new(registry));
        let p = Pool::new(config);

        let tasks = vec![
            Task::new("good", "a").with_skill("review"),
            Task::new("bad", "b").with_skill("missing"),
            Task::new("plain", "c"),
        ];
        let results = p.spawn_batch(&CancellationToken::new(), &tasks).await;
        assert!(results[0].is_success());
        assert_eq!(
            results[1].error(),
            Some(&AgentFlowError::SkillNotFound("missing".into()))
        );
        assert!(results[2].is_success());
    }

    #[tokio::test]
    async fn test_duplicate_task_id_last_write_wins() {
        let p = pool(Arc::new(MockProvider::new("ok")), 2);
        let cancel = CancellationToken::new();

        let first = p.spawn(&cancel, &Task::new("dup", "one")).await.unwrap();
        let second = p.spawn(&cancel, &Task::new("dup", "two")).await.unwrap();
        assert_ne!(first.agent_id, second.agent_id);

        assert_eq!(p.stats().results, 1);
        assert_eq!(p.get_result("dup").unwrap().agent_id, second.agent_id);
    }

    #[tokio::test]
    async fn test_clear_results() {
        let p = pool(Arc::new(MockProvider::new("ok")), 2);
        p.spawn(&CancellationToken::new(), &Task::new("t", "x")).await.unwrap();
        assert!(p.get_result("t").is_some());

        p.clear_results();
        assert!(p.get_result("t").is_none());
        assert_eq!(p.stats().results, 0);
    }
}
