//! Agent execution core.
//!
//! An [`Agent`] owns one conversation's history bound to a provider and
//! model. A [`Pool`] spawns a fresh agent per [`Task`] under a fixed
//! concurrency limit and keeps the per-task [`TaskResult`]s.

pub mod agent;
pub mod pool;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentConfig, AgentStream};
pub use pool::{Pool, PoolConfig, PoolStats, SpawnError, Task, TaskResult};
