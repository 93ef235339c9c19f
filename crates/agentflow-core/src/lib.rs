//! Core types, config, errors, and skill loading for AgentFlow.

pub mod config;
pub mod error;
pub mod skills;
pub mod types;
