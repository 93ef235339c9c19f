use thiserror::Error;

/// Every failure the execution core can surface.
///
/// Errors are `Clone` so one failure can be stored in a pool result, returned
/// to the caller and carried on a stream chunk at the same time.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentFlowError {
    #[error("{provider} error {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    /// An error chunk received while consuming a stream.
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("no choices returned")]
    NoChoices,

    #[error("Request cancelled")]
    Cancelled,

    #[error("pool exhausted: max {max} agents")]
    PoolExhausted { max: usize },

    #[error("Unknown model spec: {0}")]
    UnknownModel(String),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl AgentFlowError {
    /// Capacity errors are returned synchronously by the pool and never retried.
    pub fn is_capacity(&self) -> bool {
        matches!(self, AgentFlowError::PoolExhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentFlowError::Cancelled)
    }
}

impl From<std::io::Error> for AgentFlowError {
    fn from(e: std::io::Error) -> Self {
        AgentFlowError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AgentFlowError {
    fn from(e: serde_json::Error) -> Self {
        AgentFlowError::Json(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentFlowError>;
