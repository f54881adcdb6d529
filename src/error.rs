//! Error taxonomy for the engine
//!
//! Every caller-visible failure is one of these variants. The only soft failure
//! in the engine is a derived-metric rule, which is recorded as an omission on
//! the prediction instead of surfacing here.

/// Engine errors returned by every library operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("version conflict on {config_id}: expected {expected}, found {actual}")]
    Conflict {
        config_id: String,
        expected: u32,
        actual: u32,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("feedback {0} has already been reviewed")]
    AlreadyReviewed(String),

    #[error("parent chain for {config_id} exceeds depth {max_depth} or loops")]
    ConfigCycle { config_id: String, max_depth: usize },

    #[error("deadline exceeded before {0} completed")]
    DeadlineExceeded(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable kind, used by the RPC layer
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Conflict { .. } => "conflict",
            EngineError::Validation(_) => "validation",
            EngineError::Provider { .. } => "provider",
            EngineError::AlreadyReviewed(_) => "already_reviewed",
            EngineError::ConfigCycle { .. } => "config_cycle",
            EngineError::DeadlineExceeded(_) => "deadline_exceeded",
            EngineError::Storage(_) | EngineError::Serialization(_) => "storage",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}
