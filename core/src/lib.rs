// Bob Core Library
// Event bus, LLM client and answer service for the Bob voice assistant

pub mod answer;
pub mod event;
pub mod llm;
pub mod providers;

// Export core types
pub use answer::{AnswerError, AnswerService, LlmAnswerService, LlmAnswerServiceConfig};
pub use event::{Event, EventBus, EventBusStats, QoSLevel};
pub use llm::{PromptBundle, TokenBudget};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BobError {
    #[error("Event bus error: {0}")]
    EventBusError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Search error: {0}")]
    SearchError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, BobError>;
