use thiserror::Error;

#[derive(Debug, Error)]
pub enum TasklaneError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Session errors
    #[error("Session error: {session}: {message}")]
    Session { session: String, message: String },

    #[error("Session event stream closed: {0}")]
    StreamClosed(String),

    #[error("Cancelled")]
    Cancelled,

    // Flow errors
    #[error("Invalid flow definition: {0}")]
    InvalidFlow(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Flow execution exceeded max steps ({0})")]
    StepBudgetExceeded(usize),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TasklaneError {
    /// Fatal engine errors abort a flow run and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound(_) | Self::StepBudgetExceeded(_) | Self::InvalidFlow(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TasklaneError>;
