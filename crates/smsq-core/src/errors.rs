/// Core error type for the dispatch engine.
///
/// Adapter crates should map their specific errors into this type so the core
/// can decide consistently what is surfaced to callers and what is retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no eligible recipients for campaign {0}")]
    EmptyAudience(String),

    #[error("control conflict: {0}")]
    ControlConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Only storage failures are worth another attempt by the task runtime.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
