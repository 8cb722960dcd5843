use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("invalid {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("configuration document {0} not found")]
    DocumentNotFound(String),

    #[error("job manager already started")]
    AlreadyStarted,

    #[error("job store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job record encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub(crate) fn invalid(field: &'static str, reason: &str) -> Self {
        EngineError::InvalidRequest {
            field,
            reason: reason.to_string(),
        }
    }
}
