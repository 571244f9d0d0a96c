use thiserror::Error;

#[derive(Error, Debug)]
pub enum GantryError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Duplicate request id: {0}")]
    DuplicateRequest(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Sampler error: {0}")]
    Sampler(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Out of capacity: {0}")]
    OutOfCapacity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GantryError>;
