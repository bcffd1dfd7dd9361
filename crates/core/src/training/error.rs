use thiserror::Error;

/// Errors from training-engine setup.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("training engine error: {0}")]
    Engine(String),

    #[error("parameter gather failed: {0}")]
    Gather(String),
}

pub type Result<T> = std::result::Result<T, TrainingError>;
