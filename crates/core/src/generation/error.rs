//! Error types for coordinated generation.

use thiserror::Error;

use crate::distributed::DistributedError;

/// Errors from the generation pipeline.
///
/// Per-task variants (`MissingCode`, `MissingHyperparameters`,
/// `MalformedHyperparameters`, `Io`) are logged and skipped by the
/// coordinator; the rest abort the run.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no code block in generated text")]
    MissingCode,

    #[error("no hyperparameter object in generated text")]
    MissingHyperparameters,

    #[error("malformed hyperparameters: {0}")]
    MalformedHyperparameters(#[source] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("compute error: {0}")]
    Compute(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("shard count {shard_count} must divide {dimension}={size}")]
    IncompatibleSharding {
        shard_count: usize,
        dimension: &'static str,
        size: usize,
    },

    #[error("designated rank failed to build tasks: {0}")]
    TaskSource(String),
}

impl GenerationError {
    /// Whether the coordinator may skip the task and continue.
    pub fn is_per_task(&self) -> bool {
        matches!(
            self,
            Self::MissingCode
                | Self::MissingHyperparameters
                | Self::MalformedHyperparameters(_)
                | Self::Io(_)
                | Self::Serialization(_)
                | Self::Compute(_)
                | Self::Tokenizer(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GenerationError>;
