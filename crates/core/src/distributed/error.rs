//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur while bootstrapping or driving a process group.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A world size or process count of zero was requested.
    #[error("invalid world size {0}: must be > 0")]
    InvalidWorldSize(usize),

    /// The requested communication backend is not provided by this implementation.
    #[error("unsupported communication backend: {0}")]
    UnsupportedBackend(String),

    /// Rendezvous or group construction failed.
    #[error("process group formation failed: {0}")]
    GroupFormation(String),

    /// The backend does not accept an optional argument (e.g. a device hint).
    #[error("backend does not accept option `{0}`")]
    UnsupportedOption(&'static str),

    /// Communication timeout.
    #[error("communication timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A collective was issued before a group exists.
    #[error("no process group has been formed")]
    NotInitialized,

    /// Peer sent something unexpected on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Device binding or seeding failed.
    #[error("accelerator error: {0}")]
    Accelerator(String),

    /// A local worker process could not be started.
    #[error("failed to spawn worker rank {rank}: {source}")]
    Spawn {
        rank: usize,
        #[source]
        source: std::io::Error,
    },

    /// A local worker process exited unsuccessfully.
    #[error("worker rank {rank} failed: {status}")]
    WorkerFailed { rank: usize, status: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object broadcast payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
