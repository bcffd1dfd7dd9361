//! Tensor-parallel text generation with a single writer.
//!
//! - [`RankCoordinatedGenerator`] - task distribution and the per-task protocol
//! - [`ModelCompute`] - prompt encoding, sharded generate, continuation decode
//! - [`ArtifactStore`] - on-disk layout of generated models
//! - [`extract`] - code and hyperparameter extraction
//! - [`generate_worker`] - the whole job for one rank

mod artifact;
mod coordinator;
mod engine;
mod error;
pub mod extract;
mod task;
mod worker;

pub use artifact::{
    ArtifactStore, FULL_OUTPUT_FILE, HYPERPARAMETER_FILE, NEW_NN_FILE, RECORD_FILE, SYNTH_DIR,
};
pub use coordinator::{
    GenerationReport, GeneratorConfig, RankCoordinatedGenerator, DEFAULT_PROMPT_SUFFIX,
};
pub use engine::{
    check_tensor_parallel, effective_pad_token_id, shard_for_inference, CausalModel,
    InferenceEngine, ModelCompute, ModelShape, Precision, RawOutput, SamplingParams,
    ShardedModel, ShardingOptions, ShardingStrategy, TaskCompute, TextTokenizer,
};
pub use error::{GenerationError, Result};
pub use task::{parse_hyperparameters, GeneratedArtifact, GenerationTask};
pub use worker::{generate_worker, WorkerOptions};
