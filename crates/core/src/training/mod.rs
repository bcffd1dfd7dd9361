//! Distributed training setup.
//!
//! - [`TrainingEngineAdapter`] - static config + per-run overrides, trainable
//!   parameter selection
//! - [`with_gathered_parameters`] - scoped gather of partitioned parameters
//!   (e.g. to write a checkpoint)
//! - [`DistributedSampler`] - disjoint per-rank dataset indices

mod adapter;
pub mod config;
mod error;
mod sampler;

pub use adapter::{
    with_gathered_parameters, GatheredParameters, Parameter, ParameterPartitioner,
    TrainableModule, TrainingEngine, TrainingEngineAdapter,
};
pub use config::{
    load_engine_config, merge_engine_config, patch_from_training_args, ConfigSource,
    TrainingArgs,
};
pub use error::{Result, TrainingError};
pub use sampler::DistributedSampler;
