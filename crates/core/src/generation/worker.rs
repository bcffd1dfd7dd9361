//! One rank of a complete generation job.
//!
//! [`generate_worker`] is the entry a driver hands to
//! [`LocalSpawner::spawn_if_needed`](crate::distributed::LocalSpawner::spawn_if_needed),
//! or calls directly when an external launcher started the process:
//!
//! ```text
//! init runtime -> shard model -> distribute tasks -> run -> destroy
//! ```

use super::coordinator::{GenerationReport, GeneratorConfig, RankCoordinatedGenerator};
use super::engine::{
    shard_for_inference, InferenceEngine, ModelCompute, Precision, ShardingOptions,
    ShardingStrategy, TextTokenizer,
};
use super::error::Result;
use super::task::GenerationTask;
use crate::distributed::{BestEffort, DistributedRuntime, InitOptions, ProcessGroup};

/// Everything a rank needs besides the model and its collaborators.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub init: InitOptions,
    pub precision: Precision,
    pub strategy: ShardingStrategy,
    pub generator: GeneratorConfig,
}

/// Run one rank of a generation job.
///
/// The model is split across all ranks (`shard_count = world_size`). `build`
/// runs on the designated rank only. The runtime is destroyed after a
/// successful run; on error it is left as is.
pub fn generate_worker<E, T, F>(
    runtime: &mut DistributedRuntime,
    engine: &E,
    model: E::Model,
    tokenizer: T,
    options: &WorkerOptions,
    build: F,
) -> Result<GenerationReport>
where
    E: InferenceEngine,
    T: TextTokenizer,
    F: FnOnce() -> Result<Vec<GenerationTask>>,
{
    runtime.init(&options.init)?;

    let sharding = ShardingOptions {
        shard_count: runtime.world_size(),
        precision: options.precision,
        strategy: options.strategy,
    };
    let sharded = shard_for_inference(engine, model, &sharding)?;
    let mut compute =
        ModelCompute::from_config(sharded, tokenizer, runtime.device(), &options.generator);

    let report = {
        let mut generator = RankCoordinatedGenerator::new(runtime, options.generator.clone());
        let tasks = generator.distribute_tasks(build)?;
        generator.run(&tasks, &mut compute)?
    };

    if let BestEffort::Suppressed(e) = runtime.destroy()? {
        tracing::warn!(rank = runtime.rank(), error = %e, "teardown barrier failed");
    }
    Ok(report)
}
