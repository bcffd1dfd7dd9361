//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use nngpt_core::distributed::{
    accelerator, Accelerator, BestEffort, DistributedRuntime, EnvSource, InitOptions,
    LocalSpawner, ProcessEnv, ProcessGroup, RuntimeState, TcpBackend,
};
use nngpt_core::training::{merge_engine_config, ConfigSource, TrainingArgs};

use crate::config::DriverConfig;

/// Bring up the runtime on every rank, synchronize once and tear down.
///
/// Spawns local workers first when no launcher set identity.
pub fn check(config: &DriverConfig) -> anyhow::Result<()> {
    let accelerator = accelerator::detect();
    let options = config.init_options();
    let spawner = LocalSpawner::current_exe().context("cannot locate the nngpt binary")?;
    spawner.spawn_if_needed(&ProcessEnv, accelerator.as_ref(), config.nprocs, |_| {
        check_worker(ProcessEnv, accelerator.clone(), &options).map(|_| ())
    })
}

/// One rank of [`check`].
pub fn check_worker(
    env: impl EnvSource + 'static,
    accelerator: Arc<dyn Accelerator>,
    options: &InitOptions,
) -> anyhow::Result<RuntimeState> {
    let mut runtime =
        DistributedRuntime::new(Box::new(TcpBackend::new()), accelerator).with_env(env);
    runtime
        .init(options)
        .with_context(|| format!("distributed init failed (backend {})", options.backend))?;

    let state = runtime.state();
    tracing::info!(
        rank = runtime.rank(),
        local_rank = runtime.local_rank(),
        world_size = runtime.world_size(),
        designated = runtime.is_designated(),
        seed = state.seed(),
        "rank ready"
    );

    runtime.barrier().context("barrier failed")?;
    if let BestEffort::Suppressed(e) = runtime.destroy().context("teardown failed")? {
        tracing::warn!(error = %e, "final barrier failed during teardown");
    }
    Ok(state)
}

/// Merged training-engine configuration as pretty JSON.
pub fn engine_config(path: &Path, args: &TrainingArgs) -> anyhow::Result<String> {
    let merged = merge_engine_config(&ConfigSource::Path(path.to_path_buf()), Some(args))
        .with_context(|| format!("failed to load engine config {}", path.display()))?;
    Ok(serde_json::to_string_pretty(&merged)?)
}
