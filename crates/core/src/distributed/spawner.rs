//! Single-node fallback launcher.
//!
//! Used only when no external launcher set identity. Each worker is a
//! re-execution of a program (by default the current binary with the same
//! arguments) distinguished by the standard distributed environment
//! variables:
//!
//! | Variable      | Value                  |
//! |---------------|------------------------|
//! | `RANK`        | spawn index            |
//! | `LOCAL_RANK`  | spawn index            |
//! | `WORLD_SIZE`  | process count          |
//! | `MASTER_ADDR` | 127.0.0.1 unless set   |
//! | `MASTER_PORT` | 29500 unless set       |
//!
//! The workers see those variables, take the externally-launched path and
//! run the entry point directly.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use super::accelerator::Accelerator;
use super::error::{DistributedError, Result};
use super::topology::{
    env_int, EnvSource, LaunchContext, DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT, LOCAL_RANK_ENV,
    MASTER_ADDR_ENV, MASTER_PORT_ENV, RANK_ENV, WORLD_SIZE_ENV,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One worker per visible device, at least one.
pub fn default_process_count(accelerator: &dyn Accelerator) -> usize {
    accelerator.device_count().max(1)
}

/// Spawns and supervises local worker processes.
#[derive(Debug, Clone)]
pub struct LocalSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl LocalSpawner {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-execute the current binary with its own CLI arguments.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, std::env::args_os().skip(1)))
    }

    /// Run `entry` here if an external launcher set identity, otherwise spawn
    /// `process_count` workers (default: one per device) and wait for them.
    ///
    /// `entry` receives the local rank.
    pub fn spawn_if_needed<F, E>(
        &self,
        env: &dyn EnvSource,
        accelerator: &dyn Accelerator,
        process_count: Option<usize>,
        entry: F,
    ) -> std::result::Result<(), E>
    where
        F: FnOnce(usize) -> std::result::Result<(), E>,
        E: From<DistributedError>,
    {
        match LaunchContext::detect(env) {
            LaunchContext::External => entry(env_int(env, LOCAL_RANK_ENV, 0)),
            LaunchContext::NeedsLocalSpawn => {
                let count = process_count.unwrap_or_else(|| default_process_count(accelerator));
                self.launch(count, env).map_err(E::from)
            }
        }
    }

    /// Spawn exactly `process_count` workers and join them.
    ///
    /// The first worker to fail kills the rest and fails the launch.
    pub fn launch(&self, process_count: usize, env: &dyn EnvSource) -> Result<()> {
        if process_count == 0 {
            return Err(DistributedError::InvalidWorldSize(0));
        }

        let mut workers: Vec<Option<Child>> = Vec::with_capacity(process_count);
        for rank in 0..process_count {
            tracing::info!(rank, world_size = process_count, program = ?self.program, "spawning worker");
            let mut command = Command::new(&self.program);
            command
                .args(&self.args)
                .env(RANK_ENV, rank.to_string())
                .env(LOCAL_RANK_ENV, rank.to_string())
                .env(WORLD_SIZE_ENV, process_count.to_string());
            if env.var(MASTER_ADDR_ENV).is_none() {
                command.env(MASTER_ADDR_ENV, DEFAULT_MASTER_ADDR);
            }
            if env.var(MASTER_PORT_ENV).is_none() {
                command.env(MASTER_PORT_ENV, DEFAULT_MASTER_PORT.to_string());
            }
            match command.spawn() {
                Ok(child) => workers.push(Some(child)),
                Err(source) => {
                    terminate(&mut workers);
                    return Err(DistributedError::Spawn { rank, source });
                }
            }
        }

        supervise(workers)
    }
}

/// Poll workers until all exit cleanly or one fails.
fn supervise(mut workers: Vec<Option<Child>>) -> Result<()> {
    loop {
        let mut running = 0;
        for rank in 0..workers.len() {
            let Some(child) = workers[rank].as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    tracing::debug!(rank, "worker exited cleanly");
                    workers[rank] = None;
                }
                Ok(Some(status)) => {
                    tracing::error!(rank, %status, "worker failed, terminating the rest");
                    workers[rank] = None;
                    terminate(&mut workers);
                    return Err(DistributedError::WorkerFailed {
                        rank,
                        status: status.to_string(),
                    });
                }
                Ok(None) => running += 1,
                Err(e) => {
                    terminate(&mut workers);
                    return Err(e.into());
                }
            }
        }
        if running == 0 {
            tracing::info!(count = workers.len(), "all workers finished");
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn terminate(workers: &mut [Option<Child>]) {
    for (rank, slot) in workers.iter_mut().enumerate() {
        if let Some(mut child) = slot.take() {
            if let Err(e) = child.kill() {
                tracing::debug!(rank, error = %e, "worker already gone");
            }
            let _ = child.wait();
        }
    }
}
