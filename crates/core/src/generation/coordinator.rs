//! Rank-coordinated generation.
//!
//! Every rank runs the compute step of every task with identical input; the
//! sharded forward pass is collective, so gating it on role deadlocks the
//! group. Only the designated rank decodes, parses and writes, and only after
//! compute has returned on all ranks.
//!
//! ```text
//!            rank 0                      rank 1..N-1
//! build tasks ──broadcast──────────────▶ receive tasks
//! for idx, task:
//!   compute(task)  ◀── collective ──▶   compute(task)
//!   decode / parse / persist            drop output
//! barrier          ◀── collective ──▶   barrier
//! ```

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};

use super::artifact::ArtifactStore;
use super::engine::TaskCompute;
use super::error::{GenerationError, Result};
use super::task::{GeneratedArtifact, GenerationTask};
use crate::distributed::{DistributedRuntime, ProcessGroup};

const PROGRESS_BAR_TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})";

/// Instruction appended to every prompt.
pub const DEFAULT_PROMPT_SUFFIX: &str = " Use PyTorch for the implementation. Keep the code short. \
Name the main class of the model \"Net\". The model code must include default parameters for \
initialization in the constructor. Provide only the code. Don't provide any explanation. \
Remove any text from this reply. Don't include comments in the code.";

/// Configuration for a generation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Artifacts go under `<out_dir>/synth_nn`.
    pub out_dir: PathBuf,
    pub max_new_tokens: usize,
    pub do_sample: bool,
    /// Also write the raw decoded text of each task.
    pub save_llm_output: bool,
    pub prompt_suffix: String,
    /// Draw a progress bar on the designated rank.
    pub show_progress: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
            max_new_tokens: 5000,
            do_sample: true,
            save_llm_output: true,
            prompt_suffix: DEFAULT_PROMPT_SUFFIX.to_string(),
            show_progress: true,
        }
    }
}

/// Outcome of [`RankCoordinatedGenerator::run`] on one rank.
///
/// Only the designated rank records indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub total: usize,
    pub persisted: Vec<usize>,
    pub skipped: Vec<usize>,
}

/// Drives a task sequence through all ranks.
pub struct RankCoordinatedGenerator<'a> {
    runtime: &'a mut DistributedRuntime,
    store: ArtifactStore,
    config: GeneratorConfig,
}

impl<'a> RankCoordinatedGenerator<'a> {
    pub fn new(runtime: &'a mut DistributedRuntime, config: GeneratorConfig) -> Self {
        let store = ArtifactStore::new(&config.out_dir);
        Self {
            runtime,
            store,
            config,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Build the task list on the designated rank and share it.
    ///
    /// `build` runs on the designated rank only. With world_size > 1 the list
    /// (or the build failure) is broadcast as one transfer, so every rank
    /// returns the same sequence or the same error.
    pub fn distribute_tasks<F>(&mut self, build: F) -> Result<Vec<GenerationTask>>
    where
        F: FnOnce() -> Result<Vec<GenerationTask>>,
    {
        let local = self
            .runtime
            .is_designated()
            .then(|| build().map_err(|e| e.to_string()));

        let shared: std::result::Result<Vec<GenerationTask>, String> =
            if self.runtime.world_size() > 1 {
                self.runtime.broadcast_object(local, 0)?
            } else {
                local.ok_or_else(|| {
                    GenerationError::TaskSource("single rank is not designated".to_string())
                })?
            };

        let tasks = shared.map_err(GenerationError::TaskSource)?;
        tracing::info!(rank = self.runtime.rank(), tasks = tasks.len(), "task list ready");
        Ok(tasks)
    }

    /// Run one task. Returns the persisted artifact on the designated rank,
    /// `None` on every other rank.
    pub fn run_task<C: TaskCompute>(
        &mut self,
        idx: usize,
        task: &GenerationTask,
        compute: &mut C,
    ) -> Result<Option<GeneratedArtifact>> {
        let output = compute.compute(task)?;

        if !self.runtime.is_designated() {
            return Ok(None);
        }

        let decoded_text = compute.decode(&output)?;
        tracing::debug!(idx, "generated text:\n{decoded_text}");

        let artifact = GeneratedArtifact::from_decoded(decoded_text)?;
        let dir = self
            .store
            .persist(idx, task, &artifact, self.config.save_llm_output)?;
        tracing::info!(idx, dir = %dir.display(), "saved generated model");
        Ok(Some(artifact))
    }

    /// Run every task in order, then synchronize all ranks.
    ///
    /// Per-task failures are logged and leave a gap at that index; anything
    /// else aborts the run. The group is left up for the caller to destroy.
    pub fn run<C: TaskCompute>(
        &mut self,
        tasks: &[GenerationTask],
        compute: &mut C,
    ) -> Result<GenerationReport> {
        let designated = self.runtime.is_designated();
        if designated {
            self.store.prepare()?;
        }

        let progress = (designated && self.config.show_progress).then(|| {
            let pbar = ProgressBar::new(tasks.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar().template(PROGRESS_BAR_TEMPLATE) {
                pbar.set_style(style.progress_chars("#>-"));
            }
            pbar.set_message("Sharded inference");
            pbar
        });

        let mut report = GenerationReport {
            total: tasks.len(),
            ..Default::default()
        };

        for (idx, task) in tasks.iter().enumerate() {
            match self.run_task(idx, task, compute) {
                Ok(Some(_)) => report.persisted.push(idx),
                Ok(None) => {}
                Err(e) if e.is_per_task() => {
                    tracing::warn!(idx, rank = self.runtime.rank(), error = %e, "generation failed, skipping");
                    if designated {
                        report.skipped.push(idx);
                    }
                }
                Err(e) => {
                    if let Some(pbar) = &progress {
                        pbar.abandon();
                    }
                    return Err(e);
                }
            }
            if let Some(pbar) = &progress {
                pbar.inc(1);
            }
        }

        if let Some(pbar) = progress {
            pbar.finish();
        }

        self.runtime.barrier()?;
        tracing::info!(
            rank = self.runtime.rank(),
            persisted = report.persisted.len(),
            skipped = report.skipped.len(),
            "generation finished"
        );
        Ok(report)
    }
}
