//! On-disk layout for generated models.
//!
//! ```text
//! <out_dir>/synth_nn/
//!   B0/
//!     full_output.txt      raw decoded text (optional)
//!     hp.txt               hyperparameters as JSON
//!     new_nn.py            extracted code
//!     original_<nn>.py     code of the source model (when known)
//!     dataframe.json       source record snapshot (when known)
//!   B2/
//!   ...
//! ```
//!
//! Directory names are positional: `B{idx}` is the idx-th task of the run.

use std::fs;
use std::path::{Path, PathBuf};

use super::error::Result;
use super::task::{GeneratedArtifact, GenerationTask};

pub const SYNTH_DIR: &str = "synth_nn";
pub const FULL_OUTPUT_FILE: &str = "full_output.txt";
pub const HYPERPARAMETER_FILE: &str = "hp.txt";
pub const NEW_NN_FILE: &str = "new_nn.py";
pub const RECORD_FILE: &str = "dataframe.json";

/// Writes artifacts under `<out_dir>/synth_nn`. Used by the designated rank only.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(out_dir: impl AsRef<Path>) -> Self {
        Self {
            root: out_dir.as_ref().join(SYNTH_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, idx: usize) -> PathBuf {
        self.root.join(format!("B{idx}"))
    }

    /// Create the output root.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Persist one artifact and return its directory.
    pub fn persist(
        &self,
        idx: usize,
        task: &GenerationTask,
        artifact: &GeneratedArtifact,
        save_llm_output: bool,
    ) -> Result<PathBuf> {
        let dir = self.task_dir(idx);
        fs::create_dir_all(&dir)?;
        if save_llm_output {
            fs::write(dir.join(FULL_OUTPUT_FILE), &artifact.decoded_text)?;
        }
        fs::write(
            dir.join(HYPERPARAMETER_FILE),
            serde_json::to_string(&artifact.parsed_hyperparameters)?,
        )?;
        fs::write(dir.join(NEW_NN_FILE), &artifact.code)?;

        if let (Some(nn), Some(nn_code)) = (task.record_str("nn"), task.record_str("nn_code")) {
            fs::write(dir.join(format!("original_{nn}.py")), nn_code)?;
            fs::write(
                dir.join(RECORD_FILE),
                serde_json::to_string_pretty(&task.source_record)?,
            )?;
        }

        tracing::debug!(idx, dir = %dir.display(), "artifact persisted");
        Ok(dir)
    }
}
