//! Shared test utilities for nngpt-core.
//!
//! Mock implementations of the external collaborators (tokenizer, sharded
//! model, training engine, accelerator) and helpers for simulating ranks
//! in-process.

mod mock_model;
mod mock_runtime;
mod mock_training;

pub use mock_model::{CharTokenizer, PassthroughEngine, ScriptedModel, EOS_TOKEN_ID};
pub use mock_runtime::{launch_env, EventLog, RecordingAccelerator};
pub use mock_training::{MockModule, MockPartitioner, RecordedHandle, RecordingTrainingEngine};
