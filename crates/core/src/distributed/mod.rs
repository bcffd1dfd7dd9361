//! Distributed bootstrap and rank coordination.
//!
//! This module brings a job of one or more processes to a common starting
//! point:
//! - [`topology`] - identity from the launch environment
//! - [`LocalSpawner`] - self-spawn for standalone single-node runs
//! - [`DistributedRuntime`] - init/teardown lifecycle and seed agreement
//! - [`CommBackend`] - collective operations (broadcast, barrier)
//!
//! # Architecture
//!
//! One process per rank. Single-process runs (world_size = 1) never form a
//! group; every collective is then a local no-op.
//!
//! # Usage
//!
//! ```ignore
//! use nngpt_core::distributed::{accelerator, DistributedRuntime, InitOptions, TcpBackend};
//!
//! let mut runtime = DistributedRuntime::new(Box::new(TcpBackend::new()), accelerator::detect());
//! runtime.init(&InitOptions::default())?;
//! // ... collective work ...
//! runtime.destroy()?;
//! ```

pub mod accelerator;
mod communicator;
mod error;
mod local;
mod process_group;
mod runtime;
mod spawner;
mod tcp;
pub mod topology;

pub use accelerator::{Accelerator, CudaRuntime, NoAccelerator};
pub use communicator::{
    broadcast_object, broadcast_tensor, BackendCapabilities, CommBackend, GroupOptions,
};
pub use error::{DistributedError, Result};
pub use local::{LocalBackend, LocalBackendOptions, LocalProbe, LocalWorld};
pub use process_group::{ProcessGroup, ProcessIdentity};
pub use runtime::{
    BestEffort, DistributedRuntime, InitOptions, RuntimeState, DEFAULT_BACKEND, DEFAULT_TIMEOUT,
};
pub use spawner::{default_process_count, LocalSpawner};
pub use tcp::TcpBackend;
pub use topology::{EnvSource, LaunchContext, ProcessEnv, Rendezvous};
