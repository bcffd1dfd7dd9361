//! Launch-environment resolution.
//!
//! Identity is read from the standard distributed launcher variables:
//! - `RANK`: Global rank of this process (0..WORLD_SIZE)
//! - `WORLD_SIZE`: Total number of processes
//! - `LOCAL_RANK`: Rank on this node (device ordinal)
//! - `MASTER_ADDR`: Address of rank 0 for rendezvous (default: 127.0.0.1)
//! - `MASTER_PORT`: Port for rendezvous (default: 29500)
//!
//! Presence of any of the first three means an external launcher already
//! assigned identities. Absence of all three means a standalone process.

use std::collections::HashMap;

use super::error::Result;
use super::process_group::ProcessIdentity;

pub const RANK_ENV: &str = "RANK";
pub const LOCAL_RANK_ENV: &str = "LOCAL_RANK";
pub const WORLD_SIZE_ENV: &str = "WORLD_SIZE";
pub const MASTER_ADDR_ENV: &str = "MASTER_ADDR";
pub const MASTER_PORT_ENV: &str = "MASTER_PORT";

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Source of launch variables.
///
/// [`ProcessEnv`] reads the real process environment; a `HashMap` lets
/// in-process simulations give each simulated rank its own variables.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Read an integer variable, falling back to `default` when absent or malformed.
pub fn env_int(env: &dyn EnvSource, name: &str, default: usize) -> usize {
    env.var(name)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// How this process came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchContext {
    /// An external launcher (torchrun-style) already assigned identity.
    External,
    /// No identity signals; a local spawn must synthesize them.
    NeedsLocalSpawn,
}

impl LaunchContext {
    pub fn detect(env: &dyn EnvSource) -> Self {
        let signalled = [RANK_ENV, LOCAL_RANK_ENV, WORLD_SIZE_ENV]
            .iter()
            .any(|key| env.var(key).is_some());
        if signalled {
            Self::External
        } else {
            Self::NeedsLocalSpawn
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::External)
    }
}

/// Resolve this process's identity.
///
/// Missing or unparsable signals default to rank 0, local rank 0 and world
/// size 1; a world size of 0 also reads as 1. Only contradictory signals
/// (rank outside the world) are rejected.
pub fn resolve(env: &dyn EnvSource) -> Result<ProcessIdentity> {
    if !LaunchContext::detect(env).is_external() {
        return Ok(ProcessIdentity::single());
    }
    let rank = env_int(env, RANK_ENV, 0);
    let local_rank = env_int(env, LOCAL_RANK_ENV, 0);
    let world_size = env_int(env, WORLD_SIZE_ENV, 1).max(1);
    ProcessIdentity::new(rank, local_rank, world_size)
}

/// Where rank 0 listens for the group rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub master_addr: String,
    pub master_port: u16,
}

impl Rendezvous {
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let master_addr = env
            .var(MASTER_ADDR_ENV)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let master_port = env
            .var(MASTER_PORT_ENV)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_MASTER_PORT);
        Self {
            master_addr,
            master_port,
        }
    }

    /// `host:port` string for connecting to rank 0.
    pub fn address(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self {
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }
}
