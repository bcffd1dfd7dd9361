//! Process identity within a distributed job.
//!
//! Every rank is one OS process. Its identity (rank, local rank, world size)
//! is resolved once at bootstrap and never changes afterwards.

use serde::{Deserialize, Serialize};

use super::error::{DistributedError, Result};

/// Trait for anything that knows its place in a process group.
pub trait ProcessGroup {
    /// Global rank of this process (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the group.
    fn world_size(&self) -> usize;

    /// Rank among processes on the same node, used as the device ordinal.
    fn local_rank(&self) -> usize;

    /// Whether this is the designated rank (rank 0) that owns I/O.
    fn is_designated(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-process group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Identity of the current process.
///
/// Invariant: `rank < world_size` and `world_size > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    rank: usize,
    local_rank: usize,
    world_size: usize,
}

impl ProcessIdentity {
    /// Create an identity, validating the rank against the world size.
    pub fn new(rank: usize, local_rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(DistributedError::InvalidWorldSize(world_size));
        }
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self {
            rank,
            local_rank,
            world_size,
        })
    }

    /// Identity of a standalone, non-distributed process.
    pub fn single() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
        }
    }
}

impl Default for ProcessIdentity {
    fn default() -> Self {
        Self::single()
    }
}

impl ProcessGroup for ProcessIdentity {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }
}
