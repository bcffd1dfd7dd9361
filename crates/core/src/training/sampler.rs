//! Rank-sharded dataset sampling.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::error::{Result, TrainingError};
use crate::distributed::ProcessGroup;

/// Splits dataset indices across ranks.
///
/// Each rank takes every `num_replicas`-th index starting at its rank. The
/// index list is padded by wrapping around so all ranks get
/// `ceil(len / num_replicas)` items. With `shuffle`, the permutation is
/// seeded by `seed + epoch` and identical on every rank.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(
        len: usize,
        num_replicas: usize,
        rank: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if num_replicas == 0 {
            return Err(TrainingError::InvalidConfig(
                "num_replicas must be > 0".to_string(),
            ));
        }
        if rank >= num_replicas {
            return Err(TrainingError::InvalidConfig(format!(
                "rank {rank} out of range for {num_replicas} replicas"
            )));
        }
        Ok(Self {
            len,
            num_replicas,
            rank,
            shuffle,
            seed,
            epoch: 0,
        })
    }

    /// Sampler for this process's rank in `group`.
    pub fn for_group(
        len: usize,
        group: &dyn ProcessGroup,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        Self::new(len, group.world_size(), group.rank(), shuffle, seed)
    }

    /// Change the shuffle permutation. Call with the same epoch on every rank.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of indices this rank yields per epoch.
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.num_replicas)
    }

    /// Indices for this rank in the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }

        let total = self.num_samples() * self.num_replicas;
        let padding: Vec<usize> = order.iter().copied().cycle().take(total - self.len).collect();
        order.extend(padding);

        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ProcessIdentity;
    use std::collections::BTreeSet;

    fn shards(len: usize, replicas: usize, shuffle: bool, epoch: u64) -> Vec<Vec<usize>> {
        (0..replicas)
            .map(|rank| {
                let mut s = DistributedSampler::new(len, replicas, rank, shuffle, 17).unwrap();
                s.set_epoch(epoch);
                s.indices()
            })
            .collect()
    }

    #[test]
    fn strided_without_shuffle() {
        let s = shards(6, 3, false, 0);
        assert_eq!(s, vec![vec![0, 3], vec![1, 4], vec![2, 5]]);
    }

    #[test]
    fn uneven_lengths_pad_by_wrapping() {
        let s = shards(5, 2, false, 0);
        assert_eq!(s, vec![vec![0, 2, 4], vec![1, 3, 0]]);
    }

    #[test]
    fn shuffled_shards_cover_dataset() {
        let s = shards(10, 3, true, 1);
        let covered: BTreeSet<usize> = s.iter().flatten().copied().collect();
        assert_eq!(covered, (0..10).collect());
        assert!(s.iter().all(|shard| shard.len() == 4));
    }

    #[test]
    fn same_epoch_same_order_new_epoch_new_order() {
        assert_eq!(shards(50, 2, true, 3), shards(50, 2, true, 3));
        assert_ne!(shards(50, 2, true, 3), shards(50, 2, true, 4));
    }

    #[test]
    fn single_replica_sees_everything() {
        let s = DistributedSampler::for_group(4, &ProcessIdentity::single(), false, 0).unwrap();
        assert_eq!(s.indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_dataset() {
        let s = DistributedSampler::new(0, 4, 1, true, 0).unwrap();
        assert_eq!(s.num_samples(), 0);
        assert!(s.indices().is_empty());
    }

    #[test]
    fn rank_out_of_range_rejected() {
        assert!(DistributedSampler::new(4, 2, 2, false, 0).is_err());
        assert!(DistributedSampler::new(4, 0, 0, false, 0).is_err());
    }
}
