//! In-process process group.
//!
//! Simulates a multi-rank job inside one process: each rank runs on its own
//! thread with a [`LocalBackend`] attached to a shared [`LocalWorld`].
//! Collectives block exactly like the real thing, so a rank that skips one
//! stalls the others.

use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use super::communicator::{BackendCapabilities, CommBackend, GroupOptions};
use super::error::{DistributedError, Result};

/// Shared rendezvous state for every simulated rank.
pub struct LocalWorld {
    world_size: usize,
    barrier: Barrier,
    slot: Mutex<Vec<u8>>,
}

impl LocalWorld {
    pub fn new(world_size: usize) -> Result<Arc<Self>> {
        if world_size == 0 {
            return Err(DistributedError::InvalidWorldSize(0));
        }
        Ok(Arc::new(Self {
            world_size,
            barrier: Barrier::new(world_size),
            slot: Mutex::new(Vec::new()),
        }))
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn slot(&self) -> MutexGuard<'_, Vec<u8>> {
        // A panicking rank already fails the test; keep the data usable.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Behaviour knobs for a [`LocalBackend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackendOptions {
    /// Capabilities advertised to the runtime.
    pub capabilities: BackendCapabilities,
    /// Reject device hints at formation even though the capability is
    /// advertised, like an older library whose signature lacks the argument.
    pub reject_device_hint: bool,
    /// Make every barrier fail without synchronizing.
    pub fail_barrier: bool,
}

/// What a [`LocalBackend`] was asked to do. Shared with the test that built it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalProbe {
    /// Device hint passed on each formation attempt, in order.
    pub form_attempts: Vec<Option<usize>>,
    /// Device hint passed on each barrier, in order.
    pub barrier_hints: Vec<Option<usize>>,
    pub broadcasts: usize,
    pub destroyed: bool,
}

/// One rank's view of a [`LocalWorld`].
pub struct LocalBackend {
    world: Arc<LocalWorld>,
    options: LocalBackendOptions,
    probe: Arc<Mutex<LocalProbe>>,
    rank: Option<usize>,
}

impl LocalBackend {
    pub fn new(world: Arc<LocalWorld>) -> Self {
        Self::with_options(world, LocalBackendOptions::default())
    }

    pub fn with_options(world: Arc<LocalWorld>, options: LocalBackendOptions) -> Self {
        Self {
            world,
            options,
            probe: Arc::new(Mutex::new(LocalProbe::default())),
            rank: None,
        }
    }

    /// Handle for inspecting calls after the backend is moved into a runtime.
    pub fn probe(&self) -> Arc<Mutex<LocalProbe>> {
        self.probe.clone()
    }

    fn record(&self) -> MutexGuard<'_, LocalProbe> {
        self.probe.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CommBackend for LocalBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.options.capabilities
    }

    fn is_initialized(&self) -> bool {
        self.rank.is_some()
    }

    fn form_group(&mut self, options: &GroupOptions) -> Result<()> {
        self.record().form_attempts.push(options.device_hint);
        if options.device_hint.is_some() && self.options.reject_device_hint {
            return Err(DistributedError::UnsupportedOption("device_hint"));
        }
        if options.world_size != self.world.world_size {
            return Err(DistributedError::GroupFormation(format!(
                "world_size {} does not match local world of {}",
                options.world_size, self.world.world_size
            )));
        }
        if options.rank >= options.world_size {
            return Err(DistributedError::InvalidRank {
                rank: options.rank,
                world_size: options.world_size,
            });
        }
        self.world.barrier.wait();
        self.rank = Some(options.rank);
        Ok(())
    }

    fn broadcast(&mut self, payload: Vec<u8>, src_rank: usize) -> Result<Vec<u8>> {
        let rank = self.rank.ok_or(DistributedError::NotInitialized)?;
        if src_rank >= self.world.world_size {
            return Err(DistributedError::InvalidRank {
                rank: src_rank,
                world_size: self.world.world_size,
            });
        }
        self.record().broadcasts += 1;
        // Source publishes, everyone reads, then the slot may be reused.
        if rank == src_rank {
            *self.world.slot() = payload;
        }
        self.world.barrier.wait();
        let data = self.world.slot().clone();
        self.world.barrier.wait();
        Ok(data)
    }

    fn barrier(&mut self, device_hint: Option<usize>) -> Result<()> {
        if self.rank.is_none() {
            return Err(DistributedError::NotInitialized);
        }
        self.record().barrier_hints.push(device_hint);
        if self.options.fail_barrier {
            return Err(DistributedError::Protocol("injected barrier failure".to_string()));
        }
        self.world.barrier.wait();
        Ok(())
    }

    fn destroy_group(&mut self) -> Result<()> {
        if self.rank.take().is_some() {
            self.record().destroyed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::topology::Rendezvous;
    use std::thread;
    use std::time::Duration;

    fn options(rank: usize, world_size: usize) -> GroupOptions {
        GroupOptions {
            backend: "local".to_string(),
            rendezvous: Rendezvous::default(),
            timeout: Duration::from_secs(5),
            rank,
            world_size,
            device_hint: None,
        }
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        let world = LocalWorld::new(3).unwrap();
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let world = world.clone();
                thread::spawn(move || {
                    let mut backend = LocalBackend::new(world);
                    backend.form_group(&options(rank, 3)).unwrap();
                    let payload = if rank == 1 { vec![4, 2] } else { Vec::new() };
                    let first = backend.broadcast(payload, 1).unwrap();
                    let payload = if rank == 0 { vec![9] } else { Vec::new() };
                    let second = backend.broadcast(payload, 0).unwrap();
                    backend.barrier(None).unwrap();
                    (first, second)
                })
            })
            .collect();
        for h in handles {
            let (first, second) = h.join().unwrap();
            assert_eq!(first, vec![4, 2]);
            assert_eq!(second, vec![9]);
        }
    }

    #[test]
    fn rejecting_backend_records_the_hint() {
        let world = LocalWorld::new(1).unwrap();
        let mut backend = LocalBackend::with_options(
            world,
            LocalBackendOptions {
                reject_device_hint: true,
                ..Default::default()
            },
        );
        let probe = backend.probe();
        let mut opts = options(0, 1);
        opts.device_hint = Some(0);
        assert!(matches!(
            backend.form_group(&opts),
            Err(DistributedError::UnsupportedOption(_))
        ));
        opts.device_hint = None;
        backend.form_group(&opts).unwrap();
        assert_eq!(probe.lock().unwrap().form_attempts, vec![Some(0), None]);
    }

    #[test]
    fn world_size_mismatch_fails_formation() {
        let mut backend = LocalBackend::new(LocalWorld::new(2).unwrap());
        assert!(matches!(
            backend.form_group(&options(0, 3)),
            Err(DistributedError::GroupFormation(_))
        ));
    }

    #[test]
    fn empty_world_is_rejected() {
        assert!(matches!(
            LocalWorld::new(0),
            Err(DistributedError::InvalidWorldSize(0))
        ));
    }

    #[test]
    fn destroy_without_group_is_noop() {
        let mut backend = LocalBackend::new(LocalWorld::new(1).unwrap());
        let probe = backend.probe();
        backend.destroy_group().unwrap();
        assert!(!probe.lock().unwrap().destroyed);
    }
}
