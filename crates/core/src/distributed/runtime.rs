//! Distributed runtime lifecycle.
//!
//! [`DistributedRuntime`] is the explicit, per-process context that owns the
//! communication group, the device binding and the seeded RNG. It is the only
//! thing that mutates [`RuntimeState`].
//!
//! `init` runs these steps in order; the order matters because forming a
//! group before binding the device hangs accelerator backends:
//! 1. resolve identity from the launch environment
//! 2. bind the device at `local_rank` and open its tensor device (if an
//!    accelerator is present)
//! 3. form the group (world_size > 1 and none exists yet)
//! 4. agree on a base seed (rank 0 picks and broadcasts when none is given)
//! 5. seed the host RNG and the opened device with `base_seed + rank`
//! 6. mark the runtime initialized

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{de::DeserializeOwned, Serialize};

use super::accelerator::Accelerator;
use super::communicator::{broadcast_object, broadcast_tensor, CommBackend, GroupOptions};
use super::error::{DistributedError, Result};
use super::process_group::{ProcessGroup, ProcessIdentity};
use super::topology::{self, EnvSource, ProcessEnv, Rendezvous};

pub const DEFAULT_BACKEND: &str = "tcp";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Wall-clock seeds are masked to a positive 31-bit value.
const SEED_MASK: u64 = 0x7FFF_FFFF;

/// Arguments to [`DistributedRuntime::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    pub backend: String,
    /// Group formation fails after this long.
    pub timeout: Duration,
    /// Base seed shared by all ranks. `None` lets rank 0 pick one.
    pub seed: Option<u64>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            timeout: DEFAULT_TIMEOUT,
            seed: None,
        }
    }
}

/// Snapshot of the runtime's lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeState {
    pub initialized: bool,
    pub identity: ProcessIdentity,
    /// Seed agreed by every rank; each rank's RNGs use `base_seed + rank`.
    pub base_seed: u64,
}

impl RuntimeState {
    /// Seed actually applied on this rank.
    pub fn seed(&self) -> u64 {
        self.base_seed.wrapping_add(self.identity.rank() as u64)
    }
}

/// Outcome of a step that must never fail its caller.
#[derive(Debug)]
#[must_use]
pub enum BestEffort {
    Completed,
    /// The step failed; the error was logged and swallowed.
    Suppressed(DistributedError),
}

impl BestEffort {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Per-process distributed context.
pub struct DistributedRuntime {
    backend: Box<dyn CommBackend>,
    accelerator: Arc<dyn Accelerator>,
    env: Box<dyn EnvSource>,
    state: RuntimeState,
    bound_device: Option<usize>,
    /// Opened once after binding; every seed goes to this handle.
    device: Option<Device>,
    rng: StdRng,
}

impl DistributedRuntime {
    /// Runtime reading identity from the process environment.
    pub fn new(backend: Box<dyn CommBackend>, accelerator: Arc<dyn Accelerator>) -> Self {
        Self {
            backend,
            accelerator,
            env: Box::new(ProcessEnv),
            state: RuntimeState::default(),
            bound_device: None,
            device: None,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Read launch variables from `env` instead of the process environment.
    pub fn with_env(mut self, env: impl EnvSource + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    /// Seed applied on this rank (`base_seed + rank`).
    pub fn seed(&self) -> u64 {
        self.state.seed()
    }

    /// General-purpose RNG seeded with this rank's seed.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn accelerator(&self) -> &dyn Accelerator {
        self.accelerator.as_ref()
    }

    /// Device for tensors produced on this rank: the seeded device opened
    /// during `init`, or the CPU without an accelerator.
    pub fn device(&self) -> Device {
        self.device.clone().unwrap_or(Device::Cpu)
    }

    /// Whether a communication group currently exists.
    pub fn has_group(&self) -> bool {
        self.backend.is_initialized()
    }

    /// Bring the runtime up. A second call is a no-op.
    pub fn init(&mut self, options: &InitOptions) -> Result<()> {
        if self.state.initialized {
            tracing::debug!(rank = self.rank(), "distributed runtime already initialized");
            return Ok(());
        }

        let identity = topology::resolve(self.env.as_ref())?;

        if self.accelerator.is_available() {
            self.bind_device(identity.local_rank())?;
        }

        if identity.world_size() > 1 && !self.backend.is_initialized() {
            let rendezvous = Rendezvous::from_env(self.env.as_ref());
            self.form_group(&identity, rendezvous, options)?;
        }

        let base_seed = match options.seed {
            Some(seed) => seed,
            None => self.agree_on_seed()?,
        };

        let seed = base_seed.wrapping_add(identity.rank() as u64);
        self.apply_seed(seed)?;

        self.state = RuntimeState {
            initialized: true,
            identity,
            base_seed,
        };
        tracing::info!(
            rank = identity.rank(),
            local_rank = identity.local_rank(),
            world_size = identity.world_size(),
            base_seed,
            seed,
            "distributed runtime initialized"
        );
        Ok(())
    }

    /// Tear the runtime down.
    ///
    /// A final barrier is attempted but its failure is only reported through
    /// the returned [`BestEffort`]. The group is destroyed regardless and the
    /// runtime always ends uninitialized.
    pub fn destroy(&mut self) -> Result<BestEffort> {
        let mut outcome = BestEffort::Completed;
        let mut result = Ok(());
        if self.backend.is_initialized() {
            if let Err(e) = self.barrier() {
                tracing::warn!(rank = self.rank(), error = %e, "final barrier failed during teardown");
                outcome = BestEffort::Suppressed(e);
            }
            result = self.backend.destroy_group();
        }
        self.state.initialized = false;
        result.map(|()| outcome)
    }

    /// Synchronize all ranks. A no-op without a group.
    pub fn barrier(&mut self) -> Result<()> {
        if !self.backend.is_initialized() {
            return Ok(());
        }
        let hint = (self.backend.capabilities().device_hint_on_barrier
            && self.accelerator.is_available())
        .then(|| self.state.identity.local_rank());
        self.backend.barrier(hint)
    }

    /// Send `value` from `src_rank` to every rank as a single transfer.
    ///
    /// Without a group this process is the only rank, so the local value is
    /// returned as-is.
    pub fn broadcast_object<T>(&mut self, value: Option<T>, src_rank: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        if !self.backend.is_initialized() {
            return value.ok_or(DistributedError::NotInitialized);
        }
        broadcast_object(self.backend.as_mut(), value, src_rank)
    }

    fn bind_device(&mut self, local_rank: usize) -> Result<()> {
        match self.bound_device {
            Some(bound) if bound != local_rank => {
                tracing::warn!(bound, local_rank, "device already bound, not rebinding");
            }
            Some(_) => {}
            None => {
                self.accelerator.bind(local_rank)?;
                self.bound_device = Some(local_rank);
                self.device = Some(self.accelerator.open_device(local_rank)?);
                tracing::debug!(device = local_rank, "bound accelerator device");
            }
        }
        Ok(())
    }

    fn form_group(
        &mut self,
        identity: &ProcessIdentity,
        rendezvous: Rendezvous,
        options: &InitOptions,
    ) -> Result<()> {
        let mut group = GroupOptions {
            backend: options.backend.clone(),
            rendezvous,
            timeout: options.timeout,
            rank: identity.rank(),
            world_size: identity.world_size(),
            device_hint: None,
        };
        if self.backend.capabilities().device_hint_on_init {
            group.device_hint = Some(identity.local_rank());
        }

        tracing::info!(
            rank = group.rank,
            world_size = group.world_size,
            backend = %group.backend,
            addr = %group.rendezvous.address(),
            "forming process group"
        );

        match self.backend.form_group(&group) {
            Err(DistributedError::UnsupportedOption(option)) if group.device_hint.is_some() => {
                tracing::debug!(option, "backend rejected device hint, retrying without it");
                group.device_hint = None;
                self.backend.form_group(&group)
            }
            other => other,
        }
    }

    /// Rank 0's wall-clock seed, shared with every rank when a group exists.
    fn agree_on_seed(&mut self) -> Result<u64> {
        let local = wall_clock_seed();
        if !self.backend.is_initialized() {
            return Ok(local);
        }
        let buffer = Tensor::new(&[local as i64], &Device::Cpu)?;
        let shared = broadcast_tensor(self.backend.as_mut(), &buffer, 0)?;
        let value = shared.to_vec1::<i64>()?[0];
        u64::try_from(value)
            .map_err(|_| DistributedError::Protocol(format!("rank 0 broadcast negative seed {value}")))
    }

    fn apply_seed(&mut self, seed: u64) -> Result<()> {
        self.rng = StdRng::seed_from_u64(seed);
        if let Some(device) = &self.device {
            self.accelerator.seed_device(device, seed)?;
        }
        Ok(())
    }
}

impl ProcessGroup for DistributedRuntime {
    fn rank(&self) -> usize {
        self.state.identity.rank()
    }

    fn world_size(&self) -> usize {
        self.state.identity.world_size()
    }

    fn local_rank(&self) -> usize {
        self.state.identity.local_rank()
    }
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        & SEED_MASK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{
        BackendCapabilities, LocalBackend, LocalBackendOptions, LocalWorld, NoAccelerator,
    };
    use crate::testing::{launch_env, EventLog, RecordingAccelerator};
    use rand::Rng;
    use std::collections::HashMap;
    use std::thread;

    fn single_runtime() -> DistributedRuntime {
        DistributedRuntime::new(
            Box::new(LocalBackend::new(LocalWorld::new(1).unwrap())),
            Arc::new(NoAccelerator),
        )
        .with_env(HashMap::new())
    }

    /// Run `f` on `world_size` simulated ranks sharing one world.
    fn on_ranks<F, T>(world_size: usize, options: LocalBackendOptions, f: F) -> Vec<T>
    where
        F: Fn(usize, DistributedRuntime) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let world = LocalWorld::new(world_size).unwrap();
        let f = Arc::new(f);
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let world = world.clone();
                let f = f.clone();
                thread::spawn(move || {
                    let runtime = DistributedRuntime::new(
                        Box::new(LocalBackend::with_options(world, options)),
                        Arc::new(NoAccelerator),
                    )
                    .with_env(launch_env(rank, world_size));
                    f(rank, runtime)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn single_process_supplied_seed() {
        let mut rt = single_runtime();
        rt.init(&InitOptions {
            seed: Some(42),
            ..Default::default()
        })
        .unwrap();
        assert!(rt.is_initialized());
        assert!(!rt.has_group());
        assert_eq!(rt.seed(), 42);
        assert!(rt.is_designated());
    }

    #[test]
    fn single_process_without_seed_needs_no_group() {
        let mut rt = single_runtime();
        rt.init(&InitOptions::default()).unwrap();
        assert!(!rt.has_group());
        assert!(rt.seed() <= SEED_MASK);
    }

    #[test]
    fn init_is_idempotent() {
        let mut rt = single_runtime();
        let opts = InitOptions {
            seed: Some(7),
            ..Default::default()
        };
        rt.init(&opts).unwrap();
        let once = rt.state();
        rt.init(&InitOptions {
            seed: Some(99),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(rt.state(), once);
    }

    #[test]
    fn rng_is_seeded_from_rank_seed() {
        let mut a = single_runtime();
        let mut b = single_runtime();
        let opts = InitOptions {
            seed: Some(1234),
            ..Default::default()
        };
        a.init(&opts).unwrap();
        b.init(&opts).unwrap();
        assert_eq!(a.rng().gen::<u64>(), b.rng().gen::<u64>());
    }

    #[test]
    fn ranks_share_base_and_offset_by_rank() {
        let states = on_ranks(4, LocalBackendOptions::default(), |_, mut rt| {
            rt.init(&InitOptions::default()).unwrap();
            assert!(rt.has_group());
            rt.state()
        });
        let base = states[0].base_seed;
        for (rank, state) in states.iter().enumerate() {
            assert_eq!(state.identity.rank(), rank);
            assert_eq!(state.base_seed, base);
            assert_eq!(state.seed(), base + rank as u64);
        }
    }

    #[test]
    fn supplied_seed_skips_broadcast() {
        let results = on_ranks(2, LocalBackendOptions::default(), |_, mut rt| {
            rt.init(&InitOptions {
                seed: Some(10),
                ..Default::default()
            })
            .unwrap();
            rt.seed()
        });
        assert_eq!(results, vec![10, 11]);
    }

    #[test]
    fn device_hint_retried_without_on_rejection() {
        let options = LocalBackendOptions {
            capabilities: BackendCapabilities {
                device_hint_on_init: true,
                device_hint_on_barrier: false,
            },
            reject_device_hint: true,
            fail_barrier: false,
        };
        let world = LocalWorld::new(2).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let world = world.clone();
                thread::spawn(move || {
                    let backend = LocalBackend::with_options(world, options);
                    let probe = backend.probe();
                    let mut rt = DistributedRuntime::new(Box::new(backend), Arc::new(NoAccelerator))
                        .with_env(launch_env(rank, 2));
                    rt.init(&InitOptions::default()).unwrap();
                    let attempts = probe.lock().unwrap().form_attempts.clone();
                    attempts
                })
            })
            .collect();
        for (rank, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().unwrap(), vec![Some(rank), None]);
        }
    }

    /// Appends "form" to a shared log before delegating.
    struct LoggingBackend {
        inner: LocalBackend,
        log: EventLog,
    }

    impl CommBackend for LoggingBackend {
        fn capabilities(&self) -> BackendCapabilities {
            self.inner.capabilities()
        }
        fn is_initialized(&self) -> bool {
            self.inner.is_initialized()
        }
        fn form_group(&mut self, options: &GroupOptions) -> Result<()> {
            self.log.push("form".to_string());
            self.inner.form_group(options)
        }
        fn broadcast(&mut self, payload: Vec<u8>, src_rank: usize) -> Result<Vec<u8>> {
            self.log.push("broadcast".to_string());
            self.inner.broadcast(payload, src_rank)
        }
        fn barrier(&mut self, device_hint: Option<usize>) -> Result<()> {
            self.inner.barrier(device_hint)
        }
        fn destroy_group(&mut self) -> Result<()> {
            self.inner.destroy_group()
        }
    }

    #[test]
    fn init_steps_run_in_order() {
        let world = LocalWorld::new(2).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let world = world.clone();
                thread::spawn(move || {
                    let log = EventLog::default();
                    let backend = LoggingBackend {
                        inner: LocalBackend::new(world),
                        log: log.clone(),
                    };
                    let accelerator = Arc::new(RecordingAccelerator::new(2, log.clone()));
                    let mut rt = DistributedRuntime::new(Box::new(backend), accelerator)
                        .with_env(launch_env(rank, 2));
                    rt.init(&InitOptions::default()).unwrap();
                    (log.events(), rt.state())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let base = results[0].1.base_seed;
        for (rank, (events, state)) in results.into_iter().enumerate() {
            assert_eq!(
                events,
                vec![
                    format!("bind:{rank}"),
                    format!("open:{rank}"),
                    "form".to_string(),
                    "broadcast".to_string(),
                    format!("seed:{}", base + rank as u64),
                ]
            );
            assert_eq!(state.seed(), base + rank as u64);
        }
    }

    /// Hints each of two ranks passed to its backend for one explicit barrier.
    fn barrier_hints(device_hint_on_barrier: bool, with_accelerator: bool) -> Vec<Vec<Option<usize>>> {
        let options = LocalBackendOptions {
            capabilities: BackendCapabilities {
                device_hint_on_init: false,
                device_hint_on_barrier,
            },
            ..Default::default()
        };
        let world = LocalWorld::new(2).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let world = world.clone();
                thread::spawn(move || {
                    let backend = LocalBackend::with_options(world, options);
                    let probe = backend.probe();
                    let accelerator: Arc<dyn Accelerator> = if with_accelerator {
                        Arc::new(RecordingAccelerator::new(2, EventLog::default()))
                    } else {
                        Arc::new(NoAccelerator)
                    };
                    let mut rt = DistributedRuntime::new(Box::new(backend), accelerator)
                        .with_env(launch_env(rank, 2));
                    rt.init(&InitOptions {
                        seed: Some(1),
                        ..Default::default()
                    })
                    .unwrap();
                    rt.barrier().unwrap();
                    let hints = probe.lock().unwrap().barrier_hints.clone();
                    hints
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn barrier_passes_local_rank_with_accelerator_and_capability() {
        assert_eq!(barrier_hints(true, true), vec![vec![Some(0)], vec![Some(1)]]);
    }

    #[test]
    fn barrier_omits_hint_without_accelerator() {
        assert_eq!(barrier_hints(true, false), vec![vec![None], vec![None]]);
    }

    #[test]
    fn barrier_omits_hint_without_capability() {
        assert_eq!(barrier_hints(false, true), vec![vec![None], vec![None]]);
    }

    #[test]
    fn device_opened_once_and_seeded_on_every_init() {
        let log = EventLog::default();
        let mut rt = DistributedRuntime::new(
            Box::new(LocalBackend::new(LocalWorld::new(1).unwrap())),
            Arc::new(RecordingAccelerator::new(1, log.clone())),
        )
        .with_env(HashMap::new());

        rt.init(&InitOptions {
            seed: Some(5),
            ..Default::default()
        })
        .unwrap();
        assert!(rt.destroy().unwrap().is_completed());
        rt.init(&InitOptions {
            seed: Some(9),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(log.events(), vec!["bind:0", "open:0", "seed:5", "seed:9"]);
        assert!(rt.device().is_cpu());
    }

    #[test]
    fn destroy_swallows_barrier_failure() {
        let options = LocalBackendOptions {
            fail_barrier: true,
            ..Default::default()
        };
        let outcomes = on_ranks(2, options, |_, mut rt| {
            rt.init(&InitOptions {
                seed: Some(3),
                ..Default::default()
            })
            .unwrap();
            let outcome = rt.destroy().unwrap();
            (outcome.is_completed(), rt.is_initialized(), rt.has_group())
        });
        for (completed, initialized, has_group) in outcomes {
            assert!(!completed);
            assert!(!initialized);
            assert!(!has_group);
        }
    }

    #[test]
    fn destroy_then_init_again() {
        let seeds = on_ranks(2, LocalBackendOptions::default(), |_, mut rt| {
            let opts = InitOptions {
                seed: Some(100),
                ..Default::default()
            };
            rt.init(&opts).unwrap();
            assert!(rt.destroy().unwrap().is_completed());
            assert!(!rt.is_initialized());
            rt.init(&opts).unwrap();
            rt.seed()
        });
        assert_eq!(seeds, vec![100, 101]);
    }

    #[test]
    fn destroy_without_group_resets_state() {
        let mut rt = single_runtime();
        rt.init(&InitOptions::default()).unwrap();
        assert!(rt.destroy().unwrap().is_completed());
        assert!(!rt.is_initialized());
    }

    #[test]
    fn broadcast_object_single_process_returns_local() {
        let mut rt = single_runtime();
        rt.init(&InitOptions::default()).unwrap();
        let v: Vec<u32> = rt.broadcast_object(Some(vec![1, 2, 3]), 0).unwrap();
        assert_eq!(v, vec![1, 2, 3]);
    }

    #[test]
    fn contradictory_env_fails_init() {
        let mut env = HashMap::new();
        env.insert("RANK".to_string(), "3".to_string());
        env.insert("WORLD_SIZE".to_string(), "2".to_string());
        let mut rt = DistributedRuntime::new(
            Box::new(LocalBackend::new(LocalWorld::new(2).unwrap())),
            Arc::new(NoAccelerator),
        )
        .with_env(env);
        assert!(rt.init(&InitOptions::default()).is_err());
        assert!(!rt.is_initialized());
    }
}
