//! Wrapping a model with the external training engine.

use candle_core::Tensor;
use serde_json::{Map, Value};

use super::config::{merge_engine_config, ConfigSource, TrainingArgs};
use super::error::{Result, TrainingError};

/// A named model parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub tensor: Tensor,
    pub requires_grad: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, tensor: Tensor, requires_grad: bool) -> Self {
        Self {
            name: name.into(),
            tensor,
            requires_grad,
        }
    }
}

/// A model whose parameters can be enumerated.
pub trait TrainableModule {
    fn parameters(&self) -> Vec<Parameter>;

    /// Parameters with gradients enabled. Frozen weights are excluded.
    fn trainable_parameters(&self) -> Vec<Parameter> {
        self.parameters()
            .into_iter()
            .filter(|p| p.requires_grad)
            .collect()
    }
}

/// The external training engine.
pub trait TrainingEngine {
    type Model: TrainableModule;
    type Optimizer;
    type Handle;

    fn initialize(
        &self,
        model: Self::Model,
        trainable: Vec<Parameter>,
        optimizer: Option<Self::Optimizer>,
        config: &Map<String, Value>,
    ) -> Result<Self::Handle>;
}

/// Builds engine handles from a static config plus per-run overrides.
pub struct TrainingEngineAdapter;

impl TrainingEngineAdapter {
    /// Merge the config, select trainable parameters and hand both to the
    /// engine. Does not run any training step.
    pub fn wrap<E: TrainingEngine>(
        engine: &E,
        model: E::Model,
        config: &ConfigSource,
        args: Option<&TrainingArgs>,
        optimizer: Option<E::Optimizer>,
    ) -> Result<E::Handle> {
        let config = merge_engine_config(config, args)?;
        let trainable = model.trainable_parameters();
        tracing::info!(
            trainable = trainable.len(),
            overrides = args.is_some(),
            "initializing training engine"
        );
        engine.initialize(model, trainable, optimizer, &config)
    }
}

/// Parameter partitioning of the training engine (sharded optimizer state).
pub trait ParameterPartitioner {
    /// Whether parameters are currently partitioned across ranks.
    fn is_enabled(&self) -> bool;

    /// Materialize full parameters; `modifier_rank` may write to them.
    fn gather(&self, params: &[Parameter], modifier_rank: usize) -> Result<()>;

    /// Re-partition previously gathered parameters.
    fn release(&self, params: &[Parameter]) -> Result<()>;
}

/// Guard holding gathered parameters. Releases them when dropped.
pub struct GatheredParameters<'a> {
    partitioner: &'a dyn ParameterPartitioner,
    params: Vec<Parameter>,
    active: bool,
}

impl<'a> GatheredParameters<'a> {
    /// Gather `module`'s trainable parameters onto rank 0.
    ///
    /// A no-op guard when partitioning is disabled.
    pub fn enter(
        partitioner: &'a dyn ParameterPartitioner,
        module: &dyn TrainableModule,
    ) -> Result<Self> {
        if !partitioner.is_enabled() {
            return Ok(Self {
                partitioner,
                params: Vec::new(),
                active: false,
            });
        }
        let params = module.trainable_parameters();
        partitioner
            .gather(&params, 0)
            .map_err(|e| TrainingError::Gather(e.to_string()))?;
        tracing::debug!(params = params.len(), "gathered partitioned parameters");
        Ok(Self {
            partitioner,
            params,
            active: true,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Release now and report the outcome instead of only logging it.
    pub fn finish(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.partitioner.release(&self.params)
    }
}

impl Drop for GatheredParameters<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!(error = %e, "failed to release gathered parameters");
        }
    }
}

/// Run `f` with the module's trainable parameters gathered.
///
/// Parameters are released on every exit path, including a panic in `f`.
pub fn with_gathered_parameters<M, T, F>(
    partitioner: &dyn ParameterPartitioner,
    module: &M,
    f: F,
) -> Result<T>
where
    M: TrainableModule,
    F: FnOnce(&M) -> Result<T>,
{
    let guard = GatheredParameters::enter(partitioner, module)?;
    let value = f(module)?;
    guard.finish()?;
    Ok(value)
}
