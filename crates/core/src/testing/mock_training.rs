use candle_core::{DType, Device, Tensor};
use serde_json::{Map, Value};

use super::mock_runtime::EventLog;
use crate::training::{
    Parameter, ParameterPartitioner, Result, TrainableModule, TrainingEngine, TrainingError,
};

/// Module with named scalar parameters.
#[derive(Debug, Clone)]
pub struct MockModule {
    params: Vec<Parameter>,
}

impl MockModule {
    /// `(name, requires_grad)` per parameter.
    pub fn new(spec: &[(&str, bool)]) -> Self {
        let params = spec
            .iter()
            .map(|&(name, requires_grad)| {
                let tensor = Tensor::zeros(1, DType::F32, &Device::Cpu)
                    .unwrap_or_else(|e| panic!("cpu zeros failed: {e}"));
                Parameter::new(name, tensor, requires_grad)
            })
            .collect();
        Self { params }
    }
}

impl TrainableModule for MockModule {
    fn parameters(&self) -> Vec<Parameter> {
        self.params.clone()
    }
}

/// What [`RecordingTrainingEngine`] was initialized with.
#[derive(Debug, Clone)]
pub struct RecordedHandle {
    pub trainable: Vec<String>,
    pub config: Map<String, Value>,
    pub had_optimizer: bool,
}

/// Training engine that records its inputs instead of training.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordingTrainingEngine;

impl TrainingEngine for RecordingTrainingEngine {
    type Model = MockModule;
    type Optimizer = ();
    type Handle = RecordedHandle;

    fn initialize(
        &self,
        _model: MockModule,
        trainable: Vec<Parameter>,
        optimizer: Option<()>,
        config: &Map<String, Value>,
    ) -> Result<RecordedHandle> {
        Ok(RecordedHandle {
            trainable: trainable.into_iter().map(|p| p.name).collect(),
            config: config.clone(),
            had_optimizer: optimizer.is_some(),
        })
    }
}

/// Partitioner that logs `gather:<names>@<rank>` and `release:<names>`.
#[derive(Debug, Clone)]
pub struct MockPartitioner {
    enabled: bool,
    fail_gather: bool,
    log: EventLog,
}

impl MockPartitioner {
    pub fn new(enabled: bool, log: EventLog) -> Self {
        Self {
            enabled,
            fail_gather: false,
            log,
        }
    }

    pub fn failing_gather(mut self) -> Self {
        self.fail_gather = true;
        self
    }
}

fn names(params: &[Parameter]) -> String {
    params
        .iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

impl ParameterPartitioner for MockPartitioner {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn gather(&self, params: &[Parameter], modifier_rank: usize) -> Result<()> {
        if self.fail_gather {
            return Err(TrainingError::Engine("injected gather failure".to_string()));
        }
        self.log.push(format!("gather:{}@{modifier_rank}", names(params)));
        Ok(())
    }

    fn release(&self, params: &[Parameter]) -> Result<()> {
        self.log.push(format!("release:{}", names(params)));
        Ok(())
    }
}
