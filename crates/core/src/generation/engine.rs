//! Seams to the sharded-execution engine and the tokenizer.
//!
//! The engine splits one model across all ranks; every forward pass is a
//! collective. [`TaskCompute`] is what the coordinator calls on every rank
//! per task, and [`ModelCompute`] is its implementation over a
//! [`ShardedModel`].

use candle_core::{DType, Device, Tensor};

use super::coordinator::GeneratorConfig;
use super::error::{GenerationError, Result};
use super::task::GenerationTask;

/// Text tokenizer used for prompts and continuations.
pub trait TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    fn pad_token_id(&self) -> Option<u32>;

    fn eos_token_id(&self) -> Option<u32>;
}

/// Pad id to use for generation, falling back to EOS.
pub fn effective_pad_token_id(tokenizer: &dyn TextTokenizer) -> Option<u32> {
    tokenizer.pad_token_id().or_else(|| tokenizer.eos_token_id())
}

/// Numeric precision of the sharded weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    F16,
    Bf16,
    F32,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

/// How the engine replaces layers with sharded versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShardingStrategy {
    /// Engine picks the layer replacement policy.
    #[default]
    Auto,
    /// Engine swaps in its fused kernels.
    KernelInjection,
}

/// Arguments to [`InferenceEngine::initialize_for_inference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardingOptions {
    /// Number of ranks the model is split across (normally world_size).
    pub shard_count: usize,
    pub precision: Precision,
    pub strategy: ShardingStrategy,
}

impl ShardingOptions {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count,
            precision: Precision::default(),
            strategy: ShardingStrategy::default(),
        }
    }
}

/// Dimensions that constrain tensor-parallel splitting, when the model reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelShape {
    pub num_attention_heads: Option<usize>,
    pub hidden_size: Option<usize>,
}

/// Reject shard counts that would split heads or hidden units unevenly.
pub fn check_tensor_parallel(shape: &ModelShape, shard_count: usize) -> Result<()> {
    let dims = [
        ("num_attention_heads", shape.num_attention_heads),
        ("hidden_size", shape.hidden_size),
    ];
    for (dimension, size) in dims {
        if let Some(size) = size.filter(|&s| s > 0) {
            if shard_count == 0 || size % shard_count != 0 {
                return Err(GenerationError::IncompatibleSharding {
                    shard_count,
                    dimension,
                    size,
                });
            }
        }
    }
    Ok(())
}

/// An unsharded causal language model handed to the engine.
pub trait CausalModel {
    fn shape(&self) -> ModelShape {
        ModelShape::default()
    }
}

/// Sampling controls for one generate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub pad_token_id: Option<u32>,
}

/// A model split across ranks. `generate` is collective.
pub trait ShardedModel {
    /// Prompt ids `(1, prompt_len)` to prompt plus continuation `(1, total_len)`.
    fn generate(&mut self, input_ids: &Tensor, params: &SamplingParams) -> Result<Tensor>;
}

/// The external sharded-execution engine.
pub trait InferenceEngine {
    type Model: CausalModel;

    fn initialize_for_inference(
        &self,
        model: Self::Model,
        options: &ShardingOptions,
    ) -> Result<Box<dyn ShardedModel>>;
}

/// Check compatibility, then shard.
pub fn shard_for_inference<E: InferenceEngine>(
    engine: &E,
    model: E::Model,
    options: &ShardingOptions,
) -> Result<Box<dyn ShardedModel>> {
    check_tensor_parallel(&model.shape(), options.shard_count)?;
    tracing::info!(
        shard_count = options.shard_count,
        precision = ?options.precision,
        strategy = ?options.strategy,
        "initializing sharded model"
    );
    engine.initialize_for_inference(model, options)
}

/// Raw compute output of one task.
#[derive(Debug, Clone)]
pub struct RawOutput {
    /// `(1, total_len)` token ids, prompt included.
    pub tokens: Tensor,
    pub prompt_len: usize,
}

/// Per-task work split by role.
///
/// `compute` runs on every rank with identical input; `decode` only on the
/// designated rank.
pub trait TaskCompute {
    fn compute(&mut self, task: &GenerationTask) -> Result<RawOutput>;

    fn decode(&self, output: &RawOutput) -> Result<String>;
}

/// [`TaskCompute`] over a tokenizer and a sharded model.
pub struct ModelCompute<T: TextTokenizer> {
    model: Box<dyn ShardedModel>,
    tokenizer: T,
    device: Device,
    params: SamplingParams,
    prompt_suffix: String,
}

impl<T: TextTokenizer> ModelCompute<T> {
    pub fn new(
        model: Box<dyn ShardedModel>,
        tokenizer: T,
        device: Device,
        max_new_tokens: usize,
        do_sample: bool,
        prompt_suffix: impl Into<String>,
    ) -> Self {
        let pad_token_id = effective_pad_token_id(&tokenizer);
        if tokenizer.pad_token_id().is_none() && pad_token_id.is_some() {
            tracing::debug!(?pad_token_id, "tokenizer has no pad token, using EOS");
        }
        Self {
            model,
            tokenizer,
            device,
            params: SamplingParams {
                max_new_tokens,
                do_sample,
                pad_token_id,
            },
            prompt_suffix: prompt_suffix.into(),
        }
    }

    /// Sampling controls and prompt suffix taken from a generator config.
    pub fn from_config(
        model: Box<dyn ShardedModel>,
        tokenizer: T,
        device: Device,
        config: &GeneratorConfig,
    ) -> Self {
        Self::new(
            model,
            tokenizer,
            device,
            config.max_new_tokens,
            config.do_sample,
            config.prompt_suffix.clone(),
        )
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }
}

impl<T: TextTokenizer> TaskCompute for ModelCompute<T> {
    fn compute(&mut self, task: &GenerationTask) -> Result<RawOutput> {
        let prompt = format!("{}{}", task.prompt_text, self.prompt_suffix);
        let ids = self.tokenizer.encode(&prompt)?;
        let input = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let tokens = self.model.generate(&input, &self.params)?;
        Ok(RawOutput {
            tokens,
            prompt_len: ids.len(),
        })
    }

    fn decode(&self, output: &RawOutput) -> Result<String> {
        let row = output.tokens.get(0)?;
        let total = row.dim(0)?;
        if total <= output.prompt_len {
            return Ok(String::new());
        }
        let continuation = row
            .narrow(0, output.prompt_len, total - output.prompt_len)?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?;
        self.tokenizer.decode(&continuation, true)
    }
}
