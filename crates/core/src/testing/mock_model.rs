use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::Tensor;

use crate::generation::{
    CausalModel, GenerationError, InferenceEngine, ModelShape, Result, SamplingParams,
    ShardedModel, ShardingOptions, TextTokenizer,
};

/// First id past the Unicode range; used as EOS.
pub const EOS_TOKEN_ID: u32 = 0x11_0000;

/// One token per `char`, ids are code points. No pad token.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenizer;

impl CharTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl TextTokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.chars().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut out = String::with_capacity(ids.len());
        for &id in ids {
            if id == EOS_TOKEN_ID {
                if !skip_special_tokens {
                    out.push_str("</s>");
                }
                continue;
            }
            let ch = char::from_u32(id)
                .ok_or_else(|| GenerationError::Tokenizer(format!("invalid token id {id}")))?;
            out.push(ch);
        }
        Ok(out)
    }

    fn pad_token_id(&self) -> Option<u32> {
        None
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS_TOKEN_ID)
    }
}

/// Model that answers with canned responses in order, cycling.
///
/// Output is the prompt followed by the response's code points and EOS,
/// truncated to `max_new_tokens`. Counts calls so tests can check every
/// rank ran every task, and keeps the last sampling params it was given.
pub struct ScriptedModel {
    responses: Vec<String>,
    calls: Arc<AtomicUsize>,
    last_params: Arc<Mutex<Option<SamplingParams>>>,
    shape: ModelShape,
}

impl ScriptedModel {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: responses.into_iter().map(Into::into).collect(),
            calls: Arc::new(AtomicUsize::new(0)),
            last_params: Arc::new(Mutex::new(None)),
            shape: ModelShape::default(),
        }
    }

    pub fn with_shape(mut self, shape: ModelShape) -> Self {
        self.shape = shape;
        self
    }

    /// Shared call counter.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Shared slot holding the params of the latest `generate` call.
    pub fn last_params(&self) -> Arc<Mutex<Option<SamplingParams>>> {
        self.last_params.clone()
    }
}

impl CausalModel for ScriptedModel {
    fn shape(&self) -> ModelShape {
        self.shape
    }
}

impl ShardedModel for ScriptedModel {
    fn generate(&mut self, input_ids: &Tensor, params: &SamplingParams) -> Result<Tensor> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().unwrap_or_else(|e| e.into_inner()) = Some(*params);
        let mut ids = input_ids.flatten_all()?.to_vec1::<u32>()?;
        let response = match self.responses.len() {
            0 => "",
            n => self.responses[call % n].as_str(),
        };
        let continuation = response
            .chars()
            .map(u32::from)
            .chain(std::iter::once(EOS_TOKEN_ID))
            .take(params.max_new_tokens);
        ids.extend(continuation);
        Ok(Tensor::new(ids.as_slice(), input_ids.device())?.unsqueeze(0)?)
    }
}

/// Engine that "shards" by returning the model unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEngine;

impl InferenceEngine for PassthroughEngine {
    type Model = ScriptedModel;

    fn initialize_for_inference(
        &self,
        model: ScriptedModel,
        _options: &ShardingOptions,
    ) -> Result<Box<dyn ShardedModel>> {
        Ok(Box::new(model))
    }
}
