use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{GenerationError, Result};
use super::extract::{extract_code, extract_hyperparameters};

/// One prompt plus the sampled record it was built from.
///
/// Built on the designated rank and broadcast, so it must serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub prompt_text: String,
    #[serde(default)]
    pub source_record: Map<String, Value>,
}

impl GenerationTask {
    pub fn new(prompt_text: impl Into<String>) -> Self {
        Self {
            prompt_text: prompt_text.into(),
            source_record: Map::new(),
        }
    }

    pub fn with_record(mut self, record: Map<String, Value>) -> Self {
        self.source_record = record;
        self
    }

    /// String field of the source record, if present.
    pub fn record_str(&self, key: &str) -> Option<&str> {
        self.source_record.get(key).and_then(Value::as_str)
    }
}

/// What the designated rank extracted from one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedArtifact {
    pub decoded_text: String,
    pub code: String,
    pub parsed_hyperparameters: Map<String, Value>,
}

impl GeneratedArtifact {
    /// Extract code and hyperparameters from decoded model output.
    pub fn from_decoded(decoded_text: String) -> Result<Self> {
        let code = extract_code(&decoded_text).ok_or(GenerationError::MissingCode)?;
        let raw =
            extract_hyperparameters(&decoded_text).ok_or(GenerationError::MissingHyperparameters)?;
        let parsed_hyperparameters = parse_hyperparameters(&raw)?;
        Ok(Self {
            decoded_text,
            code,
            parsed_hyperparameters,
        })
    }
}

/// Parse a hyperparameter object. Single quotes are treated as double quotes.
pub fn parse_hyperparameters(raw: &str) -> Result<Map<String, Value>> {
    serde_json::from_str(&raw.replace('\'', "\""))
        .map_err(GenerationError::MalformedHyperparameters)
}
