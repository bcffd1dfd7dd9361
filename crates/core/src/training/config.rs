//! Training-engine configuration.
//!
//! The engine config is a static JSON document; a few per-run knobs are
//! patched in from [`TrainingArgs`]:
//!
//! | Argument                       | Config key                          |
//! |--------------------------------|-------------------------------------|
//! | `per_device_train_batch_size`  | `train_micro_batch_size_per_gpu`    |
//! | `gradient_accumulation_steps`  | `gradient_accumulation_steps`       |
//! | `fp16` / `bf16`                | `fp16` / `bf16` (only if absent)    |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::{Result, TrainingError};

pub const MICRO_BATCH_KEY: &str = "train_micro_batch_size_per_gpu";
pub const GRAD_ACCUM_KEY: &str = "gradient_accumulation_steps";

/// Per-run overrides. Unset fields leave the static config alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArgs {
    pub per_device_train_batch_size: Option<usize>,
    pub gradient_accumulation_steps: Option<usize>,
    pub fp16: bool,
    pub bf16: bool,
}

/// Where the static engine config comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Path(PathBuf),
    Inline(Map<String, Value>),
}

impl From<&Path> for ConfigSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for ConfigSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Map<String, Value>> for ConfigSource {
    fn from(map: Map<String, Value>) -> Self {
        Self::Inline(map)
    }
}

/// Read the static config. It must be a JSON object.
pub fn load_engine_config(source: &ConfigSource) -> Result<Map<String, Value>> {
    match source {
        ConfigSource::Inline(map) => Ok(map.clone()),
        ConfigSource::Path(path) => {
            let text = std::fs::read_to_string(path)?;
            match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => Ok(map),
                other => Err(TrainingError::InvalidConfig(format!(
                    "{} holds a {}, expected an object",
                    path.display(),
                    json_kind(&other)
                ))),
            }
        }
    }
}

/// Apply per-run overrides in place.
///
/// fp16 wins over bf16. A precision section already in the config is kept
/// as is.
pub fn patch_from_training_args(config: &mut Map<String, Value>, args: &TrainingArgs) {
    if let Some(batch) = args.per_device_train_batch_size {
        config.insert(MICRO_BATCH_KEY.to_string(), json!(batch));
    }
    if let Some(steps) = args.gradient_accumulation_steps {
        config.insert(GRAD_ACCUM_KEY.to_string(), json!(steps));
    }
    let precision = if args.fp16 {
        Some("fp16")
    } else if args.bf16 {
        Some("bf16")
    } else {
        None
    };
    if let Some(key) = precision {
        config
            .entry(key.to_string())
            .or_insert_with(|| json!({ "enabled": true }));
    }
}

/// Load and patch in one step.
pub fn merge_engine_config(
    source: &ConfigSource,
    args: Option<&TrainingArgs>,
) -> Result<Map<String, Value>> {
    let mut config = load_engine_config(source)?;
    if let Some(args) = args {
        patch_from_training_args(&mut config, args);
    }
    Ok(config)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Map<String, Value> {
        match json!({
            "train_micro_batch_size_per_gpu": 1,
            "gradient_accumulation_steps": 8,
            "zero_optimization": { "stage": 3 }
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn no_args_keeps_static_config() {
        let merged = merge_engine_config(&base().into(), None).unwrap();
        assert_eq!(merged, base());
    }

    #[test]
    fn empty_args_change_nothing() {
        let merged = merge_engine_config(&base().into(), Some(&TrainingArgs::default())).unwrap();
        assert_eq!(merged, base());
    }

    #[test]
    fn dynamic_overrides_win() {
        let args = TrainingArgs {
            per_device_train_batch_size: Some(4),
            gradient_accumulation_steps: Some(2),
            ..Default::default()
        };
        let merged = merge_engine_config(&base().into(), Some(&args)).unwrap();
        assert_eq!(merged[MICRO_BATCH_KEY], json!(4));
        assert_eq!(merged[GRAD_ACCUM_KEY], json!(2));
        assert_eq!(merged["zero_optimization"], json!({ "stage": 3 }));
    }

    #[test]
    fn fp16_preferred_over_bf16() {
        let args = TrainingArgs {
            fp16: true,
            bf16: true,
            ..Default::default()
        };
        let merged = merge_engine_config(&base().into(), Some(&args)).unwrap();
        assert_eq!(merged["fp16"], json!({ "enabled": true }));
        assert!(!merged.contains_key("bf16"));
    }

    #[test]
    fn existing_precision_section_kept() {
        let mut config = base();
        config.insert("bf16".to_string(), json!({ "enabled": false }));
        patch_from_training_args(
            &mut config,
            &TrainingArgs {
                bf16: true,
                ..Default::default()
            },
        );
        assert_eq!(config["bf16"], json!({ "enabled": false }));
    }

    #[test]
    fn loads_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ds.json");
        std::fs::write(&path, serde_json::to_string(&base()).unwrap()).unwrap();
        assert_eq!(load_engine_config(&path.as_path().into()).unwrap(), base());
    }

    #[test]
    fn non_object_file_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ds.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(
            load_engine_config(&ConfigSource::Path(path)),
            Err(TrainingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let source = ConfigSource::Path(PathBuf::from("/nonexistent/ds.json"));
        assert!(matches!(load_engine_config(&source), Err(TrainingError::Io(_))));
    }
}
