//! Configuration for the predictor and model loading

use crate::model_loader::LoaderStrategy;
use leafscan_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for building a [`Predictor`](crate::Predictor)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Model artifact settings
    #[serde(default)]
    pub model: ModelSpec,

    /// JSON array of class identifiers written at training time
    #[serde(default = "default_class_names_path")]
    pub class_names_path: PathBuf,

    /// Optional YAML disease catalogue replacing the built-in one
    #[serde(default)]
    pub knowledge_base_path: Option<PathBuf>,

    /// Upper bound for a single forward pass
    #[serde(default = "default_inference_timeout_ms")]
    pub inference_timeout_ms: u64,

    /// What `predict` returns when inference fails
    #[serde(default)]
    pub on_inference_failure: InferenceFailurePolicy,

    /// Run at most one forward pass at a time
    #[serde(default)]
    pub serialize_inference: bool,
}

/// Model artifact settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Where the primary artifact lives
    #[serde(default)]
    pub source: ModelSource,

    /// Device to run inference on
    #[serde(default)]
    pub device: DeviceSpec,

    /// Loader strategies, tried in order until one succeeds
    #[serde(default = "LoaderStrategy::default_order")]
    pub loaders: Vec<LoaderStrategy>,
}

/// Model source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModelSource {
    /// Load from local filesystem
    Local { path: PathBuf },

    /// Download from HuggingFace Hub
    HuggingFace {
        repo_id: String,
        filename: String,
        #[serde(default)]
        revision: Option<String>,
    },
}

/// Device specification (for config files)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda {
        #[serde(default)]
        index: usize,
    },
    Metal {
        #[serde(default)]
        index: usize,
    },
}

/// Policy applied when a forward pass fails or times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InferenceFailurePolicy {
    /// Return `PredictError::InferenceFailed`
    #[default]
    Surface,
    /// Return the "Unknown Disease" diagnosis with zero confidence
    Degrade,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            model: ModelSpec::default(),
            class_names_path: default_class_names_path(),
            knowledge_base_path: None,
            inference_timeout_ms: default_inference_timeout_ms(),
            on_inference_failure: InferenceFailurePolicy::default(),
            serialize_inference: false,
        }
    }
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            source: ModelSource::default(),
            device: DeviceSpec::Cpu,
            loaders: LoaderStrategy::default_order(),
        }
    }
}

impl Default for ModelSource {
    fn default() -> Self {
        Self::Local {
            path: default_model_path(),
        }
    }
}

impl PredictorConfig {
    /// Create a configuration for a local model artifact and class list
    pub fn local(model_path: impl Into<PathBuf>, class_names_path: impl Into<PathBuf>) -> Self {
        Self {
            model: ModelSpec {
                source: ModelSource::Local {
                    path: model_path.into(),
                },
                ..Default::default()
            },
            class_names_path: class_names_path.into(),
            ..Default::default()
        }
    }

    /// Load from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("Failed to parse predictor config: {}", e)))
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Set the loader strategy order
    pub fn with_loaders(mut self, loaders: Vec<LoaderStrategy>) -> Self {
        self.model.loaders = loaders;
        self
    }

    /// Set the inference failure policy
    pub fn with_failure_policy(mut self, policy: InferenceFailurePolicy) -> Self {
        self.on_inference_failure = policy;
        self
    }

    /// Set a knowledge base file
    pub fn with_knowledge_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.knowledge_base_path = Some(path.into());
        self
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }
}

fn default_model_path() -> PathBuf {
    PathBuf::from("model/model.safetensors")
}

fn default_class_names_path() -> PathBuf {
    PathBuf::from("model/class_names.json")
}

fn default_inference_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PredictorConfig::from_yaml("{}").unwrap();

        match &config.model.source {
            ModelSource::Local { path } => {
                assert_eq!(path, &PathBuf::from("model/model.safetensors"));
            }
            _ => panic!("Expected local source"),
        }
        assert_eq!(config.class_names_path, PathBuf::from("model/class_names.json"));
        assert_eq!(config.model.device, DeviceSpec::Cpu);
        assert_eq!(config.model.loaders, LoaderStrategy::default_order());
        assert_eq!(config.inference_timeout(), Duration::from_secs(10));
        assert_eq!(config.on_inference_failure, InferenceFailurePolicy::Surface);
        assert!(!config.serialize_inference);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
model:
  source:
    type: huggingface
    repo_id: "leafscan/plantvillage-mobilenet"
    filename: "model.safetensors"
    revision: "v2"
  device:
    cuda:
      index: 1
  loaders: [native, reference]
class_names_path: "/srv/model/class_names.json"
knowledge_base_path: "/srv/model/diseases.yaml"
inference_timeout_ms: 2500
on_inference_failure: degrade
serialize_inference: true
"#;

        let config = PredictorConfig::from_yaml(yaml).unwrap();

        if let ModelSource::HuggingFace {
            repo_id,
            filename,
            revision,
        } = &config.model.source
        {
            assert_eq!(repo_id, "leafscan/plantvillage-mobilenet");
            assert_eq!(filename, "model.safetensors");
            assert_eq!(revision.as_deref(), Some("v2"));
        } else {
            panic!("Expected HuggingFace source");
        }

        assert_eq!(config.model.device, DeviceSpec::Cuda { index: 1 });
        assert_eq!(
            config.model.loaders,
            vec![LoaderStrategy::Native, LoaderStrategy::Reference]
        );
        assert_eq!(config.inference_timeout(), Duration::from_millis(2500));
        assert_eq!(config.on_inference_failure, InferenceFailurePolicy::Degrade);
        assert!(config.serialize_inference);
    }

    #[test]
    fn test_unknown_loader_rejected() {
        let yaml = r#"
model:
  loaders: [native, onnx]
"#;
        assert!(matches!(PredictorConfig::from_yaml(yaml), Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_helpers() {
        let config = PredictorConfig::local("/tmp/model.safetensors", "/tmp/classes.json")
            .with_loaders(vec![LoaderStrategy::SchemaPatch])
            .with_failure_policy(InferenceFailurePolicy::Degrade)
            .with_knowledge_base("/tmp/kb.yaml");

        assert_eq!(config.model.loaders, vec![LoaderStrategy::SchemaPatch]);
        assert_eq!(config.on_inference_failure, InferenceFailurePolicy::Degrade);
        assert_eq!(config.knowledge_base_path, Some(PathBuf::from("/tmp/kb.yaml")));
    }
}
