//! Model artifact loading with ordered fallback strategies
//!
//! A model artifact is the weights file named in the configuration plus
//! optional siblings sharing its stem:
//!
//! - `model.safetensors`: weights, with the topology JSON in the header
//!   metadata under `topology`
//! - `model.npz` / `model.pth`: weights written by older exporters
//! - `model.json`: sidecar topology
//!
//! Each [`LoaderStrategy`] tries one way of turning these files into a
//! [`Network`]. Strategies run in the configured order; a failure is logged
//! and the next strategy is tried.

use crate::config::{DeviceSpec, ModelSource, ModelSpec};
use crate::network::Network;
use crate::topology::{NetworkTopology, TOPOLOGY_METADATA_KEY};
use crate::weights::{assign_by_name, assign_by_position};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use leafscan_core::{Error, Result};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extensions accepted for legacy weight files, in lookup order
const LEGACY_WEIGHT_EXTENSIONS: &[&str] = &["npz", "pth", "pt"];

/// One way of loading a model artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderStrategy {
    /// Safetensors weights with embedded topology, both strict
    Native,
    /// Legacy weights file plus sidecar topology, both strict
    Legacy,
    /// Rewrite an outdated topology, then match weights by position or name
    SchemaPatch,
    /// Ignore the stored topology and use the reference architecture
    Reference,
}

impl LoaderStrategy {
    pub fn default_order() -> Vec<Self> {
        vec![Self::Native, Self::Legacy, Self::SchemaPatch, Self::Reference]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Legacy => "legacy",
            Self::SchemaPatch => "schema_patch",
            Self::Reference => "reference",
        }
    }
}

impl fmt::Display for LoaderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network together with how it was loaded
#[derive(Debug)]
pub struct LoadedNetwork {
    pub network: Network,
    pub strategy: LoaderStrategy,
    pub artifact: PathBuf,
}

/// Files making up one model artifact
#[derive(Debug, Clone)]
pub struct ArtifactFiles {
    primary: PathBuf,
}

impl ArtifactFiles {
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
        }
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    fn sibling(&self, extension: &str) -> PathBuf {
        self.primary.with_extension(extension)
    }

    fn is_safetensors(&self) -> bool {
        self.primary.extension().and_then(|e| e.to_str()) == Some("safetensors")
    }

    /// Sidecar topology file, if present
    pub fn sidecar_topology(&self) -> Option<PathBuf> {
        let path = self.sibling("json");
        path.is_file().then_some(path)
    }

    /// First legacy weights file found, the primary itself included
    pub fn legacy_weights(&self) -> Option<PathBuf> {
        let primary_ext = self.primary.extension().and_then(|e| e.to_str());
        if primary_ext.is_some_and(|ext| LEGACY_WEIGHT_EXTENSIONS.contains(&ext))
            && self.primary.is_file()
        {
            return Some(self.primary.clone());
        }

        LEGACY_WEIGHT_EXTENSIONS
            .iter()
            .map(|ext| self.sibling(ext))
            .find(|path| path.is_file())
    }
}

/// Tensors read from a weights file, in no particular order.
///
/// Positional matching sorts the keys itself; see [`assign_by_position`].
struct WeightFile {
    tensors: Vec<(String, Tensor)>,
    metadata: HashMap<String, String>,
}

impl WeightFile {
    fn into_map(self) -> HashMap<String, Tensor> {
        self.tensors.into_iter().collect()
    }
}

fn read_safetensors(path: &Path, device: &Device) -> Result<WeightFile> {
    let buffer = std::fs::read(path)
        .map_err(|e| Error::model(format!("Failed to read {}: {}", path.display(), e)))?;

    let (_, header) = SafeTensors::read_metadata(&buffer)
        .map_err(|e| Error::model(format!("Invalid safetensors header in {}: {}", path.display(), e)))?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let tensors = candle_core::safetensors::load_buffer(&buffer, device)
        .map_err(|e| Error::model(format!("Failed to load tensors from {}: {}", path.display(), e)))?
        .into_iter()
        .collect();

    Ok(WeightFile { tensors, metadata })
}

fn read_legacy_weights(path: &Path, device: &Device) -> Result<WeightFile> {
    let tensors = match path.extension().and_then(|e| e.to_str()) {
        Some("npz") => Tensor::read_npz(path),
        Some("pth") | Some("pt") => candle_core::pickle::read_all(path),
        other => {
            return Err(Error::model(format!(
                "unsupported legacy weights format {:?}",
                other
            )))
        }
    }
    .map_err(|e| Error::model(format!("Failed to read {}: {}", path.display(), e)))?;

    let tensors = tensors
        .into_iter()
        .map(|(name, t)| t.to_device(device).map(|t| (name, t)))
        .collect::<candle_core::Result<Vec<_>>>()
        .map_err(|e| Error::model(format!("Failed to move weights to device: {}", e)))?;

    Ok(WeightFile {
        tensors,
        metadata: HashMap::new(),
    })
}

fn read_topology_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::model(format!("Failed to read topology {}: {}", path.display(), e)))
}

/// Loads model artifacts by trying each configured strategy in order
#[derive(Debug)]
pub struct ModelLoader {
    strategies: Vec<LoaderStrategy>,
    device: Device,
    num_classes: usize,
}

impl ModelLoader {
    /// Create a loader; `num_classes` sizes the reference architecture
    pub fn new(strategies: Vec<LoaderStrategy>, device: Device, num_classes: usize) -> Self {
        Self {
            strategies,
            device,
            num_classes,
        }
    }

    pub fn from_spec(spec: &ModelSpec, num_classes: usize) -> Result<Self> {
        let device = create_device(spec.device)?;
        Ok(Self::new(spec.loaders.clone(), device, num_classes))
    }

    /// Resolve the configured source and load it
    pub fn load_source(&self, source: &ModelSource) -> Result<LoadedNetwork> {
        let path = resolve_model_path(source)?;
        self.load(path)
    }

    /// Load the artifact at `path`, returning the first strategy that works
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadedNetwork> {
        let files = ArtifactFiles::new(path.as_ref());
        info!(
            artifact = %files.primary().display(),
            strategies = ?self.strategies,
            "Loading model"
        );

        if self.strategies.is_empty() {
            return Err(Error::model("no loader strategies configured"));
        }

        let mut failures = Vec::with_capacity(self.strategies.len());
        for &strategy in &self.strategies {
            match self.try_strategy(strategy, &files) {
                Ok(network) => {
                    metrics::counter!(
                        "leafscan_model_load_attempts_total",
                        "strategy" => strategy.as_str(),
                        "result" => "ok"
                    )
                    .increment(1);
                    info!(
                        strategy = %strategy,
                        network = network.name(),
                        outputs = network.num_outputs(),
                        "Model loaded"
                    );
                    return Ok(LoadedNetwork {
                        network,
                        strategy,
                        artifact: files.primary().to_path_buf(),
                    });
                }
                Err(e) => {
                    metrics::counter!(
                        "leafscan_model_load_attempts_total",
                        "strategy" => strategy.as_str(),
                        "result" => "error"
                    )
                    .increment(1);
                    warn!(strategy = %strategy, error = %e, "Loader strategy failed");
                    failures.push(format!("{}: {}", strategy, e));
                }
            }
        }

        Err(Error::model(format!(
            "all loader strategies failed ({})",
            failures.join("; ")
        )))
    }

    fn try_strategy(&self, strategy: LoaderStrategy, files: &ArtifactFiles) -> Result<Network> {
        match strategy {
            LoaderStrategy::Native => self.load_native(files),
            LoaderStrategy::Legacy => self.load_legacy(files),
            LoaderStrategy::SchemaPatch => self.load_schema_patched(files),
            LoaderStrategy::Reference => self.load_reference(files),
        }
    }

    fn load_native(&self, files: &ArtifactFiles) -> Result<Network> {
        if !files.is_safetensors() {
            return Err(Error::model("artifact is not a safetensors file"));
        }

        let weights = read_safetensors(files.primary(), &self.device)?;
        let topology_json = weights.metadata.get(TOPOLOGY_METADATA_KEY).cloned().ok_or_else(|| {
            Error::model(format!("no '{}' entry in safetensors metadata", TOPOLOGY_METADATA_KEY))
        })?;
        let topology = NetworkTopology::from_json(&topology_json)?;

        self.build(&topology, weights.into_map())
    }

    fn load_legacy(&self, files: &ArtifactFiles) -> Result<Network> {
        let weights_path = files
            .legacy_weights()
            .ok_or_else(|| Error::model("no legacy weights file (.npz, .pth, .pt) found"))?;
        let topology_path = files
            .sidecar_topology()
            .ok_or_else(|| Error::model("no sidecar topology file found"))?;

        let topology = NetworkTopology::from_json(&read_topology_file(&topology_path)?)?;
        let weights = read_legacy_weights(&weights_path, &self.device)?;

        self.build(&topology, weights.into_map())
    }

    fn load_schema_patched(&self, files: &ArtifactFiles) -> Result<Network> {
        let weights = self.read_any_weights(files)?;

        let topology_json = match weights.metadata.get(TOPOLOGY_METADATA_KEY) {
            Some(json) => json.clone(),
            None => {
                let path = files
                    .sidecar_topology()
                    .ok_or_else(|| Error::model("no topology found to patch"))?;
                read_topology_file(&path)?
            }
        };

        let (topology, report) = NetworkTopology::from_json_patched(&topology_json)?;
        debug!(?report, "Patched topology schema");

        let slots = topology.parameter_slots()?;
        match assign_by_position(&slots, &weights.tensors)
            .and_then(|assigned| self.build(&topology, assigned))
        {
            Ok(network) => Ok(network),
            Err(e) => {
                debug!(error = %e, "Positional weight matching failed, trying names");
                let assigned = assign_by_name(&slots, &weights.tensors)?;
                self.build(&topology, assigned)
            }
        }
    }

    fn load_reference(&self, files: &ArtifactFiles) -> Result<Network> {
        let weights = self.read_any_weights(files)?;
        let topology = NetworkTopology::reference(self.num_classes);
        let slots = topology.parameter_slots()?;

        match assign_by_name(&slots, &weights.tensors)
            .and_then(|assigned| self.build(&topology, assigned))
        {
            Ok(network) => Ok(network),
            Err(e) => {
                debug!(error = %e, "Name-based weight matching failed, trying positions");
                let assigned = assign_by_position(&slots, &weights.tensors)?;
                self.build(&topology, assigned)
            }
        }
    }

    /// Primary safetensors file if readable, otherwise legacy weights
    fn read_any_weights(&self, files: &ArtifactFiles) -> Result<WeightFile> {
        if files.is_safetensors() && files.primary().is_file() {
            match read_safetensors(files.primary(), &self.device) {
                Ok(weights) => return Ok(weights),
                Err(e) => debug!(error = %e, "Primary artifact unreadable"),
            }
        }

        let path = files
            .legacy_weights()
            .ok_or_else(|| Error::model("no readable weights file found"))?;
        read_legacy_weights(&path, &self.device)
    }

    fn build(&self, topology: &NetworkTopology, tensors: HashMap<String, Tensor>) -> Result<Network> {
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &self.device);
        Network::build(topology, vb)
    }
}

/// Resolve a model source to a local file, downloading if needed
pub fn resolve_model_path(source: &ModelSource) -> Result<PathBuf> {
    match source {
        ModelSource::Local { path } => {
            if !path.exists() {
                return Err(Error::model(format!(
                    "Model file not found: {}",
                    path.display()
                )));
            }
            Ok(path.clone())
        }
        ModelSource::HuggingFace {
            repo_id,
            filename,
            revision,
        } => {
            let mut builder = ApiBuilder::new();
            if let Some(cache) = dirs::cache_dir() {
                builder = builder.with_cache_dir(cache.join("leafscan").join("hub"));
            }
            let api = builder
                .build()
                .map_err(|e| Error::model(format!("Failed to initialize HF API: {}", e)))?;

            let repo = api.repo(Repo::with_revision(
                repo_id.clone(),
                RepoType::Model,
                revision.clone().unwrap_or_else(|| "main".to_string()),
            ));

            let model_path = repo
                .get(filename)
                .map_err(|e| Error::model(format!("Failed to download model from HF: {}", e)))?;

            // Siblings are optional; they land next to the primary in the cache
            let stem = Path::new(filename).with_extension("");
            for ext in ["json"].iter().chain(LEGACY_WEIGHT_EXTENSIONS) {
                let sibling = stem.with_extension(ext);
                let sibling = sibling.to_string_lossy();
                if sibling == filename.as_str() {
                    continue;
                }
                match repo.get(&sibling) {
                    Ok(path) => debug!(file = %path.display(), "Fetched artifact sibling"),
                    Err(e) => debug!(file = %sibling, error = %e, "Artifact sibling not available"),
                }
            }

            Ok(model_path)
        }
    }
}

/// Create a Candle device from its configuration
pub fn create_device(spec: DeviceSpec) -> Result<Device> {
    match spec {
        DeviceSpec::Cpu => Ok(Device::Cpu),
        DeviceSpec::Cuda { index } => Device::new_cuda(index)
            .map_err(|e| Error::model(format!("Failed to create CUDA device: {}", e))),
        DeviceSpec::Metal { index } => Device::new_metal(index)
            .map_err(|e| Error::model(format!("Failed to create Metal device: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        let names: Vec<&str> = LoaderStrategy::default_order()
            .iter()
            .map(LoaderStrategy::as_str)
            .collect();
        assert_eq!(names, vec!["native", "legacy", "schema_patch", "reference"]);
    }

    #[test]
    fn test_missing_local_model() {
        let source = ModelSource::Local {
            path: PathBuf::from("/nonexistent/model.safetensors"),
        };
        assert!(matches!(resolve_model_path(&source), Err(Error::Model(_))));
    }

    #[test]
    fn test_sibling_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("model.safetensors");
        std::fs::write(dir.path().join("model.json"), "{}").unwrap();
        std::fs::write(dir.path().join("model.pth"), b"").unwrap();

        let files = ArtifactFiles::new(&primary);
        assert_eq!(files.sidecar_topology(), Some(dir.path().join("model.json")));
        assert_eq!(files.legacy_weights(), Some(dir.path().join("model.pth")));
    }

    #[test]
    fn test_no_strategies_configured() {
        let loader = ModelLoader::new(vec![], Device::Cpu, 3);
        assert!(loader.load("/nonexistent/model.safetensors").is_err());
    }

    #[test]
    fn test_all_strategies_fail_for_missing_artifact() {
        let loader = ModelLoader::new(LoaderStrategy::default_order(), Device::Cpu, 3);
        match loader.load("/nonexistent/model.safetensors") {
            Err(Error::Model(msg)) => {
                assert!(msg.contains("native"));
                assert!(msg.contains("reference"));
            }
            other => panic!("Expected model error, got {:?}", other.map(|l| l.strategy)),
        }
    }
}
