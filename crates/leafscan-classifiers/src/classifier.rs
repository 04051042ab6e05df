//! Classifier trait and the candle-backed implementation

use crate::config::ModelSpec;
use crate::model_loader::{LoadedNetwork, LoaderStrategy, ModelLoader};
use crate::network::Network;
use crate::preprocess::InferenceTensor;
use candle_core::D;
use leafscan_core::{Error, Result};
use std::path::PathBuf;

/// Anything that turns a preprocessed image into class probabilities.
///
/// Inference is synchronous and CPU/GPU bound; callers run it on a blocking
/// thread. Implementations must be safe to call from several threads.
pub trait ImageClassifier: Send + Sync {
    /// Probability vector of length [`num_classes`](Self::num_classes)
    fn infer(&self, input: &InferenceTensor) -> Result<Vec<f32>>;

    fn num_classes(&self) -> usize;

    fn name(&self) -> &str;
}

/// Classifier running a candle [`Network`]
#[derive(Debug)]
pub struct CandleClassifier {
    name: String,
    network: Network,
    strategy: LoaderStrategy,
    artifact: PathBuf,
}

impl CandleClassifier {
    pub fn new(loaded: LoadedNetwork) -> Self {
        let name = loaded
            .artifact
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| format!("{}:{}", loaded.network.name(), stem))
            .unwrap_or_else(|| loaded.network.name().to_string());

        Self {
            name,
            network: loaded.network,
            strategy: loaded.strategy,
            artifact: loaded.artifact,
        }
    }

    /// Resolve, download if needed, and load the configured artifact
    pub fn load(spec: &ModelSpec, num_classes: usize) -> Result<Self> {
        let loader = ModelLoader::from_spec(spec, num_classes)?;
        Ok(Self::new(loader.load_source(&spec.source)?))
    }

    /// Strategy that produced the network
    pub fn strategy(&self) -> LoaderStrategy {
        self.strategy
    }

    pub fn artifact(&self) -> &PathBuf {
        &self.artifact
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

impl ImageClassifier for CandleClassifier {
    fn infer(&self, input: &InferenceTensor) -> Result<Vec<f32>> {
        let output = self.network.forward(input.tensor())?;

        let probabilities = if self.network.ends_with_softmax() {
            output
        } else {
            candle_nn::ops::softmax(&output, D::Minus1)
                .map_err(|e| Error::inference(format!("Failed to apply softmax: {}", e)))?
        };

        let probabilities: Vec<f32> = probabilities
            .squeeze(0)
            .and_then(|t| t.to_vec1())
            .map_err(|e| Error::inference(format!("Failed to read model output: {}", e)))?;

        if probabilities.len() != self.network.num_outputs() {
            return Err(Error::inference(format!(
                "model produced {} outputs, expected {}",
                probabilities.len(),
                self.network.num_outputs()
            )));
        }

        Ok(probabilities)
    }

    fn num_classes(&self) -> usize {
        self.network.num_outputs()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
