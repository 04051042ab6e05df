//! leafscan classifiers
//!
//! Image preprocessing, model loading and inference, and result resolution
//! for leaf disease diagnosis.
//!
//! The pipeline for one request:
//! - [`ImagePreprocessor`] decodes an image into a `(1, 128, 128, 3)` tensor
//! - an [`ImageClassifier`] turns it into class probabilities
//! - the [`ResultResolver`] applies the confidence gate and looks the winning
//!   class up in the knowledge base
//!
//! [`Predictor`] ties these together behind an async `predict` call. Models are
//! loaded with [`ModelLoader`], which tries a configurable list of
//! [`LoaderStrategy`]s so that artifacts written by older exporters still load.

pub mod classifier;
pub mod config;
pub mod model_loader;
pub mod network;
pub mod predictor;
pub mod preprocess;
pub mod resolver;
pub mod topology;
pub mod weights;

pub use classifier::{CandleClassifier, ImageClassifier};
pub use config::{DeviceSpec, InferenceFailurePolicy, ModelSource, ModelSpec, PredictorConfig};
pub use model_loader::{LoadedNetwork, LoaderStrategy, ModelLoader};
pub use network::Network;
pub use predictor::{Predictor, PredictorOptions, PredictorStatus};
pub use preprocess::{ImagePreprocessor, InferenceTensor, IMAGE_SIZE};
pub use resolver::{PredictionOutcome, Resolution, ResultResolver, CONFIDENCE_GATE};
pub use topology::{NetworkTopology, TOPOLOGY_FORMAT_VERSION, TOPOLOGY_METADATA_KEY};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::classifier::ImageClassifier;
    pub use crate::config::PredictorConfig;
    pub use crate::predictor::{Predictor, PredictorOptions};
    pub use crate::preprocess::InferenceTensor;
    pub use leafscan_core::prelude::*;
}
