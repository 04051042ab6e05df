//! The predictor: image in, diagnosis out
//!
//! A [`Predictor`] is built once at startup and shared behind an `Arc`. It
//! either holds a ready classifier or remembers why none could be loaded; in
//! the latter case every call fails fast with
//! [`PredictError::ModelUnavailable`] and the model is never touched.

use crate::classifier::{CandleClassifier, ImageClassifier};
use crate::config::{InferenceFailurePolicy, PredictorConfig};
use crate::preprocess::{ImagePreprocessor, InferenceTensor};
use crate::resolver::ResultResolver;
use leafscan_core::{ClassIndex, Diagnosis, Error, KnowledgeBase, PredictError, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Runtime options for a [`Predictor`]
#[derive(Debug, Clone, Copy)]
pub struct PredictorOptions {
    pub inference_timeout: Duration,
    pub failure_policy: InferenceFailurePolicy,
    pub serialize_inference: bool,
}

impl Default for PredictorOptions {
    fn default() -> Self {
        Self {
            inference_timeout: Duration::from_secs(10),
            failure_policy: InferenceFailurePolicy::Surface,
            serialize_inference: false,
        }
    }
}

impl From<&PredictorConfig> for PredictorOptions {
    fn from(config: &PredictorConfig) -> Self {
        Self {
            inference_timeout: config.inference_timeout(),
            failure_policy: config.on_inference_failure,
            serialize_inference: config.serialize_inference,
        }
    }
}

enum ModelState {
    Ready {
        classifier: Arc<dyn ImageClassifier>,
        resolver: ResultResolver,
    },
    Unavailable {
        reason: String,
    },
}

/// Readiness as reported to health checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredictorStatus {
    Ready { model: String, classes: usize },
    Unavailable { reason: String },
}

pub struct Predictor {
    state: ModelState,
    preprocessor: ImagePreprocessor,
    options: PredictorOptions,
    inference_lock: Option<Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("status", &self.status())
            .field("options", &self.options)
            .finish()
    }
}

impl Predictor {
    /// Load class index, knowledge base and model from configuration.
    ///
    /// Never fails: any startup problem leaves the predictor unavailable.
    pub fn load(config: &PredictorConfig) -> Self {
        info!("Initializing predictor");
        let options = PredictorOptions::from(config);

        match Self::load_parts(config) {
            Ok((classifier, class_index, knowledge)) => {
                Self::from_parts(Arc::new(classifier), class_index, knowledge, options)
            }
            Err(e) => Self::unavailable(e.to_string(), options),
        }
    }

    fn load_parts(config: &PredictorConfig) -> Result<(CandleClassifier, ClassIndex, KnowledgeBase)> {
        let knowledge = match &config.knowledge_base_path {
            Some(path) => KnowledgeBase::from_yaml_file(path)?,
            None => KnowledgeBase::builtin(),
        };
        let class_index = ClassIndex::from_file(&config.class_names_path)?;
        let classifier = CandleClassifier::load(&config.model, class_index.len())?;
        Ok((classifier, class_index, knowledge))
    }

    /// Assemble a predictor from already loaded parts
    pub fn from_parts(
        classifier: Arc<dyn ImageClassifier>,
        class_index: ClassIndex,
        knowledge: KnowledgeBase,
        options: PredictorOptions,
    ) -> Self {
        if classifier.num_classes() != class_index.len() {
            return Self::unavailable(
                format!(
                    "model '{}' has {} outputs but the class index lists {} classes",
                    classifier.name(),
                    classifier.num_classes(),
                    class_index.len()
                ),
                options,
            );
        }

        let missing = knowledge.missing_ids(&class_index);
        if !missing.is_empty() {
            warn!(
                classes = ?missing,
                "Classes without knowledge base records will resolve to Unknown Disease"
            );
        }

        info!(
            model = classifier.name(),
            classes = class_index.len(),
            "Predictor ready"
        );

        Self {
            state: ModelState::Ready {
                classifier,
                resolver: ResultResolver::new(Arc::new(class_index), Arc::new(knowledge)),
            },
            preprocessor: ImagePreprocessor::new(),
            inference_lock: options
                .serialize_inference
                .then(|| Arc::new(Mutex::new(()))),
            options,
        }
    }

    /// A predictor that rejects every request
    pub fn unavailable(reason: impl Into<String>, options: PredictorOptions) -> Self {
        let reason = reason.into();
        error!(reason = %reason, "Model unavailable, predictions disabled");
        Self {
            state: ModelState::Unavailable { reason },
            preprocessor: ImagePreprocessor::new(),
            options,
            inference_lock: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ModelState::Ready { .. })
    }

    pub fn status(&self) -> PredictorStatus {
        match &self.state {
            ModelState::Ready {
                classifier,
                resolver,
            } => PredictorStatus::Ready {
                model: classifier.name().to_string(),
                classes: resolver.class_index().len(),
            },
            ModelState::Unavailable { reason } => PredictorStatus::Unavailable {
                reason: reason.clone(),
            },
        }
    }

    pub fn options(&self) -> &PredictorOptions {
        &self.options
    }

    /// Diagnose the image at `path`
    pub async fn predict(&self, path: impl AsRef<Path>) -> std::result::Result<Diagnosis, PredictError> {
        let (classifier, resolver) = self.ready()?;
        let path: PathBuf = path.as_ref().to_path_buf();
        debug!(path = %path.display(), "Predicting from file");

        let preprocessor = self.preprocessor.clone();
        let input = run_preprocess(move || preprocessor.preprocess(&path)).await?;
        self.classify(classifier, resolver, input).await
    }

    /// Diagnose an in-memory image
    pub async fn predict_bytes(&self, bytes: Vec<u8>) -> std::result::Result<Diagnosis, PredictError> {
        let (classifier, resolver) = self.ready()?;
        debug!(bytes = bytes.len(), "Predicting from buffer");

        let preprocessor = self.preprocessor.clone();
        let input = run_preprocess(move || preprocessor.preprocess_bytes(&bytes)).await?;
        self.classify(classifier, resolver, input).await
    }

    fn ready(&self) -> std::result::Result<(&Arc<dyn ImageClassifier>, &ResultResolver), PredictError> {
        match &self.state {
            ModelState::Ready {
                classifier,
                resolver,
            } => Ok((classifier, resolver)),
            ModelState::Unavailable { reason } => {
                record_outcome("model_unavailable");
                Err(PredictError::ModelUnavailable(reason.clone()))
            }
        }
    }

    async fn classify(
        &self,
        classifier: &Arc<dyn ImageClassifier>,
        resolver: &ResultResolver,
        input: InferenceTensor,
    ) -> std::result::Result<Diagnosis, PredictError> {
        match self.infer(classifier, input).await {
            Ok(probabilities) => {
                let diagnosis = resolver.resolve(&probabilities).to_diagnosis();
                record_outcome("ok");
                Ok(diagnosis)
            }
            Err(e) => match self.options.failure_policy {
                InferenceFailurePolicy::Surface => {
                    warn!(error = %e, "Inference failed");
                    record_outcome("inference_failed");
                    Err(PredictError::InferenceFailed(e.to_string()))
                }
                InferenceFailurePolicy::Degrade => {
                    warn!(error = %e, "Inference failed, returning Unknown Disease");
                    record_outcome("degraded");
                    Ok(resolver.unknown().to_diagnosis())
                }
            },
        }
    }

    async fn infer(&self, classifier: &Arc<dyn ImageClassifier>, input: InferenceTensor) -> Result<Vec<f32>> {
        let classifier = Arc::clone(classifier);
        let lock = self.inference_lock.clone();

        let task = tokio::task::spawn_blocking(move || {
            let _guard = lock
                .as_deref()
                .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner));
            let start = Instant::now();
            let result = classifier.infer(&input);
            (result, start.elapsed())
        });

        let (result, elapsed) = match tokio::time::timeout(self.options.inference_timeout, task).await {
            Ok(Ok(finished)) => finished,
            Ok(Err(join_error)) => {
                return Err(Error::inference(format!("inference task aborted: {}", join_error)))
            }
            Err(_) => {
                return Err(Error::inference(format!(
                    "inference exceeded {:?}",
                    self.options.inference_timeout
                )))
            }
        };

        metrics::histogram!("leafscan_inference_latency_us").record(elapsed.as_micros() as f64);
        debug!(latency_us = elapsed.as_micros() as u64, "Inference finished");
        result
    }
}

async fn run_preprocess<F>(work: F) -> std::result::Result<InferenceTensor, PredictError>
where
    F: FnOnce() -> Result<InferenceTensor> + Send + 'static,
{
    let result = match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(join_error) => Err(Error::preprocess(format!(
            "preprocessing task aborted: {}",
            join_error
        ))),
    };

    result.map_err(|e| {
        warn!(error = %e, "Preprocessing failed");
        record_outcome("preprocessing_failed");
        PredictError::PreprocessingFailed(e.to_string())
    })
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("leafscan_predictions_total", "outcome" => outcome).increment(1);
}
