//! Error types for leafscan

/// Result type alias using leafscan's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for leafscan operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Image decoding or tensor construction errors
    #[error("preprocessing error: {0}")]
    Preprocess(String),

    /// Model artifact loading errors
    #[error("model error: {0}")]
    Model(String),

    /// Forward pass errors
    #[error("inference error: {0}")]
    Inference(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Knowledge base consistency errors
    #[error("knowledge base error: {0}")]
    KnowledgeBase(String),

    /// Filesystem errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a new preprocessing error
    pub fn preprocess(msg: impl Into<String>) -> Self {
        Self::Preprocess(msg.into())
    }

    /// Create a new model loading error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new inference error
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new knowledge base error
    pub fn knowledge_base(msg: impl Into<String>) -> Self {
        Self::KnowledgeBase(msg.into())
    }
}

/// Failure of a single `predict` call.
///
/// This is the complete set of outcomes a caller has to handle besides a
/// successful diagnosis; nothing else escapes the predictor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredictError {
    /// The model could not be loaded at startup; every request fails fast
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The input could not be decoded into an inference tensor
    #[error("image preprocessing failed: {0}")]
    PreprocessingFailed(String),

    /// The forward pass failed or timed out
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

impl PredictError {
    /// Stable machine-readable tag for this error
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::PreprocessingFailed(_) => "preprocessing_failed",
            Self::InferenceFailed(_) => "inference_failed",
        }
    }
}
