//! leafscan core
//!
//! Core types and data shared across the leafscan diagnosis pipeline.
//!
//! This crate provides:
//! - Error types and result handling, including the closed `PredictError`
//!   taxonomy returned by the predictor
//! - The diagnosis data model (disease records, risk levels, confidence tiers)
//! - The disease knowledge base with its guaranteed "Unknown Disease" entry
//! - The class index mapping model output positions to disease identifiers

pub mod class_index;
pub mod error;
pub mod knowledge;
pub mod types;

pub use class_index::ClassIndex;
pub use error::{Error, PredictError, Result};
pub use knowledge::{KnowledgeBase, UNKNOWN_DISEASE_ID};
pub use types::{ConfidenceClass, ConfidenceTier, Diagnosis, DiseaseRecord, RiskLevel};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::class_index::ClassIndex;
    pub use crate::error::{Error, PredictError, Result};
    pub use crate::knowledge::{KnowledgeBase, UNKNOWN_DISEASE_ID};
    pub use crate::types::{ConfidenceTier, Diagnosis, DiseaseRecord, RiskLevel};
}
