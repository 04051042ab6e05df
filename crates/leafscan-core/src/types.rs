//! Core types for leafscan diagnoses

use serde::{Deserialize, Serialize};
use std::fmt;

/// Intrinsic severity of a disease.
///
/// This comes verbatim from the knowledge base and never depends on how
/// confident the model was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    None,
    Low,
    Moderate,
    High,
    Critical,
    Unknown,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Low => "Low",
            Self::Moderate => "Moderate",
            Self::High => "High",
            Self::Critical => "Critical",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive record for one disease class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseRecord {
    /// Stable key, matching the class index entry
    pub id: String,

    /// Human-readable disease name
    pub display_name: String,

    /// Affected crop
    pub crop: String,

    /// Intrinsic severity
    pub risk: RiskLevel,

    pub description: String,

    #[serde(default)]
    pub causes: Vec<String>,

    #[serde(default)]
    pub treatment: Vec<String>,

    #[serde(default)]
    pub prevention: Vec<String>,
}

/// User-facing confidence label derived from the confidence percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfidenceTier {
    #[serde(rename = "High Confidence")]
    High,
    #[serde(rename = "Moderate Confidence")]
    Moderate,
    #[serde(rename = "Low Confidence")]
    Low,
}

/// Percentage at or above which confidence is reported as high
pub const HIGH_CONFIDENCE_PERCENT: f64 = 90.0;

/// Percentage at or above which confidence is reported as moderate
pub const MODERATE_CONFIDENCE_PERCENT: f64 = 75.0;

impl ConfidenceTier {
    /// Classify a confidence percentage (already rounded to two decimals).
    ///
    /// Both cutoffs are inclusive: 90.00 is high, 75.00 is moderate.
    pub fn from_percent(percent: f64) -> Self {
        if percent >= HIGH_CONFIDENCE_PERCENT {
            Self::High
        } else if percent >= MODERATE_CONFIDENCE_PERCENT {
            Self::Moderate
        } else {
            Self::Low
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::High => "High Confidence",
            Self::Moderate => "Moderate Confidence",
            Self::Low => "Low Confidence",
        }
    }

    /// Styling hint for renderers
    pub fn style_class(&self) -> ConfidenceClass {
        match self {
            Self::High => ConfidenceClass::Success,
            Self::Moderate => ConfidenceClass::Warning,
            Self::Low => ConfidenceClass::Danger,
        }
    }
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Styling hint attached to a confidence tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceClass {
    Success,
    Warning,
    Danger,
}

/// Round a raw `[0, 1]` confidence to a percentage with two decimals
pub fn confidence_percent(confidence: f32) -> f64 {
    (f64::from(confidence) * 100.0 * 100.0).round() / 100.0
}

/// Structured response of a single prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub disease_id: String,
    pub disease_name: String,
    pub crop: String,
    pub risk_level: RiskLevel,
    pub description: String,
    pub causes: Vec<String>,
    pub treatment: Vec<String>,
    pub prevention: Vec<String>,

    /// Percentage formatted for display, e.g. "91.00%"
    pub confidence: String,

    /// Percentage rounded to two decimals
    pub confidence_score: f64,

    pub confidence_level: ConfidenceTier,
    pub confidence_class: ConfidenceClass,
}

impl Diagnosis {
    /// Assemble a diagnosis from a resolved record and its confidence percentage
    pub fn new(record: &DiseaseRecord, confidence_score: f64, tier: ConfidenceTier) -> Self {
        Self {
            disease_id: record.id.clone(),
            disease_name: record.display_name.clone(),
            crop: record.crop.clone(),
            risk_level: record.risk,
            description: record.description.clone(),
            causes: record.causes.clone(),
            treatment: record.treatment.clone(),
            prevention: record.prevention.clone(),
            confidence: format!("{:.2}%", confidence_score),
            confidence_score,
            confidence_level: tier,
            confidence_class: tier.style_class(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries_are_inclusive() {
        assert_eq!(ConfidenceTier::from_percent(90.00), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_percent(89.99), ConfidenceTier::Moderate);
        assert_eq!(ConfidenceTier::from_percent(75.00), ConfidenceTier::Moderate);
        assert_eq!(ConfidenceTier::from_percent(74.99), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::from_percent(0.0), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::from_percent(100.0), ConfidenceTier::High);
    }

    #[test]
    fn test_confidence_percent_rounding() {
        assert_eq!(confidence_percent(0.91), 91.0);
        assert_eq!(confidence_percent(0.60), 60.0);
        assert_eq!(confidence_percent(0.75), 75.0);
        assert_eq!(confidence_percent(0.123456), 12.35);
        assert_eq!(confidence_percent(1.0), 100.0);
    }

    #[test]
    fn test_style_class() {
        assert_eq!(ConfidenceTier::High.style_class(), ConfidenceClass::Success);
        assert_eq!(ConfidenceTier::Moderate.style_class(), ConfidenceClass::Warning);
        assert_eq!(ConfidenceTier::Low.style_class(), ConfidenceClass::Danger);
    }

    #[test]
    fn test_diagnosis_serialization() {
        let record = DiseaseRecord {
            id: "Potato___Late_blight".to_string(),
            display_name: "Potato Late Blight".to_string(),
            crop: "Potato".to_string(),
            risk: RiskLevel::Critical,
            description: "Oomycete disease".to_string(),
            causes: vec!["Cool, moist weather".to_string()],
            treatment: vec![],
            prevention: vec![],
        };

        let diagnosis = Diagnosis::new(&record, 82.5, ConfidenceTier::from_percent(82.5));
        let json = serde_json::to_value(&diagnosis).unwrap();

        assert_eq!(json["disease_name"], "Potato Late Blight");
        assert_eq!(json["risk_level"], "Critical");
        assert_eq!(json["confidence"], "82.50%");
        assert_eq!(json["confidence_score"], 82.5);
        assert_eq!(json["confidence_level"], "Moderate Confidence");
        assert_eq!(json["confidence_class"], "warning");
        assert_eq!(json["causes"][0], "Cool, moist weather");
    }
}
