//! Confidence-gated resolution of probability vectors into disease records

use leafscan_core::types::confidence_percent;
use leafscan_core::{ClassIndex, ConfidenceTier, Diagnosis, DiseaseRecord, KnowledgeBase};
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw confidence below which no specific disease is named
pub const CONFIDENCE_GATE: f32 = 0.75;

/// Winning position of a probability vector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionOutcome {
    pub predicted_class_index: usize,
    pub raw_confidence: f32,
}

impl PredictionOutcome {
    /// Argmax with first-index tie break. NaN never wins; `None` when no
    /// finite-comparable score exists.
    pub fn from_probabilities(probabilities: &[f32]) -> Option<Self> {
        let mut best: Option<Self> = None;
        for (index, &p) in probabilities.iter().enumerate() {
            if p.is_nan() {
                continue;
            }
            if best.map_or(true, |b| p > b.raw_confidence) {
                best = Some(Self {
                    predicted_class_index: index,
                    raw_confidence: p,
                });
            }
        }
        best
    }
}

/// Outcome of resolving one probability vector
#[derive(Debug, Clone)]
pub struct Resolution<'a> {
    pub record: &'a DiseaseRecord,
    pub outcome: Option<PredictionOutcome>,
    pub confidence_percent: f64,
    pub confidence_tier: ConfidenceTier,
}

impl Resolution<'_> {
    pub fn is_unknown(&self) -> bool {
        self.record.id == leafscan_core::UNKNOWN_DISEASE_ID
    }

    pub fn to_diagnosis(&self) -> Diagnosis {
        Diagnosis::new(self.record, self.confidence_percent, self.confidence_tier)
    }
}

/// Maps probability vectors to knowledge base records
#[derive(Debug, Clone)]
pub struct ResultResolver {
    class_index: Arc<ClassIndex>,
    knowledge: Arc<KnowledgeBase>,
}

impl ResultResolver {
    pub fn new(class_index: Arc<ClassIndex>, knowledge: Arc<KnowledgeBase>) -> Self {
        Self {
            class_index,
            knowledge,
        }
    }

    pub fn class_index(&self) -> &ClassIndex {
        &self.class_index
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    pub fn resolve(&self, probabilities: &[f32]) -> Resolution<'_> {
        let outcome = PredictionOutcome::from_probabilities(probabilities);
        let confidence = outcome.map_or(0.0, |o| o.raw_confidence);
        let record = self.select_record(outcome);

        let percent = confidence_percent(confidence);
        let tier = ConfidenceTier::from_percent(percent);

        debug!(
            disease = %record.id,
            class_index = outcome.map(|o| o.predicted_class_index),
            confidence = percent,
            tier = %tier,
            "Resolved prediction"
        );

        Resolution {
            record,
            outcome,
            confidence_percent: percent,
            confidence_tier: tier,
        }
    }

    /// The "Unknown Disease" diagnosis with zero confidence
    pub fn unknown(&self) -> Resolution<'_> {
        Resolution {
            record: self.knowledge.unknown(),
            outcome: None,
            confidence_percent: 0.0,
            confidence_tier: ConfidenceTier::Low,
        }
    }

    fn select_record(&self, outcome: Option<PredictionOutcome>) -> &DiseaseRecord {
        let Some(outcome) = outcome else {
            return self.knowledge.unknown();
        };

        if outcome.raw_confidence < CONFIDENCE_GATE {
            return self.knowledge.unknown();
        }

        let Some(id) = self.class_index.get(outcome.predicted_class_index) else {
            warn!(
                index = outcome.predicted_class_index,
                classes = self.class_index.len(),
                "Predicted index outside the class index"
            );
            return self.knowledge.unknown();
        };

        match self.knowledge.get(id) {
            Some(record) => record,
            None => {
                warn!(class = %id, "Class has no knowledge base record");
                self.knowledge.unknown()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafscan_core::UNKNOWN_DISEASE_ID;
    use proptest::prelude::*;

    const PLANTVILLAGE: [&str; 15] = [
        "Pepper__bell___Bacterial_spot",
        "Pepper__bell___healthy",
        "Potato___Early_blight",
        "Potato___Late_blight",
        "Potato___healthy",
        "Tomato_Bacterial_spot",
        "Tomato_Early_blight",
        "Tomato_Late_blight",
        "Tomato_Leaf_Mold",
        "Tomato_Septoria_leaf_spot",
        "Tomato_Spider_mites_Two_spotted_spider_mite",
        "Tomato__Target_Spot",
        "Tomato__Tomato_YellowLeaf__Curl_Virus",
        "Tomato__Tomato_mosaic_virus",
        "Tomato_healthy",
    ];

    fn resolver() -> ResultResolver {
        let index = ClassIndex::new(PLANTVILLAGE.iter().map(|s| s.to_string()).collect()).unwrap();
        ResultResolver::new(Arc::new(index), Arc::new(KnowledgeBase::builtin()))
    }

    fn with_peak(position: usize, peak: f32) -> Vec<f32> {
        let mut probs = vec![0.02; PLANTVILLAGE.len()];
        probs[position] = peak;
        probs
    }

    #[test]
    fn test_confident_healthy_tomato() {
        let resolver = resolver();
        let resolution = resolver.resolve(&with_peak(14, 0.91));

        assert_eq!(resolution.record.display_name, "Healthy Tomato Plant");
        assert_eq!(resolution.confidence_percent, 91.0);
        assert_eq!(resolution.confidence_tier, ConfidenceTier::High);

        let diagnosis = resolution.to_diagnosis();
        assert_eq!(diagnosis.confidence, "91.00%");
        assert_eq!(diagnosis.confidence_level.label(), "High Confidence");
    }

    #[test]
    fn test_low_confidence_is_unknown() {
        let resolver = resolver();
        let resolution = resolver.resolve(&with_peak(3, 0.60));

        assert!(resolution.is_unknown());
        assert_eq!(resolution.record.display_name, "Uncertain Diagnosis");
        assert_eq!(resolution.confidence_percent, 60.0);
        assert_eq!(resolution.confidence_tier, ConfidenceTier::Low);
        assert_eq!(resolution.outcome.unwrap().predicted_class_index, 3);
    }

    #[test]
    fn test_gate_is_inclusive() {
        let resolver = resolver();
        let resolution = resolver.resolve(&with_peak(4, 0.75));

        assert_eq!(resolution.record.id, "Potato___healthy");
        assert_eq!(resolution.confidence_tier, ConfidenceTier::Moderate);
    }

    #[test]
    fn test_first_index_wins_ties() {
        let outcome = PredictionOutcome::from_probabilities(&[0.1, 0.45, 0.45]).unwrap();
        assert_eq!(outcome.predicted_class_index, 1);
    }

    #[test]
    fn test_nan_never_wins() {
        let outcome = PredictionOutcome::from_probabilities(&[f32::NAN, 0.3, f32::NAN]).unwrap();
        assert_eq!(outcome.predicted_class_index, 1);
        assert!(PredictionOutcome::from_probabilities(&[f32::NAN]).is_none());
    }

    #[test]
    fn test_empty_vector_is_unknown() {
        let resolver = resolver();
        let resolution = resolver.resolve(&[]);
        assert!(resolution.is_unknown());
        assert_eq!(resolution.confidence_percent, 0.0);
        assert!(resolution.outcome.is_none());
    }

    #[test]
    fn test_out_of_range_index_is_unknown() {
        let index = ClassIndex::new(vec!["Tomato_healthy".to_string()]).unwrap();
        let resolver = ResultResolver::new(Arc::new(index), Arc::new(KnowledgeBase::builtin()));

        let resolution = resolver.resolve(&[0.05, 0.95]);
        assert!(resolution.is_unknown());
        assert_eq!(resolution.confidence_percent, 95.0);
    }

    #[test]
    fn test_class_missing_from_knowledge_base() {
        let index = ClassIndex::new(vec!["Corn_rust".to_string()]).unwrap();
        let resolver = ResultResolver::new(Arc::new(index), Arc::new(KnowledgeBase::builtin()));

        assert_eq!(resolver.resolve(&[0.99]).record.id, UNKNOWN_DISEASE_ID);
    }

    #[test]
    fn test_risk_comes_from_record() {
        let resolver = resolver();
        let late_blight = resolver.resolve(&with_peak(3, 0.76));
        assert_eq!(late_blight.record.risk, leafscan_core::RiskLevel::Critical);
        assert_eq!(late_blight.confidence_tier, ConfidenceTier::Moderate);
    }

    fn probability_vector() -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(0.0f32..=1.0, PLANTVILLAGE.len())
    }

    proptest! {
        #[test]
        fn prop_confident_predictions_name_the_class(
            mut probs in probability_vector(),
            position in 0..PLANTVILLAGE.len(),
            peak in 0.75f32..=1.0,
        ) {
            for p in probs.iter_mut() {
                *p = p.min(peak * 0.99);
            }
            probs[position] = peak;

            let resolver = resolver();
            let resolution = resolver.resolve(&probs);
            prop_assert_eq!(resolution.record.id.as_str(), PLANTVILLAGE[position]);
        }

        #[test]
        fn prop_unconfident_predictions_are_unknown(probs in prop::collection::vec(0.0f32..0.75, 1..32)) {
            let resolver = resolver();
            prop_assert!(resolver.resolve(&probs).is_unknown());
        }

        #[test]
        fn prop_tier_matches_percent(probs in probability_vector()) {
            let resolver = resolver();
            let resolution = resolver.resolve(&probs);
            let expected = if resolution.confidence_percent >= 90.0 {
                ConfidenceTier::High
            } else if resolution.confidence_percent >= 75.0 {
                ConfidenceTier::Moderate
            } else {
                ConfidenceTier::Low
            };
            prop_assert_eq!(resolution.confidence_tier, expected);
        }
    }
}
