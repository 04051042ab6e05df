//! Static disease knowledge base
//!
//! Read-only catalogue of disease metadata keyed by class identifier. The
//! catalogue always contains the `"Unknown Disease"` entry, which the resolver
//! falls back to whenever it cannot (or should not) name a specific disease.

use crate::class_index::ClassIndex;
use crate::error::{Error, Result};
use crate::types::{DiseaseRecord, RiskLevel};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Identifier of the universal fallback record
pub const UNKNOWN_DISEASE_ID: &str = "Unknown Disease";

/// Disease catalogue with a guaranteed fallback entry
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    records: HashMap<String, DiseaseRecord>,
    unknown: DiseaseRecord,
}

impl KnowledgeBase {
    /// Build a knowledge base from records.
    ///
    /// Fails if the `"Unknown Disease"` record is missing or an id repeats.
    pub fn new(records: impl IntoIterator<Item = DiseaseRecord>) -> Result<Self> {
        let mut map = HashMap::new();
        let mut unknown = None;

        for record in records {
            if record.id == UNKNOWN_DISEASE_ID {
                if unknown.replace(record).is_some() {
                    return Err(Error::knowledge_base(format!(
                        "duplicate record id '{}'",
                        UNKNOWN_DISEASE_ID
                    )));
                }
                continue;
            }

            if map.contains_key(&record.id) {
                return Err(Error::knowledge_base(format!(
                    "duplicate record id '{}'",
                    record.id
                )));
            }
            map.insert(record.id.clone(), record);
        }

        let unknown = unknown.ok_or_else(|| {
            Error::knowledge_base(format!("missing required '{}' record", UNKNOWN_DISEASE_ID))
        })?;

        Ok(Self {
            records: map,
            unknown,
        })
    }

    /// The built-in catalogue of PlantVillage pepper, potato and tomato classes
    pub fn builtin() -> Self {
        Self {
            records: BUILTIN
                .iter()
                .map(|entry| (entry.id.to_string(), entry.to_record()))
                .collect(),
            unknown: UNKNOWN.to_record(),
        }
    }

    /// Parse a YAML list of disease records
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let records: Vec<DiseaseRecord> = serde_yaml::from_str(yaml)
            .map_err(|e| Error::knowledge_base(format!("Failed to parse records: {}", e)))?;
        Self::new(records)
    }

    /// Load a YAML list of disease records from file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let kb = Self::from_yaml(&content)?;
        info!(path = %path.display(), records = kb.len(), "Loaded knowledge base");
        Ok(kb)
    }

    /// Get a record by id
    pub fn get(&self, id: &str) -> Option<&DiseaseRecord> {
        if id == UNKNOWN_DISEASE_ID {
            Some(&self.unknown)
        } else {
            self.records.get(id)
        }
    }

    /// Get a record by id, falling back to the "Unknown Disease" record
    pub fn lookup(&self, id: &str) -> &DiseaseRecord {
        self.get(id).unwrap_or(&self.unknown)
    }

    /// The "Unknown Disease" record
    pub fn unknown(&self) -> &DiseaseRecord {
        &self.unknown
    }

    /// Number of records, including the fallback
    pub fn len(&self) -> usize {
        self.records.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Class identifiers that have no record in this knowledge base
    pub fn missing_ids<'a>(&self, classes: &'a ClassIndex) -> Vec<&'a str> {
        classes.iter().filter(|id| self.get(id).is_none()).collect()
    }
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        Self::builtin()
    }
}

struct Entry {
    id: &'static str,
    name: &'static str,
    crop: &'static str,
    risk: RiskLevel,
    description: &'static str,
    causes: &'static [&'static str],
    treatment: &'static [&'static str],
    prevention: &'static [&'static str],
}

impl Entry {
    fn to_record(&self) -> DiseaseRecord {
        DiseaseRecord {
            id: self.id.to_string(),
            display_name: self.name.to_string(),
            crop: self.crop.to_string(),
            risk: self.risk,
            description: self.description.to_string(),
            causes: owned(self.causes),
            treatment: owned(self.treatment),
            prevention: owned(self.prevention),
        }
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const UNKNOWN: Entry = Entry {
    id: UNKNOWN_DISEASE_ID,
    name: "Uncertain Diagnosis",
    crop: "Unknown",
    risk: RiskLevel::Unknown,
    description: "The system cannot confidently identify the disease. This may be due to unclear image quality, an uncommon disease, or conditions outside the training dataset.",
    causes: &[
        "Low image quality (blur, shadows)",
        "Unrecognized disease type",
        "Insufficient training data",
        "Environmental damage (sunscald, nutrient burn)",
    ],
    treatment: &[
        "Capture clearer image in natural lighting",
        "Ensure leaf fills most of image",
        "Avoid shadows and blur",
        "Consult agricultural expert if symptoms worsen",
    ],
    prevention: &[
        "Monitor plant condition regularly",
        "Maintain proper watering schedule",
        "Ensure balanced soil nutrients",
        "Protect from extreme weather",
    ],
};

const BUILTIN: &[Entry] = &[
    Entry {
        id: "Pepper__bell___Bacterial_spot",
        name: "Pepper Bacterial Spot",
        crop: "Pepper (Bell)",
        risk: RiskLevel::High,
        description: "Bacterial Spot is a serious disease of pepper caused by Xanthomonas campestris pv. vesicatoria. It causes spots on leaves and fruits, leading to defoliation and unmarketable fruit.",
        causes: &[
            "Periods of high humidity and rain",
            "Infected seeds or transplants",
            "Warm temperatures (24-30°C)",
            "Water splashing from overhead irrigation",
        ],
        treatment: &[
            "Apply copper-based bactericides covering all foliage",
            "Remove and destroy infected plant debris immediately",
            "Prune plants to improve air circulation",
            "Use streptomycin sulfate if permitted",
        ],
        prevention: &[
            "Use disease-free certified seeds",
            "Practice crop rotation with non-host crops (e.g., corn, beans)",
            "Avoid overhead irrigation; use drip irrigation",
            "Sanitize tools and equipment regularly",
        ],
    },
    Entry {
        id: "Pepper__bell___healthy",
        name: "Healthy Pepper Plant",
        crop: "Pepper (Bell)",
        risk: RiskLevel::None,
        description: "The pepper plant appears healthy with vibrant green leaves and no signs of bacterial spot or other infections.",
        causes: &[],
        treatment: &[
            "No treatment required",
        ],
        prevention: &[
            "Maintain consistent watering schedule",
            "Fertilize with balanced nutrients",
            "Monitor regularly for pests like aphids",
        ],
    },
    Entry {
        id: "Potato___Early_blight",
        name: "Potato Early Blight",
        crop: "Potato",
        risk: RiskLevel::Moderate,
        description: "Early Blight is a common fungal disease caused by Alternaria solani. It manifests as target-like spots with concentric rings on leaves, primarily affecting older foliage first.",
        causes: &[
            "Alternaria solani fungus",
            "Alternating wet and dry conditions",
            "Nutrient stress (especially Nitrogen deficiency)",
            "Plant aging (susceptibility increases with maturity)",
        ],
        treatment: &[
            "Apply fungicides like Chlorothalonil, Mancozeb, or Azoxystrobin",
            "Remove infected lower leaves to reduce inoculum",
            "Maintain plant vigor through proper fertilization",
        ],
        prevention: &[
            "Rotate crops every 2-3 years",
            "Use certified disease-free seed tubers",
            "Mulch soil to prevent fungal spore splash",
            "Harvest when vines are completely dry",
        ],
    },
    Entry {
        id: "Potato___Late_blight",
        name: "Potato Late Blight",
        crop: "Potato",
        risk: RiskLevel::Critical,
        description: "Late Blight is a devastating disease caused by the oomycete Phytophthora infestans. It causes rapid necrosis of leaves and stems and can rot tubers, potentially destroying entire crops.",
        causes: &[
            "Phytophthora infestans pathogen",
            "Cool, moist weather conditions",
            "Infected cull piles or volunteer plants",
            "Wind-blown spores from nearby fields",
        ],
        treatment: &[
            "Apply systemic fungicides (e.g., Metalaxyl/Mefenoxam) immediately",
            "Destroy all infected plant material (do not compost)",
            "Kill vines 2-3 weeks before harvest to protect tubers",
        ],
        prevention: &[
            "Plant resistant potato varieties",
            "Eliminate all cull piles and volunteer potatoes",
            "Implement a preventative fungicide schedule",
            "Avoid overhead irrigation",
        ],
    },
    Entry {
        id: "Potato___healthy",
        name: "Healthy Potato Plant",
        crop: "Potato",
        risk: RiskLevel::None,
        description: "The potato plant shows vigorous growth with no signs of blight, yellowing, or lesions.",
        causes: &[],
        treatment: &[
            "No treatment required",
        ],
        prevention: &[
            "Hill soil around base to protect tubers",
            "Ensure proper drainage to prevent rot",
            "Scout for Colorado Potato Beetle",
        ],
    },
    Entry {
        id: "Tomato_Bacterial_spot",
        name: "Tomato Bacterial Spot",
        crop: "Tomato",
        risk: RiskLevel::High,
        description: "Bacterial Spot is caused by several species of Xanthomonas. It causes dark, water-soaked spots on leaves and raised scabs on fruit, significantly reducing quality.",
        causes: &[
            "Xanthomonas bacteria",
            "High humidity and rainfall",
            "Contaminated seeds",
            "Handling wet plants",
        ],
        treatment: &[
            "Spray with fixed copper mixed with mancozeb",
            "Remove symptomatic plants if infestation is localized",
            "Avoid working in the garden when foliage is wet",
        ],
        prevention: &[
            "Use pathogen-free seed and transplants",
            "Sanitize stakes and cages before reuse",
            "Rotate away from solanaceous crops for 2 years",
            "Control weeds (nightshades)",
        ],
    },
    Entry {
        id: "Tomato_Early_blight",
        name: "Tomato Early Blight",
        crop: "Tomato",
        risk: RiskLevel::Moderate,
        description: "Early Blight is a fungal disease caused by Alternaria solani. It appears as dark brown spots with concentric rings, usually starting on older leaves. It spreads rapidly in warm and humid conditions.",
        causes: &[
            "High humidity and warm temperature",
            "Overwatering or poor drainage",
            "Infected soil or plant debris",
            "Lack of crop rotation",
        ],
        treatment: &[
            "Remove infected leaves immediately to prevent spread",
            "Apply fungicides such as Mancozeb, Chlorothalonil, or Copper-based fungicides",
            "Avoid overhead watering",
            "Improve air circulation between plants",
        ],
        prevention: &[
            "Use disease-resistant seed varieties",
            "Practice crop rotation every season",
            "Keep soil well-drained",
            "Monitor plants regularly",
            "Maintain proper plant spacing",
        ],
    },
    Entry {
        id: "Tomato_Late_blight",
        name: "Tomato Late Blight",
        crop: "Tomato",
        risk: RiskLevel::Critical,
        description: "Late Blight is a highly destructive disease caused by Phytophthora infestans. It causes large, dark, water-soaked spots on leaves and stems, and can kill plants rapidly.",
        causes: &[
            "Cool, wet weather",
            "Phytophthora infestans spores",
            "Nearby infected potato fields",
            "High humidity (>90%)",
        ],
        treatment: &[
            "Apply protective fungicides (Chlorothalonil/Copper) proactively",
            "Remove and BAG infected plants immediately (disturbs spores)",
            "Do not compost infected material",
        ],
        prevention: &[
            "Plant resistant varieties (e.g., 'Mountain Magic')",
            "Space plants widely for airflow",
            "Water at the base of the plant only",
            "Scout daily in cool/wet weather",
        ],
    },
    Entry {
        id: "Tomato_Leaf_Mold",
        name: "Tomato Leaf Mold",
        crop: "Tomato",
        risk: RiskLevel::Low,
        description: "Leaf Mold is primarily a greenhouse disease caused by Passalora fulva. It causes yellow spots on upper leaf surfaces and olive-green mold on the undersides.",
        causes: &[
            "High relative humidity (>85%)",
            "Poor air circulation",
            "Cool to warm temperatures",
            "Greenhouse cultivation without venting",
        ],
        treatment: &[
            "Apply fungicides if infection is severe",
            "Prune lower leaves to open up the canopy",
            "Increase ventilation/fans",
        ],
        prevention: &[
            "Keep humidity below 85%",
            "Use drip irrigation",
            "Plant resistant cultivars",
            "Sanitize greenhouse structures",
        ],
    },
    Entry {
        id: "Tomato_Septoria_leaf_spot",
        name: "Tomato Septoria Leaf Spot",
        crop: "Tomato",
        risk: RiskLevel::Moderate,
        description: "Septoria Leaf Spot is a fungal disease that causes numerous small, circular spots with dark borders and gray centers. It causes defoliation of lower leaves.",
        causes: &[
            "Septoria lycopersici fungus",
            "Warm, wet weather",
            "Splashing water (rain or overhead irrigation)",
            "Plant overcrowding",
        ],
        treatment: &[
            "Apply fungicides (Chlorothalonil/Copper/Mancozeb)",
            "Remove infected leaves from the bottom up",
            "Clean up all plant debris at end of season",
        ],
        prevention: &[
            "Mulch around base of plants to cover soil",
            "Water at the base only",
            "Rotate crops every 3 years",
            "Control horsenettle and other weeds",
        ],
    },
    Entry {
        id: "Tomato_Spider_mites_Two_spotted_spider_mite",
        name: "Two-spotted Spider Mite",
        crop: "Tomato",
        risk: RiskLevel::Moderate,
        description: "Spider mites are tiny arachnids that suck sap from leaves, causing yellow stippling (dots). Heavy infestations produce fine webbing and leaf browning.",
        causes: &[
            "Hot, dry conditions",
            "Dusty environments",
            "Water stress in plants",
            "Lack of natural predators",
        ],
        treatment: &[
            "Spray with a strong stream of water to dislodge mites",
            "Apply insecticidal soap or neem oil",
            "Release predatory mites (biological control)",
        ],
        prevention: &[
            "Keep plants well-watered (mites hate humidity)",
            "Reduce dust on leaves",
            "Avoid broad-spectrum insecticides (kills predators)",
        ],
    },
    Entry {
        id: "Tomato__Target_Spot",
        name: "Tomato Target Spot",
        crop: "Tomato",
        risk: RiskLevel::Moderate,
        description: "Target Spot is a fungal disease caused by Corynespora cassiicola. It creates brown lesions with faint concentric rings (targets) on leaves and fruit.",
        causes: &[
            "High humidity and warm temperatures",
            "Poor air circulation",
            "Infected plant debris",
            "Wind-dispersed spores",
        ],
        treatment: &[
            "Apply fungicides (e.g., Azoxystrobin, Chlorothalonil)",
            "Remove infected plant parts",
            "Improve airflow by pruning",
        ],
        prevention: &[
            "Avoid overhead irrigation",
            "Clean up crop debris",
            "Rotate away from hosts (incl. cucumber, papaya)",
            "Ensure proper spacing",
        ],
    },
    Entry {
        id: "Tomato__Tomato_YellowLeaf__Curl_Virus",
        name: "Tomato Yellow Leaf Curl Virus",
        crop: "Tomato",
        risk: RiskLevel::High,
        description: "TYLCV is a viral disease transmitted by whiteflies. It causes severe stunting, leaf curling/yellowing, and flower drop. Infected plants often produce no fruit.",
        causes: &[
            "Silverleaf Whitefly vector",
            "Presence of viral reservoir weeds",
            "Warm seasons favoring whiteflies",
        ],
        treatment: &[
            "Remove and destroy infected plants immediately (virus cannot be cured)",
            "Control whitefly populations (soaps/oils)",
            "Use reflective mulches to repel vectors",
        ],
        prevention: &[
            "Plant TYLCV-resistant varieties",
            "Use 50-60 mesh screens to exclude whiteflies",
            "Manage weeds near the field",
            "Avoid planting near older infected crops",
        ],
    },
    Entry {
        id: "Tomato__Tomato_mosaic_virus",
        name: "Tomato Mosaic Virus",
        crop: "Tomato",
        risk: RiskLevel::High,
        description: "ToMV causes mottling (light/dark green patterns), leaf distortion (fern-leaf), and uneven fruit ripening. It is highly contagious.",
        causes: &[
            "Mechanical transmission (hands, tools)",
            "Contaminated seeds",
            "Infected soil debris",
            "Smokers (tobacco can carry the virus)",
        ],
        treatment: &[
            "Remove and burn infected plants",
            "Disinfect tools with 10% bleach solution",
            "Wash hands thoroughly with soap (especially smokers)",
        ],
        prevention: &[
            "Plant resistant varieties (Tm-1, Tm-2 genes)",
            "Soak seeds in 10% trisodium phosphate (TSP)",
            "Sanitize greenhouse benches and pots",
            "Avoid handling plants unnecessarily",
        ],
    },
    Entry {
        id: "Tomato_healthy",
        name: "Healthy Tomato Plant",
        crop: "Tomato",
        risk: RiskLevel::None,
        description: "The plant appears healthy with no visible signs of disease or infection.",
        causes: &[],
        treatment: &[
            "No treatment required",
        ],
        prevention: &[
            "Continue proper watering",
            "Provide sufficient sunlight",
            "Maintain balanced fertilization",
            "Monitor regularly",
        ],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> DiseaseRecord {
        DiseaseRecord {
            id: id.to_string(),
            display_name: id.to_string(),
            crop: "Test".to_string(),
            risk: RiskLevel::Low,
            description: String::new(),
            causes: vec![],
            treatment: vec![],
            prevention: vec![],
        }
    }

    #[test]
    fn test_builtin_contains_all_classes() {
        let kb = KnowledgeBase::builtin();
        assert_eq!(kb.len(), 16);

        let healthy = kb.get("Tomato_healthy").unwrap();
        assert_eq!(healthy.display_name, "Healthy Tomato Plant");
        assert_eq!(healthy.risk, RiskLevel::None);
        assert!(healthy.causes.is_empty());

        let blight = kb.get("Potato___Late_blight").unwrap();
        assert_eq!(blight.risk, RiskLevel::Critical);
        assert_eq!(blight.crop, "Potato");
    }

    #[test]
    fn test_unknown_fallback() {
        let kb = KnowledgeBase::builtin();
        let unknown = kb.lookup("Grape___Black_rot");
        assert_eq!(unknown.id, UNKNOWN_DISEASE_ID);
        assert_eq!(unknown.display_name, "Uncertain Diagnosis");
        assert_eq!(unknown.risk, RiskLevel::Unknown);
        assert_eq!(kb.get(UNKNOWN_DISEASE_ID), Some(kb.unknown()));
    }

    #[test]
    fn test_missing_sentinel_rejected() {
        let result = KnowledgeBase::new(vec![record("Tomato_healthy")]);
        assert!(matches!(result, Err(Error::KnowledgeBase(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = KnowledgeBase::new(vec![
            record(UNKNOWN_DISEASE_ID),
            record("Tomato_healthy"),
            record("Tomato_healthy"),
        ]);
        assert!(matches!(result, Err(Error::KnowledgeBase(_))));
    }

    #[test]
    fn test_missing_ids() {
        let kb = KnowledgeBase::builtin();
        let classes = ClassIndex::new(vec![
            "Tomato_healthy".to_string(),
            "Corn___Common_rust".to_string(),
        ])
        .unwrap();

        assert_eq!(kb.missing_ids(&classes), vec!["Corn___Common_rust"]);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
- id: "Unknown Disease"
  display_name: "Uncertain Diagnosis"
  crop: "Unknown"
  risk: Unknown
  description: "Cannot identify"
- id: "Apple___Apple_scab"
  display_name: "Apple Scab"
  crop: "Apple"
  risk: Moderate
  description: "Fungal disease caused by Venturia inaequalis"
  treatment:
    - "Apply captan or sulfur sprays"
"#;

        let kb = KnowledgeBase::from_yaml(yaml).unwrap();
        assert_eq!(kb.len(), 2);
        let scab = kb.get("Apple___Apple_scab").unwrap();
        assert_eq!(scab.risk, RiskLevel::Moderate);
        assert_eq!(scab.treatment.len(), 1);
        assert!(scab.prevention.is_empty());
    }
}
