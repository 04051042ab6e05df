//! Positional mapping from model outputs to disease identifiers

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Ordered class identifiers produced at training time.
///
/// Index `i` of the model's output vector corresponds to `ClassIndex[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassIndex {
    names: Vec<String>,
}

impl ClassIndex {
    /// Create a class index from an ordered list of identifiers
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::config("class index is empty"));
        }

        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                warn!(class = %name, "Duplicate entry in class index");
            }
        }

        Ok(Self { names })
    }

    /// Parse a JSON array of class identifiers
    pub fn from_json(json: &str) -> Result<Self> {
        let names: Vec<String> = serde_json::from_str(json)?;
        Self::new(names)
    }

    /// Load a JSON array of class identifiers from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read class index {}: {}", path.display(), e))
        })?;

        let index = Self::from_json(&content)?;
        info!(path = %path.display(), classes = index.len(), "Loaded class index");
        Ok(index)
    }

    /// Identifier at an output position
    pub fn get(&self, position: usize) -> Option<&str> {
        self.names.get(position).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_positional_lookup() {
        let index = ClassIndex::from_json(r#"["Potato___healthy", "Tomato_healthy"]"#).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(1), Some("Tomato_healthy"));
        assert_eq!(index.get(2), None);
    }

    #[test]
    fn test_empty_index_rejected() {
        assert!(matches!(ClassIndex::from_json("[]"), Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            ClassIndex::from_json(r#"{"0": "Tomato_healthy"}"#),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"["a", "b", "c"]"#).unwrap();

        let index = ClassIndex::from_file(file.path()).unwrap();
        assert_eq!(index.iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_missing_file() {
        let result = ClassIndex::from_file("/nonexistent/class_names.json");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
