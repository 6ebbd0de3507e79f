//! Model metadata and versioning structures

use serde::{Deserialize, Serialize};

/// Semantic version for models
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModelVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("Invalid version format: {s}"));
        }
        let field = |i: usize, what: &str| -> Result<u32, String> {
            parts[i]
                .parse()
                .map_err(|_| format!("Invalid {what} version: {}", parts[i]))
        };
        Ok(Self::new(
            field(0, "major")?,
            field(1, "minor")?,
            field(2, "patch")?,
        ))
    }
}

impl Default for ModelVersion {
    fn default() -> Self {
        Self::new(0, 1, 0)
    }
}

impl std::fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// Stored as "major.minor.patch" in model files.
impl Serialize for ModelVersion {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModelVersion {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        ModelVersion::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Descriptive fields carried next to the layer graph in a model file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Model name
    #[serde(default)]
    pub name: String,
    /// Model version
    #[serde(default)]
    pub version: ModelVersion,
    /// Model description
    #[serde(default)]
    pub description: Option<String>,
    /// Output class names in output-column order, when the exporter recorded them
    #[serde(default)]
    pub class_names: Vec<String>,
}
