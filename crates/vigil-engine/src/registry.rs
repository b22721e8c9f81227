//! Registry of perception models known to the deployment.

use std::collections::BTreeMap;
use thiserror::Error;

use vigil_models::{ModelCapability, ModelId};

/// Error parsing a `name:capability` model list.
#[derive(Debug, Error)]
#[error("Invalid model entry '{entry}': {reason}")]
pub struct RegistryParseError {
    pub entry: String,
    pub reason: String,
}

/// Model id → capability map used to validate rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRegistry {
    models: BTreeMap<ModelId, ModelCapability>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with_model(mut self, id: impl Into<ModelId>, capability: ModelCapability) -> Self {
        self.register(id, capability);
        self
    }

    pub fn register(&mut self, id: impl Into<ModelId>, capability: ModelCapability) {
        self.models.insert(id.into(), capability);
    }

    pub fn capability(&self, id: &ModelId) -> Option<ModelCapability> {
        self.models.get(id).copied()
    }

    pub fn contains(&self, id: &ModelId) -> bool {
        self.models.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModelId, ModelCapability)> {
        self.models.iter().map(|(id, cap)| (id, *cap))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Parse `detector:object_detection,pose:pose_estimation`.
    pub fn parse_list(list: &str) -> Result<Self, RegistryParseError> {
        let mut registry = Self::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, capability) = entry.split_once(':').ok_or_else(|| RegistryParseError {
                entry: entry.to_string(),
                reason: "expected <model>:<capability>".to_string(),
            })?;
            let capability = capability.parse().map_err(|e: vigil_models::ModelCapabilityParseError| {
                RegistryParseError {
                    entry: entry.to_string(),
                    reason: e.to_string(),
                }
            })?;
            registry.register(name.trim(), capability);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_list() {
        let registry = ModelRegistry::parse_list("detector:object_detection, pose:pose").unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.capability(&ModelId::from("pose")),
            Some(ModelCapability::PoseEstimation)
        );
        assert!(!registry.contains(&ModelId::from("depth")));
    }

    #[test]
    fn test_parse_model_list_rejects_bad_entries() {
        assert!(ModelRegistry::parse_list("detector").is_err());
        assert!(ModelRegistry::parse_list("detector:depth").is_err());
        assert!(ModelRegistry::parse_list("").unwrap().is_empty());
    }
}
