//! # Distribution Catalog
//!
//! Maps catalog names to server images. Operator-level overrides from the
//! `image-overrides` key replace the image of a known entry; overrides for
//! names the catalog does not know are ignored.

use std::collections::BTreeMap;
use tracing::debug;

use crate::controller::reconciler::ValidationError;
use crate::crd::DistributionType;

/// Built-in catalog entries
pub const DISTRIBUTIONS: &[(&str, &str)] = &[
    ("starter", "docker.io/llamastack/distribution-starter:latest"),
    ("remote-vllm", "docker.io/llamastack/distribution-remote-vllm:latest"),
    (
        "meta-reference-gpu",
        "docker.io/llamastack/distribution-meta-reference-gpu:latest",
    ),
    ("postgres-demo", "docker.io/llamastack/distribution-postgres-demo:latest"),
];

/// The image a distribution resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDistribution {
    /// Catalog name, or the image when given directly
    pub active: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionCatalog {
    images: BTreeMap<String, String>,
}

impl Default for DistributionCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DistributionCatalog {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            images: DISTRIBUTIONS
                .iter()
                .map(|(name, image)| ((*name).to_string(), (*image).to_string()))
                .collect(),
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, String>) -> Self {
        for (name, image) in overrides {
            match self.images.get_mut(name) {
                Some(entry) => entry.clone_from(image),
                None => debug!(distribution = %name, "Ignoring override for unknown distribution"),
            }
        }
        self
    }

    #[must_use]
    pub fn images(&self) -> &BTreeMap<String, String> {
        &self.images
    }

    pub fn resolve(
        &self,
        distribution: &DistributionType,
    ) -> Result<ResolvedDistribution, ValidationError> {
        let name = distribution.name.as_deref().filter(|s| !s.is_empty());
        let image = distribution.image.as_deref().filter(|s| !s.is_empty());
        match (name, image) {
            (Some(name), None) => self
                .images
                .get(name)
                .map(|image| ResolvedDistribution {
                    active: name.to_string(),
                    image: image.clone(),
                })
                .ok_or_else(|| ValidationError::UnknownDistribution {
                    name: name.to_string(),
                    available: self.images.keys().cloned().collect::<Vec<_>>().join(", "),
                }),
            (None, Some(image)) => Ok(ResolvedDistribution {
                active: image.to_string(),
                image: image.to_string(),
            }),
            _ => Err(ValidationError::AmbiguousDistribution),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_name(name: &str) -> DistributionType {
        DistributionType {
            name: Some(name.to_string()),
            image: None,
        }
    }

    #[test]
    fn test_starter_resolves_to_default_image() {
        let resolved = DistributionCatalog::builtin().resolve(&by_name("starter")).unwrap();
        assert_eq!(resolved.image, "docker.io/llamastack/distribution-starter:latest");
        assert_eq!(resolved.active, "starter");
    }

    #[test]
    fn test_override_replaces_image() {
        let overrides = BTreeMap::from([
            ("starter".to_string(), "quay.io/mirror/starter:1.2".to_string()),
            ("nonexistent".to_string(), "quay.io/x:1".to_string()),
        ]);
        let catalog = DistributionCatalog::builtin().with_overrides(&overrides);

        assert_eq!(
            catalog.resolve(&by_name("starter")).unwrap().image,
            "quay.io/mirror/starter:1.2"
        );
        assert!(!catalog.images().contains_key("nonexistent"));
    }

    #[test]
    fn test_unknown_name_lists_available() {
        let err = DistributionCatalog::builtin()
            .resolve(&by_name("bogus"))
            .unwrap_err();
        assert!(err.to_string().contains("bogus"));
        assert!(err.to_string().contains("starter"));
    }

    #[test]
    fn test_direct_image() {
        let resolved = DistributionCatalog::builtin()
            .resolve(&DistributionType {
                name: None,
                image: Some("quay.io/me/stack:2".to_string()),
            })
            .unwrap();
        assert_eq!(resolved.image, "quay.io/me/stack:2");
    }

    #[test]
    fn test_both_or_neither_rejected() {
        let catalog = DistributionCatalog::builtin();
        assert_eq!(
            catalog.resolve(&DistributionType::default()),
            Err(ValidationError::AmbiguousDistribution)
        );
        assert_eq!(
            catalog.resolve(&DistributionType {
                name: Some("starter".to_string()),
                image: Some("quay.io/x:1".to_string()),
            }),
            Err(ValidationError::AmbiguousDistribution)
        );
    }
}
