//! Static embedding model registry.
//!
//! The registry is a compiled-in table of every embedding model anchorage
//! can bind a collection to. Lookups never touch the network or the disk.

use crate::error::{Error, Result};
use crate::model::{ModelDescriptor, Provider};

/// Every known model, in declaration order.
pub static MODELS: &[ModelDescriptor] = &[
    ModelDescriptor::new(
        "sentence-transformers/all-MiniLM-L6-v2",
        384,
        Provider::FastEmbed,
        "Lightweight, fast model good for general use",
    ),
    ModelDescriptor::new(
        "sentence-transformers/all-mpnet-base-v2",
        768,
        Provider::FastEmbed,
        "High quality, balanced performance",
    ),
    ModelDescriptor::new(
        "BAAI/bge-small-en-v1.5",
        384,
        Provider::FastEmbed,
        "Compact model optimized for English",
    ),
    ModelDescriptor::new(
        "BAAI/bge-base-en-v1.5",
        768,
        Provider::FastEmbed,
        "Better quality English embeddings",
    ),
    ModelDescriptor::new(
        "BAAI/bge-large-en-v1.5",
        1024,
        Provider::FastEmbed,
        "Highest quality English embeddings",
    ),
    ModelDescriptor::new(
        "sentence-transformers/all-MiniLM-L12-v2",
        384,
        Provider::FastEmbed,
        "Slightly larger than L6, better quality",
    ),
    ModelDescriptor::new(
        "thenlper/gte-small",
        384,
        Provider::FastEmbed,
        "General text embeddings, small variant",
    ),
    ModelDescriptor::new(
        "thenlper/gte-base",
        768,
        Provider::FastEmbed,
        "General text embeddings, base variant",
    ),
    ModelDescriptor::new(
        "thenlper/gte-large",
        1024,
        Provider::FastEmbed,
        "General text embeddings, large variant",
    ),
    ModelDescriptor::new(
        "intfloat/e5-small-v2",
        384,
        Provider::FastEmbed,
        "E5 family, small and efficient",
    ),
    ModelDescriptor::new(
        "intfloat/e5-base-v2",
        768,
        Provider::FastEmbed,
        "E5 family, balanced performance",
    ),
    ModelDescriptor::new(
        "intfloat/e5-large-v2",
        1024,
        Provider::FastEmbed,
        "E5 family, highest quality",
    ),
    ModelDescriptor::new(
        "text-embedding-3-small",
        1536,
        Provider::OpenAi,
        "OpenAI hosted, small",
    ),
    ModelDescriptor::new(
        "text-embedding-3-large",
        3072,
        Provider::OpenAi,
        "OpenAI hosted, large",
    ),
];

/// The model chosen when only a width is known and several models share it.
static CANONICAL_DEFAULTS: &[(usize, &str)] = &[
    (384, "sentence-transformers/all-MiniLM-L6-v2"),
    (768, "sentence-transformers/all-mpnet-base-v2"),
    (1024, "BAAI/bge-large-en-v1.5"),
];

/// The model used when nothing else is configured.
pub const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// All known models, in declaration order.
#[must_use]
pub fn list() -> &'static [ModelDescriptor] {
    MODELS
}

/// Look up a model by its canonical name.
pub fn resolve_by_name(name: &str) -> Result<&'static ModelDescriptor> {
    MODELS
        .iter()
        .find(|model| model.name == name)
        .ok_or_else(|| Error::ModelNotFound {
            name: name.to_string(),
        })
}

/// Pick the model to use for a desired vector width.
///
/// Prefers the canonical default for that width; otherwise the first
/// model of that width in declaration order.
pub fn resolve_by_width(width: usize) -> Result<&'static ModelDescriptor> {
    if let Some((_, name)) = CANONICAL_DEFAULTS.iter().find(|(w, _)| *w == width) {
        if let Ok(model) = resolve_by_name(name) {
            return Ok(model);
        }
    }

    MODELS
        .iter()
        .find(|model| model.width == width)
        .ok_or(Error::NoCandidate { width })
}

/// Every model producing vectors of the given width.
pub fn models_with_width(width: usize) -> impl Iterator<Item = &'static ModelDescriptor> {
    MODELS.iter().filter(move |model| model.width == width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_resolve_by_name() {
        let model = resolve_by_name("BAAI/bge-base-en-v1.5").unwrap();
        assert_eq!(model.width, 768);
        assert_eq!(model.provider, Provider::FastEmbed);
    }

    #[test]
    fn test_resolve_by_name_unknown() {
        let err = resolve_by_name("acme/unknown").unwrap_err();
        assert!(matches!(err, Error::ModelNotFound { ref name } if name == "acme/unknown"));
    }

    #[test]
    fn test_resolve_by_width_prefers_canonical_default() {
        assert_eq!(resolve_by_width(384).unwrap().name, DEFAULT_MODEL);
        assert_eq!(
            resolve_by_width(768).unwrap().name,
            "sentence-transformers/all-mpnet-base-v2"
        );
        assert_eq!(resolve_by_width(1024).unwrap().name, "BAAI/bge-large-en-v1.5");
    }

    #[test]
    fn test_resolve_by_width_single_candidate() {
        assert_eq!(resolve_by_width(1536).unwrap().name, "text-embedding-3-small");
    }

    #[test]
    fn test_resolve_by_width_no_candidate() {
        let err = resolve_by_width(42).unwrap_err();
        assert!(matches!(err, Error::NoCandidate { width: 42 }));
    }

    #[test]
    fn test_resolve_by_width_is_deterministic() {
        let first = resolve_by_width(768).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve_by_width(768).unwrap(), first);
        }
    }

    #[test]
    fn test_registry_names_are_unique() {
        let names: HashSet<_> = list().iter().map(|m| m.name).collect();
        assert_eq!(names.len(), list().len());
    }

    #[test]
    fn test_registry_widths_are_positive() {
        assert!(list().iter().all(|m| m.width > 0));
    }

    #[test]
    fn test_canonical_defaults_exist_in_table() {
        for (width, name) in CANONICAL_DEFAULTS {
            let model = resolve_by_name(name).unwrap();
            assert_eq!(model.width, *width);
        }
    }

    #[test]
    fn test_models_with_width() {
        let names: Vec<_> = models_with_width(1024).map(|m| m.name).collect();
        assert_eq!(
            names,
            vec![
                "BAAI/bge-large-en-v1.5",
                "thenlper/gte-large",
                "intfloat/e5-large-v2"
            ]
        );
    }
}
