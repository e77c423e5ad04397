//! The dimension consistency gate.
//!
//! Every store and search goes through [`DimensionValidator::prepare_vector`],
//! which resolves the collection's bound model (binding it on first use),
//! embeds the text with that model and refuses to hand back a vector whose
//! length differs from the model's declared width.

use std::sync::Arc;

use anchorage_core::{registry, CollectionBinding, Distance, ModelDescriptor};

use crate::association::AssociationStore;
use crate::embedding::{ProviderCache, ProviderFactory};
use crate::error::{BindingError, BindingResult};

/// A vector that is safe to write to (or query) its collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedVector {
    pub vector: Vec<f32>,
    pub binding: CollectionBinding,
    pub model: &'static ModelDescriptor,
}

/// Model and metric hints supplied with a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingHints<'a> {
    pub model: Option<&'a str>,
    pub width: Option<usize>,
    /// Metric for a first binding; the configured default when `None`.
    pub distance: Option<Distance>,
}

impl<'a> BindingHints<'a> {
    #[must_use]
    pub const fn new(model: Option<&'a str>, width: Option<usize>) -> Self {
        Self {
            model,
            width,
            distance: None,
        }
    }

    #[must_use]
    pub const fn with_distance(mut self, distance: Option<Distance>) -> Self {
        self.distance = distance;
        self
    }
}

#[derive(Debug)]
pub struct DimensionValidator {
    associations: Arc<AssociationStore>,
    providers: ProviderCache,
    default_distance: Distance,
}

impl DimensionValidator {
    pub fn new(
        associations: Arc<AssociationStore>,
        factory: Arc<dyn ProviderFactory>,
        default_distance: Distance,
    ) -> Self {
        Self {
            associations,
            providers: ProviderCache::new(factory),
            default_distance,
        }
    }

    pub fn associations(&self) -> &Arc<AssociationStore> {
        &self.associations
    }

    /// Embed `text` for `collection`, enforcing its binding.
    pub async fn prepare_vector(
        &self,
        collection: &str,
        requested_model: Option<&str>,
        requested_width: Option<usize>,
        text: &str,
    ) -> BindingResult<PreparedVector> {
        let binding = self
            .resolve_binding(collection, BindingHints::new(requested_model, requested_width))
            .await?;
        self.embed(binding, text).await
    }

    /// Embed `text` with the model `binding` names and check its width.
    pub async fn embed(
        &self,
        binding: CollectionBinding,
        text: &str,
    ) -> BindingResult<PreparedVector> {
        let model = registry::resolve_by_name(&binding.model)?;
        let provider = self.providers.get(model)?;
        let vector = provider.embed(text).await?;

        if vector.len() != model.width {
            log::error!(
                "Embedding for '{}' with {} has {} dimensions, expected {}",
                binding.collection,
                model.name,
                vector.len(),
                model.width
            );
            return Err(BindingError::EmbeddingWidthFault {
                collection: binding.collection,
                model: model.name.to_string(),
                expected: model.width,
                actual: vector.len(),
            });
        }

        Ok(PreparedVector {
            vector,
            binding,
            model,
        })
    }

    /// The binding to use for `collection`, creating one from `hints` when
    /// the collection has never been bound.
    pub async fn resolve_binding(
        &self,
        collection: &str,
        hints: BindingHints<'_>,
    ) -> BindingResult<CollectionBinding> {
        if let Some(binding) = self.associations.get_binding(collection).await? {
            return Self::honour_existing(binding, hints);
        }

        let model = match (hints.model, hints.width) {
            (Some(name), width) => {
                let model = registry::resolve_by_name(name)?;
                if let Some(width) = width.filter(|w| *w != model.width) {
                    return Err(BindingError::ConflictingHints {
                        model: model.name.to_string(),
                        model_width: model.width,
                        requested_width: width,
                    });
                }
                model
            }
            (None, Some(width)) => registry::resolve_by_width(width)?,
            (None, None) => {
                return Err(BindingError::AmbiguousModel {
                    collection: collection.to_string(),
                })
            }
        };

        // An unbound but existing collection keeps the metric it was made with.
        let distance = match hints.distance {
            Some(distance) => distance,
            None => self
                .associations
                .physical(collection)
                .await?
                .map_or(self.default_distance, |info| info.distance),
        };
        match self
            .associations
            .create_binding(collection, model.name, distance)
            .await
        {
            Err(BindingError::AlreadyBound { .. }) => {
                // Another caller bound it first; theirs is authoritative.
                let winner = self.associations.get_binding(collection).await?.ok_or_else(|| {
                    BindingError::NotBound {
                        collection: collection.to_string(),
                    }
                })?;
                log::debug!(
                    "Lost first binding of '{}' to {}; using it",
                    collection,
                    winner.model
                );
                Self::honour_existing(winner, hints)
            }
            other => other,
        }
    }

    fn honour_existing(
        binding: CollectionBinding,
        hints: BindingHints<'_>,
    ) -> BindingResult<CollectionBinding> {
        if let Some(requested) = hints.model.filter(|m| *m != binding.model) {
            return Err(BindingError::ModelMismatch {
                collection: binding.collection,
                bound: binding.model,
                requested: requested.to_string(),
            });
        }
        if let Some(distance) = hints.distance.filter(|d| *d != binding.distance) {
            return Err(BindingError::AlreadyBound {
                collection: binding.collection,
                existing_model: binding.model.clone(),
                existing_distance: binding.distance,
                requested_model: binding.model,
                requested_distance: distance,
            });
        }
        if let Some(width) = hints.width {
            if registry::resolve_by_name(&binding.model).is_ok_and(|m| m.width != width) {
                log::debug!(
                    "Ignoring width hint {} for '{}'; bound to {}",
                    width,
                    binding.collection,
                    binding.model
                );
            }
        }
        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingProvider;
    use crate::error::EmbedError;
    use anchorage_store::{InMemoryStore, RetryPolicy, VectorStore};
    use async_trait::async_trait;

    const MPNET: &str = "sentence-transformers/all-mpnet-base-v2";
    const MINILM: &str = "sentence-transformers/all-MiniLM-L6-v2";

    /// Returns vectors of a fixed width.
    #[derive(Debug)]
    struct FixedWidth(usize);

    #[async_trait]
    impl EmbeddingProvider for FixedWidth {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(vec![0.5; self.0])
        }
    }

    #[derive(Debug, Default)]
    struct Factory {
        override_width: Option<usize>,
    }

    impl ProviderFactory for Factory {
        fn create(
            &self,
            model: &'static ModelDescriptor,
        ) -> Result<Arc<dyn EmbeddingProvider>, EmbedError> {
            Ok(Arc::new(FixedWidth(self.override_width.unwrap_or(model.width))))
        }
    }

    fn validator_with(factory: Factory) -> (Arc<InMemoryStore>, DimensionValidator) {
        let store = Arc::new(InMemoryStore::new());
        let associations = Arc::new(AssociationStore::new(
            Arc::clone(&store) as Arc<dyn VectorStore>,
            "_anchorage_bindings",
            RetryPolicy::default(),
        ));
        let validator = DimensionValidator::new(associations, Arc::new(factory), Distance::Cosine);
        (store, validator)
    }

    #[tokio::test]
    async fn test_no_hint_is_ambiguous() {
        let (_, validator) = validator_with(Factory::default());
        let err = validator
            .prepare_vector("docs", None, None, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, BindingError::AmbiguousModel { .. }));
    }

    #[tokio::test]
    async fn test_width_hint_binds_canonical_default() {
        let (_, validator) = validator_with(Factory::default());
        let prepared = validator
            .prepare_vector("docs", None, Some(384), "hello")
            .await
            .unwrap();
        assert_eq!(prepared.binding.model, MINILM);
        assert_eq!(prepared.binding.distance, Distance::Cosine);
        assert_eq!(prepared.vector.len(), 384);
    }

    #[tokio::test]
    async fn test_existing_binding_wins_over_width_hint() {
        let (_, validator) = validator_with(Factory::default());
        validator
            .associations()
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap();

        let prepared = validator
            .prepare_vector("docs", None, None, "hello")
            .await
            .unwrap();
        assert_eq!(prepared.vector.len(), 768);

        let prepared = validator
            .prepare_vector("docs", None, Some(384), "hello")
            .await
            .unwrap();
        assert_eq!(prepared.vector.len(), 768);
        assert_eq!(prepared.model.name, MPNET);
    }

    #[tokio::test]
    async fn test_model_mismatch_is_refused() {
        let (_, validator) = validator_with(Factory::default());
        validator
            .associations()
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap();

        let err = validator
            .prepare_vector("docs", Some(MINILM), None, "hello")
            .await
            .unwrap_err();
        match err {
            BindingError::ModelMismatch { bound, requested, .. } => {
                assert_eq!(bound, MPNET);
                assert_eq!(requested, MINILM);
            }
            other => panic!("expected ModelMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_conflicting_hints_on_first_binding() {
        let (store, validator) = validator_with(Factory::default());
        let err = validator
            .prepare_vector("docs", Some(MPNET), Some(384), "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, BindingError::ConflictingHints { .. }));
        assert!(!store.collection_exists("_anchorage_bindings").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_width_embedding_is_a_fault() {
        let (_, validator) = validator_with(Factory {
            override_width: Some(512),
        });
        let err = validator
            .prepare_vector("docs", Some(MPNET), None, "hello")
            .await
            .unwrap_err();
        match err {
            BindingError::EmbeddingWidthFault {
                expected, actual, ..
            } => {
                assert_eq!(expected, 768);
                assert_eq!(actual, 512);
            }
            other => panic!("expected EmbeddingWidthFault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_width_has_no_candidate() {
        let (_, validator) = validator_with(Factory::default());
        let err = validator
            .prepare_vector("docs", None, Some(100), "hello")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BindingError::Registry(anchorage_core::Error::NoCandidate { width: 100 })
        ));
    }

    #[tokio::test]
    async fn test_first_binding_adopts_existing_collection_metric() {
        let (store, validator) = validator_with(Factory::default());
        store.create_collection("docs", 384, Distance::Dot).await.unwrap();

        let binding = validator
            .resolve_binding("docs", BindingHints::new(None, Some(384)))
            .await
            .unwrap();
        assert_eq!(binding.model, MINILM);
        assert_eq!(binding.distance, Distance::Dot);
    }

    #[tokio::test]
    async fn test_first_binding_refuses_existing_collection_of_other_width() {
        let (store, validator) = validator_with(Factory::default());
        store.create_collection("docs", 384, Distance::Cosine).await.unwrap();

        let err = validator
            .prepare_vector("docs", Some(MPNET), None, "hello")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BindingError::ShapeMismatch {
                expected_width: 768,
                actual_width: 384,
                ..
            }
        ));
        assert_eq!(validator.associations().get_binding("docs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_distance_hint_conflicts_with_existing_binding() {
        let (_, validator) = validator_with(Factory::default());
        validator
            .associations()
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap();
        let err = validator
            .resolve_binding(
                "docs",
                BindingHints::new(None, None).with_distance(Some(Distance::Dot)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BindingError::AlreadyBound { .. }));
    }
}
