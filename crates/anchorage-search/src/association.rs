//! Durable collection-to-model bindings.
//!
//! Bindings are persisted as records in a reserved metadata collection of
//! the backing store and cached in memory. The cache is only ever filled
//! from a persisted record or by a successful write, so it never holds a
//! binding the store does not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OnceCell, RwLock};

use anchorage_core::{registry, CollectionBinding, Distance};
use anchorage_store::client::METADATA_VECTOR_WIDTH;
use anchorage_store::{retry, CollectionInfo, Exhausted, RetryPolicy, StoreError, VectorStore};

use crate::error::{BindingError, BindingResult};

/// Longest collection name accepted.
const MAX_NAME_LEN: usize = 255;

/// Maps collection names to their bound model and distance metric.
#[derive(Debug)]
pub struct AssociationStore {
    store: Arc<dyn VectorStore>,
    metadata_collection: String,
    retry: RetryPolicy,
    cache: RwLock<HashMap<String, CollectionBinding>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metadata_ready: OnceCell<()>,
}

impl AssociationStore {
    pub fn new(
        store: Arc<dyn VectorStore>,
        metadata_collection: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            metadata_collection: metadata_collection.into(),
            retry,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            metadata_ready: OnceCell::new(),
        }
    }

    pub fn metadata_collection(&self) -> &str {
        &self.metadata_collection
    }

    pub fn is_reserved(&self, collection: &str) -> bool {
        collection == self.metadata_collection
    }

    /// Reject the reserved name and names the store cannot address.
    pub fn check_name(&self, collection: &str) -> BindingResult<()> {
        if self.is_reserved(collection) {
            return Err(BindingError::ReservedCollection {
                collection: collection.to_string(),
            });
        }
        validate_collection_name(collection)
    }

    /// The binding for `collection`, or `None` if it was never bound.
    pub async fn get_binding(&self, collection: &str) -> BindingResult<Option<CollectionBinding>> {
        self.check_name(collection)?;
        if let Some(binding) = self.cache.read().await.get(collection) {
            return Ok(Some(binding.clone()));
        }

        let Some(binding) = self.load(collection).await? else {
            return Ok(None);
        };
        log::debug!(
            "Loaded binding for '{}': {} ({})",
            collection,
            binding.model,
            binding.distance
        );
        self.cache
            .write()
            .await
            .insert(collection.to_string(), binding.clone());
        Ok(Some(binding))
    }

    /// Bind `collection` to `model` and `distance`.
    ///
    /// An identical existing binding is returned unchanged. A different one
    /// is never overwritten: the call fails with
    /// [`BindingError::AlreadyBound`] carrying the existing values. Nothing
    /// is persisted when the physical collection already exists with a
    /// width or metric the model cannot fill.
    pub async fn create_binding(
        &self,
        collection: &str,
        model: &str,
        distance: Distance,
    ) -> BindingResult<CollectionBinding> {
        self.check_name(collection)?;
        let descriptor = registry::resolve_by_name(model)?;

        let lock = self.key_lock(collection);
        let _guard = lock.lock().await;

        if let Some(existing) = self.get_binding(collection).await? {
            if existing.matches(descriptor.name, distance) {
                return Ok(existing);
            }
            return Err(BindingError::AlreadyBound {
                collection: collection.to_string(),
                existing_model: existing.model,
                existing_distance: existing.distance,
                requested_model: descriptor.name.to_string(),
                requested_distance: distance,
            });
        }

        if let Some(info) = self.physical(collection).await? {
            if !info.accepts(descriptor.width, distance) {
                log::warn!(
                    "Refusing to bind '{}' to {}: collection holds {}-dimensional {} vectors",
                    collection,
                    descriptor.name,
                    info.width,
                    info.distance
                );
                return Err(shape_mismatch(
                    collection,
                    descriptor.name,
                    descriptor.width,
                    distance,
                    info,
                ));
            }
        }

        let binding = CollectionBinding::new(collection, descriptor.name, distance);
        self.persist(&binding).await?;
        log::info!(
            "Bound collection '{}' to {} ({})",
            collection,
            binding.model,
            binding.distance
        );
        Ok(binding)
    }

    /// Administrative override: replace whatever binding exists.
    ///
    /// Existing vectors in the collection are not re-embedded; callers are
    /// expected to recreate the collection's contents.
    pub async fn override_binding(
        &self,
        collection: &str,
        model: &str,
        distance: Distance,
    ) -> BindingResult<CollectionBinding> {
        self.check_name(collection)?;
        let descriptor = registry::resolve_by_name(model)?;

        let lock = self.key_lock(collection);
        let _guard = lock.lock().await;

        let previous = self.get_binding(collection).await?;
        let binding = CollectionBinding::new(collection, descriptor.name, distance);
        self.persist(&binding).await?;

        match previous {
            Some(old) => log::warn!(
                "Overrode binding for '{}': {} ({}) -> {} ({})",
                collection,
                old.model,
                old.distance,
                binding.model,
                binding.distance
            ),
            None => log::warn!(
                "Override created binding for '{}': {} ({})",
                collection,
                binding.model,
                binding.distance
            ),
        }
        Ok(binding)
    }

    /// Remove the binding of a collection that is being deleted.
    pub async fn delete_binding(&self, collection: &str) -> BindingResult<()> {
        self.check_name(collection)?;
        let lock = self.key_lock(collection);
        let guard = lock.lock().await;
        let result = self.remove_persisted(collection).await;
        drop(guard);
        drop(lock);
        self.release_lock(collection);
        result
    }

    async fn remove_persisted(&self, collection: &str) -> BindingResult<()> {
        let result = retry(&self.retry, "delete binding", || {
            self.store
                .delete_metadata(&self.metadata_collection, collection)
        })
        .await;
        match result {
            Ok(()) => {}
            Err(exhausted) if exhausted.error.is_not_found() => {}
            Err(exhausted) => return Err(persistence(collection, exhausted)),
        }

        self.cache.write().await.remove(collection);
        log::info!("Removed binding for '{}'", collection);
        Ok(())
    }

    /// Every binding seen by this process, ordered by collection name.
    pub async fn list_bindings(&self) -> Vec<CollectionBinding> {
        let mut bindings: Vec<_> = self.cache.read().await.values().cloned().collect();
        bindings.sort_by(|a, b| a.collection.cmp(&b.collection));
        bindings
    }

    /// Shape of the physical collection, or `None` if it does not exist.
    pub async fn physical(&self, collection: &str) -> BindingResult<Option<CollectionInfo>> {
        retry(&self.retry, "read collection info", || {
            self.store.collection_info(collection)
        })
        .await
        .map_err(|e| persistence(collection, e))
    }

    fn key_lock(&self, collection: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(collection.to_string()).or_default())
    }

    /// Forget the lock of a deleted collection once nobody else holds it.
    fn release_lock(&self, collection: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(collection)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(collection);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn load(&self, collection: &str) -> BindingResult<Option<CollectionBinding>> {
        let result = retry(&self.retry, "read binding", || {
            self.store
                .read_metadata(&self.metadata_collection, collection)
        })
        .await;

        let value = match result {
            Ok(value) => value,
            // No metadata collection yet means nothing was ever bound.
            Err(exhausted) if exhausted.error.is_not_found() => None,
            Err(exhausted) => return Err(persistence(collection, exhausted)),
        };

        value
            .map(|value| {
                CollectionBinding::from_payload(value).map_err(|e| BindingError::CorruptBinding {
                    collection: collection.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Write `binding` through to the store, then to the cache.
    async fn persist(&self, binding: &CollectionBinding) -> BindingResult<()> {
        let collection = binding.collection.as_str();
        self.ensure_metadata_collection()
            .await
            .map_err(|e| persistence(collection, e))?;

        let payload = binding.to_payload()?;
        retry(&self.retry, "write binding", || {
            self.store
                .upsert_metadata(&self.metadata_collection, collection, payload.clone())
        })
        .await
        .map_err(|e| persistence(collection, e))?;

        self.cache
            .write()
            .await
            .insert(collection.to_string(), binding.clone());
        Ok(())
    }

    async fn ensure_metadata_collection(&self) -> Result<(), Exhausted> {
        self.metadata_ready
            .get_or_try_init(|| async {
                let exists = retry(&self.retry, "check metadata collection", || {
                    self.store.collection_exists(&self.metadata_collection)
                })
                .await?;
                if exists {
                    return Ok(());
                }

                log::info!("Creating metadata collection '{}'", self.metadata_collection);
                let created = retry(&self.retry, "create metadata collection", || {
                    self.store.create_collection(
                        &self.metadata_collection,
                        METADATA_VECTOR_WIDTH,
                        Distance::Dot,
                    )
                })
                .await;
                match created {
                    Ok(()) => Ok(()),
                    // Another process created it first.
                    Err(Exhausted {
                        error: StoreError::Http { status: 409, .. },
                        ..
                    }) => Ok(()),
                    Err(e) => Err(e),
                }
            })
            .await
            .map(|_| ())
    }
}

pub(crate) fn shape_mismatch(
    collection: &str,
    model: &str,
    width: usize,
    distance: Distance,
    info: CollectionInfo,
) -> BindingError {
    BindingError::ShapeMismatch {
        collection: collection.to_string(),
        model: model.to_string(),
        expected_width: width,
        actual_width: info.width,
        expected_distance: distance,
        actual_distance: info.distance,
    }
}

fn persistence(collection: &str, exhausted: Exhausted) -> BindingError {
    BindingError::Persistence {
        collection: collection.to_string(),
        attempts: exhausted.attempts,
        source: exhausted.error,
    }
}

/// Names must be non-empty and made of ASCII letters, digits, `_`, `-` or `.`.
pub fn validate_collection_name(collection: &str) -> BindingResult<()> {
    let invalid = |reason: &str| {
        Err(BindingError::InvalidCollectionName {
            collection: collection.to_string(),
            reason: reason.to_string(),
        })
    };

    if collection.is_empty() {
        return invalid("name is empty");
    }
    if collection.len() > MAX_NAME_LEN {
        return invalid("name is longer than 255 characters");
    }
    if let Some(c) = collection
        .chars()
        .find(|&c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return invalid(&format!("character {c:?} is not allowed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchorage_store::InMemoryStore;
    use std::time::Duration;

    const META: &str = "_anchorage_bindings";
    const MPNET: &str = "sentence-transformers/all-mpnet-base-v2";
    const MINILM: &str = "sentence-transformers/all-MiniLM-L6-v2";

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn associations(store: &Arc<InMemoryStore>) -> AssociationStore {
        AssociationStore::new(
            Arc::clone(store) as Arc<dyn VectorStore>,
            META,
            fast_retry(),
        )
    }

    #[tokio::test]
    async fn test_unbound_collection() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);
        assert_eq!(associations.get_binding("docs").await.unwrap(), None);
        // Reads never create the metadata collection.
        assert!(!store.collection_exists(META).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);

        let created = associations
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap();
        let fetched = associations.get_binding("docs").await.unwrap().unwrap();
        assert_eq!(created, fetched);
        assert!(store.collection_exists(META).await.unwrap());
    }

    #[tokio::test]
    async fn test_identical_binding_is_returned_unchanged() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);

        let first = associations
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap();
        let second = associations
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_different_binding_is_refused() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);
        associations
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap();

        let err = associations
            .create_binding("docs", MINILM, Distance::Cosine)
            .await
            .unwrap_err();
        match err {
            BindingError::AlreadyBound {
                existing_model,
                requested_model,
                ..
            } => {
                assert_eq!(existing_model, MPNET);
                assert_eq!(requested_model, MINILM);
            }
            other => panic!("expected AlreadyBound, got {other:?}"),
        }

        let err = associations
            .create_binding("docs", MPNET, Distance::Dot)
            .await
            .unwrap_err();
        assert!(matches!(err, BindingError::AlreadyBound { .. }));
    }

    #[tokio::test]
    async fn test_binding_survives_restart() {
        let store = Arc::new(InMemoryStore::new());
        associations(&store)
            .create_binding("docs", MPNET, Distance::Euclid)
            .await
            .unwrap();

        let restarted = associations(&store);
        let binding = restarted.get_binding("docs").await.unwrap().unwrap();
        assert_eq!(binding.model, MPNET);
        assert_eq!(binding.distance, Distance::Euclid);
    }

    #[tokio::test]
    async fn test_override_replaces_binding() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);
        associations
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap();

        associations
            .override_binding("docs", MINILM, Distance::Dot)
            .await
            .unwrap();

        let restarted = AssociationStore::new(
            Arc::clone(&store) as Arc<dyn VectorStore>,
            META,
            fast_retry(),
        );
        let binding = restarted.get_binding("docs").await.unwrap().unwrap();
        assert!(binding.matches(MINILM, Distance::Dot));
    }

    #[tokio::test]
    async fn test_delete_binding() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);
        associations
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap();

        associations.delete_binding("docs").await.unwrap();
        assert_eq!(associations.get_binding("docs").await.unwrap(), None);
        assert!(associations.list_bindings().await.is_empty());

        // Deleting again is harmless.
        associations.delete_binding("docs").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_binding_releases_key_lock() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);
        for name in ["docs", "notes"] {
            associations
                .create_binding(name, MPNET, Distance::Cosine)
                .await
                .unwrap();
        }
        assert_eq!(associations.lock_count(), 2);

        associations.delete_binding("docs").await.unwrap();
        associations.delete_binding("notes").await.unwrap();
        assert_eq!(associations.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_existing_collection_with_other_width_is_not_bound() {
        let store = Arc::new(InMemoryStore::new());
        store.create_collection("docs", 384, Distance::Cosine).await.unwrap();
        let associations = associations(&store);

        let err = associations
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap_err();
        match err {
            BindingError::ShapeMismatch {
                collection,
                expected_width,
                actual_width,
                ..
            } => {
                assert_eq!(collection, "docs");
                assert_eq!(expected_width, 768);
                assert_eq!(actual_width, 384);
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
        assert_eq!(associations.get_binding("docs").await.unwrap(), None);
        assert!(!store.collection_exists(META).await.unwrap());
    }

    #[tokio::test]
    async fn test_existing_collection_with_other_metric_is_not_bound() {
        let store = Arc::new(InMemoryStore::new());
        store.create_collection("docs", 384, Distance::Dot).await.unwrap();
        let err = associations(&store)
            .create_binding("docs", MINILM, Distance::Cosine)
            .await
            .unwrap_err();
        assert!(matches!(err, BindingError::ShapeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_existing_collection_with_same_shape_is_bound() {
        let store = Arc::new(InMemoryStore::new());
        store.create_collection("docs", 384, Distance::Cosine).await.unwrap();
        let binding = associations(&store)
            .create_binding("docs", MINILM, Distance::Cosine)
            .await
            .unwrap();
        assert_eq!(binding.model, MINILM);
    }

    #[tokio::test]
    async fn test_reserved_name_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);
        let err = associations
            .create_binding(META, MPNET, Distance::Cosine)
            .await
            .unwrap_err();
        assert!(matches!(err, BindingError::ReservedCollection { .. }));
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let err = associations(&store)
            .create_binding("docs", "no/such-model", Distance::Cosine)
            .await
            .unwrap_err();
        assert!(matches!(err, BindingError::Registry(_)));
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces_persistence_error() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);
        store.set_healthy(false);

        let err = associations
            .create_binding("docs", MPNET, Distance::Cosine)
            .await
            .unwrap_err();
        match err {
            BindingError::Persistence {
                collection,
                attempts,
                ..
            } => {
                assert_eq!(collection, "docs");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Persistence, got {other:?}"),
        }
        assert!(associations.list_bindings().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_bindings_sorted() {
        let store = Arc::new(InMemoryStore::new());
        let associations = associations(&store);
        for name in ["notes", "docs", "code"] {
            associations
                .create_binding(name, MINILM, Distance::Cosine)
                .await
                .unwrap();
        }
        let names: Vec<_> = associations
            .list_bindings()
            .await
            .into_iter()
            .map(|b| b.collection)
            .collect();
        assert_eq!(names, vec!["code", "docs", "notes"]);
    }

    #[test]
    fn test_collection_name_validation() {
        assert!(validate_collection_name("docs_v2.en-US").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("my docs").is_err());
        assert!(validate_collection_name("a/b").is_err());
        assert!(validate_collection_name(&"x".repeat(256)).is_err());
    }
}
