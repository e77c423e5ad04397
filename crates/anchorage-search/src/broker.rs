//! The broker: one entry point for storing and searching text.
//!
//! Ties the lifecycle controller, the vector store, the association store
//! and the validator together. Every operation holds an in-flight permit
//! from the controller, so shutdown can drain it.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use anchorage_core::{CollectionBinding, Distance};
use anchorage_store::{
    CollectionInfo, Config, LifecycleController, Point, QdrantClient, RetryPolicy, ScoredPoint,
    StoreError, StoredPoint, VectorStore,
};

use crate::association::{shape_mismatch, AssociationStore};
use crate::embedding::ProviderFactory;
use crate::error::{BindingError, BindingResult};
use crate::validator::{BindingHints, DimensionValidator, PreparedVector};

/// One document in a [`Broker::store_batch`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchEntry {
    /// Caller-chosen id. Non-UUID ids are mapped to a stable UUID, so
    /// storing the same id again overwrites the earlier point.
    pub id: Option<String>,
    pub text: String,
    pub metadata: Option<serde_json::Value>,
}

impl BatchEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub document: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl From<ScoredPoint> for SearchHit {
    fn from(point: ScoredPoint) -> Self {
        let (document, metadata) = split_payload(point.payload);
        Self {
            id: point.id,
            score: point.score,
            document,
            metadata,
        }
    }
}

/// A document read back by [`Broker::scroll`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDocument {
    pub id: String,
    pub document: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl From<StoredPoint> for StoredDocument {
    fn from(point: StoredPoint) -> Self {
        let (document, metadata) = split_payload(point.payload);
        Self {
            id: point.id,
            document,
            metadata,
        }
    }
}

/// One page of a collection's documents. Pass `next_offset` back to
/// [`Broker::scroll`] to continue; `None` means the last page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentPage {
    pub documents: Vec<StoredDocument>,
    pub next_offset: Option<String>,
}

/// What is known about a collection: its binding and its physical shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionReport {
    pub collection: String,
    pub binding: Option<CollectionBinding>,
    pub physical: Option<CollectionInfo>,
}

fn split_payload(
    payload: Option<serde_json::Value>,
) -> (Option<String>, Option<serde_json::Value>) {
    let mut payload = payload.unwrap_or(serde_json::Value::Null);
    let document = payload
        .get("document")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let metadata = payload
        .get_mut("metadata")
        .map(serde_json::Value::take)
        .filter(|m| !m.is_null());
    (document, metadata)
}

/// Map a caller-supplied id to a point id.
pub fn point_id(id: &str) -> Uuid {
    Uuid::parse_str(id).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_DNS, id.as_bytes()))
}

fn document_payload(text: &str, metadata: Option<serde_json::Value>) -> serde_json::Value {
    serde_json::json!({
        "document": text,
        "metadata": metadata.unwrap_or(serde_json::Value::Null),
    })
}

#[derive(Debug)]
pub struct Broker {
    lifecycle: Arc<LifecycleController>,
    store: Arc<dyn VectorStore>,
    validator: DimensionValidator,
    search_limit: usize,
    max_batch_size: usize,
}

impl Broker {
    /// Bring the backend up and connect to it over REST.
    pub async fn connect(
        config: &Config,
        lifecycle: Arc<LifecycleController>,
        factory: Arc<dyn ProviderFactory>,
    ) -> BindingResult<Self> {
        let handle = lifecycle.ensure_ready().await?;
        let client = QdrantClient::from_handle(&handle, config.request_timeout())?;
        log::info!("Connected to backing store at {}", handle.endpoint());
        Ok(Self::with_store(config, lifecycle, Arc::new(client), factory))
    }

    /// Build a broker over an existing store client.
    pub fn with_store(
        config: &Config,
        lifecycle: Arc<LifecycleController>,
        store: Arc<dyn VectorStore>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        let associations = Arc::new(AssociationStore::new(
            Arc::clone(&store),
            config.metadata_collection.clone(),
            RetryPolicy::with_max_retries(config.persistence_retries),
        ));
        let validator = DimensionValidator::new(associations, factory, config.default_distance);
        Self {
            lifecycle,
            store,
            validator,
            search_limit: config.search_limit,
            max_batch_size: config.max_batch_size,
        }
    }

    pub fn associations(&self) -> &AssociationStore {
        self.validator.associations()
    }

    pub fn validator(&self) -> &DimensionValidator {
        &self.validator
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    /// Embed and store one document. Returns the new point's id.
    pub async fn store(
        &self,
        collection: &str,
        text: &str,
        metadata: Option<serde_json::Value>,
        model: Option<&str>,
        width: Option<usize>,
    ) -> BindingResult<Uuid> {
        let _permit = self.lifecycle.begin_operation().await?;
        let prepared = self
            .validator
            .prepare_vector(collection, model, width, text)
            .await?;
        self.ensure_physical(&prepared).await?;

        let id = Uuid::new_v4();
        let point = Point {
            id,
            vector: prepared.vector,
            payload: document_payload(text, metadata),
        };
        self.store.upsert_points(collection, vec![point]).await?;
        log::debug!("Stored document {} in '{}'", id, collection);
        Ok(id)
    }

    /// Embed and store many documents in one upsert. Returns how many were
    /// stored.
    pub async fn store_batch(
        &self,
        collection: &str,
        entries: Vec<BatchEntry>,
        model: Option<&str>,
        width: Option<usize>,
    ) -> BindingResult<usize> {
        if entries.len() > self.max_batch_size {
            return Err(BindingError::BatchTooLarge {
                size: entries.len(),
                max: self.max_batch_size,
            });
        }
        let Some(first) = entries.first() else {
            return Ok(0);
        };

        let _permit = self.lifecycle.begin_operation().await?;
        let prepared = self
            .validator
            .prepare_vector(collection, model, width, &first.text)
            .await?;
        self.ensure_physical(&prepared).await?;

        let binding = prepared.binding.clone();
        let mut vectors = vec![prepared.vector];
        for entry in entries.iter().skip(1) {
            let next = self.validator.embed(binding.clone(), &entry.text).await?;
            vectors.push(next.vector);
        }

        let points: Vec<Point> = entries
            .into_iter()
            .zip(vectors)
            .map(|(entry, vector)| Point {
                id: entry
                    .id
                    .as_deref()
                    .map_or_else(Uuid::new_v4, point_id),
                vector,
                payload: document_payload(&entry.text, entry.metadata),
            })
            .collect();
        let count = points.len();
        self.store.upsert_points(collection, points).await?;
        log::info!("Stored {} documents in '{}'", count, collection);
        Ok(count)
    }

    /// Search a bound collection.
    pub async fn find(
        &self,
        collection: &str,
        query: &str,
        limit: Option<usize>,
    ) -> BindingResult<Vec<SearchHit>> {
        self.find_with_threshold(collection, query, limit, None).await
    }

    /// Search a bound collection, dropping hits worse than `min_score`.
    ///
    /// For cosine and dot product a hit must score at least `min_score`;
    /// for the distance metrics it must score at most `min_score`.
    pub async fn find_with_threshold(
        &self,
        collection: &str,
        query: &str,
        limit: Option<usize>,
        min_score: Option<f32>,
    ) -> BindingResult<Vec<SearchHit>> {
        let _permit = self.lifecycle.begin_operation().await?;
        let binding = self
            .associations()
            .get_binding(collection)
            .await?
            .ok_or_else(|| BindingError::NotBound {
                collection: collection.to_string(),
            })?;
        let distance = binding.distance;
        let prepared = self.validator.embed(binding, query).await?;

        let limit = limit.unwrap_or(self.search_limit);
        let points = match self
            .store
            .query_points(collection, prepared.vector, limit)
            .await
        {
            Ok(points) => points,
            // Bound but nothing stored yet.
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(points
            .into_iter()
            .filter(|point| min_score.map_or(true, |t| passes(distance, point.score, t)))
            .map(SearchHit::from)
            .collect())
    }

    /// The binding and physical shape of a collection, or `None` when it
    /// is neither bound nor present in the store.
    pub async fn collection_info(
        &self,
        collection: &str,
    ) -> BindingResult<Option<CollectionReport>> {
        let _permit = self.lifecycle.begin_operation().await?;
        let binding = self.associations().get_binding(collection).await?;
        let physical = self.store.collection_info(collection).await?;
        if binding.is_none() && physical.is_none() {
            return Ok(None);
        }
        Ok(Some(CollectionReport {
            collection: collection.to_string(),
            binding,
            physical,
        }))
    }

    /// Page through the documents stored in a collection.
    ///
    /// `limit` defaults to the search limit and is capped at the batch size.
    /// A collection that does not exist yields an empty page.
    pub async fn scroll(
        &self,
        collection: &str,
        limit: Option<usize>,
        offset: Option<&str>,
    ) -> BindingResult<DocumentPage> {
        let _permit = self.lifecycle.begin_operation().await?;
        self.associations().check_name(collection)?;
        let limit = limit
            .unwrap_or(self.search_limit)
            .min(self.max_batch_size)
            .max(1);
        match self.store.scroll_points(collection, limit, offset).await {
            Ok(page) => Ok(DocumentPage {
                documents: page.points.into_iter().map(StoredDocument::from).collect(),
                next_offset: page.next_offset,
            }),
            Err(e) if e.is_not_found() => Ok(DocumentPage::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Bind a collection and create it in the store.
    pub async fn create_collection(
        &self,
        collection: &str,
        model: Option<&str>,
        width: Option<usize>,
        distance: Option<Distance>,
    ) -> BindingResult<CollectionBinding> {
        let _permit = self.lifecycle.begin_operation().await?;
        let binding = self
            .validator
            .resolve_binding(
                collection,
                BindingHints::new(model, width).with_distance(distance),
            )
            .await?;
        let descriptor = anchorage_core::registry::resolve_by_name(&binding.model)?;
        self.ensure_collection(collection, descriptor.name, descriptor.width, binding.distance)
            .await?;
        Ok(binding)
    }

    /// Delete a collection and its binding.
    pub async fn delete_collection(&self, collection: &str) -> BindingResult<()> {
        let _permit = self.lifecycle.begin_operation().await?;
        self.associations().check_name(collection)?;
        match self.store.delete_collection(collection).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                log::debug!("Collection '{}' did not exist", collection);
            }
            Err(e) => return Err(e.into()),
        }
        self.associations().delete_binding(collection).await?;
        log::info!("Deleted collection '{}'", collection);
        Ok(())
    }

    /// User-facing collections. Never includes the metadata collection.
    pub async fn list_collections(&self) -> BindingResult<Vec<String>> {
        let _permit = self.lifecycle.begin_operation().await?;
        let mut names = self.store.list_collections().await?;
        names.retain(|name| !self.associations().is_reserved(name));
        Ok(names)
    }

    /// Stop accepting operations and shut the backend down.
    pub async fn shutdown(&self) -> BindingResult<()> {
        self.lifecycle.shutdown().await?;
        Ok(())
    }

    async fn ensure_physical(&self, prepared: &PreparedVector) -> BindingResult<()> {
        self.ensure_collection(
            &prepared.binding.collection,
            prepared.model.name,
            prepared.model.width,
            prepared.binding.distance,
        )
        .await
    }

    /// Create the physical collection, or check that the existing one has
    /// the width and metric `model` needs.
    async fn ensure_collection(
        &self,
        collection: &str,
        model: &str,
        width: usize,
        distance: Distance,
    ) -> BindingResult<()> {
        if let Some(info) = self.store.collection_info(collection).await? {
            return Self::check_shape(collection, model, width, distance, info);
        }
        match self.store.create_collection(collection, width, distance).await {
            Ok(()) => Ok(()),
            // Created concurrently by another request.
            Err(StoreError::Http { status: 409, .. }) => {
                match self.store.collection_info(collection).await? {
                    Some(info) => Self::check_shape(collection, model, width, distance, info),
                    None => Ok(()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn check_shape(
        collection: &str,
        model: &str,
        width: usize,
        distance: Distance,
        info: CollectionInfo,
    ) -> BindingResult<()> {
        if info.accepts(width, distance) {
            return Ok(());
        }
        log::error!(
            "Collection '{}' holds {}-dimensional {} vectors; {} needs {}-dimensional {}",
            collection,
            info.width,
            info.distance,
            model,
            width,
            distance
        );
        Err(shape_mismatch(collection, model, width, distance, info))
    }
}

fn passes(distance: Distance, score: f32, threshold: f32) -> bool {
    if distance.higher_is_closer() {
        score >= threshold
    } else {
        score <= threshold
    }
}
