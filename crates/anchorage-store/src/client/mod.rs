//! The narrow client capability anchorage needs from a vector store.

pub mod memory;
pub mod qdrant;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use anchorage_core::Distance;

use crate::error::StoreResult;
use crate::probe::HealthProbeResult;

pub use memory::InMemoryStore;
pub use qdrant::QdrantClient;

/// Vector width of the reserved metadata collection. Metadata points carry
/// a constant placeholder vector; only their payload matters.
pub const METADATA_VECTOR_WIDTH: usize = 1;

/// Namespace for metadata point ids.
const METADATA_NAMESPACE: Uuid = Uuid::from_u128(0x6a1c_3f0e_8b7d_4c52_9e14_2d0b_77a5_c3e9);

/// Stable point id for a metadata record key.
#[must_use]
pub fn metadata_point_id(key: &str) -> Uuid {
    Uuid::new_v5(&METADATA_NAMESPACE, key.as_bytes())
}

/// A point to upsert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// A query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Option<serde_json::Value>,
}

/// Shape and size of a physical collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub width: usize,
    pub distance: Distance,
    pub points: u64,
}

impl CollectionInfo {
    /// Whether vectors of `width` scored with `distance` fit this collection.
    #[must_use]
    pub fn accepts(&self, width: usize, distance: Distance) -> bool {
        self.width == width && self.distance == distance
    }
}

/// A stored point without its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub id: String,
    pub payload: Option<serde_json::Value>,
}

/// One page of [`VectorStore::scroll_points`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    pub points: Vec<StoredPoint>,
    /// Id to pass as `offset` for the next page; `None` at the end.
    pub next_offset: Option<String>,
}

/// Operations anchorage performs against a vector store.
///
/// Metadata records live as points in an ordinary collection created with
/// [`METADATA_VECTOR_WIDTH`]; the collection must exist before records are
/// written to it.
#[async_trait]
pub trait VectorStore: Send + Sync + fmt::Debug {
    async fn health_probe(&self) -> HealthProbeResult;

    async fn list_collections(&self) -> StoreResult<Vec<String>>;

    async fn collection_exists(&self, name: &str) -> StoreResult<bool>;

    async fn create_collection(&self, name: &str, width: usize, distance: Distance)
        -> StoreResult<()>;

    /// `Ok(None)` when the collection does not exist.
    async fn collection_info(&self, name: &str) -> StoreResult<Option<CollectionInfo>>;

    async fn delete_collection(&self, name: &str) -> StoreResult<()>;

    async fn upsert_points(&self, collection: &str, points: Vec<Point>) -> StoreResult<()>;

    /// Nearest neighbours of `vector`, best match first.
    async fn query_points(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> StoreResult<Vec<ScoredPoint>>;

    /// Page through stored points in id order, starting at `offset`
    /// (inclusive) when given.
    async fn scroll_points(
        &self,
        collection: &str,
        limit: usize,
        offset: Option<&str>,
    ) -> StoreResult<ScrollPage>;

    async fn upsert_metadata(
        &self,
        collection: &str,
        key: &str,
        value: serde_json::Value,
    ) -> StoreResult<()>;

    /// `Ok(None)` when no record exists under `key`.
    async fn read_metadata(&self, collection: &str, key: &str)
        -> StoreResult<Option<serde_json::Value>>;

    async fn delete_metadata(&self, collection: &str, key: &str) -> StoreResult<()>;
}

/// Payload envelope for metadata records.
pub(crate) fn metadata_payload(key: &str, value: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "key": key, "value": value })
}

/// Extract the stored value from a metadata payload envelope.
pub(crate) fn metadata_value(mut payload: serde_json::Value) -> Option<serde_json::Value> {
    payload
        .get_mut("value")
        .map(serde_json::Value::take)
        .filter(|value| !value.is_null())
}
