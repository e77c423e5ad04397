//! Qdrant REST client.
//!
//! Speaks just enough of the Qdrant HTTP API for collection management,
//! point upsert/query and small metadata records. Every request carries
//! the optional `api-key` header and the client-wide timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use anchorage_core::Distance;

use crate::client::{
    metadata_payload, metadata_point_id, metadata_value, CollectionInfo, Point, ScoredPoint,
    ScrollPage, StoredPoint, VectorStore, METADATA_VECTOR_WIDTH,
};
use crate::error::{StoreError, StoreResult};
use crate::lifecycle::BackingStoreHandle;
use crate::probe::{probe_readyz, HealthProbeResult};

// ---------------------------------------------------------------------------
// Wire types (private -- Qdrant wraps every answer in {"result": ...})
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionsResult {
    collections: Vec<CollectionName>,
}

#[derive(Debug, Deserialize)]
struct CollectionName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ExistsResult {
    exists: bool,
}

#[derive(Debug, Serialize)]
struct CreateCollectionRequest {
    vectors: VectorParams,
}

#[derive(Debug, Serialize)]
struct VectorParams {
    size: usize,
    distance: Distance,
}

#[derive(Debug, Deserialize)]
struct CollectionDetails {
    #[serde(default)]
    points_count: Option<u64>,
    config: CollectionConfig,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: WireVectors,
}

#[derive(Debug, Deserialize)]
struct WireVectorParams {
    size: usize,
    distance: Distance,
}

/// Collections hold either one unnamed vector or a map of named ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireVectors {
    Single(WireVectorParams),
    Named(BTreeMap<String, WireVectorParams>),
}

impl CollectionDetails {
    fn into_info(self, name: &str) -> StoreResult<CollectionInfo> {
        let params = match self.config.params.vectors {
            WireVectors::Single(params) => params,
            WireVectors::Named(named) => named.into_values().next().ok_or_else(|| {
                StoreError::Parse {
                    operation: "collection info".to_string(),
                    message: format!("collection '{name}' declares no vectors"),
                }
            })?,
        };
        Ok(CollectionInfo {
            width: params.size,
            distance: params.distance,
            points: self.points_count.unwrap_or(0),
        })
    }
}

#[derive(Debug, Serialize)]
struct UpsertRequest<'a> {
    points: &'a [Point],
}

#[derive(Debug, Serialize)]
struct QueryRequest {
    query: Vec<f32>,
    limit: usize,
    with_payload: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    points: Vec<WireScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct WireScoredPoint {
    id: serde_json::Value,
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RecordResult {
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ScrollRequest {
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<serde_json::Value>,
    with_payload: bool,
    with_vector: bool,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<WireRecord>,
    #[serde(default)]
    next_page_offset: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    id: serde_json::Value,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct DeletePointsRequest {
    points: Vec<uuid::Uuid>,
}

/// Qdrant ids are either unsigned integers or UUID strings.
fn wire_id(id: serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Offsets handed back to callers are strings; numeric ids go back as numbers.
fn offset_value(offset: &str) -> serde_json::Value {
    offset
        .parse::<u64>()
        .map_or_else(|_| serde_json::Value::from(offset), serde_json::Value::from)
}

impl From<WireScoredPoint> for ScoredPoint {
    fn from(point: WireScoredPoint) -> Self {
        Self {
            id: wire_id(point.id),
            score: point.score,
            payload: point.payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Qdrant REST API client.
#[derive(Debug, Clone)]
pub struct QdrantClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl QdrantClient {
    /// Create a client for `endpoint` (e.g. `http://127.0.0.1:6333`).
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> StoreResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(crate::USER_AGENT)
            .build()?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    /// Create a client for the backend a lifecycle controller brought up.
    pub fn from_handle(handle: &BackingStoreHandle, timeout: Duration) -> StoreResult<Self> {
        Self::new(handle.endpoint(), handle.api_key().map(str::to_string), timeout)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.endpoint, path));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    /// Send a request and turn non-success statuses into [`StoreError::Http`].
    async fn send(&self, operation: &str, builder: RequestBuilder) -> StoreResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        log::debug!("Qdrant {} failed with HTTP {}: {}", operation, status, message);
        Err(StoreError::Http {
            operation: operation.to_string(),
            status: status.as_u16(),
            message,
        })
    }

    async fn parse<T: DeserializeOwned>(operation: &str, response: Response) -> StoreResult<T> {
        let envelope: Envelope<T> = response.json().await.map_err(|e| StoreError::Parse {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;
        Ok(envelope.result)
    }

    fn not_found_as(collection: &str, err: StoreError) -> StoreError {
        match err {
            StoreError::Http { status: 404, .. } => StoreError::CollectionNotFound {
                collection: collection.to_string(),
            },
            other => other,
        }
    }
}

#[async_trait]
impl VectorStore for QdrantClient {
    async fn health_probe(&self) -> HealthProbeResult {
        probe_readyz(&self.http, &self.endpoint, self.api_key.as_deref()).await
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        let response = self
            .send("list collections", self.request(Method::GET, "/collections"))
            .await?;
        let result: CollectionsResult = Self::parse("list collections", response).await?;
        Ok(result.collections.into_iter().map(|c| c.name).collect())
    }

    async fn collection_exists(&self, name: &str) -> StoreResult<bool> {
        let path = format!("/collections/{name}/exists");
        let response = self
            .send("collection exists", self.request(Method::GET, &path))
            .await?;
        let result: ExistsResult = Self::parse("collection exists", response).await?;
        Ok(result.exists)
    }

    async fn create_collection(
        &self,
        name: &str,
        width: usize,
        distance: Distance,
    ) -> StoreResult<()> {
        log::info!(
            "Creating collection '{}' with width {} and {} distance",
            name,
            width,
            distance
        );
        let body = CreateCollectionRequest {
            vectors: VectorParams {
                size: width,
                distance,
            },
        };
        let path = format!("/collections/{name}");
        self.send(
            "create collection",
            self.request(Method::PUT, &path).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn collection_info(&self, name: &str) -> StoreResult<Option<CollectionInfo>> {
        let path = format!("/collections/{name}");
        let response = match self
            .send("collection info", self.request(Method::GET, &path))
            .await
        {
            Ok(response) => response,
            Err(StoreError::Http { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let details: CollectionDetails = Self::parse("collection info", response).await?;
        details.into_info(name).map(Some)
    }

    async fn delete_collection(&self, name: &str) -> StoreResult<()> {
        let path = format!("/collections/{name}");
        self.send("delete collection", self.request(Method::DELETE, &path))
            .await
            .map_err(|e| Self::not_found_as(name, e))?;
        Ok(())
    }

    async fn upsert_points(&self, collection: &str, points: Vec<Point>) -> StoreResult<()> {
        let path = format!("/collections/{collection}/points?wait=true");
        let body = UpsertRequest { points: &points };
        self.send("upsert points", self.request(Method::PUT, &path).json(&body))
            .await
            .map_err(|e| Self::not_found_as(collection, e))?;
        log::debug!("Upserted {} points into '{}'", points.len(), collection);
        Ok(())
    }

    async fn query_points(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> StoreResult<Vec<ScoredPoint>> {
        let path = format!("/collections/{collection}/points/query");
        let body = QueryRequest {
            query: vector,
            limit,
            with_payload: true,
        };
        let response = self
            .send("query points", self.request(Method::POST, &path).json(&body))
            .await
            .map_err(|e| Self::not_found_as(collection, e))?;
        let result: QueryResult = Self::parse("query points", response).await?;
        Ok(result.points.into_iter().map(ScoredPoint::from).collect())
    }

    async fn scroll_points(
        &self,
        collection: &str,
        limit: usize,
        offset: Option<&str>,
    ) -> StoreResult<ScrollPage> {
        let path = format!("/collections/{collection}/points/scroll");
        let body = ScrollRequest {
            limit,
            offset: offset.map(offset_value),
            with_payload: true,
            with_vector: false,
        };
        let response = self
            .send("scroll points", self.request(Method::POST, &path).json(&body))
            .await
            .map_err(|e| Self::not_found_as(collection, e))?;
        let result: ScrollResult = Self::parse("scroll points", response).await?;
        Ok(ScrollPage {
            points: result
                .points
                .into_iter()
                .map(|record| StoredPoint {
                    id: wire_id(record.id),
                    payload: record.payload,
                })
                .collect(),
            next_offset: result
                .next_page_offset
                .filter(|offset| !offset.is_null())
                .map(wire_id),
        })
    }

    async fn upsert_metadata(
        &self,
        collection: &str,
        key: &str,
        value: serde_json::Value,
    ) -> StoreResult<()> {
        let point = Point {
            id: metadata_point_id(key),
            vector: vec![1.0; METADATA_VECTOR_WIDTH],
            payload: metadata_payload(key, value),
        };
        self.upsert_points(collection, vec![point]).await
    }

    async fn read_metadata(
        &self,
        collection: &str,
        key: &str,
    ) -> StoreResult<Option<serde_json::Value>> {
        let path = format!("/collections/{collection}/points/{}", metadata_point_id(key));
        let response = self
            .request(Method::GET, &path)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(StoreError::Http {
                operation: "read metadata".to_string(),
                status,
                message: response.text().await.unwrap_or_default(),
            });
        }
        let record: RecordResult = Self::parse("read metadata", response).await?;
        Ok(record.payload.and_then(metadata_value))
    }

    async fn delete_metadata(&self, collection: &str, key: &str) -> StoreResult<()> {
        let path = format!("/collections/{collection}/points/delete?wait=true");
        let body = DeletePointsRequest {
            points: vec![metadata_point_id(key)],
        };
        self.send("delete metadata", self.request(Method::POST, &path).json(&body))
            .await
            .map_err(|e| Self::not_found_as(collection, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_creation_trims_trailing_slash() {
        let client = QdrantClient::new("http://localhost:6333/", None, Duration::from_secs(5))
            .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:6333");
    }

    #[test]
    fn test_create_collection_body() {
        let body = CreateCollectionRequest {
            vectors: VectorParams {
                size: 768,
                distance: Distance::Cosine,
            },
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"vectors": {"size": 768, "distance": "Cosine"}})
        );
    }

    #[test]
    fn test_upsert_body() {
        let id = uuid::Uuid::nil();
        let points = vec![Point {
            id,
            vector: vec![0.5, 0.25],
            payload: json!({"document": "hello"}),
        }];
        let body = UpsertRequest { points: &points };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["points"][0]["id"], id.to_string());
        assert_eq!(value["points"][0]["vector"], json!([0.5, 0.25]));
        assert_eq!(value["points"][0]["payload"]["document"], "hello");
    }

    #[test]
    fn test_collections_response_deserialize() {
        let raw = r#"{"result":{"collections":[{"name":"docs"},{"name":"_anchorage_bindings"}]},"status":"ok","time":0.0001}"#;
        let envelope: Envelope<CollectionsResult> = serde_json::from_str(raw).unwrap();
        let names: Vec<_> = envelope.result.collections.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["docs", "_anchorage_bindings"]);
    }

    #[test]
    fn test_query_response_deserialize_mixed_ids() {
        let raw = r#"{"result":{"points":[
            {"id":"6a1c3f0e-8b7d-4c52-9e14-2d0b77a5c3e9","score":0.91,"payload":{"document":"a"}},
            {"id":42,"score":0.5}
        ]}}"#;
        let envelope: Envelope<QueryResult> = serde_json::from_str(raw).unwrap();
        let points: Vec<ScoredPoint> = envelope
            .result
            .points
            .into_iter()
            .map(ScoredPoint::from)
            .collect();
        assert_eq!(points[0].id, "6a1c3f0e-8b7d-4c52-9e14-2d0b77a5c3e9");
        assert_eq!(points[0].payload.as_ref().unwrap()["document"], "a");
        assert_eq!(points[1].id, "42");
        assert!(points[1].payload.is_none());
    }

    #[test]
    fn test_record_response_deserialize() {
        let raw = r#"{"result":{"id":"x","payload":{"key":"docs","value":{"model":"m"}}}}"#;
        let envelope: Envelope<RecordResult> = serde_json::from_str(raw).unwrap();
        let value = envelope.result.payload.and_then(metadata_value);
        assert_eq!(value, Some(json!({"model": "m"})));
    }

    #[test]
    fn test_collection_details_deserialize_single_vector() {
        let raw = r#"{"result":{"status":"green","points_count":12,
            "config":{"params":{"vectors":{"size":384,"distance":"Cosine"}}}}}"#;
        let envelope: Envelope<CollectionDetails> = serde_json::from_str(raw).unwrap();
        let info = envelope.result.into_info("docs").unwrap();
        assert_eq!(info.width, 384);
        assert_eq!(info.distance, Distance::Cosine);
        assert_eq!(info.points, 12);
    }

    #[test]
    fn test_collection_details_deserialize_named_vectors() {
        let raw = r#"{"result":{"config":{"params":{"vectors":
            {"text":{"size":768,"distance":"Dot"}}}}}}"#;
        let envelope: Envelope<CollectionDetails> = serde_json::from_str(raw).unwrap();
        let info = envelope.result.into_info("docs").unwrap();
        assert_eq!(info.width, 768);
        assert_eq!(info.distance, Distance::Dot);
        assert_eq!(info.points, 0);
    }

    #[test]
    fn test_collection_details_without_vectors_is_parse_error() {
        let raw = r#"{"result":{"config":{"params":{"vectors":{}}}}}"#;
        let envelope: Envelope<CollectionDetails> = serde_json::from_str(raw).unwrap();
        let err = envelope.result.into_info("docs").unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[test]
    fn test_scroll_body_keeps_numeric_offsets_numeric() {
        let body = ScrollRequest {
            limit: 10,
            offset: Some(offset_value("42")),
            with_payload: true,
            with_vector: false,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"limit": 10, "offset": 42, "with_payload": true, "with_vector": false})
        );
        assert_eq!(
            offset_value("6a1c3f0e-8b7d-4c52-9e14-2d0b77a5c3e9"),
            json!("6a1c3f0e-8b7d-4c52-9e14-2d0b77a5c3e9")
        );
    }

    #[test]
    fn test_scroll_response_deserialize() {
        let raw = r#"{"result":{"points":[
            {"id":7,"payload":{"document":"a"}},
            {"id":"6a1c3f0e-8b7d-4c52-9e14-2d0b77a5c3e9"}
        ],"next_page_offset":8}}"#;
        let envelope: Envelope<ScrollResult> = serde_json::from_str(raw).unwrap();
        let result = envelope.result;
        assert_eq!(wire_id(result.points[0].id.clone()), "7");
        assert!(result.points[1].payload.is_none());
        assert_eq!(result.next_page_offset.map(wire_id).as_deref(), Some("8"));
    }

    #[test]
    fn test_not_found_maps_to_collection_not_found() {
        let err = QdrantClient::not_found_as(
            "docs",
            StoreError::Http {
                operation: "delete collection".to_string(),
                status: 404,
                message: String::new(),
            },
        );
        assert!(err.is_not_found());
    }
}
