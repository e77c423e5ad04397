//! In-process vector store.
//!
//! Brute-force implementation of [`VectorStore`] used by tests. Scoring
//! follows Qdrant's conventions: cosine and dot are similarities (higher is
//! closer), euclid and manhattan are distances (lower is closer).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use anchorage_core::Distance;

use crate::client::{
    metadata_payload, metadata_point_id, metadata_value, CollectionInfo, Point, ScoredPoint,
    ScrollPage, StoredPoint, VectorStore, METADATA_VECTOR_WIDTH,
};
use crate::error::{LifecycleError, StoreError, StoreResult};
use crate::probe::HealthProbeResult;

#[derive(Debug)]
struct Collection {
    width: usize,
    distance: Distance,
    points: HashMap<Uuid, (Vec<f32>, serde_json::Value)>,
}

/// A [`VectorStore`] held entirely in memory.
#[derive(Debug)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    healthy: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Make every subsequent call succeed or fail as if the backend were
    /// up or down.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of points currently stored in `collection`.
    pub fn point_count(&self, collection: &str) -> Option<usize> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        collections.get(collection).map(|c| c.points.len())
    }

    fn check_up(&self) -> StoreResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Lifecycle(LifecycleError::BackendUnavailable {
                endpoint: "memory".to_string(),
                down_for: Duration::ZERO,
            }))
        }
    }

    fn missing(name: &str) -> StoreError {
        StoreError::CollectionNotFound {
            collection: name.to_string(),
        }
    }
}

fn score(distance: Distance, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match distance {
        Distance::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
        Distance::Dot => dot,
        Distance::Euclid => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        Distance::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn health_probe(&self) -> HealthProbeResult {
        if self.healthy.load(Ordering::SeqCst) {
            HealthProbeResult::healthy(Duration::ZERO)
        } else {
            HealthProbeResult::unreachable(Duration::ZERO, "in-memory store marked unhealthy")
        }
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        self.check_up()?;
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn collection_exists(&self, name: &str) -> StoreResult<bool> {
        self.check_up()?;
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        Ok(collections.contains_key(name))
    }

    async fn create_collection(
        &self,
        name: &str,
        width: usize,
        distance: Distance,
    ) -> StoreResult<()> {
        self.check_up()?;
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        if collections.contains_key(name) {
            return Err(StoreError::Http {
                operation: "create collection".to_string(),
                status: 409,
                message: format!("Collection `{name}` already exists!"),
            });
        }
        collections.insert(
            name.to_string(),
            Collection {
                width,
                distance,
                points: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn collection_info(&self, name: &str) -> StoreResult<Option<CollectionInfo>> {
        self.check_up()?;
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        Ok(collections.get(name).map(|c| CollectionInfo {
            width: c.width,
            distance: c.distance,
            points: c.points.len() as u64,
        }))
    }

    async fn delete_collection(&self, name: &str) -> StoreResult<()> {
        self.check_up()?;
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        collections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing(name))
    }

    async fn upsert_points(&self, collection: &str, points: Vec<Point>) -> StoreResult<()> {
        self.check_up()?;
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| Self::missing(collection))?;

        if let Some(bad) = points.iter().find(|p| p.vector.len() != target.width) {
            return Err(StoreError::WidthMismatch {
                collection: collection.to_string(),
                expected: target.width,
                actual: bad.vector.len(),
            });
        }
        for point in points {
            target.points.insert(point.id, (point.vector, point.payload));
        }
        Ok(())
    }

    async fn query_points(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> StoreResult<Vec<ScoredPoint>> {
        self.check_up()?;
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let target = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;
        if vector.len() != target.width {
            return Err(StoreError::WidthMismatch {
                collection: collection.to_string(),
                expected: target.width,
                actual: vector.len(),
            });
        }

        let mut hits: Vec<ScoredPoint> = target
            .points
            .iter()
            .map(|(id, (stored, payload))| ScoredPoint {
                id: id.to_string(),
                score: score(target.distance, &vector, stored),
                payload: Some(payload.clone()),
            })
            .collect();

        if target.distance.higher_is_closer() {
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        } else {
            hits.sort_by(|a, b| a.score.total_cmp(&b.score));
        }
        hits.truncate(limit);
        Ok(hits)
    }

    async fn scroll_points(
        &self,
        collection: &str,
        limit: usize,
        offset: Option<&str>,
    ) -> StoreResult<ScrollPage> {
        self.check_up()?;
        let start = offset
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| StoreError::Parse {
                operation: "scroll points".to_string(),
                message: format!("invalid offset: {e}"),
            })?;

        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let target = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;

        let mut ids: Vec<&Uuid> = target
            .points
            .keys()
            .filter(|id| start.map_or(true, |start| **id >= start))
            .collect();
        ids.sort();

        let next_offset = ids.get(limit).map(|id| id.to_string());
        let points = ids
            .into_iter()
            .take(limit)
            .map(|id| StoredPoint {
                id: id.to_string(),
                payload: target.points.get(id).map(|(_, payload)| payload.clone()),
            })
            .collect();
        Ok(ScrollPage {
            points,
            next_offset,
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
        self.check_up()?;
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let target = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;
        Ok(target
            .points
            .get(&metadata_point_id(key))
            .and_then(|(_, payload)| metadata_value(payload.clone())))
    }

    async fn delete_metadata(&self, collection: &str, key: &str) -> StoreResult<()> {
        self.check_up()?;
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| Self::missing(collection))?;
        target.points.remove(&metadata_point_id(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(vector: Vec<f32>, doc: &str) -> Point {
        Point {
            id: Uuid::new_v4(),
            vector,
            payload: json!({ "document": doc }),
        }
    }

    #[tokio::test]
    async fn test_create_and_list_collections() {
        let store = InMemoryStore::new();
        store.create_collection("b", 3, Distance::Cosine).await.unwrap();
        store.create_collection("a", 3, Distance::Dot).await.unwrap();
        assert_eq!(store.list_collections().await.unwrap(), vec!["a", "b"]);
        assert!(store.collection_exists("a").await.unwrap());
        assert!(!store.collection_exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_collection_is_conflict() {
        let store = InMemoryStore::new();
        store.create_collection("a", 3, Distance::Cosine).await.unwrap();
        let err = store
            .create_collection("a", 3, Distance::Cosine)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Http { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_upsert_rejects_wrong_width() {
        let store = InMemoryStore::new();
        store.create_collection("a", 3, Distance::Cosine).await.unwrap();
        let err = store
            .upsert_points("a", vec![point(vec![1.0, 0.0], "short")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::WidthMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
        assert_eq!(store.point_count("a"), Some(0));
    }

    #[tokio::test]
    async fn test_upsert_into_missing_collection() {
        let store = InMemoryStore::new();
        let err = store
            .upsert_points("nope", vec![point(vec![1.0], "x")])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cosine_query_orders_best_first() {
        let store = InMemoryStore::new();
        store.create_collection("a", 2, Distance::Cosine).await.unwrap();
        store
            .upsert_points(
                "a",
                vec![
                    point(vec![0.0, 1.0], "up"),
                    point(vec![1.0, 0.1], "right"),
                ],
            )
            .await
            .unwrap();
        let hits = store.query_points("a", vec![1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload.as_ref().unwrap()["document"], "right");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_euclid_query_orders_nearest_first() {
        let store = InMemoryStore::new();
        store.create_collection("a", 1, Distance::Euclid).await.unwrap();
        store
            .upsert_points("a", vec![point(vec![10.0], "far"), point(vec![1.0], "near")])
            .await
            .unwrap();
        let hits = store.query_points("a", vec![0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.as_ref().unwrap()["document"], "near");
    }

    #[tokio::test]
    async fn test_metadata_round_trip_and_delete() {
        let store = InMemoryStore::new();
        store
            .create_collection("_meta", METADATA_VECTOR_WIDTH, Distance::Dot)
            .await
            .unwrap();
        assert_eq!(store.read_metadata("_meta", "docs").await.unwrap(), None);

        store
            .upsert_metadata("_meta", "docs", json!({"model": "m"}))
            .await
            .unwrap();
        assert_eq!(
            store.read_metadata("_meta", "docs").await.unwrap(),
            Some(json!({"model": "m"}))
        );

        store.delete_metadata("_meta", "docs").await.unwrap();
        assert_eq!(store.read_metadata("_meta", "docs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_collection_info_reports_shape_and_count() {
        let store = InMemoryStore::new();
        assert_eq!(store.collection_info("a").await.unwrap(), None);

        store.create_collection("a", 2, Distance::Dot).await.unwrap();
        store
            .upsert_points("a", vec![point(vec![1.0, 0.0], "x")])
            .await
            .unwrap();
        let info = store.collection_info("a").await.unwrap().unwrap();
        assert_eq!(info.width, 2);
        assert_eq!(info.distance, Distance::Dot);
        assert_eq!(info.points, 1);
    }

    #[tokio::test]
    async fn test_scroll_pages_through_every_point() {
        let store = InMemoryStore::new();
        store.create_collection("a", 1, Distance::Dot).await.unwrap();
        let points: Vec<Point> = (0..5).map(|i| point(vec![1.0], &format!("d{i}"))).collect();
        store.upsert_points("a", points).await.unwrap();

        let first = store.scroll_points("a", 2, None).await.unwrap();
        assert_eq!(first.points.len(), 2);
        let offset = first.next_offset.clone().unwrap();

        let second = store.scroll_points("a", 2, Some(&offset)).await.unwrap();
        assert_eq!(second.points[0].id, offset);
        let third = store
            .scroll_points("a", 2, second.next_offset.as_deref())
            .await
            .unwrap();
        assert_eq!(third.points.len(), 1);
        assert!(third.next_offset.is_none());

        let mut seen: Vec<String> = [first, second, third]
            .into_iter()
            .flat_map(|page| page.points.into_iter().map(|p| p.id))
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_scroll_rejects_malformed_offset() {
        let store = InMemoryStore::new();
        store.create_collection("a", 1, Distance::Dot).await.unwrap();
        let err = store.scroll_points("a", 2, Some("not-a-uuid")).await.unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_unhealthy_store_fails_calls() {
        let store = InMemoryStore::new();
        store.set_healthy(false);
        assert!(!store.health_probe().await.reachable);
        let err = store.list_collections().await.unwrap_err();
        assert!(err.is_transient());

        store.set_healthy(true);
        assert!(store.list_collections().await.is_ok());
    }
}
