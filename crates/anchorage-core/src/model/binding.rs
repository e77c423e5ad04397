use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::distance::Distance;

/// The permanent association between a collection and the embedding model
/// and distance metric its vectors were written with.
///
/// The same shape is persisted in the backing store's reserved metadata
/// collection and held in the in-memory binding cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionBinding {
    /// Name of the user-facing collection (unique key).
    pub collection: String,

    /// Canonical registry name of the bound embedding model.
    pub model: String,

    /// Distance metric the collection was created with.
    pub distance: Distance,

    /// When the binding was first created.
    pub created_at: DateTime<Utc>,
}

impl CollectionBinding {
    #[must_use]
    pub fn new(collection: impl Into<String>, model: impl Into<String>, distance: Distance) -> Self {
        Self {
            collection: collection.into(),
            model: model.into(),
            distance,
            created_at: Utc::now(),
        }
    }

    /// Whether this binding already records the given (model, distance) pair.
    #[must_use]
    pub fn matches(&self, model: &str, distance: Distance) -> bool {
        self.model == model && self.distance == distance
    }

    /// Encode as a metadata payload record.
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from a metadata payload record.
    pub fn from_payload(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
