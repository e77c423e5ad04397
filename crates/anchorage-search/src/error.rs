//! Error types for the consistency layer.

use anchorage_core::Distance;
use anchorage_store::{LifecycleError, StoreError};
use thiserror::Error;

/// Errors from an embedding provider.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// No endpoint is configured that can serve the model.
    #[error("no embedding endpoint configured for {model}: {reason}")]
    NotConfigured { model: String, reason: String },

    /// The endpoint answered with a non-success status.
    #[error("embedding endpoint returned HTTP {status} for {model}: {message}")]
    Http {
        model: String,
        status: u16,
        message: String,
    },

    /// The response did not contain an embedding.
    #[error("could not parse embedding response for {model}: {message}")]
    Parse { model: String, message: String },

    #[error("embedding request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Request(e) => e.is_timeout() || e.is_connect(),
            Self::NotConfigured { .. } | Self::Parse { .. } => false,
        }
    }
}

/// Errors raised while resolving or enforcing collection-model bindings.
#[derive(Debug, Error)]
pub enum BindingError {
    /// The collection is already bound to a different model or metric.
    /// The existing binding is authoritative.
    #[error(
        "collection '{collection}' is bound to {existing_model} ({existing_distance}); \
         refusing {requested_model} ({requested_distance})"
    )]
    AlreadyBound {
        collection: String,
        existing_model: String,
        existing_distance: Distance,
        requested_model: String,
        requested_distance: Distance,
    },

    /// The name belongs to the reserved metadata collection.
    #[error("collection name '{collection}' is reserved")]
    ReservedCollection { collection: String },

    #[error("invalid collection name '{collection}': {reason}")]
    InvalidCollectionName { collection: String, reason: String },

    /// An unbound collection was used without a model or width hint.
    #[error("collection '{collection}' has no bound model; specify a model or vector width")]
    AmbiguousModel { collection: String },

    /// A call asked for a model other than the one the collection is bound to.
    #[error("collection '{collection}' is bound to {bound}, not {requested}")]
    ModelMismatch {
        collection: String,
        bound: String,
        requested: String,
    },

    /// The embedding capability returned a vector of the wrong length.
    #[error(
        "embedding for collection '{collection}' with {model} has {actual} dimensions, expected {expected}"
    )]
    EmbeddingWidthFault {
        collection: String,
        model: String,
        expected: usize,
        actual: usize,
    },

    /// A model and a width were both given for a first binding and disagree.
    #[error("model {model} produces {model_width}-dimensional vectors, not {requested_width}")]
    ConflictingHints {
        model: String,
        model_width: usize,
        requested_width: usize,
    },

    /// The physical collection already exists with a shape the model
    /// cannot fill.
    #[error(
        "collection '{collection}' holds {actual_width}-dimensional {actual_distance} vectors; \
         {model} needs {expected_width}-dimensional {expected_distance}"
    )]
    ShapeMismatch {
        collection: String,
        model: String,
        expected_width: usize,
        actual_width: usize,
        expected_distance: Distance,
        actual_distance: Distance,
    },

    /// The operation needs an existing binding.
    #[error("collection '{collection}' is not bound to a model")]
    NotBound { collection: String },

    /// A persisted binding could not be decoded.
    #[error("stored binding for '{collection}' is corrupt: {message}")]
    CorruptBinding { collection: String, message: String },

    /// Reading or writing the metadata collection kept failing.
    #[error("binding persistence for '{collection}' failed after {attempts} attempts: {source}")]
    Persistence {
        collection: String,
        attempts: usize,
        #[source]
        source: StoreError,
    },

    #[error("batch of {size} entries exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Registry(#[from] anchorage_core::Error),

    #[error(transparent)]
    Embedding(#[from] EmbedError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl BindingError {
    /// Returns `true` when the operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Persistence { source, .. } | Self::Store(source) => source.is_transient(),
            Self::Embedding(e) => e.is_transient(),
            Self::Lifecycle(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Convenience alias for consistency-layer results.
pub type BindingResult<T> = std::result::Result<T, BindingError>;
