//! Collection-model consistency for anchorage.
//!
//! Keeps every collection permanently bound to one embedding model and
//! distance metric, and refuses any vector whose width does not match the
//! bound model before it reaches the backing store.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod association;
pub mod broker;
pub mod embedding;
pub mod error;
pub mod validator;

pub use association::AssociationStore;
pub use broker::{
    BatchEntry, Broker, CollectionReport, DocumentPage, SearchHit, StoredDocument,
};
pub use embedding::{
    EmbeddingProvider, HttpProviderFactory, OpenAiCompatibleProvider, ProviderCache,
    ProviderFactory,
};
pub use error::{BindingError, BindingResult, EmbedError};
pub use validator::{BindingHints, DimensionValidator, PreparedVector};
