//! Core domain model for anchorage.
//!
//! This crate defines the collection binding model (which embedding model
//! and distance metric a collection is permanently tied to), the distance
//! metrics understood by the backing store, and the static embedding model
//! registry.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod error;
pub mod model;
pub mod registry;

pub use error::{Error, Result};
pub use model::{CollectionBinding, Distance, ModelDescriptor, Provider};
