//! Backing store access for anchorage.
//!
//! Configuration, port allocation, the lifecycle controller that provisions
//! and health-checks the vector store, and the narrow client capability used
//! to talk to it.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod ports;
pub mod probe;
pub mod resilience;

pub use client::{
    CollectionInfo, InMemoryStore, Point, QdrantClient, ScoredPoint, ScrollPage, StoredPoint,
    VectorStore,
};
pub use config::{BackendMode, Config};
pub use error::{LifecycleError, PortError, StoreError, StoreResult};
pub use lifecycle::{
    BackendTarget, BackingStoreHandle, DockerProvisioner, LifecycleController, LifecycleSettings,
    LifecycleState, OperationPermit, Provisioner,
};
pub use ports::{PortAllocator, PortReport};
pub use probe::{HealthProbe, HealthProbeResult, HttpHealthProbe};
pub use resilience::{retry, Exhausted, RetryPolicy};

/// User agent sent with every HTTP request.
pub const USER_AGENT: &str = concat!("anchorage/", env!("CARGO_PKG_VERSION"));
