//! The client-pool seam.
//!
//! A [`DependencySource`] is whatever can answer blocking-query fetches for
//! dependencies: a service-registry/secret-store client pool in production,
//! or the in-memory [`MemorySource`](crate::MemorySource) in tests and local
//! development. The watcher only relies on this trait.

use async_trait::async_trait;

use scribe_core::dependency::{DepValue, Dependency, FetchError};

/// One observed value plus the monotonic index it was observed at.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub value: DepValue,
    /// Monotonic per-dependency version; a subsequent fetch with this index
    /// blocks until the data changes again.
    pub index: u64,
}

/// Blocking-query access to dependency data.
#[async_trait]
pub trait DependencySource: Send + Sync + 'static {
    /// Resolve once the dependency's data version exceeds `last_index`.
    ///
    /// The first call for a dependency passes `last_index = 0` and must
    /// resolve with whatever is currently known, including "no data"
    /// expressed as the dependency's zero value.
    async fn fetch(&self, dep: &Dependency, last_index: u64)
        -> Result<FetchOutcome, FetchError>;
}
