//! # scribe-watch
//!
//! The subscription layer between the runner and its data sources:
//! - [`source`] — the [`DependencySource`] seam a client pool implements
//! - [`memory`] — in-memory source + the local [`Catalog`] document
//! - [`watcher`] — per-dependency polling views with pooled data/error channels
//! - [`error`] — [`CatalogError`]

pub mod error;
pub mod memory;
pub mod source;
pub mod watcher;

pub use error::CatalogError;
pub use memory::{Catalog, MemorySource, ServiceInstance};
pub use source::{DependencySource, FetchOutcome};
pub use watcher::{DataEvent, Watcher};
