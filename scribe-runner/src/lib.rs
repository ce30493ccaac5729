//! # scribe-runner
//!
//! The reactive core of the scribe agent: a single-task control loop that
//! binds templates to the watch layer, schedules re-renders, dampens bursts,
//! coordinates cross-instance deduplication, and supervises an optional
//! child process.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use scribe_core::Config;
//! use scribe_runner::Runner;
//! use scribe_watch::{DependencySource, MemorySource};
//!
//! async fn serve(config: Config) {
//!     let source: Arc<dyn DependencySource> = Arc::new(MemorySource::new());
//!     let mut runner = Runner::new(config, source, false, false).expect("runner");
//!     let mut errors = runner.error_ch().expect("error channel");
//!     let handle = runner.handle();
//!
//!     tokio::spawn(runner.start());
//!     if let Some(err) = errors.recv().await {
//!         eprintln!("runner failed: {err}");
//!         handle.stop();
//!     }
//!     handle.done().await;
//! }
//! ```

pub mod child;
pub mod command;
pub mod dedup;
pub mod env;
pub mod error;
pub mod pid;
pub mod quiescence;
pub mod runner;

pub use child::{Child, SpawnInput};
pub use dedup::DedupManager;
pub use error::{AggregateError, RunnerError};
pub use runner::{RenderEvent, Runner, RunnerHandle};
