//! Cross-instance render deduplication surface.
//!
//! The runner consumes this trait; the backing implementation (a distributed
//! lock plus shared storage that elects one leader per template and fans the
//! leader's data out to followers) lives with the host integration. Followers
//! skip subscribing to shareable dependencies and instead re-render when the
//! manager signals an update.

use tokio::sync::watch;

use scribe_core::dependency::Dependency;
use scribe_template::TemplateId;

use crate::error::RunnerError;

/// Leader election and dependency publication for cooperating agents.
///
/// `stop` must be idempotent: the runner stops the manager early in
/// once-mode and again during final cleanup.
pub trait DedupManager: Send + 'static {
    /// Begin coordinating. Called once before the first render pass.
    fn start(&mut self) -> Result<(), RunnerError>;

    /// Cease coordinating and release any held leadership.
    fn stop(&mut self);

    /// A counter bumped whenever leadership changes or a peer published new
    /// data for a watched template. The runner re-renders on every change.
    fn update_ch(&self) -> watch::Receiver<u64>;

    /// Whether this agent currently owns renders for `template`.
    fn is_leader(&self, template: &TemplateId) -> bool;

    /// Publish the dependency set the leader used for `template`, so
    /// followers can receive the corresponding values.
    fn update_deps(
        &mut self,
        template: &TemplateId,
        used: &[Dependency],
    ) -> Result<(), RunnerError>;
}
