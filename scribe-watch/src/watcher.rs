//! Dependency watcher.
//!
//! The watcher owns one polling view task per subscribed dependency. Views
//! run blocking-query fetches against the [`DependencySource`], push value
//! updates onto a shared, pooled data channel, and report fetch failures on
//! a shared error channel. Subscription management (`add` / `remove`) is
//! synchronous; the runner reconciles the set after every render pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scribe_core::dependency::{DepKey, DepValue, Dependency, FetchError};

use crate::source::DependencySource;

/// Buffered update slots shared by all views. The pool lets several
/// dependencies deliver between two runner wakes; the runner drains it
/// before rendering.
const DATA_CHANNEL_CAPACITY: usize = 64;
const ERR_CHANNEL_CAPACITY: usize = 16;

/// A new value for a subscribed dependency.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub dependency: Dependency,
    pub value: DepValue,
}

struct View {
    cancel: CancellationToken,
}

/// Subscription layer over a [`DependencySource`].
pub struct Watcher {
    source: Arc<dyn DependencySource>,
    retry: Duration,
    data_tx: mpsc::Sender<DataEvent>,
    err_tx: mpsc::Sender<FetchError>,
    views: HashMap<DepKey, View>,
}

impl Watcher {
    /// Build a watcher plus its data and error receive channels.
    pub fn new(
        source: Arc<dyn DependencySource>,
        retry: Duration,
    ) -> (Self, mpsc::Receiver<DataEvent>, mpsc::Receiver<FetchError>) {
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(ERR_CHANNEL_CAPACITY);
        (
            Self {
                source,
                retry,
                data_tx,
                err_tx,
                views: HashMap::new(),
            },
            data_rx,
            err_rx,
        )
    }

    /// Subscribe to `dep`. Returns false if it is already watched.
    pub fn add(&mut self, dep: Dependency) -> bool {
        let key = dep.key();
        if self.views.contains_key(&key) {
            return false;
        }

        tracing::debug!(dependency = %key, "adding watch");
        let cancel = CancellationToken::new();
        tokio::spawn(poll_view(
            Arc::clone(&self.source),
            dep,
            self.retry,
            self.data_tx.clone(),
            self.err_tx.clone(),
            cancel.clone(),
        ));
        self.views.insert(key, View { cancel });
        true
    }

    /// Unsubscribe from `dep`. Returns false if it was not watched.
    pub fn remove(&mut self, dep: &Dependency) -> bool {
        match self.views.remove(&dep.key()) {
            Some(view) => {
                tracing::debug!(dependency = %dep.key(), "removing watch");
                view.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn watching(&self, dep: &Dependency) -> bool {
        self.views.contains_key(&dep.key())
    }

    pub fn size(&self) -> usize {
        self.views.len()
    }

    /// Cancel every view. The watcher can be dropped afterwards; in-flight
    /// channel deliveries are discarded by the receiver side going away.
    pub fn stop(&mut self) {
        tracing::debug!(views = self.views.len(), "stopping watcher");
        for (_, view) in self.views.drain() {
            view.cancel.cancel();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_view(
    source: Arc<dyn DependencySource>,
    dep: Dependency,
    retry: Duration,
    data_tx: mpsc::Sender<DataEvent>,
    err_tx: mpsc::Sender<FetchError>,
    cancel: CancellationToken,
) {
    let mut last_index = 0u64;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = source.fetch(&dep, last_index) => outcome,
        };

        match outcome {
            Ok(fetched) => {
                last_index = fetched.index;
                let event = DataEvent {
                    dependency: dep.clone(),
                    value: fetched.value,
                };
                if data_tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(dependency = %dep.key(), error = %err, "view fetch failed");
                if err_tx.send(err).await.is_err() {
                    return;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(retry) => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
