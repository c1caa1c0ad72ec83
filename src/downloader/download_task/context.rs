//! Download task context: shared state handed to every task of an engine.

use crate::config::{DownloadConfig, RetryConfig};
use crate::downloader::progress::ProgressTracker;
use crate::types::Event;
use std::sync::Arc;
use std::time::Duration;

/// Shared context for download tasks, reducing parameter passing between helpers.
pub(crate) struct TaskContext {
    /// Shared HTTP client (connection pool, credential, user agent)
    pub(crate) client: reqwest::Client,
    /// Retry policy
    pub(crate) retry: RetryConfig,
    /// Bound on waiting for response headers and for each body chunk
    pub(crate) timeout: Duration,
    /// Largest slice written to disk at once
    pub(crate) chunk_size: usize,
    /// Aggregate counters
    pub(crate) progress: Arc<ProgressTracker>,
    /// Event broadcast sender
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Batch-wide cancellation
    pub(crate) cancel_token: tokio_util::sync::CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(
        client: reqwest::Client,
        settings: &DownloadConfig,
        event_tx: tokio::sync::broadcast::Sender<Event>,
    ) -> Self {
        Self {
            client,
            retry: settings.retry.clone(),
            timeout: settings.timeout,
            chunk_size: settings.chunk_size.max(1),
            progress: Arc::new(ProgressTracker::new()),
            event_tx,
            cancel_token: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Emit an event; dropped silently when nobody is subscribed.
    pub(crate) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}
