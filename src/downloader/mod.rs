//! Concurrent download engine.
//!
//! The [`DownloadEngine`] runs [`DownloadTask`]s under a global concurrency cap:
//! - [`download_task`] - Per-file state machine, streaming and retry
//! - [`progress`] - Aggregate counters readable while a batch runs, and a progress reporter
//!
//! Targets are admitted in input order and may complete in any order. At most
//! `max_concurrent_downloads` tasks are active at once; when one finishes the next target is
//! admitted immediately. A failing task never affects its siblings.

mod download_task;
pub mod progress;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use download_task::DownloadTask;
pub use progress::{ProgressSnapshot, ProgressTracker, format_bytes, watch_progress};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{BatchReport, DownloadTarget, Event};
use download_task::TaskContext;
use futures::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Download engine (cloneable - all state is Arc-wrapped)
///
/// Clones share the HTTP client, the event channel, the progress counters and the
/// cancellation token.
#[derive(Clone)]
pub struct DownloadEngine {
    /// Configuration (wrapped in Arc for sharing across tasks)
    config: Arc<Config>,
    /// State shared by every task
    ctx: Arc<TaskContext>,
}

impl DownloadEngine {
    /// Create an engine with its own HTTP client
    ///
    /// The client carries the API key as a bearer credential, bounds connection setup by the
    /// configured timeout, and is shared by every task.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let api_key = config.api_key.trim();
        if !api_key.is_empty() {
            let mut credential =
                HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
                    Error::config(
                        "civitai_api_key",
                        "contains characters not allowed in an HTTP header",
                    )
                })?;
            credential.set_sensitive(true);
            headers.insert(AUTHORIZATION, credential);
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.download_settings.timeout)
            .default_headers(headers)
            .user_agent(concat!("civitai-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(config, client))
    }

    /// Create an engine around an existing HTTP client
    pub fn with_client(config: Arc<Config>, client: reqwest::Client) -> Self {
        let (event_tx, _rx) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ctx = TaskContext::new(client, &config.download_settings, event_tx);
        Self {
            config,
            ctx: Arc::new(ctx),
        }
    }

    /// Subscribe to download events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// A subscriber that falls behind by more than 1000 events receives
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.ctx.event_tx.subscribe()
    }

    /// Shared progress counters
    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.ctx.progress)
    }

    /// Get the current configuration
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Cancel everything this engine is running or will be asked to run
    ///
    /// In-flight tasks abort their request or backoff sleep and delete their `.part` file.
    /// Targets not yet admitted are recorded as cancelled without any network call.
    pub fn cancel(&self) {
        tracing::info!("Cancelling downloads");
        self.ctx.cancel_token.cancel();
    }

    /// Token that cancels this engine when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel_token.clone()
    }

    /// True once [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.ctx.cancel_token.is_cancelled()
    }

    /// Download every target and return one outcome per target
    ///
    /// Returns only after every task reached a terminal state.
    pub async fn run(&self, targets: impl IntoIterator<Item = DownloadTarget>) -> BatchReport {
        let targets: Vec<DownloadTarget> = targets.into_iter().collect();
        self.ctx.progress.add_pending(targets.len());
        let report = self.download_all(futures::stream::iter(targets)).await;
        self.emit_event(Event::BatchComplete {
            summary: report.summary(),
        });
        report
    }

    /// Like [`run`](Self::run), for targets that arrive over time
    ///
    /// Targets are admitted as they are produced; the call returns once the stream ended and
    /// every admitted task is terminal.
    pub async fn run_stream<S>(&self, targets: S) -> BatchReport
    where
        S: Stream<Item = DownloadTarget>,
    {
        let progress = self.progress();
        let report = self
            .download_all(targets.inspect(move |_| progress.add_pending(1)))
            .await;
        self.emit_event(Event::BatchComplete {
            summary: report.summary(),
        });
        report
    }

    /// Run targets through the bounded pool without announcing batch completion
    pub(crate) async fn download_all<S>(&self, targets: S) -> BatchReport
    where
        S: Stream<Item = DownloadTarget>,
    {
        let limit = self.config.download_settings.max_concurrent_downloads.max(1);
        let max_attempts = self.config.download_settings.retry.max_attempts;

        // Callers may hand in streams that are not Unpin (e.g. built from async blocks)
        let mut outcomes = std::pin::pin!(
            targets
                .map(|target| {
                    let ctx = Arc::clone(&self.ctx);
                    async move { DownloadTask::new(target, max_attempts).run(&ctx).await }
                })
                .buffer_unordered(limit)
        );

        let mut report = BatchReport::new();
        while let Some(result) = outcomes.next().await {
            report.record(result.entry, result.outcome);
        }

        let summary = report.summary();
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.download_failed,
            bytes = summary.bytes,
            "Downloads finished"
        );
        report
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.ctx.emit(event);
    }
}
