//! Download task state machine: attempts, backoff and final outcome.

use super::context::TaskContext;
use super::transfer::{AttemptProgress, remove_partial, transfer};
use crate::error::{DownloadFailureKind, FetchError};
use crate::retry::{IsRetryable, next_delay};
use crate::types::{DownloadTarget, EntryId, Event, Outcome, ReportEntry, TaskState};

/// One file to fetch, with its retry state
///
/// Lifecycle: `Pending -> InFlight -> {Succeeded | Retrying -> InFlight | Failed}`.
/// `Retrying` is only entered after a transient failure while attempts remain. A task that is
/// cancelled before its first attempt goes straight from `Pending` to `Failed`.
#[derive(Debug)]
pub struct DownloadTask {
    target: DownloadTarget,
    state: TaskState,
    attempts: u32,
    max_attempts: u32,
    current: AttemptProgress,
}

impl DownloadTask {
    /// Create a pending task; `max_attempts` counts the first attempt and is at least 1
    pub fn new(target: DownloadTarget, max_attempts: u32) -> Self {
        Self {
            target,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            current: AttemptProgress::default(),
        }
    }

    /// Entry this task downloads
    pub fn id(&self) -> EntryId {
        self.target.entry.id
    }

    /// What is being fetched and where it goes
    pub fn target(&self) -> &DownloadTarget {
        &self.target
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt limit
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Bytes written by the current (or last) attempt
    pub fn bytes_written(&self) -> u64 {
        self.current.bytes_written
    }

    /// Content-Length of the current (or last) attempt, when declared
    pub fn total_bytes(&self) -> Option<u64> {
        self.current.total_bytes
    }

    fn set_state(&mut self, ctx: &TaskContext, to: TaskState) {
        ctx.progress.transition(self.state, to);
        self.state = to;
    }

    /// Drive the task to a terminal state
    pub(crate) async fn run(mut self, ctx: &TaskContext) -> ReportEntry {
        let id = self.id();
        let url = self.target.resolution.download_url.clone();
        let destination = self.target.destination.clone();

        if ctx.cancel_token.is_cancelled() {
            tracing::debug!(entry_id = %id, "Batch cancelled before download started");
            return self.fail(ctx, FetchError::Cancelled).await;
        }

        ctx.emit(Event::DownloadStarted {
            id,
            destination: destination.clone(),
        });
        tracing::info!(
            entry_id = %id,
            %url,
            destination = %destination.display(),
            "Starting download"
        );

        loop {
            self.attempts += 1;
            self.set_state(ctx, TaskState::InFlight);

            let result = tokio::select! {
                biased;
                _ = ctx.cancel_token.cancelled() => Err(FetchError::Cancelled),
                result = transfer(ctx, id, &url, &destination, &mut self.current) => result,
            };

            let error = match result {
                Ok(bytes) => return self.succeed(ctx, bytes),
                Err(e) => e,
            };

            if !error.is_retryable() || self.attempts >= self.max_attempts {
                return self.fail(ctx, error).await;
            }

            let delay = next_delay(&ctx.retry, self.attempts, &error);
            self.set_state(ctx, TaskState::Retrying);
            tracing::warn!(
                entry_id = %id,
                error = %error,
                attempt = self.attempts,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Download failed, retrying"
            );
            ctx.emit(Event::Retrying {
                id,
                attempt: self.attempts,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });

            let cancelled = tokio::select! {
                biased;
                _ = ctx.cancel_token.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                return self.fail(ctx, FetchError::Cancelled).await;
            }
        }
    }

    fn succeed(mut self, ctx: &TaskContext, bytes: u64) -> ReportEntry {
        let id = self.id();
        self.set_state(ctx, TaskState::Succeeded);
        let path = self.target.destination.clone();

        if self.attempts > 1 {
            tracing::info!(
                entry_id = %id,
                attempts = self.attempts,
                bytes,
                "Download succeeded after retry"
            );
        } else {
            tracing::info!(entry_id = %id, bytes, path = %path.display(), "Download complete");
        }
        ctx.emit(Event::DownloadComplete {
            id,
            path: path.clone(),
            bytes,
        });

        ReportEntry {
            entry: self.target.entry,
            outcome: Outcome::Succeeded {
                path,
                bytes,
                attempts: self.attempts,
            },
        }
    }

    async fn fail(mut self, ctx: &TaskContext, error: FetchError) -> ReportEntry {
        let id = self.id();
        self.set_state(ctx, TaskState::Failed);
        remove_partial(&self.target.destination).await;

        let outcome = match error {
            FetchError::Cancelled => Outcome::cancelled(self.attempts),
            ref e => {
                let kind = if e.is_retryable() {
                    tracing::error!(
                        entry_id = %id,
                        error = %e,
                        attempts = self.attempts,
                        "Download failed after all retry attempts exhausted"
                    );
                    DownloadFailureKind::Transient
                } else {
                    tracing::error!(
                        entry_id = %id,
                        error = %e,
                        "Download failed with non-retryable error"
                    );
                    DownloadFailureKind::Permanent
                };
                Outcome::DownloadFailed {
                    kind,
                    message: e.to_string(),
                    attempts: self.attempts,
                }
            }
        };

        if let (Some(code), Some(message)) = (outcome.reason_code(), outcome.failure_message()) {
            ctx.emit(Event::DownloadFailed {
                id,
                error: message,
                code,
            });
        }

        ReportEntry {
            entry: self.target.entry,
            outcome,
        }
    }
}
