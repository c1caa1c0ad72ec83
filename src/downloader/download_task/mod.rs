//! Download task execution -- one file from request to final outcome.
//!
//! Split into focused submodules:
//! - [`context`] - Shared state handed to every task
//! - [`orchestration`] - Task state machine, retry and backoff
//! - [`transfer`] - A single attempt: request, stream to disk, verify, rename

mod context;
mod orchestration;
mod transfer;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub(crate) use context::TaskContext;
pub use orchestration::DownloadTask;
