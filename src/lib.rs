//! # civitai-dl
//!
//! Batch downloader for CivitAI model artifacts listed in CSV files.
//!
//! ## Overview
//!
//! - **Normalization** - URLs, model page links, bare IDs and free-text names all resolve to one
//!   canonical download URL ([`Normalizer`])
//! - **Bounded concurrency** - downloads run under a global cap, resolutions under their own
//! - **Streaming with retry** - files are streamed to disk and transient failures are retried
//!   with exponential backoff
//! - **Per-entry outcomes** - a failing entry never aborts the batch; every entry ends up in the
//!   [`BatchReport`] with a reason code
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use civitai_dl::{BatchOrchestrator, CivitaiClient, Config, DownloadEngine, Normalizer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::load("config.json".as_ref())?);
//!
//!     let catalog = Arc::new(CivitaiClient::from_config(&config)?);
//!     let normalizer = Arc::new(Normalizer::new(catalog, &config.catalog)?);
//!     let engine = DownloadEngine::new(Arc::clone(&config))?;
//!     let orchestrator = BatchOrchestrator::new(normalizer, engine, "/opt/stable-diffusion");
//!
//!     let entries = civitai_dl::csv_source::read_csv_entries("CSVs/lora.csv".as_ref())?;
//!     let report = orchestrator.run(entries).await;
//!     for failure in report.failures() {
//!         println!("{} -> {}", failure.entry.identifier(), failure.code);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Batch orchestration (resolve, then download)
pub mod batch;
/// Model catalog client
pub mod catalog;
/// Configuration types
pub mod config;
/// CSV and text model lists
pub mod csv_source;
/// Concurrent download engine
pub mod downloader;
/// Error types
pub mod error;
/// Identifier normalization
pub mod normalizer;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use batch::BatchOrchestrator;
pub use catalog::{CatalogClient, CivitaiClient, VersionInfo};
pub use config::{CatalogConfig, Config, DownloadConfig, RetryConfig};
pub use downloader::{
    DownloadEngine, DownloadTask, ProgressSnapshot, ProgressTracker, format_bytes, watch_progress,
};
pub use error::{
    CatalogError, DownloadFailureKind, Error, FetchError, ReasonCode, RemoteErrorKind,
    ResolveFailure, Result,
};
pub use normalizer::{CatalogHost, Identifier, Normalizer};
pub use types::{
    BatchReport, BatchSummary, DownloadTarget, EntryId, Event, ModelCategory, Outcome, RawEntry,
    ReportEntry, Resolution, TaskState,
};

/// Resolve once the process is asked to stop.
///
/// Listens for Ctrl+C everywhere and additionally for SIGTERM on Unix. A handler that cannot be
/// registered is logged and ignored; the function then waits on the remaining one.
///
/// # Example
///
/// ```no_run
/// use civitai_dl::{shutdown_signal, DownloadEngine};
///
/// fn cancel_on_signal(engine: &DownloadEngine) {
///     let token = engine.cancellation_token();
///     tokio::spawn(async move {
///         shutdown_signal().await;
///         token.cancel();
///     });
/// }
/// ```
pub async fn shutdown_signal() {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C"),
            Err(e) => {
                tracing::warn!(error = %e, "Could not listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => {}
        _ = terminate() => {}
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
            tracing::info!("Received SIGTERM");
        }
        Err(e) => {
            // Restricted environments (containers, tests) may refuse the registration
            tracing::warn!(error = %e, "Could not register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
