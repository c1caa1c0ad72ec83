//! Batch orchestration: resolve raw entries and download them as they resolve.
//!
//! Resolution runs in its own tokio task, bounded by `max_concurrent_resolutions`, and hands
//! each resolved target to the [`DownloadEngine`] over an mpsc channel. Downloads therefore
//! start while later entries are still being looked up.

use crate::config::Config;
use crate::downloader::DownloadEngine;
use crate::error::ResolveFailure;
use crate::normalizer::Normalizer;
use crate::types::{BatchReport, DownloadTarget, Event, Outcome, RawEntry, Resolution};
use crate::utils::{destination_file_name, unique_path};
use futures::StreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Resolves and downloads a list of entries, producing one outcome per entry
pub struct BatchOrchestrator {
    normalizer: Arc<Normalizer>,
    engine: DownloadEngine,
    root: PathBuf,
}

impl BatchOrchestrator {
    /// Create an orchestrator writing category folders under `root`
    pub fn new(
        normalizer: Arc<Normalizer>,
        engine: DownloadEngine,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            normalizer,
            engine,
            root: root.into(),
        }
    }

    /// The engine downloads are handed to
    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    /// Subscribe to resolution and download events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.engine.subscribe()
    }

    /// Cancel the batch; see [`DownloadEngine::cancel`]
    pub fn cancel(&self) {
        self.engine.cancel();
    }

    /// Resolve and download every entry
    ///
    /// Returns once every entry has exactly one outcome. Entries that were never resolved
    /// because the batch was cancelled are recorded as cancelled. Entry IDs are expected to be
    /// unique; a repeated ID keeps its first outcome.
    pub async fn run(&self, entries: Vec<RawEntry>) -> BatchReport {
        let config = self.engine.config();
        let settings = &config.download_settings;
        let buffer = settings
            .max_concurrent_downloads
            .max(settings.max_concurrent_resolutions)
            .max(1);
        let (tx, rx) = mpsc::channel(buffer);

        info!(entries = entries.len(), root = %self.root.display(), "Starting batch");

        let resolver = tokio::spawn(dispatch(
            Arc::clone(&self.normalizer),
            self.engine.clone(),
            self.root.clone(),
            entries.clone(),
            tx,
        ));

        let downloads = self.engine.download_all(ReceiverStream::new(rx)).await;

        let mut report = match resolver.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Resolver task failed");
                BatchReport::new()
            }
        };
        report.merge(downloads);

        for entry in entries {
            if !report.contains(entry.id) {
                debug!(entry_id = %entry.id, "Entry not resolved before cancellation");
                report.record(entry, Outcome::cancelled(0));
            }
        }

        let summary = report.summary();
        info!(
            succeeded = summary.succeeded,
            resolution_failed = summary.resolution_failed,
            download_failed = summary.download_failed,
            bytes = summary.bytes,
            "Batch complete"
        );
        self.engine.emit_event(Event::BatchComplete { summary });
        report
    }

    /// Resolve every entry without downloading anything
    ///
    /// Results are returned in input order.
    pub async fn resolve_all(
        &self,
        entries: Vec<RawEntry>,
    ) -> Vec<(RawEntry, Result<Resolution, ResolveFailure>)> {
        let limit = self
            .engine
            .config()
            .download_settings
            .max_concurrent_resolutions
            .max(1);

        futures::stream::iter(entries)
            .map(|entry| {
                let normalizer = Arc::clone(&self.normalizer);
                async move {
                    let result = normalizer.normalize(entry.identifier()).await;
                    if let Err(failure) = &result {
                        warn!(
                            entry_id = %entry.id,
                            identifier = entry.identifier(),
                            error = %failure,
                            "Could not resolve entry"
                        );
                    }
                    (entry, result)
                }
            })
            .buffered(limit)
            .collect()
            .await
    }
}

/// Destination for a resolved entry, claimed so no other target in the batch shares it
pub fn destination_for(
    config: &Config,
    root: &Path,
    entry: &RawEntry,
    resolution: &Resolution,
    claimed: &mut HashSet<PathBuf>,
) -> PathBuf {
    let dir = root.join(config.category_dir(resolution.category));
    unique_path(&dir.join(destination_file_name(entry, resolution)), claimed)
}

/// Resolve entries in input order and send each resolved target to the engine.
///
/// Returns the resolution failures. Stops early when the batch is cancelled.
async fn dispatch(
    normalizer: Arc<Normalizer>,
    engine: DownloadEngine,
    root: PathBuf,
    entries: Vec<RawEntry>,
    tx: mpsc::Sender<DownloadTarget>,
) -> BatchReport {
    let config = engine.config();
    let limit = config.download_settings.max_concurrent_resolutions.max(1);
    let cancel = engine.cancellation_token();
    let progress = engine.progress();

    let mut claimed = HashSet::new();
    let mut report = BatchReport::new();

    // Ordered so collision suffixes are assigned in input order
    let mut resolved = futures::stream::iter(entries)
        .map(|entry| {
            let normalizer = Arc::clone(&normalizer);
            async move {
                let result = normalizer.normalize(entry.identifier()).await;
                (entry, result)
            }
        })
        .buffered(limit);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Resolution stopped by cancellation");
                break;
            }
            next = resolved.next() => next,
        };
        let Some((entry, result)) = next else {
            break;
        };

        match result {
            Ok(resolution) => {
                info!(
                    entry_id = %entry.id,
                    url = %resolution.download_url,
                    category = %resolution.category,
                    "Resolved entry"
                );
                engine.emit_event(Event::Resolved {
                    id: entry.id,
                    url: resolution.download_url.clone(),
                    category: resolution.category,
                });

                let destination =
                    destination_for(&config, &root, &entry, &resolution, &mut claimed);
                progress.add_pending(1);
                let target = DownloadTarget {
                    entry,
                    resolution,
                    destination,
                };
                if tx.send(target).await.is_err() {
                    warn!("Download engine stopped accepting targets");
                    break;
                }
            }
            Err(failure) => {
                if failure.is_unauthorized() {
                    error!(entry_id = %entry.id, error = %failure, "Catalog rejected the API key");
                } else {
                    warn!(
                        entry_id = %entry.id,
                        identifier = entry.identifier(),
                        error = %failure,
                        "Could not resolve entry"
                    );
                }
                engine.emit_event(Event::ResolutionFailed {
                    id: entry.id,
                    failure: failure.clone(),
                });
                report.record(entry, Outcome::ResolutionFailed { failure });
            }
        }
    }

    report
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogClient, VersionInfo};
    use crate::error::{CatalogError, ReasonCode};
    use crate::types::{EntryId, ModelCategory};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticCatalog {
        base: String,
        /// version id -> (model id, category, file name)
        versions: HashMap<u64, (u64, ModelCategory, Option<String>)>,
        calls: AtomicUsize,
    }

    impl StaticCatalog {
        fn new(base: &str) -> Self {
            Self {
                base: base.to_string(),
                versions: HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn version(
            mut self,
            model: u64,
            version: u64,
            category: ModelCategory,
            file: Option<&str>,
        ) -> Self {
            self.versions
                .insert(version, (model, category, file.map(str::to_string)));
            self
        }

        fn info(&self, version_id: u64) -> Result<VersionInfo, CatalogError> {
            let (model_id, category, file_name) =
                self.versions.get(&version_id).cloned().ok_or(CatalogError::NotFound)?;
            Ok(VersionInfo {
                version_id,
                model_id: Some(model_id),
                download_url: format!("{}/api/download/models/{version_id}", self.base),
                category,
                file_name,
                model_name: None,
            })
        }
    }

    #[async_trait]
    impl CatalogClient for StaticCatalog {
        async fn get_version(&self, version_id: u64) -> Result<VersionInfo, CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.info(version_id)
        }

        async fn get_model_default_version(
            &self,
            model_id: u64,
        ) -> Result<VersionInfo, CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let version_id = self
                .versions
                .iter()
                .find(|(_, (model, _, _))| *model == model_id)
                .map(|(version, _)| *version)
                .ok_or(CatalogError::NotFound)?;
            self.info(version_id)
        }

        async fn search(&self, _text: &str) -> Result<u64, CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CatalogError::NotFound)
        }
    }

    fn config(base: &str) -> Config {
        let mut config = Config::default();
        config.api_key = "test-key".into();
        config.catalog.base_url = base.to_string();
        config.download_settings.timeout = Duration::from_secs(5);
        config.download_settings.retry.initial_delay = Duration::from_millis(10);
        config.download_settings.retry.jitter = false;
        config
    }

    fn orchestrator(config: Config, catalog: Arc<StaticCatalog>, root: &Path) -> BatchOrchestrator {
        let normalizer = Normalizer::new(catalog, &config.catalog).unwrap();
        let engine = DownloadEngine::new(Arc::new(config)).unwrap();
        BatchOrchestrator::new(Arc::new(normalizer), engine, root)
    }

    async fn serve_version(server: &MockServer, version_id: u64, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(format!("/api/download/models/{version_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn resolves_and_downloads_into_category_dirs() {
        let server = MockServer::start().await;
        serve_version(&server, 11, b"lora-bytes").await;
        serve_version(&server, 21, b"checkpoint-bytes").await;

        let catalog = Arc::new(
            StaticCatalog::new(&server.uri())
                .version(1, 11, ModelCategory::Lora, Some("detail.safetensors"))
                .version(2, 21, ModelCategory::Checkpoint, None),
        );
        let root = TempDir::new().unwrap();
        let orchestrator = orchestrator(config(&server.uri()), catalog, root.path());

        let entries = vec![
            RawEntry::from_identifier(1, format!("{}/api/download/models/11", server.uri())),
            RawEntry {
                name: Some("Base Model".into()),
                ..RawEntry::from_identifier(2, "2")
            },
            RawEntry::from_identifier(3, "zzz-no-such-model"),
        ];
        let report = orchestrator.run(entries).await;

        assert_eq!(report.len(), 3);
        let lora = root.path().join("models/Lora/detail.safetensors");
        let checkpoint = root.path().join("models/Stable-diffusion/Base Model.safetensors");
        assert_eq!(std::fs::read(lora).unwrap(), b"lora-bytes");
        assert_eq!(std::fs::read(checkpoint).unwrap(), b"checkpoint-bytes");
        assert_eq!(
            report.get(EntryId(3)).unwrap().outcome,
            Outcome::ResolutionFailed {
                failure: ResolveFailure::NotFound
            }
        );
    }

    #[tokio::test]
    async fn colliding_names_get_numbered_suffixes() {
        let server = MockServer::start().await;
        serve_version(&server, 11, b"one").await;
        serve_version(&server, 12, b"two").await;

        let catalog = Arc::new(
            StaticCatalog::new(&server.uri())
                .version(1, 11, ModelCategory::Lora, Some("same.safetensors"))
                .version(9, 12, ModelCategory::Lora, Some("same.safetensors")),
        );
        let root = TempDir::new().unwrap();
        let orchestrator = orchestrator(config(&server.uri()), catalog, root.path());

        let report = orchestrator
            .run(vec![
                RawEntry::from_identifier(1, format!("{}/api/download/models/11", server.uri())),
                RawEntry::from_identifier(2, format!("{}/api/download/models/12", server.uri())),
            ])
            .await;

        assert_eq!(report.summary().succeeded, 2);
        let dir = root.path().join("models/Lora");
        assert_eq!(std::fs::read(dir.join("same.safetensors")).unwrap(), b"one");
        assert_eq!(std::fs::read(dir.join("same (1).safetensors")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn blank_identifiers_fail_without_catalog_calls() {
        let catalog = Arc::new(StaticCatalog::new("https://civitai.com"));
        let root = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            config("https://civitai.com"),
            Arc::clone(&catalog),
            root.path(),
        );

        let report = orchestrator
            .run(vec![RawEntry::from_identifier(1, "   ")])
            .await;

        assert_eq!(
            report.get(EntryId(1)).unwrap().outcome.reason_code(),
            Some(ReasonCode::Unparseable)
        );
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_batch_still_reports_every_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let catalog = Arc::new(
            StaticCatalog::new(&server.uri()).version(1, 11, ModelCategory::Lora, None),
        );
        let root = TempDir::new().unwrap();
        let orchestrator = orchestrator(config(&server.uri()), catalog, root.path());
        orchestrator.cancel();

        let entries: Vec<_> = (1..=4)
            .map(|i| RawEntry::from_identifier(i, "1"))
            .collect();
        let report = orchestrator.run(entries).await;

        assert_eq!(report.len(), 4);
        for item in report.iter() {
            assert_eq!(item.outcome, Outcome::cancelled(0));
        }
    }

    #[tokio::test]
    async fn emits_resolution_events_and_batch_complete() {
        let server = MockServer::start().await;
        serve_version(&server, 11, b"x").await;

        let catalog = Arc::new(
            StaticCatalog::new(&server.uri()).version(1, 11, ModelCategory::Vae, None),
        );
        let root = TempDir::new().unwrap();
        let orchestrator = orchestrator(config(&server.uri()), catalog, root.path());
        let mut events = orchestrator.subscribe();

        orchestrator
            .run(vec![
                RawEntry::from_identifier(1, "1"),
                RawEntry::from_identifier(2, "missing model"),
            ])
            .await;

        let mut resolved = 0;
        let mut failed = 0;
        let mut batch_complete = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::Resolved { category, .. } => {
                    assert_eq!(category, ModelCategory::Vae);
                    resolved += 1;
                }
                Event::ResolutionFailed { id, .. } => {
                    assert_eq!(id, EntryId(2));
                    failed += 1;
                }
                Event::BatchComplete { summary } => {
                    assert_eq!(summary.total(), 2);
                    batch_complete += 1;
                }
                _ => {}
            }
        }
        assert_eq!((resolved, failed, batch_complete), (1, 1, 1));
    }

    #[tokio::test]
    async fn resolve_all_keeps_input_order() {
        let catalog = Arc::new(
            StaticCatalog::new("https://civitai.com")
                .version(1, 11, ModelCategory::Lora, None)
                .version(2, 21, ModelCategory::Checkpoint, None),
        );
        let root = TempDir::new().unwrap();
        let orchestrator = orchestrator(config("https://civitai.com"), catalog, root.path());

        let results = orchestrator
            .resolve_all(vec![
                RawEntry::from_identifier(1, "2"),
                RawEntry::from_identifier(2, ""),
                RawEntry::from_identifier(3, "1"),
            ])
            .await;

        let ids: Vec<u64> = results.iter().map(|(entry, _)| entry.id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(
            results[0].1.as_ref().unwrap().download_url,
            "https://civitai.com/api/download/models/21"
        );
        assert_eq!(results[1].1, Err(ResolveFailure::Unparseable));
        assert_eq!(results[2].1.as_ref().unwrap().category, ModelCategory::Lora);
    }
}
