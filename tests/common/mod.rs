//! Common test utilities for civitai-dl end-to-end tests
//!
//! [`MockCivitai`] serves both the catalog API (`/api/v1/...`) and the download endpoint
//! (`/api/download/models/{id}`) from one wiremock server, so a real [`CivitaiClient`] and
//! [`DownloadEngine`] can run against it.

#![allow(dead_code)]

use civitai_dl::{
    BatchOrchestrator, CivitaiClient, Config, DownloadEngine, Normalizer,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// API key every mock expects
pub const TEST_API_KEY: &str = "e2e-key";

/// Wiremock server pretending to be CivitAI
pub struct MockCivitai {
    pub server: MockServer,
}

impl MockCivitai {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Canonical download URL on this server
    pub fn download_url(&self, version_id: u64) -> String {
        format!("{}/api/download/models/{version_id}", self.uri())
    }

    /// Serve `GET /api/v1/model-versions/{version_id}`
    pub async fn version(&self, model_id: u64, version_id: u64, model_type: &str, file: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/api/v1/model-versions/{version_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": version_id,
                "modelId": model_id,
                "downloadUrl": self.download_url(version_id),
                "files": [
                    { "name": "preview.png", "primary": false },
                    { "name": file, "primary": true, "metadata": { "format": "SafeTensor" } }
                ],
                "model": { "name": "model", "type": model_type }
            })))
            .mount(&self.server)
            .await;
    }

    /// Serve `GET /api/v1/models/{model_id}` with one version
    pub async fn model(&self, model_id: u64, version_id: u64, model_type: &str, file: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/api/v1/models/{model_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": model_id,
                "name": "model",
                "type": model_type,
                "modelVersions": [{
                    "id": version_id,
                    "downloadUrl": self.download_url(version_id),
                    "files": [{ "name": file, "primary": true }]
                }]
            })))
            .mount(&self.server)
            .await;
    }

    /// Serve a search for `query` returning the given model IDs in rank order
    pub async fn search(&self, query: &str, model_ids: &[u64]) {
        let items: Vec<_> = model_ids.iter().map(|id| json!({ "id": id })).collect();
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .and(query_param("query", query))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": items })))
            .mount(&self.server)
            .await;
    }

    /// Serve the artifact for a version; `expected` pins the number of downloads
    pub async fn artifact(&self, version_id: u64, body: &[u8], expected: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/api/download/models/{version_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .expect(expected)
            .named(format!("artifact {version_id}"))
            .mount(&self.server)
            .await;
    }

    /// Configuration pointing at this server with fast retries
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.api_key = TEST_API_KEY.to_string();
        config.catalog.base_url = self.uri();
        config.download_settings.timeout = Duration::from_secs(5);
        config.download_settings.chunk_size = 1024;
        config.download_settings.retry.initial_delay = Duration::from_millis(10);
        config.download_settings.retry.jitter = false;
        config
    }

    /// Real client, normalizer and engine wired to this server
    pub fn orchestrator(&self, config: Config, root: &Path) -> BatchOrchestrator {
        let catalog = CivitaiClient::from_config(&config).expect("catalog client");
        let normalizer =
            Normalizer::new(Arc::new(catalog), &config.catalog).expect("normalizer");
        let engine = DownloadEngine::new(Arc::new(config)).expect("engine");
        BatchOrchestrator::new(Arc::new(normalizer), engine, root)
    }
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}
