//! Shared test helpers for creating DownloadEngine instances in tests.

use crate::config::Config;
use crate::downloader::DownloadEngine;
use crate::types::{DownloadTarget, ModelCategory, RawEntry, Resolution};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Config with fast retries and no jitter so timing assertions are stable.
pub(crate) fn test_config(max_concurrent: usize, max_attempts: u32) -> Config {
    let mut config = Config::default();
    config.api_key = "test-key".to_string();
    config.download_settings.max_concurrent_downloads = max_concurrent;
    config.download_settings.timeout = Duration::from_secs(5);
    config.download_settings.chunk_size = 1024;
    config.download_settings.retry.max_attempts = max_attempts;
    config.download_settings.retry.initial_delay = Duration::from_millis(10);
    config.download_settings.retry.max_delay = Duration::from_secs(5);
    config.download_settings.retry.jitter = false;
    config
}

pub(crate) fn create_test_engine(config: Config) -> DownloadEngine {
    DownloadEngine::new(Arc::new(config)).unwrap()
}

/// A download target for entry `id` fetching `url` into `dir/<file_name>`.
pub(crate) fn target(id: u64, url: &str, dir: &Path, file_name: &str) -> DownloadTarget {
    DownloadTarget {
        entry: RawEntry::from_identifier(id, url),
        resolution: Resolution {
            download_url: url.to_string(),
            category: ModelCategory::Other,
            model_id: None,
            version_id: Some(id),
            file_name: Some(file_name.to_string()),
            model_name: None,
        },
        destination: dir.join(file_name),
    }
}

/// Deterministic payload of `len` bytes.
pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
