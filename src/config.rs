//! Configuration types for civitai-dl
//!
//! The configuration is a JSON document (`config.json` by default). Every field has a
//! default, so an empty object is a valid configuration.

use crate::error::{Error, Result};
use crate::types::ModelCategory;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

/// Main configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// CivitAI API key sent as a bearer credential (default: empty)
    #[serde(rename = "civitai_api_key", default)]
    pub api_key: String,

    /// Directory holding the model list CSV files (default: "CSVs")
    #[serde(default = "default_csvs_directory")]
    pub csvs_directory: PathBuf,

    /// Destination directory per category, relative to the download root
    #[serde(default = "default_model_paths")]
    pub model_paths: BTreeMap<ModelCategory, PathBuf>,

    /// Download behavior (concurrency, timeouts, chunking, retries)
    #[serde(default)]
    pub download_settings: DownloadConfig,

    /// Catalog service location
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            csvs_directory: default_csvs_directory(),
            model_paths: default_model_paths(),
            download_settings: DownloadConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// A missing file is created with the default configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "Created default configuration");
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check that the settings are usable
    pub fn validate(&self) -> Result<()> {
        let settings = &self.download_settings;
        if settings.max_concurrent_downloads == 0 {
            return Err(Error::config(
                "max_concurrent_downloads",
                "must be at least 1",
            ));
        }
        if settings.max_concurrent_resolutions == 0 {
            return Err(Error::config(
                "max_concurrent_resolutions",
                "must be at least 1",
            ));
        }
        if settings.chunk_size == 0 {
            return Err(Error::config("chunk_size", "must be at least 1 byte"));
        }
        if settings.retry.max_attempts == 0 {
            return Err(Error::config("retry_attempts", "must be at least 1"));
        }
        if settings.timeout.is_zero() {
            return Err(Error::config("timeout", "must be at least 1 second"));
        }
        if !settings.retry.backoff_multiplier.is_finite() || settings.retry.backoff_multiplier < 1.0
        {
            return Err(Error::config("backoff_multiplier", "must be at least 1.0"));
        }

        match url::Url::parse(&self.catalog.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {}
            Ok(_) => {
                return Err(Error::config(
                    "catalog.base_url",
                    "must be an http(s) URL with a host",
                ));
            }
            Err(e) => {
                return Err(Error::config(
                    "catalog.base_url",
                    format!("invalid URL: {e}"),
                ));
            }
        }

        Ok(())
    }

    /// Relative destination directory for a category.
    ///
    /// Falls back to the `other` mapping, then to `models/Other`.
    pub fn category_dir(&self, category: ModelCategory) -> PathBuf {
        self.model_paths
            .get(&category)
            .or_else(|| self.model_paths.get(&ModelCategory::Other))
            .cloned()
            .unwrap_or_else(|| PathBuf::from("models/Other"))
    }
}

/// Download behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum concurrent downloads (default: 4)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Maximum concurrent catalog lookups (default: 2)
    #[serde(default = "default_max_resolutions")]
    pub max_concurrent_resolutions: usize,

    /// Request timeout in seconds (default: 30)
    ///
    /// Applies to catalog requests as a whole. For downloads it bounds connecting, waiting for
    /// response headers, and every gap between body chunks, so large files are not cut off.
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Largest piece written to disk at once, in bytes (default: 8192)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Retry behavior for transient download failures
    #[serde(flatten)]
    pub retry: RetryConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent(),
            max_concurrent_resolutions: default_max_resolutions(),
            timeout: default_timeout(),
            chunk_size: default_chunk_size(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per download, including the first (default: 3)
    #[serde(rename = "retry_attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Catalog service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Catalog origin; API calls go to `<base_url>/api/v1/` (default: "https://civitai.com")
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

// Default value functions
fn default_csvs_directory() -> PathBuf {
    PathBuf::from("CSVs")
}

fn default_model_paths() -> BTreeMap<ModelCategory, PathBuf> {
    [
        (ModelCategory::Checkpoint, "models/Stable-diffusion"),
        (ModelCategory::Lora, "models/Lora"),
        (ModelCategory::Locon, "models/Lora"),
        (ModelCategory::Lycoris, "models/Lora"),
        (ModelCategory::ControlNet, "models/ControlNet"),
        (ModelCategory::Hypernetwork, "models/hypernetworks"),
        (ModelCategory::Vae, "models/VAE"),
        (ModelCategory::Poses, "models/Poses"),
        (ModelCategory::TextualInversion, "embeddings"),
        (ModelCategory::Upscaler, "models/ESRGAN"),
        (
            ModelCategory::AestheticGradient,
            "extensions/stable-diffusion-webui-aesthetic-gradients/aesthetic_embeddings",
        ),
        (
            ModelCategory::MotionModule,
            "extensions/sd-webui-animatediff/model",
        ),
        (ModelCategory::Other, "models/Other"),
    ]
    .into_iter()
    .map(|(category, dir)| (category, PathBuf::from(dir)))
    .collect()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_resolutions() -> usize {
    2
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_chunk_size() -> usize {
    8192
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "https://civitai.com".to_string()
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
