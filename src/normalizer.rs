//! Identifier normalization
//!
//! Users list models in many shapes: direct download links, model page links (with or without
//! a `modelVersionId` query parameter), bare numeric model IDs, or plain names. This module maps
//! each of them to exactly one canonical download URL of the form
//! `<catalog base>/api/download/models/<versionId>`.
//!
//! Classification ([`Identifier::parse`]) is purely syntactic. The [`Normalizer`] then consults
//! the catalog only for what cannot be answered locally.

use crate::catalog::{CatalogClient, VersionInfo};
use crate::config::CatalogConfig;
use crate::error::{CatalogError, ResolveFailure};
use crate::types::{ModelCategory, Resolution};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Query parameter selecting a specific version on a model page
const VERSION_QUERY_PARAM: &str = "modelVersionId";

/// Host and base URL of the catalog, used to recognize catalog links
#[derive(Clone, Debug)]
pub struct CatalogHost {
    base_url: String,
    host: String,
    port: Option<u16>,
}

impl CatalogHost {
    /// Parse the catalog base URL (e.g. `https://civitai.com`)
    pub fn new(base_url: &str) -> Result<Self, CatalogError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let invalid = |reason: &str| CatalogError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        let host = url
            .host_str()
            .map(normalize_host)
            .ok_or_else(|| invalid("missing host"))?;

        Ok(Self {
            base_url: trimmed.to_string(),
            host,
            port: url.port(),
        })
    }

    /// Canonical download URL for a version
    pub fn download_url(&self, version_id: u64) -> String {
        format!("{}/api/download/models/{version_id}", self.base_url)
    }

    /// True when `url` points at this catalog
    ///
    /// A leading `www.` is ignored. The port only has to match when the base URL names one.
    pub fn matches(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        if normalize_host(host) != self.host {
            return false;
        }
        match self.port {
            Some(port) => url.port_or_known_default() == Some(port),
            None => true,
        }
    }

    /// Version ID of a canonical download URL, `None` for anything else
    pub fn canonical_version(&self, url: &str) -> Option<u64> {
        match Identifier::parse(url, self) {
            Ok(Identifier::Canonical { version_id, .. }) => Some(version_id),
            _ => None,
        }
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}

/// Syntactic shape of a user-supplied identifier
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identifier {
    /// Already a direct download URL; kept verbatim (trimmed)
    Canonical {
        /// The URL as given
        url: String,
        /// Version ID embedded in the path
        version_id: u64,
    },
    /// Model page URL, optionally pinned to a version
    ModelPage {
        /// Model ID from the path
        model_id: u64,
        /// `modelVersionId` query parameter, when present and numeric
        version_id: Option<u64>,
    },
    /// Bare numeric model ID
    ModelId(u64),
    /// Anything else; resolved through catalog search
    FreeText(String),
}

impl Identifier {
    /// Classify a raw identifier without any I/O
    ///
    /// # Errors
    ///
    /// [`ResolveFailure::Unparseable`] for empty input and for digit strings that do not fit
    /// in a `u64`.
    pub fn parse(raw: &str, host: &CatalogHost) -> Result<Self, ResolveFailure> {
        let input = raw.trim();
        if input.is_empty() {
            return Err(ResolveFailure::Unparseable);
        }

        if let Ok(url) = Url::parse(input)
            && host.matches(&url)
            && let Some(identifier) = Self::from_catalog_url(input, &url)?
        {
            return Ok(identifier);
        }

        if is_digits(input) {
            return parse_id(input).map(Identifier::ModelId);
        }

        Ok(Identifier::FreeText(input.to_string()))
    }

    fn from_catalog_url(input: &str, url: &Url) -> Result<Option<Self>, ResolveFailure> {
        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.collect())
            .unwrap_or_default();
        if segments.last() == Some(&"") {
            segments.pop();
        }

        match segments.as_slice() {
            ["api", "download", "models", id] if is_digits(id) => Ok(Some(Identifier::Canonical {
                url: input.to_string(),
                version_id: parse_id(id)?,
            })),
            ["models", id] | ["models", id, _] if is_digits(id) => {
                let version_id = url
                    .query_pairs()
                    .find(|(key, _)| key == VERSION_QUERY_PARAM)
                    .and_then(|(_, value)| {
                        if is_digits(&value) {
                            value.parse::<u64>().ok()
                        } else {
                            None
                        }
                    });
                Ok(Some(Identifier::ModelPage {
                    model_id: parse_id(id)?,
                    version_id,
                }))
            }
            _ => Ok(None),
        }
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_id(s: &str) -> Result<u64, ResolveFailure> {
    s.parse().map_err(|_| ResolveFailure::Unparseable)
}

/// Resolves raw identifiers to canonical download URLs
pub struct Normalizer {
    catalog: Arc<dyn CatalogClient>,
    host: CatalogHost,
}

impl Normalizer {
    /// Create a normalizer for the configured catalog
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        config: &CatalogConfig,
    ) -> Result<Self, CatalogError> {
        Ok(Self {
            catalog,
            host: CatalogHost::new(&config.base_url)?,
        })
    }

    /// The catalog host this normalizer recognizes
    pub fn host(&self) -> &CatalogHost {
        &self.host
    }

    /// Resolve one raw identifier
    ///
    /// Never retries; catalog errors other than `NotFound` become
    /// [`ResolveFailure::RemoteError`].
    pub async fn normalize(&self, raw: &str) -> Result<Resolution, ResolveFailure> {
        match Identifier::parse(raw, &self.host)? {
            Identifier::Canonical { url, version_id } => {
                Ok(self.resolve_canonical(url, version_id).await)
            }
            Identifier::ModelPage {
                version_id: Some(version_id),
                ..
            } => {
                let info = self.catalog.get_version(version_id).await?;
                Ok(self.resolution(info))
            }
            Identifier::ModelPage {
                model_id,
                version_id: None,
            }
            | Identifier::ModelId(model_id) => {
                let info = self.catalog.get_model_default_version(model_id).await?;
                Ok(self.resolution(info))
            }
            Identifier::FreeText(text) => {
                let model_id = self.catalog.search(&text).await?;
                debug!(query = %text, model_id, "Search matched model");
                let info = self.catalog.get_model_default_version(model_id).await?;
                Ok(self.resolution(info))
            }
        }
    }

    async fn resolve_canonical(&self, url: String, version_id: u64) -> Resolution {
        match self.catalog.get_version(version_id).await {
            Ok(info) => Resolution {
                download_url: url,
                category: info.category,
                model_id: info.model_id,
                version_id: Some(version_id),
                file_name: info.file_name,
                model_name: info.model_name,
            },
            Err(e) => {
                debug!(%url, error = %e, "Category lookup failed, using default");
                Resolution {
                    download_url: url,
                    category: ModelCategory::Other,
                    model_id: None,
                    version_id: Some(version_id),
                    file_name: None,
                    model_name: None,
                }
            }
        }
    }

    fn resolution(&self, info: VersionInfo) -> Resolution {
        let download_url = match self.host.canonical_version(&info.download_url) {
            Some(_) => info.download_url,
            None => self.host.download_url(info.version_id),
        };
        Resolution {
            download_url,
            category: info.category,
            model_id: info.model_id,
            version_id: Some(info.version_id),
            file_name: info.file_name,
            model_name: info.model_name,
        }
    }
}
