//! CivitAI REST API client

use super::wire::{self, Model, ModelVersion, SearchPage};
use super::{CatalogClient, VersionInfo};
use crate::config::{CatalogConfig, Config};
use crate::error::CatalogError;
use crate::types::ModelCategory;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Number of search results requested; only the first is used
const SEARCH_LIMIT: &str = "10";

/// Client for the CivitAI catalog (`<base>/api/v1/`)
///
/// The API key is attached to every request as a bearer credential. Once the catalog rejects
/// it (401/403), the client stops issuing requests and every call returns
/// [`CatalogError::Unauthorized`].
#[derive(Debug)]
pub struct CivitaiClient {
    http: reqwest::Client,
    base_url: String,
    api_root: Url,
    rejected: AtomicBool,
}

impl CivitaiClient {
    /// Build a client without contacting the catalog
    ///
    /// # Errors
    ///
    /// [`CatalogError::Unauthorized`] when the key is empty or not a valid header value,
    /// [`CatalogError::InvalidBaseUrl`] when the base URL cannot be used.
    pub fn new(
        api_key: &str,
        catalog: &CatalogConfig,
        timeout: Duration,
    ) -> Result<Self, CatalogError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(CatalogError::Unauthorized);
        }

        let base_url = catalog.base_url.trim().trim_end_matches('/').to_string();
        let api_root = Url::parse(&format!("{base_url}/api/v1/")).map_err(|e| {
            CatalogError::InvalidBaseUrl {
                url: catalog.base_url.clone(),
                reason: e.to_string(),
            }
        })?;
        if !matches!(api_root.scheme(), "http" | "https") {
            return Err(CatalogError::InvalidBaseUrl {
                url: catalog.base_url.clone(),
                reason: "scheme must be http or https".to_string(),
            });
        }

        let mut credential = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| CatalogError::Unauthorized)?;
        credential.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, credential);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .user_agent(concat!("civitai-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url,
            api_root,
            rejected: AtomicBool::new(false),
        })
    }

    /// Build a client from the application configuration
    pub fn from_config(config: &Config) -> Result<Self, CatalogError> {
        Self::new(
            &config.api_key,
            &config.catalog,
            config.download_settings.timeout,
        )
    }

    /// Build a client and verify the credential against the catalog
    ///
    /// # Errors
    ///
    /// Everything [`new`](Self::new) returns, plus [`CatalogError::Unauthorized`] when the
    /// catalog rejects the key.
    pub async fn connect(
        api_key: &str,
        catalog: &CatalogConfig,
        timeout: Duration,
    ) -> Result<Self, CatalogError> {
        let client = Self::new(api_key, catalog, timeout)?;
        client.verify_credentials().await?;
        Ok(client)
    }

    /// Issue one cheap request to check the credential
    ///
    /// Only a rejected credential is an error. Other failures are logged and tolerated; the
    /// individual lookups will report them per entry.
    pub async fn verify_credentials(&self) -> Result<(), CatalogError> {
        match self
            .get_json::<SearchPage>("models", &[("limit", "1")])
            .await
        {
            Ok(_) => Ok(()),
            Err(CatalogError::Unauthorized) => Err(CatalogError::Unauthorized),
            Err(e) => {
                warn!(error = %e, "Could not verify catalog credentials");
                Ok(())
            }
        }
    }

    /// True once the catalog has rejected the credential
    pub fn is_rejected(&self) -> bool {
        self.rejected.load(Ordering::Acquire)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CatalogError> {
        if self.is_rejected() {
            return Err(CatalogError::Unauthorized);
        }

        let url = self
            .api_root
            .join(path)
            .map_err(|e| CatalogError::Decode(format!("invalid request path {path}: {e}")))?;
        debug!(%url, "Catalog request");

        let response = self.http.get(url).query(query).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            if !self.rejected.swap(true, Ordering::AcqRel) {
                warn!(status = status.as_u16(), "Catalog rejected the API key");
            }
            return Err(CatalogError::Unauthorized);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound);
        }
        if !status.is_success() {
            return Err(CatalogError::Http {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| CatalogError::Decode(e.to_string()))
    }

    fn version_info(
        &self,
        version: ModelVersion,
        model_id: Option<u64>,
        model_type: Option<&str>,
        model_name: Option<String>,
    ) -> VersionInfo {
        let file_name = wire::preferred_file(&version.files).and_then(|f| f.name.clone());
        let category = version
            .model
            .as_ref()
            .and_then(|m| m.kind.as_deref())
            .or(model_type)
            .map(ModelCategory::from_catalog_type)
            .unwrap_or_default();
        let download_url = version
            .download_url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| format!("{}/api/download/models/{}", self.base_url, version.id));

        VersionInfo {
            version_id: version.id,
            model_id: version.model_id.or(model_id),
            download_url,
            category,
            file_name,
            model_name: version
                .model
                .and_then(|m| m.name)
                .or(model_name)
                .filter(|n| !n.trim().is_empty()),
        }
    }
}

#[async_trait]
impl CatalogClient for CivitaiClient {
    async fn get_version(&self, version_id: u64) -> Result<VersionInfo, CatalogError> {
        let version: ModelVersion = self
            .get_json(&format!("model-versions/{version_id}"), &[])
            .await?;
        Ok(self.version_info(version, None, None, None))
    }

    async fn get_model_default_version(
        &self,
        model_id: u64,
    ) -> Result<VersionInfo, CatalogError> {
        let model: Model = self.get_json(&format!("models/{model_id}"), &[]).await?;
        let Model {
            id,
            name,
            kind,
            model_versions,
        } = model;

        let version = model_versions
            .into_iter()
            .next()
            .ok_or(CatalogError::NotFound)?;
        Ok(self.version_info(version, Some(id), kind.as_deref(), name))
    }

    async fn search(&self, text: &str) -> Result<u64, CatalogError> {
        let page: SearchPage = self
            .get_json(
                "models",
                &[
                    ("query", text),
                    ("limit", SEARCH_LIMIT),
                    ("primaryFileOnly", "true"),
                ],
            )
            .await?;
        page.items
            .first()
            .map(|item| item.id)
            .ok_or(CatalogError::NotFound)
    }
}
