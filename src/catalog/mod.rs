//! Model catalog lookups
//!
//! The [`CatalogClient`] trait is the seam between identifier resolution and the remote
//! service. [`CivitaiClient`] talks to the CivitAI REST API; tests substitute in-memory
//! implementations.

mod civitai;
mod wire;

pub use civitai::CivitaiClient;

use crate::error::CatalogError;
use crate::types::ModelCategory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A downloadable model version as described by the catalog
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Catalog version ID
    pub version_id: u64,
    /// Owning model ID, when the catalog reports it
    pub model_id: Option<u64>,
    /// Download URL as reported by the catalog
    pub download_url: String,
    /// Declared category of the owning model
    pub category: ModelCategory,
    /// Name of the preferred file of this version
    pub file_name: Option<String>,
    /// Display name of the owning model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

/// Lookups against a model catalog
///
/// Implementations must be cheap to share between tasks; the normalizer holds one behind an
/// `Arc` and calls it concurrently.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Look up a specific model version
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the version does not exist; other variants when the
    /// catalog cannot be queried.
    async fn get_version(&self, version_id: u64) -> Result<VersionInfo, CatalogError>;

    /// Look up the default (most recent) version of a model
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the model does not exist or has no versions.
    async fn get_model_default_version(&self, model_id: u64)
    -> Result<VersionInfo, CatalogError>;

    /// Search the catalog by free text and return the best-ranked model ID
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when the search has no results.
    async fn search(&self, text: &str) -> Result<u64, CatalogError>;
}
