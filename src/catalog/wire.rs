//! JSON shapes returned by the CivitAI REST API
//!
//! Only the fields the resolver needs are modelled; everything else is ignored.

use serde::Deserialize;

/// `GET /api/v1/model-versions/{id}`, also embedded in model responses
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModelVersion {
    pub id: u64,
    #[serde(default)]
    pub model_id: Option<u64>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub files: Vec<VersionFile>,
    /// Present on the standalone version endpoint only
    #[serde(default)]
    pub model: Option<VersionModel>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VersionModel {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VersionFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub metadata: Option<FileMetadata>,
}

impl VersionFile {
    pub fn is_safetensor(&self) -> bool {
        let format_matches = self
            .metadata
            .as_ref()
            .and_then(|m| m.format.as_deref())
            .is_some_and(|f| f.eq_ignore_ascii_case("safetensor"));
        let name_matches = self
            .name
            .as_deref()
            .is_some_and(|n| n.to_ascii_lowercase().ends_with(".safetensors"));
        format_matches || name_matches
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileMetadata {
    #[serde(default)]
    pub format: Option<String>,
}

/// `GET /api/v1/models/{id}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Model {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub model_versions: Vec<ModelVersion>,
}

/// `GET /api/v1/models?query=...`
#[derive(Debug, Deserialize)]
pub(crate) struct SearchPage {
    #[serde(default)]
    pub items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchItem {
    pub id: u64,
}

/// Pick the file a version is downloaded as: primary, else first SafeTensor, else first
pub(crate) fn preferred_file(files: &[VersionFile]) -> Option<&VersionFile> {
    files
        .iter()
        .find(|f| f.primary)
        .or_else(|| files.iter().find(|f| f.is_safetensor()))
        .or_else(|| files.first())
}
