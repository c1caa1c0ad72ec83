//! Core types for civitai-dl

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{DownloadFailureKind, ReasonCode, ResolveFailure};

/// Identity of an entry within a batch (1-based position in its source file)
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Create a new EntryId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for EntryId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of a model list, as read from CSV or a text file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    /// Position of the entry in its source
    pub id: EntryId,
    /// Serial label as written in the source (the `SrNo` column)
    pub label: String,
    /// Declared model ID, if any
    pub model_id: Option<String>,
    /// Declared model name, if any
    pub name: Option<String>,
    /// Raw URL, ID or name to resolve, if any
    pub url: Option<String>,
}

impl RawEntry {
    /// Create an entry that only carries a raw identifier
    pub fn from_identifier(id: u64, identifier: impl Into<String>) -> Self {
        Self {
            id: EntryId(id),
            label: id.to_string(),
            model_id: None,
            name: None,
            url: Some(identifier.into()),
        }
    }

    /// The string handed to the normalizer.
    ///
    /// Prefers the URL column, then the model ID, then the name. Blank columns are skipped;
    /// an entry with nothing usable yields an empty string.
    pub fn identifier(&self) -> &str {
        [&self.url, &self.model_id, &self.name]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or("")
    }
}

/// Model category reported by the catalog
///
/// Closed set; anything the catalog reports that is not listed here maps to
/// [`ModelCategory::Other`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    /// Full Stable Diffusion checkpoint
    Checkpoint,
    /// LoRA adapter
    Lora,
    /// LoCon adapter
    Locon,
    /// LyCORIS adapter
    Lycoris,
    /// ControlNet model
    ControlNet,
    /// Hypernetwork
    Hypernetwork,
    /// VAE
    Vae,
    /// Pose collections
    Poses,
    /// Textual inversion embedding
    TextualInversion,
    /// Upscaler (ESRGAN etc.)
    Upscaler,
    /// Aesthetic gradient
    AestheticGradient,
    /// AnimateDiff motion module
    MotionModule,
    /// Anything else
    #[default]
    Other,
}

impl ModelCategory {
    /// Every category, in declaration order
    pub const ALL: [ModelCategory; 13] = [
        ModelCategory::Checkpoint,
        ModelCategory::Lora,
        ModelCategory::Locon,
        ModelCategory::Lycoris,
        ModelCategory::ControlNet,
        ModelCategory::Hypernetwork,
        ModelCategory::Vae,
        ModelCategory::Poses,
        ModelCategory::TextualInversion,
        ModelCategory::Upscaler,
        ModelCategory::AestheticGradient,
        ModelCategory::MotionModule,
        ModelCategory::Other,
    ];

    /// Lowercase tag, as used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCategory::Checkpoint => "checkpoint",
            ModelCategory::Lora => "lora",
            ModelCategory::Locon => "locon",
            ModelCategory::Lycoris => "lycoris",
            ModelCategory::ControlNet => "controlnet",
            ModelCategory::Hypernetwork => "hypernetwork",
            ModelCategory::Vae => "vae",
            ModelCategory::Poses => "poses",
            ModelCategory::TextualInversion => "textualinversion",
            ModelCategory::Upscaler => "upscaler",
            ModelCategory::AestheticGradient => "aestheticgradient",
            ModelCategory::MotionModule => "motionmodule",
            ModelCategory::Other => "other",
        }
    }

    /// Map a catalog model type (`"LORA"`, `"TextualInversion"`, `"Controlnet"`, ...)
    ///
    /// Case and non-alphanumeric characters are ignored. Unknown types become `Other`.
    pub fn from_catalog_type(value: &str) -> Self {
        let normalized: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .unwrap_or(ModelCategory::Other)
    }
}

impl std::fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw identifier normalized to a direct-download URL
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Direct-download endpoint (`<catalog>/api/download/models/<versionId>`)
    pub download_url: String,
    /// Category used to pick the destination directory
    pub category: ModelCategory,
    /// Resolved model ID, when the catalog reported one
    pub model_id: Option<u64>,
    /// Resolved model version ID
    pub version_id: Option<u64>,
    /// Primary file name from catalog metadata
    pub file_name: Option<String>,
    /// Display name of the model in the catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

/// A resolved entry ready for the download engine
#[derive(Clone, Debug)]
pub struct DownloadTarget {
    /// The entry this target came from
    pub entry: RawEntry,
    /// Where to download from
    pub resolution: Resolution,
    /// Where to write the file (unique within a batch)
    pub destination: PathBuf,
}

/// Lifecycle state of a download task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted, not yet started
    Pending,
    /// Request or body transfer in progress
    InFlight,
    /// Waiting out a backoff delay after a transient failure
    Retrying,
    /// File written completely
    Succeeded,
    /// Gave up
    Failed,
}

impl TaskState {
    /// True for `Succeeded` and `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// Final result for one entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// File downloaded
    Succeeded {
        /// Destination path
        path: PathBuf,
        /// Bytes written
        bytes: u64,
        /// Attempts used, including the successful one
        attempts: u32,
    },
    /// Identifier could not be resolved; no download attempted
    ResolutionFailed {
        /// Why resolution failed
        failure: ResolveFailure,
    },
    /// Download did not complete
    DownloadFailed {
        /// Transient (exhausted) or permanent
        kind: DownloadFailureKind,
        /// Last error message
        message: String,
        /// Attempts made
        attempts: u32,
    },
}

impl Outcome {
    /// Outcome recorded for entries that were cancelled before finishing
    pub fn cancelled(attempts: u32) -> Self {
        Outcome::DownloadFailed {
            kind: DownloadFailureKind::Permanent,
            message: "cancelled".to_string(),
            attempts,
        }
    }

    /// True for `Succeeded`
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }

    /// Taxonomy code for failures, `None` for successes
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            Outcome::Succeeded { .. } => None,
            Outcome::ResolutionFailed { failure } => Some(failure.reason_code()),
            Outcome::DownloadFailed { kind, .. } => Some(kind.reason_code()),
        }
    }

    /// Human-readable failure description, `None` for successes
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Outcome::Succeeded { .. } => None,
            Outcome::ResolutionFailed { failure } => Some(failure.to_string()),
            Outcome::DownloadFailed { message, .. } => Some(message.clone()),
        }
    }
}

/// Entry and its outcome
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// The raw entry as read
    pub entry: RawEntry,
    /// What happened to it
    pub outcome: Outcome,
}

/// Outcome of every entry in a batch, keyed by entry identity
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchReport {
    entries: BTreeMap<EntryId, ReportEntry>,
}

impl BatchReport {
    /// Create an empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of an entry.
    ///
    /// The report is append-only: a second outcome for the same entry is ignored and
    /// `false` is returned.
    pub fn record(&mut self, entry: RawEntry, outcome: Outcome) -> bool {
        match self.entries.entry(entry.id) {
            std::collections::btree_map::Entry::Occupied(_) => {
                tracing::warn!(entry_id = entry.id.0, "Ignoring duplicate outcome for entry");
                false
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(ReportEntry { entry, outcome });
                true
            }
        }
    }

    /// Merge another report into this one (first outcome wins)
    pub fn merge(&mut self, other: BatchReport) {
        for (_, item) in other.entries {
            self.record(item.entry, item.outcome);
        }
    }

    /// Look up an entry's outcome
    pub fn get(&self, id: EntryId) -> Option<&ReportEntry> {
        self.entries.get(&id)
    }

    /// True if an outcome was recorded for the entry
    pub fn contains(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Iterate entries in ID order
    pub fn iter(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.values()
    }

    /// Number of entries with an outcome
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counts per outcome class
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for item in self.entries.values() {
            match item.outcome {
                Outcome::Succeeded { bytes, .. } => {
                    summary.succeeded += 1;
                    summary.bytes += bytes;
                }
                Outcome::ResolutionFailed { .. } => summary.resolution_failed += 1,
                Outcome::DownloadFailed { .. } => summary.download_failed += 1,
            }
        }
        summary
    }

    /// Failed entries with their reason codes, in ID order
    pub fn failures(&self) -> Vec<FailureRecord<'_>> {
        self.entries
            .values()
            .filter_map(|item| {
                let code = item.outcome.reason_code()?;
                Some(FailureRecord {
                    entry: &item.entry,
                    code,
                    message: item.outcome.failure_message().unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Clones of every failed entry, for re-running just that subset
    pub fn failed_entries(&self) -> Vec<RawEntry> {
        self.failures()
            .into_iter()
            .map(|record| record.entry.clone())
            .collect()
    }
}

/// A failed entry as listed in the report
#[derive(Clone, Debug)]
pub struct FailureRecord<'a> {
    /// The raw entry
    pub entry: &'a RawEntry,
    /// Taxonomy code
    pub code: ReasonCode,
    /// Human-readable detail
    pub message: String,
}

/// Outcome counts for a batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Entries downloaded
    pub succeeded: usize,
    /// Entries that could not be resolved
    pub resolution_failed: usize,
    /// Entries whose download failed
    pub download_failed: usize,
    /// Total bytes of successful downloads
    pub bytes: u64,
}

impl BatchSummary {
    /// Total entries
    pub fn total(&self) -> usize {
        self.succeeded + self.resolution_failed + self.download_failed
    }
}

/// Event emitted while a batch runs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Entry resolved to a download URL
    Resolved {
        /// Entry ID
        id: EntryId,
        /// Canonical download URL
        url: String,
        /// Category
        category: ModelCategory,
    },

    /// Entry could not be resolved
    ResolutionFailed {
        /// Entry ID
        id: EntryId,
        /// Reason
        failure: ResolveFailure,
    },

    /// Download task admitted to the pool
    DownloadStarted {
        /// Entry ID
        id: EntryId,
        /// Destination path
        destination: PathBuf,
    },

    /// Bytes written for a task
    Progress {
        /// Entry ID
        id: EntryId,
        /// Bytes written in the current attempt
        bytes_written: u64,
        /// Content-Length, when declared
        #[serde(skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
    },

    /// Transient failure, waiting before the next attempt
    Retrying {
        /// Entry ID
        id: EntryId,
        /// Attempt that just failed
        attempt: u32,
        /// Delay before the next attempt in milliseconds
        delay_ms: u64,
        /// Error of the failed attempt
        error: String,
    },

    /// Download finished
    DownloadComplete {
        /// Entry ID
        id: EntryId,
        /// Destination path
        path: PathBuf,
        /// Bytes written
        bytes: u64,
    },

    /// Download gave up
    DownloadFailed {
        /// Entry ID
        id: EntryId,
        /// Last error
        error: String,
        /// Reason code
        code: ReasonCode,
    },

    /// Every entry of a batch has an outcome
    BatchComplete {
        /// Outcome counts
        summary: BatchSummary,
    },
}
