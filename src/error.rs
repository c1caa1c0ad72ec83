//! Error types for civitai-dl
//!
//! This module provides the error handling for the library:
//! - [`Error`] for fallible setup operations (configuration, CSV files, client construction)
//! - [`CatalogError`] for lookups against the model catalog
//! - [`FetchError`] for a single download attempt
//! - [`ResolveFailure`] and [`DownloadFailureKind`], recorded per entry in the batch report
//! - [`ReasonCode`], the machine-readable failure taxonomy every reported failure maps to

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for civitai-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for civitai-dl
///
/// Returned by operations that prepare a batch. Failures of individual entries are never
/// surfaced through this type; they are recorded in the [`BatchReport`](crate::BatchReport).
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "chunk_size")
        key: Option<String>,
    },

    /// Catalog client could not be constructed or rejected the credential
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV file could not be read or written
    #[error("CSV error in {path}: {source}")]
    Csv {
        /// The CSV file being processed
        path: PathBuf,
        /// The underlying CSV error
        source: csv::Error,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Errors returned by the model catalog client
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog confirmed there is no matching model, version or search result
    #[error("no matching entry in catalog")]
    NotFound,

    /// The API key is missing or was rejected by the catalog
    #[error("catalog rejected the API key")]
    Unauthorized,

    /// The catalog answered with an unexpected HTTP status
    #[error("catalog returned HTTP {status}")]
    Http {
        /// HTTP status code
        status: u16,
    },

    /// The request could not be sent or the response could not be read
    #[error("catalog request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The response body did not have the expected shape
    #[error("unexpected catalog response: {0}")]
    Decode(String),

    /// The catalog base URL is not usable
    #[error("invalid catalog base URL {url}: {reason}")]
    InvalidBaseUrl {
        /// The configured base URL
        url: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Sub-reason of a remote resolution failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Missing or rejected API key
    Unauthorized,
    /// Unexpected HTTP status from the catalog
    Http,
    /// Connection, timeout or transport failure
    Network,
    /// Malformed catalog response
    Decode,
}

/// Why an entry could not be resolved to a download URL
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ResolveFailure {
    /// Empty or malformed identifier; no catalog call was made
    #[error("identifier is empty or malformed")]
    Unparseable,

    /// The catalog confirmed there is no match
    #[error("catalog has no matching model")]
    NotFound,

    /// The catalog could not be queried
    #[error("catalog lookup failed: {detail}")]
    RemoteError {
        /// Sub-reason, e.g. unauthorized
        kind: RemoteErrorKind,
        /// Human-readable detail
        detail: String,
    },
}

impl ResolveFailure {
    /// Taxonomy code for this failure
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            ResolveFailure::Unparseable => ReasonCode::Unparseable,
            ResolveFailure::NotFound => ReasonCode::NotFound,
            ResolveFailure::RemoteError { .. } => ReasonCode::RemoteError,
        }
    }

    /// True when the failure was caused by a missing or rejected API key
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            ResolveFailure::RemoteError {
                kind: RemoteErrorKind::Unauthorized,
                ..
            }
        )
    }
}

impl From<CatalogError> for ResolveFailure {
    fn from(err: CatalogError) -> Self {
        let kind = match &err {
            CatalogError::NotFound => return ResolveFailure::NotFound,
            CatalogError::Unauthorized => RemoteErrorKind::Unauthorized,
            CatalogError::Http { .. } => RemoteErrorKind::Http,
            CatalogError::Network(_) => RemoteErrorKind::Network,
            CatalogError::Decode(_) | CatalogError::InvalidBaseUrl { .. } => {
                RemoteErrorKind::Decode
            }
        };
        ResolveFailure::RemoteError {
            kind,
            detail: err.to_string(),
        }
    }
}

/// Error from a single download attempt
///
/// Classified as transient or permanent through
/// [`IsRetryable`](crate::retry::IsRetryable).
#[derive(Debug, Error)]
pub enum FetchError {
    /// The target URL cannot be requested
    #[error("invalid download URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// The server answered with a non-success status
    #[error("server returned HTTP {status}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Server-supplied Retry-After delay, if any
        retry_after: Option<Duration>,
    },

    /// Transport failure (connect, TLS, body read)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// No response or body data arrived within the configured timeout
    #[error("no data received for {}s", .timeout.as_secs())]
    Stalled {
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// Body ended before the declared Content-Length
    #[error("response truncated: received {received} of {expected} bytes")]
    Truncated {
        /// Bytes actually received
        received: u64,
        /// Bytes declared by Content-Length
        expected: u64,
    },

    /// Local filesystem failure
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        /// The path being written
        path: PathBuf,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// The batch was cancelled while this attempt was running
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Wrap an I/O error with the path it occurred on
    pub(crate) fn filesystem(path: &std::path::Path, source: std::io::Error) -> Self {
        FetchError::Filesystem {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Final classification of a failed download
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadFailureKind {
    /// Retryable failure that persisted through every attempt
    Transient,
    /// Non-retryable failure (client error, bad URL, filesystem, cancellation)
    Permanent,
}

impl DownloadFailureKind {
    /// Taxonomy code for this failure
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            DownloadFailureKind::Transient => ReasonCode::TransientDownloadFailure,
            DownloadFailureKind::Permanent => ReasonCode::PermanentDownloadFailure,
        }
    }
}

/// Machine-readable failure taxonomy used in batch reports
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Malformed or empty identifier
    Unparseable,
    /// Catalog confirmed no match
    NotFound,
    /// Catalog could not be queried
    RemoteError,
    /// Retryable fetch error, attempts exhausted
    TransientDownloadFailure,
    /// Non-retryable fetch or filesystem error
    PermanentDownloadFailure,
}

impl ReasonCode {
    /// Stable string form, suitable for logs and CSV output
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Unparseable => "unparseable",
            ReasonCode::NotFound => "not_found",
            ReasonCode::RemoteError => "remote_error",
            ReasonCode::TransientDownloadFailure => "transient_download_failure",
            ReasonCode::PermanentDownloadFailure => "permanent_download_failure",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
