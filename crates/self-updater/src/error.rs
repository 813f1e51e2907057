//! Error types for the update system.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::version::AppVersion;

/// A package that could not be downloaded, with the last error it recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFailure {
    pub name: String,
    pub error: String,
    pub retry_count: u32,
}

impl fmt::Display for PackageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} attempts): {}",
            self.name, self.retry_count, self.error
        )
    }
}

/// A backed-up file that could not be moved back during rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFailure {
    pub path: String,
    pub error: String,
}

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A check or an install pipeline is already running on this session
    #[error("an update operation is already in progress")]
    AlreadyInProgress,

    /// Neither a server list nor a manifest URL was configured
    #[error("no update servers configured")]
    NoServers,

    /// The server answered with nothing usable
    #[error("server returned an empty manifest")]
    ManifestEmpty,

    /// Manifest text could not be parsed
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// Compressed manifest payload could not be inflated
    #[error("failed to decompress manifest payload: {0}")]
    Decompress(String),

    /// The installed version is older than the manifest's minimum
    #[error("current version {current} is below the required minimum {minimum}")]
    VersionTooLow {
        minimum: AppVersion,
        current: AppVersion,
    },

    /// Content hash does not match the declared value
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// File size does not match the declared value
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Download failed with HTTP status
    #[error("download failed with status {status}")]
    DownloadFailed { status: u16 },

    /// Network error during a transfer
    #[error("network error: {0}")]
    NetworkError(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Transfers were cancelled before the batch completed
    #[error("transfer cancelled")]
    Cancelled,

    /// One or more packages exhausted their retry budget
    #[error("{} package(s) failed to download: {}", .0.len(), join_failures(.0))]
    PackagesFailed(Vec<PackageFailure>),

    /// A payload archive could not be unpacked
    #[error("failed to extract package {package}: {reason}")]
    ExtractionFailed { package: String, reason: String },

    /// A manifest-supplied path would leave the directory it is joined to
    #[error("unsafe path {path:?}: {reason}")]
    UnsafePath { path: String, reason: String },

    /// A required install step ran out of retries
    #[error("failed to {action} {path}: {source}")]
    InstallStep {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Installation failed and some backups could not be restored
    #[error("rollback incomplete after {cause}: {} file(s) not restored", .failures.len())]
    RollbackIncomplete {
        cause: Box<UpdateError>,
        failures: Vec<RestoreFailure>,
    },

    /// A delete rule is not a valid pattern
    #[error("invalid delete rule {pattern:?}: {reason}")]
    InvalidRule { pattern: String, reason: String },

    /// Version parsing error
    #[error("version parse error: {0}")]
    VersionParseError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A background task panicked or was aborted
    #[error("background task failed: {0}")]
    TaskFailed(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl UpdateError {
    /// Whether this error is the cooperative cancellation of a transfer.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdateError::Cancelled)
    }
}

fn join_failures(failures: &[PackageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::HttpError(err.to_string())
    }
}

impl From<url::ParseError> for UpdateError {
    fn from(err: url::ParseError) -> Self {
        UpdateError::ConfigError(format!("invalid URL: {}", err))
    }
}

impl From<tokio::task::JoinError> for UpdateError {
    fn from(err: tokio::task::JoinError) -> Self {
        UpdateError::TaskFailed(err.to_string())
    }
}
