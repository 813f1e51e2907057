//! # self-updater
//!
//! Self-update client for installed applications.
//!
//! This crate handles:
//! - Manifest checks with server failover and gzip-compressed payloads
//! - Package selection against the files already installed
//! - Concurrent package downloads with per-package retry
//! - Transactional file installation with rollback
//!
//! ## Guarantees
//!
//! An install attempt either completes or is rolled back; a failed rollback
//! is reported with every path that could not be restored. Only one check
//! or install runs per [`UpdateSession`] at a time.

pub mod check;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod extract;
pub mod flags;
pub mod install;
pub mod manager;
pub mod manifest;
pub mod preserve;
#[cfg(test)]
mod proptests;
pub mod rollback;
pub mod selection;
pub mod session;
pub mod verifier;
pub mod version;

// Re-export main types for convenience
pub use check::{CheckOutcome, CheckState, UpdateCandidate, UpdateChecker};
pub use config::{
    Credentials, DownloadConfig, FileRetryConfig, InstallConfig, NetworkConfig, PolicyConfig,
    UpdateConfig,
};
pub use download::{
    DownloadJob, DownloadProgress, DownloadScheduler, HttpTransport, ManifestSource,
    PackageFetcher, PackageState,
};
pub use error::{PackageFailure, RestoreFailure, UpdateError};
pub use events::{EventSink, InstallPhase, UpdateEvent};
pub use extract::{CopyExtractor, DefaultExtractor, PayloadExtractor, ZipExtractor};
pub use flags::{UpdateMethod, VerificationLevel};
pub use install::{FileInstaller, InstallRetries, InstallState, RetirementPolicy, RetryPolicy};
pub use manager::{
    TerminationDecision, TerminationObserver, UpdateManager, UpdateManagerBuilder,
    UpdateResolution, UpdateState,
};
pub use manifest::{DeleteMethod, JsonManifestParser, Manifest, ManifestParser, Package, Server};
pub use preserve::PreservedFiles;
pub use rollback::{InstallationRecord, RollbackStore};
pub use selection::{Decision, FileVersionSource, NoVersionInfo, PackageSelector, Selection};
pub use session::{
    ComponentResolver, SessionFlags, SessionGuard, SessionPaths, StaticComponents, UpdateSession,
};
pub use verifier::FileVerifier;
pub use version::AppVersion;
