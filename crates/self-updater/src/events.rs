//! Progress and status messages.
//!
//! Long-running operations report through an [`EventSink`]. Each operation
//! ends with exactly one terminal event ([`UpdateEvent::is_terminal`]).

use std::fmt;

use tokio::sync::mpsc;

use crate::version::AppVersion;

/// Install phase reported with [`UpdateEvent::InstallProgress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Retiring,
    Installing,
    RollingBack,
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallPhase::Retiring => write!(f, "retiring"),
            InstallPhase::Installing => write!(f, "installing"),
            InstallPhase::RollingBack => write!(f, "rolling back"),
        }
    }
}

/// A message emitted while checking, downloading, or installing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    CheckStarted,
    ManifestFetching { server_index: usize, url: String },
    ServerFailover { from_index: usize, reason: String },
    /// Terminal for a check
    UpdateFound { version: AppVersion, packages: usize },
    /// Terminal for a check
    NoUpdate,
    /// Terminal for a check
    VersionTooLow { minimum: AppVersion, current: AppVersion },
    PackageDownloadStarted { name: String, attempt: u32 },
    /// Bytes received are non-decreasing within one attempt
    DownloadProgress {
        name: String,
        attempt: u32,
        received: u64,
        total: Option<u64>,
    },
    PackageRetried { name: String, retry_count: u32, error: String },
    PackageDownloaded { name: String },
    PackageExtracted { name: String },
    InstallProgress {
        phase: InstallPhase,
        index: usize,
        total: usize,
        path: String,
    },
    /// Terminal for an install pipeline
    Installed { version: AppVersion },
    /// Terminal for any operation
    Failed { message: String },
}

impl UpdateEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateEvent::UpdateFound { .. }
                | UpdateEvent::NoUpdate
                | UpdateEvent::VersionTooLow { .. }
                | UpdateEvent::Installed { .. }
                | UpdateEvent::Failed { .. }
        )
    }
}

/// Sending half of an event stream.
///
/// A sink without a receiver, or whose receiver was dropped, discards events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<UpdateEvent>>,
}

impl EventSink {
    /// A connected sink and the receiver for its events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: UpdateEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
