//! Update manager - orchestrates the complete update flow.
//!
//! Check, download, extract and install run strictly in order, each stage
//! starting only after the previous one succeeded. A failing stage is
//! handled here: the installer has already rolled back its own changes, so
//! the manager records the error, emits one terminal event and removes the
//! session's downloads and staging tree. The rollback tree and the install
//! record outlive the run, whatever its outcome.
//!
//! When the session is in must-update mode, a failed, declined or
//! impossible update asks the host to terminate. A registered
//! [`TerminationObserver`] may veto that request.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::check::{CheckOutcome, UpdateCandidate, UpdateChecker};
use crate::config::UpdateConfig;
use crate::download::{
    DownloadJob, DownloadScheduler, HttpTransport, ManifestSource, PackageFetcher,
};
use crate::error::UpdateError;
use crate::events::{EventSink, UpdateEvent};
use crate::extract::{DefaultExtractor, PayloadExtractor};
use crate::install::{FileInstaller, InstallRetries, RetirementPolicy};
use crate::manifest::{package_source_url, JsonManifestParser, ManifestParser};
use crate::selection::{FileVersionSource, NoVersionInfo};
use crate::session::{ComponentResolver, SessionFlags, SessionPaths, UpdateSession};

/// Current state of the update manager.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpdateState {
    /// Idle, no update in progress
    #[default]
    Idle,
    /// Checking for updates
    Checking,
    /// Update available
    UpdateAvailable,
    /// Downloading packages
    Downloading,
    /// Unpacking payloads into the staging tree
    Extracting,
    /// Replacing application files
    Installing,
    /// Update installed
    Installed,
    /// Error occurred
    Error(String),
}

/// How an update attempt ended, as far as termination is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResolution {
    Installed,
    NoUpdate,
    /// The host chose not to install an available update
    Declined,
    VersionTooLow,
    Failed,
}

/// Whether the host process should exit after an update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationDecision {
    Continue,
    Terminate { exit_code: i32 },
}

impl TerminationDecision {
    /// Must-update sessions terminate unless the update was installed or
    /// there was nothing to install.
    pub fn evaluate(flags: &SessionFlags, resolution: UpdateResolution, exit_code: i32) -> Self {
        let unresolved = matches!(
            resolution,
            UpdateResolution::Failed | UpdateResolution::Declined | UpdateResolution::VersionTooLow
        );
        if flags.must_update && unresolved {
            TerminationDecision::Terminate { exit_code }
        } else {
            TerminationDecision::Continue
        }
    }
}

/// Host hook consulted before the process is terminated.
pub trait TerminationObserver: Send + Sync {
    /// Return `true` to keep the process running.
    fn veto_termination(&self, exit_code: i32) -> bool;
}

/// Main update manager that orchestrates the complete update flow.
///
/// # Example
///
/// ```ignore
/// use self_updater::{UpdateConfig, UpdateManager};
///
/// let config = UpdateConfig::load_from_file(path)?;
/// let manager = UpdateManager::from_config(config)?;
///
/// if let Some(candidate) = manager.check_for_updates().await? {
///     manager.install_update(&candidate).await?;
/// }
/// ```
pub struct UpdateManager {
    config: UpdateConfig,
    session: UpdateSession,
    checker: UpdateChecker,
    parser: Arc<dyn ManifestParser>,
    fetcher: Arc<dyn PackageFetcher>,
    extractor: Arc<dyn PayloadExtractor>,
    observer: Option<Arc<dyn TerminationObserver>>,
    events: EventSink,
    cancel: CancellationToken,
    state: Arc<RwLock<UpdateState>>,
    cached_update: Arc<RwLock<Option<UpdateCandidate>>>,
}

impl UpdateManager {
    /// Build a manager that talks HTTP, with the configured session root or
    /// a fresh one under the temp root.
    pub fn from_config(config: UpdateConfig) -> Result<Self, UpdateError> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config.network)?);
        let session = UpdateSession::new(
            config.session_paths(),
            config.resolve_app_dir()?,
            config.resolve_current_version()?,
        );
        UpdateManagerBuilder::new(config, session)
            .manifest_source(transport.clone())
            .package_fetcher(transport)
            .build()
    }

    pub fn builder(config: UpdateConfig, session: UpdateSession) -> UpdateManagerBuilder {
        UpdateManagerBuilder::new(config, session)
    }

    /// Get the current state of the update manager.
    pub async fn state(&self) -> UpdateState {
        self.state.read().await.clone()
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn session(&self) -> &UpdateSession {
        &self.session
    }

    pub fn checker(&self) -> &UpdateChecker {
        &self.checker
    }

    /// Cancelling this token aborts in-flight downloads.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The candidate found by the last successful check.
    pub async fn cached_update(&self) -> Option<UpdateCandidate> {
        self.cached_update.read().await.clone()
    }

    async fn set_state(&self, state: UpdateState) {
        *self.state.write().await = state;
    }

    /// Check for available updates.
    ///
    /// Returns `Ok(None)` when there is nothing to install. A version below
    /// the manifest's minimum is reported as [`UpdateError::VersionTooLow`].
    pub async fn check_for_updates(&self) -> Result<Option<UpdateCandidate>, UpdateError> {
        let _guard = self.session.try_begin()?;
        self.check_active().await
    }

    async fn check_active(&self) -> Result<Option<UpdateCandidate>, UpdateError> {
        info!("Checking for updates...");
        self.set_state(UpdateState::Checking).await;

        match self.checker.check_active(&self.session).await {
            Ok(CheckOutcome::UpdateFound(candidate)) => {
                *self.cached_update.write().await = Some(candidate.clone());
                self.set_state(UpdateState::UpdateAvailable).await;
                Ok(Some(candidate))
            }
            Ok(CheckOutcome::NoUpdate { .. }) => {
                info!(current = %self.session.current_version(), "No update available");
                self.set_state(UpdateState::Idle).await;
                Ok(None)
            }
            Ok(CheckOutcome::VersionTooLow { minimum, current, .. }) => {
                let e = UpdateError::VersionTooLow { minimum, current };
                self.set_state(UpdateState::Error(e.to_string())).await;
                Err(e)
            }
            Err(e) => {
                self.set_state(UpdateState::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Download and install an update found by a check.
    ///
    /// On failure every installed change has been rolled back and the
    /// session's downloads are removed before the error is returned.
    pub async fn install_update(&self, candidate: &UpdateCandidate) -> Result<(), UpdateError> {
        let _guard = match self.session.try_begin() {
            Ok(guard) => guard,
            Err(e) => {
                self.events.emit(UpdateEvent::Failed {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        self.install_active(candidate).await
    }

    async fn install_active(&self, candidate: &UpdateCandidate) -> Result<(), UpdateError> {
        info!("Installing update to version {}", candidate.manifest.app_version);

        match self.run_pipeline(candidate).await {
            Ok(()) => {
                info!("Update installed successfully");
                self.set_state(UpdateState::Installed).await;
                *self.cached_update.write().await = None;
                self.session.discard_transient();
                self.events.emit(UpdateEvent::Installed {
                    version: candidate.manifest.app_version,
                });
                Ok(())
            }
            Err(e) => {
                error!("Update failed: {}", e);
                self.set_state(UpdateState::Error(e.to_string())).await;
                self.discard_after_failure(&e);
                self.events.emit(UpdateEvent::Failed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn discard_after_failure(&self, err: &UpdateError) {
        if let UpdateError::RollbackIncomplete { failures, .. } = err {
            error!(
                backups = %self.session.paths().rollback_dir().display(),
                unrestored = failures.len(),
                "Some files were not restored; their backups are kept"
            );
        }
        self.session.discard_transient();
    }

    /// Check and, when an update is found, install it in one guarded run.
    ///
    /// Applies the termination policy to the outcome before returning.
    pub async fn run_update(&self) -> Result<UpdateResolution, UpdateError> {
        let guard = self.session.try_begin()?;

        let (resolution, result) = match self.check_active().await {
            Ok(None) => (UpdateResolution::NoUpdate, Ok(())),
            Ok(Some(candidate)) => match self.install_active(&candidate).await {
                Ok(()) => (UpdateResolution::Installed, Ok(())),
                Err(e) => (UpdateResolution::Failed, Err(e)),
            },
            Err(e @ UpdateError::VersionTooLow { .. }) => (UpdateResolution::VersionTooLow, Err(e)),
            Err(e) => (UpdateResolution::Failed, Err(e)),
        };
        drop(guard);

        self.apply_termination_policy(resolution);
        result.map(|()| resolution)
    }

    /// Record that the host declined an available update.
    pub fn decline_update(&self) -> TerminationDecision {
        info!("Update declined");
        self.apply_termination_policy(UpdateResolution::Declined)
    }

    /// What the termination policy says about `resolution`.
    pub fn termination_decision(&self, resolution: UpdateResolution) -> TerminationDecision {
        TerminationDecision::evaluate(
            &self.session.flags(),
            resolution,
            self.config.policy.exit_code,
        )
    }

    /// Evaluate the policy and terminate the process when it says so.
    ///
    /// Returns only if the decision is to continue or the observer vetoed.
    pub fn apply_termination_policy(&self, resolution: UpdateResolution) -> TerminationDecision {
        let decision = self.termination_decision(resolution);
        if let TerminationDecision::Terminate { exit_code } = decision {
            warn!(?resolution, exit_code, "Must-update session cannot continue");
            self.request_termination(exit_code);
        }
        decision
    }

    /// Ask the host to exit; returns `false` if the observer vetoed.
    pub fn request_termination(&self, exit_code: i32) -> bool {
        if let Some(observer) = &self.observer {
            if observer.veto_termination(exit_code) {
                info!(exit_code, "Termination vetoed by host");
                return false;
            }
        }
        info!(exit_code, "Terminating process");
        std::process::exit(exit_code)
    }

    async fn run_pipeline(&self, candidate: &UpdateCandidate) -> Result<(), UpdateError> {
        let paths = self.session.paths().clone();

        // Session files let an interrupted run resume without re-selecting
        self.session.persist_manifest(&candidate.manifest_text)?;
        self.session
            .persist_packages(&candidate.packages, self.parser.as_ref())?;
        self.session.persist_preserved()?;
        self.session.set_aside_previous_rollback()?;

        self.set_state(UpdateState::Downloading).await;
        let jobs = candidate
            .packages
            .iter()
            .map(|package| {
                Ok(DownloadJob::new(
                    package.clone(),
                    package_source_url(&candidate.manifest_url, &package.name),
                    paths.package_payload(&package.name)?,
                ))
            })
            .collect::<Result<Vec<DownloadJob>, UpdateError>>()?;
        DownloadScheduler::new(Arc::clone(&self.fetcher), &self.config.download)
            .with_events(self.events.clone())
            .with_ping_url(candidate.manifest.update_ping_url.clone())
            .with_cancellation(self.cancel.child_token())
            .run(jobs)
            .await?;

        self.set_state(UpdateState::Extracting).await;
        let extractor = Arc::clone(&self.extractor);
        let packages = candidate.packages.clone();
        let events = self.events.clone();
        let extract_paths = paths.clone();
        tokio::task::spawn_blocking(move || -> Result<(), UpdateError> {
            let staging = extract_paths.staging_dir();
            std::fs::create_dir_all(&staging)?;
            for package in &packages {
                let payload = extract_paths.package_payload(&package.name)?;
                let files = extractor.extract(package, &payload, &staging)?;
                debug!(package = %package.name, files, "Package extracted");
                events.emit(UpdateEvent::PackageExtracted {
                    name: package.name.clone(),
                });
            }
            Ok(())
        })
        .await??;

        self.set_state(UpdateState::Installing).await;
        let mut installer = self.build_installer(candidate, &paths)?;
        tokio::task::spawn_blocking(move || installer.install()).await??;
        Ok(())
    }

    fn build_installer(
        &self,
        candidate: &UpdateCandidate,
        paths: &SessionPaths,
    ) -> Result<FileInstaller, UpdateError> {
        let install = &self.config.install;
        let method = install
            .delete_method
            .unwrap_or(candidate.manifest.delete_method);
        let rules = candidate
            .manifest
            .delete_file_rules
            .iter()
            .chain(&install.delete_rules);
        let retirement = RetirementPolicy::new(method, rules)?;

        let mut preserved = self.session.preserved();
        preserved.extend(&install.preserved_files);

        Ok(FileInstaller::new(
            self.session.app_dir().to_path_buf(),
            paths.staging_dir(),
            paths.rollback_dir(),
        )
        .with_retirement(retirement)
        .with_preserved(preserved)
        .with_retries(InstallRetries::from(&install.retry))
        .with_events(self.events.clone())
        .with_record_path(paths.install_record_file()))
    }
}

/// Assembles an [`UpdateManager`] from pluggable collaborators.
pub struct UpdateManagerBuilder {
    config: UpdateConfig,
    session: UpdateSession,
    source: Option<Arc<dyn ManifestSource>>,
    fetcher: Option<Arc<dyn PackageFetcher>>,
    parser: Arc<dyn ManifestParser>,
    versions: Arc<dyn FileVersionSource>,
    extractor: Arc<dyn PayloadExtractor>,
    observer: Option<Arc<dyn TerminationObserver>>,
    events: EventSink,
}

impl UpdateManagerBuilder {
    pub fn new(config: UpdateConfig, session: UpdateSession) -> Self {
        let session = session
            .with_flags(SessionFlags::from(&config.policy))
            .with_preserved(&config.install.preserved_files);
        Self {
            config,
            session,
            source: None,
            fetcher: None,
            parser: Arc::new(JsonManifestParser),
            versions: Arc::new(NoVersionInfo),
            extractor: Arc::new(DefaultExtractor),
            observer: None,
            events: EventSink::disconnected(),
        }
    }

    pub fn manifest_source(mut self, source: Arc<dyn ManifestSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn package_fetcher(mut self, fetcher: Arc<dyn PackageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn ManifestParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn file_versions(mut self, versions: Arc<dyn FileVersionSource>) -> Self {
        self.versions = versions;
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn PayloadExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn component_resolver(mut self, resolver: Arc<dyn ComponentResolver>) -> Self {
        self.session = self.session.with_component_resolver(resolver);
        self
    }

    pub fn termination_observer(mut self, observer: Arc<dyn TerminationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Collaborators not set explicitly fall back to HTTP with the
    /// configured network settings.
    pub fn build(self) -> Result<UpdateManager, UpdateError> {
        let (source, fetcher) = match (self.source.clone(), self.fetcher.clone()) {
            (Some(source), Some(fetcher)) => (source, fetcher),
            (source, fetcher) => {
                let transport = Arc::new(HttpTransport::new(&self.config.network)?);
                (
                    source.unwrap_or_else(|| transport.clone()),
                    fetcher.unwrap_or(transport),
                )
            }
        };
        Ok(self.assemble(source, fetcher))
    }

    fn assemble(
        self,
        source: Arc<dyn ManifestSource>,
        fetcher: Arc<dyn PackageFetcher>,
    ) -> UpdateManager {
        let checker = UpdateChecker::new(
            source,
            Arc::clone(&self.parser),
            self.versions,
            self.config.servers.clone(),
        )
        .with_manifest_url(self.config.manifest_url.clone())
        .with_events(self.events.clone());

        UpdateManager {
            config: self.config,
            session: self.session,
            checker,
            parser: self.parser,
            fetcher,
            extractor: self.extractor,
            observer: self.observer,
            events: self.events,
            cancel: CancellationToken::new(),
            state: Arc::new(RwLock::new(UpdateState::Idle)),
            cached_update: Arc::new(RwLock::new(None)),
        }
    }
}
