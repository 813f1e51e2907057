//! Update check state machine.
//!
//! A check fetches the manifest (or reads the session's cached copy),
//! decides between "version too low", "no update" and "update found", and
//! fails over to the next server when a server errors or has nothing new.
//!
//! ```text
//! Idle -> CheckingManifest -+-> VersionTooLow
//!             ^             +-> UpdateFound
//!             |             +-> NoUpdate ----+
//!             |             +-> (error) -----+-> ServerFailover
//!             +----------------------------------------+
//!   servers exhausted: NoUpdate (last said so) | Error (last failed)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::download::ManifestSource;
use crate::error::UpdateError;
use crate::events::{EventSink, UpdateEvent};
use crate::manifest::{decode_manifest_payload, Manifest, ManifestParser, Package, Server};
use crate::selection::{FileVersionSource, PackageSelector};
use crate::session::UpdateSession;
use crate::version::AppVersion;

/// Where a check currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Idle,
    CheckingManifest,
    ServerFailover,
    VersionTooLow,
    NoUpdate,
    UpdateFound,
    Error,
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckState::Idle => "idle",
            CheckState::CheckingManifest => "checking manifest",
            CheckState::ServerFailover => "failing over",
            CheckState::VersionTooLow => "version too low",
            CheckState::NoUpdate => "no update",
            CheckState::UpdateFound => "update found",
            CheckState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A manifest that offers an update, with the packages to fetch.
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    pub manifest: Manifest,
    /// Manifest text as received, for the session cache
    pub manifest_text: String,
    /// URL the manifest was read from; package URLs derive from it
    pub manifest_url: String,
    pub packages: Vec<Package>,
    pub server_index: usize,
}

/// Result of a completed check.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    UpdateFound(UpdateCandidate),
    NoUpdate {
        server_index: usize,
    },
    VersionTooLow {
        minimum: AppVersion,
        current: AppVersion,
        server_index: usize,
    },
}

impl CheckOutcome {
    pub fn server_index(&self) -> usize {
        match self {
            CheckOutcome::UpdateFound(candidate) => candidate.server_index,
            CheckOutcome::NoUpdate { server_index } => *server_index,
            CheckOutcome::VersionTooLow { server_index, .. } => *server_index,
        }
    }

    pub fn has_update(&self) -> bool {
        matches!(self, CheckOutcome::UpdateFound(_))
    }
}

/// Decision for one manifest.
enum Verdict {
    Found(Vec<Package>),
    NoUpdate,
    TooLow { minimum: AppVersion },
}

/// Checks upgrade sources for a newer version.
pub struct UpdateChecker {
    source: Arc<dyn ManifestSource>,
    parser: Arc<dyn ManifestParser>,
    versions: Arc<dyn FileVersionSource>,
    servers: Vec<Server>,
    manifest_url: Option<String>,
    current_index: AtomicUsize,
    state: Mutex<CheckState>,
    events: EventSink,
}

impl UpdateChecker {
    pub fn new(
        source: Arc<dyn ManifestSource>,
        parser: Arc<dyn ManifestParser>,
        versions: Arc<dyn FileVersionSource>,
        servers: Vec<Server>,
    ) -> Self {
        Self {
            source,
            parser,
            versions,
            servers,
            manifest_url: None,
            current_index: AtomicUsize::new(0),
            state: Mutex::new(CheckState::Idle),
            events: EventSink::disconnected(),
        }
    }

    /// Use this manifest URL instead of the server list.
    pub fn with_manifest_url(mut self, url: Option<String>) -> Self {
        self.manifest_url = url.filter(|u| !u.is_empty());
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> CheckState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Index of the server the next check starts from.
    pub fn current_index(&self) -> usize {
        self.current_index.load(Ordering::Acquire)
    }

    pub fn parser(&self) -> &Arc<dyn ManifestParser> {
        &self.parser
    }

    fn set_state(&self, state: CheckState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Run a check, rejecting it if the session is busy.
    pub async fn check(&self, session: &UpdateSession) -> Result<CheckOutcome, UpdateError> {
        let _guard = session.try_begin()?;
        self.check_active(session).await
    }

    /// Run a check on a session the caller already holds active.
    pub async fn check_active(&self, session: &UpdateSession) -> Result<CheckOutcome, UpdateError> {
        self.events.emit(UpdateEvent::CheckStarted);
        let result = self.run(session).await;

        match &result {
            Ok(CheckOutcome::UpdateFound(candidate)) => {
                self.set_state(CheckState::UpdateFound);
                self.events.emit(UpdateEvent::UpdateFound {
                    version: candidate.manifest.app_version,
                    packages: candidate.packages.len(),
                });
            }
            Ok(CheckOutcome::NoUpdate { .. }) => {
                self.set_state(CheckState::NoUpdate);
                self.events.emit(UpdateEvent::NoUpdate);
            }
            Ok(CheckOutcome::VersionTooLow {
                minimum, current, ..
            }) => {
                self.set_state(CheckState::VersionTooLow);
                self.events.emit(UpdateEvent::VersionTooLow {
                    minimum: *minimum,
                    current: *current,
                });
            }
            Err(e) => {
                self.set_state(CheckState::Error);
                error!(error = %e, "Update check failed");
                self.events.emit(UpdateEvent::Failed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn manifest_urls(&self) -> Result<Vec<String>, UpdateError> {
        if let Some(url) = &self.manifest_url {
            return Ok(vec![url.clone()]);
        }
        if self.servers.is_empty() {
            return Err(UpdateError::NoServers);
        }
        self.servers.iter().map(Server::manifest_url).collect()
    }

    async fn run(&self, session: &UpdateSession) -> Result<CheckOutcome, UpdateError> {
        self.set_state(CheckState::CheckingManifest);
        let urls = self.manifest_urls()?;
        let start = self.current_index().min(urls.len() - 1);

        if let Some(text) = session.load_cached_manifest()? {
            info!("Using cached manifest from an earlier run");
            let url = urls[start].clone();
            let cached = self
                .parser
                .parse(&text)
                .and_then(|manifest| self.conclude(session, manifest, text, url, start));
            match cached {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(error = %e, "Discarding unusable session files; fetching again");
                    session.discard_resume_state();
                }
            }
        }

        let mut last_error = None;
        for (server_index, url) in urls.iter().enumerate().skip(start) {
            self.set_state(CheckState::CheckingManifest);
            self.events.emit(UpdateEvent::ManifestFetching {
                server_index,
                url: url.clone(),
            });

            let attempt = match self.fetch(url).await {
                Ok((manifest, text)) => {
                    self.conclude(session, manifest, text, url.clone(), server_index)
                }
                Err(e) => Err(e),
            };
            let reason = match attempt {
                Ok(CheckOutcome::NoUpdate { .. }) => {
                    last_error = None;
                    "no update".to_string()
                }
                Ok(outcome) => {
                    self.current_index.store(server_index, Ordering::Release);
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(server_index, url = %url, error = %e, "Manifest check failed");
                    let reason = e.to_string();
                    last_error = Some(e);
                    reason
                }
            };

            if server_index + 1 < urls.len() {
                self.set_state(CheckState::ServerFailover);
                info!(from = server_index, reason = %reason, "Failing over to next server");
                self.events.emit(UpdateEvent::ServerFailover {
                    from_index: server_index,
                    reason,
                });
            }
        }

        // Exhausted: start from the first server next time
        self.current_index.store(0, Ordering::Release);
        match last_error {
            Some(e) => Err(e),
            None => Ok(CheckOutcome::NoUpdate {
                server_index: urls.len() - 1,
            }),
        }
    }

    async fn fetch(&self, url: &str) -> Result<(Manifest, String), UpdateError> {
        let payload = self.source.fetch_manifest(url).await?;
        let text = decode_manifest_payload(&payload, self.parser.as_ref())?;
        let manifest = self.parser.parse(&text)?;
        debug!(url = %url, version = %manifest.app_version, "Parsed manifest");
        Ok((manifest, text))
    }

    fn conclude(
        &self,
        session: &UpdateSession,
        manifest: Manifest,
        manifest_text: String,
        manifest_url: String,
        server_index: usize,
    ) -> Result<CheckOutcome, UpdateError> {
        let current = session.current_version();
        match self.evaluate(session, &manifest)? {
            Verdict::TooLow { minimum } => {
                warn!(%minimum, %current, "Installed version is below the required minimum");
                Ok(CheckOutcome::VersionTooLow {
                    minimum,
                    current,
                    server_index,
                })
            }
            Verdict::NoUpdate => Ok(CheckOutcome::NoUpdate { server_index }),
            Verdict::Found(packages) => {
                info!(
                    version = %manifest.app_version,
                    packages = packages.len(),
                    server_index,
                    "Update found"
                );
                Ok(CheckOutcome::UpdateFound(UpdateCandidate {
                    manifest,
                    manifest_text,
                    manifest_url,
                    packages,
                    server_index,
                }))
            }
        }
    }

    fn evaluate(&self, session: &UpdateSession, manifest: &Manifest) -> Result<Verdict, UpdateError> {
        if manifest.must_update {
            session.escalate_must_update();
        }
        session.set_auto_exit(manifest.auto_exit_current_process);

        let current = session.current_version();
        if let Some(minimum) = manifest.required_min_version {
            if current < minimum {
                return Ok(Verdict::TooLow { minimum });
            }
        }

        if manifest.app_version <= current {
            debug!(available = %manifest.app_version, %current, "No newer version");
            return Ok(Verdict::NoUpdate);
        }

        let packages = match session.load_packages(self.parser.as_ref())? {
            Some(packages) => {
                info!(packages = packages.len(), "Resuming with persisted package list");
                session.load_preserved()?;
                packages
            }
            None => {
                let components = |id: &str| session.component_enabled(id);
                let selector =
                    PackageSelector::new(session.app_dir(), self.versions.as_ref(), &components);
                let selection = selector.select(manifest)?;
                for path in &selection.preserved {
                    session.preserve(path);
                }
                selection.packages
            }
        };

        if packages.is_empty() {
            return Ok(Verdict::NoUpdate);
        }
        Ok(Verdict::Found(packages))
    }
}
