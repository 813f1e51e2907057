//! The update session.
//!
//! One session owns everything that lives for the duration of an update:
//! the per-session temporary root and the files persisted under it, the
//! policy flags (which a must-update manifest escalates), the preserve set,
//! and the memoized component flags. Only one check or install pipeline may
//! run on a session at a time; [`UpdateSession::try_begin`] enforces this.
//!
//! ```text
//! temp_root/
//! ├── update.json          # manifest text, reused instead of re-fetching
//! ├── packages.json        # selected packages, for resumption
//! ├── reservefile.json     # preserve set, for resumption
//! ├── install-record.json  # undo log of the last install attempt
//! ├── packages/            # downloaded payloads
//! ├── new/                 # extracted files to install
//! └── rollback/            # backups mirroring the application root
//! ```
//!
//! After a run only `rollback/` and `install-record.json` stay behind.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::config::PolicyConfig;
use crate::error::UpdateError;
use crate::manifest::{ManifestParser, Package};
use crate::preserve::{checked_relative, PreservedFiles};
use crate::version::AppVersion;

const MANIFEST_FILE: &str = "update.json";
const PACKAGE_LIST_FILE: &str = "packages.json";
const PRESERVE_LIST_FILE: &str = "reservefile.json";
const INSTALL_RECORD_FILE: &str = "install-record.json";
const PACKAGES_DIR: &str = "packages";
const STAGING_DIR: &str = "new";
const ROLLBACK_DIR: &str = "rollback";

/// Paths under a session's temporary root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    root: PathBuf,
}

impl SessionPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// A fresh, uniquely named root below `base`.
    pub fn unique_under(base: &Path) -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        Self::new(base.join(format!("session-{}-{}", stamp, std::process::id())))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn package_list_file(&self) -> PathBuf {
        self.root.join(PACKAGE_LIST_FILE)
    }

    pub fn preserve_list_file(&self) -> PathBuf {
        self.root.join(PRESERVE_LIST_FILE)
    }

    pub fn install_record_file(&self) -> PathBuf {
        self.root.join(INSTALL_RECORD_FILE)
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join(PACKAGES_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn rollback_dir(&self) -> PathBuf {
        self.root.join(ROLLBACK_DIR)
    }

    /// Where a package's payload is saved.
    ///
    /// Fails for names that would place the payload outside the package
    /// directory.
    pub fn package_payload(&self, package_name: &str) -> Result<PathBuf, UpdateError> {
        Ok(self.packages_dir().join(checked_relative(package_name)?))
    }
}

/// Policy flags for the rest of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub force_update: bool,
    pub must_update: bool,
    pub auto_kill_processes: bool,
    pub auto_end_processes_in_app_dir: bool,
    pub auto_exit_current_process: bool,
}

impl From<&PolicyConfig> for SessionFlags {
    fn from(policy: &PolicyConfig) -> Self {
        Self {
            force_update: policy.force_update,
            must_update: policy.must_update,
            auto_kill_processes: policy.auto_kill_processes,
            auto_end_processes_in_app_dir: policy.auto_end_processes_in_app_dir,
            auto_exit_current_process: false,
        }
    }
}

/// Decides whether a feature-scoped package is eligible.
pub trait ComponentResolver: Send + Sync {
    fn is_enabled(&self, component_id: &str) -> bool;
}

/// A fixed map of component flags; unknown components are disabled.
#[derive(Debug, Clone, Default)]
pub struct StaticComponents {
    flags: HashMap<String, bool>,
}

impl StaticComponents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, component_id: impl Into<String>, enabled: bool) -> Self {
        self.flags.insert(component_id.into(), enabled);
        self
    }
}

impl ComponentResolver for StaticComponents {
    fn is_enabled(&self, component_id: &str) -> bool {
        self.flags.get(component_id).copied().unwrap_or(false)
    }
}

/// Resets the session's active flag when dropped.
#[derive(Debug)]
pub struct SessionGuard<'a> {
    active: &'a AtomicBool,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Explicit state of one update session.
pub struct UpdateSession {
    paths: SessionPaths,
    app_dir: PathBuf,
    current_version: AppVersion,
    active: AtomicBool,
    flags: Mutex<SessionFlags>,
    preserved: Mutex<PreservedFiles>,
    resolver: Arc<dyn ComponentResolver>,
    component_cache: Mutex<HashMap<String, bool>>,
}

impl std::fmt::Debug for UpdateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSession")
            .field("paths", &self.paths)
            .field("app_dir", &self.app_dir)
            .field("current_version", &self.current_version)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl UpdateSession {
    pub fn new(paths: SessionPaths, app_dir: PathBuf, current_version: AppVersion) -> Self {
        Self {
            paths,
            app_dir,
            current_version,
            active: AtomicBool::new(false),
            flags: Mutex::new(SessionFlags::default()),
            preserved: Mutex::new(PreservedFiles::new()),
            resolver: Arc::new(StaticComponents::new()),
            component_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_flags(self, flags: SessionFlags) -> Self {
        *lock(&self.flags) = flags;
        self
    }

    pub fn with_component_resolver(mut self, resolver: Arc<dyn ComponentResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_preserved<S: AsRef<str>>(self, paths: impl IntoIterator<Item = S>) -> Self {
        lock(&self.preserved).extend(paths);
        self
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn current_version(&self) -> AppVersion {
        self.current_version
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the session active, rejecting re-entrant operations.
    pub fn try_begin(&self) -> Result<SessionGuard<'_>, UpdateError> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| UpdateError::AlreadyInProgress)?;
        Ok(SessionGuard {
            active: &self.active,
        })
    }

    pub fn flags(&self) -> SessionFlags {
        *lock(&self.flags)
    }

    /// Apply a must-update manifest: kill, end and force become true for good.
    pub fn escalate_must_update(&self) {
        let mut flags = lock(&self.flags);
        flags.must_update = true;
        flags.auto_kill_processes = true;
        flags.auto_end_processes_in_app_dir = true;
        flags.force_update = true;
        info!("Must-update manifest: forcing update and process termination flags");
    }

    pub fn set_auto_exit(&self, auto_exit: bool) {
        lock(&self.flags).auto_exit_current_process |= auto_exit;
    }

    /// Resolve a component flag, asking the resolver at most once per id.
    pub fn component_enabled(&self, component_id: &str) -> bool {
        let mut cache = lock(&self.component_cache);
        if let Some(&enabled) = cache.get(component_id) {
            return enabled;
        }
        let enabled = self.resolver.is_enabled(component_id);
        debug!(component = %component_id, enabled, "Resolved component flag");
        cache.insert(component_id.to_string(), enabled);
        enabled
    }

    pub fn preserve(&self, path: &str) -> bool {
        lock(&self.preserved).insert(path)
    }

    pub fn preserved(&self) -> PreservedFiles {
        lock(&self.preserved).clone()
    }

    /// Cached manifest text from an earlier run, if present.
    pub fn load_cached_manifest(&self) -> Result<Option<String>, UpdateError> {
        read_optional(&self.paths.manifest_file())
    }

    pub fn persist_manifest(&self, text: &str) -> Result<(), UpdateError> {
        write_creating_parent(&self.paths.manifest_file(), text)
    }

    /// Package list persisted by an earlier run, if present.
    pub fn load_packages(
        &self,
        parser: &dyn ManifestParser,
    ) -> Result<Option<Vec<Package>>, UpdateError> {
        match read_optional(&self.paths.package_list_file())? {
            Some(text) => Ok(Some(parser.read_packages(&text)?)),
            None => Ok(None),
        }
    }

    pub fn persist_packages(
        &self,
        packages: &[Package],
        parser: &dyn ManifestParser,
    ) -> Result<(), UpdateError> {
        let text = parser.write_packages(packages)?;
        write_creating_parent(&self.paths.package_list_file(), &text)
    }

    /// Merge a persisted preserve list into the preserve set; returns whether one existed.
    pub fn load_preserved(&self) -> Result<bool, UpdateError> {
        match read_optional(&self.paths.preserve_list_file())? {
            Some(text) => {
                let list: Vec<String> = serde_json::from_str(&text)?;
                lock(&self.preserved).extend(list);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn persist_preserved(&self) -> Result<(), UpdateError> {
        let list = lock(&self.preserved).to_vec();
        let text = serde_json::to_string_pretty(&list)?;
        write_creating_parent(&self.paths.preserve_list_file(), &text)
    }

    /// Remove the resume files so the next check starts from scratch.
    pub fn discard_resume_state(&self) {
        for file in [
            self.paths.manifest_file(),
            self.paths.package_list_file(),
            self.paths.preserve_list_file(),
        ] {
            match fs::remove_file(&file) {
                Ok(()) => debug!(path = %file.display(), "Removed session file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.display(), error = %e, "Failed to remove session file"),
            }
        }
    }

    /// Remove downloads, the staging tree and the resume files.
    ///
    /// The rollback tree and the install record are kept.
    pub fn discard_transient(&self) {
        for dir in [self.paths.packages_dir(), self.paths.staging_dir()] {
            remove_dir_logged(&dir);
        }
        self.discard_resume_state();
    }

    /// Move a rollback tree left by an earlier attempt aside.
    ///
    /// Returns where it went, or `None` when there was nothing to keep.
    pub fn set_aside_previous_rollback(&self) -> Result<Option<PathBuf>, UpdateError> {
        let rollback = self.paths.rollback_dir();
        let has_content = match fs::read_dir(&rollback) {
            Ok(mut entries) => entries.next().is_some(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !has_content {
            return Ok(None);
        }

        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let aside = self.paths.root().join(format!("{ROLLBACK_DIR}-{stamp}"));
        fs::rename(&rollback, &aside)?;
        warn!(
            from = %rollback.display(),
            to = %aside.display(),
            "Kept rollback tree of an earlier attempt"
        );
        Ok(Some(aside))
    }

    /// Remove the session's temporary root. Failures are logged, not returned.
    pub fn cleanup(&self) {
        let root = self.paths.root();
        if !root.exists() {
            return;
        }
        match fs::remove_dir_all(root) {
            Ok(()) => debug!(path = %root.display(), "Removed session directory"),
            Err(e) => warn!(path = %root.display(), error = %e, "Failed to remove session directory"),
        }
    }
}

fn remove_dir_logged(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!(path = %dir.display(), "Removed session directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove session directory"),
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_optional(path: &Path) -> Result<Option<String>, UpdateError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_creating_parent(path: &Path, text: &str) -> Result<(), UpdateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, text)?;
    Ok(())
}
