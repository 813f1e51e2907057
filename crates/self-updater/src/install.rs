//! Transactional file installation.
//!
//! An install attempt runs in two phases against an application root:
//!
//! - **Retire**: when a delete policy is set, every non-preserved file the
//!   policy selects is copied to the rollback root and then deleted. Empty
//!   directories left behind are removed afterwards.
//! - **Install**: every file in the staging directory is placed into the
//!   application root. An existing destination is backed up first.
//!
//! Any unrecoverable step rolls the whole attempt back: installed files are
//! deleted and backups moved back. An attempt ends either fully installed
//! or rolled back; there is no partial-success state.
//!
//! File operations retry at a fixed interval, since the expected failure is
//! a short-lived lock on the file. The installer blocks; async callers run
//! it on a blocking thread.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::FileRetryConfig;
use crate::error::UpdateError;
use crate::events::{EventSink, InstallPhase, UpdateEvent};
use crate::manifest::DeleteMethod;
use crate::preserve::{relative_to, PreservedFiles};
use crate::rollback::{InstallationRecord, RollbackStore};

/// Fixed-interval retry for one kind of file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1)
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op` until it succeeds or the attempts are used up.
    pub fn run<T>(
        &self,
        action: &str,
        path: &Path,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> io::Result<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        path = %path.display(),
                        error = %e,
                        "Failed to {}; retrying", action
                    );
                    if !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Retry policies for each file operation of an install attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallRetries {
    pub delete: RetryPolicy,
    pub backup: RetryPolicy,
    pub copy: RetryPolicy,
    pub cleanup: RetryPolicy,
}

impl Default for InstallRetries {
    fn default() -> Self {
        Self::from(&FileRetryConfig::default())
    }
}

impl From<&FileRetryConfig> for InstallRetries {
    fn from(config: &FileRetryConfig) -> Self {
        let delay = config.delay();
        Self {
            delete: RetryPolicy::new(config.delete_attempts, delay),
            backup: RetryPolicy::new(config.backup_attempts, delay),
            copy: RetryPolicy::new(config.copy_attempts, delay),
            cleanup: RetryPolicy::new(config.cleanup_attempts, delay),
        }
    }
}

impl InstallRetries {
    /// Single attempt, no delay.
    pub fn immediate() -> Self {
        let once = RetryPolicy::new(1, Duration::ZERO);
        Self {
            delete: once,
            backup: once,
            copy: once,
            cleanup: once,
        }
    }
}

/// Which files of the previous installation get retired.
#[derive(Debug, Clone, Default)]
pub struct RetirementPolicy {
    method: DeleteMethod,
    rules: Vec<Regex>,
}

impl RetirementPolicy {
    /// Compile case-insensitive rules for `method`.
    pub fn new<S: AsRef<str>>(
        method: DeleteMethod,
        patterns: impl IntoIterator<Item = S>,
    ) -> Result<Self, UpdateError> {
        let rules = patterns
            .into_iter()
            .map(|p| {
                let pattern = p.as_ref();
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| UpdateError::InvalidRule {
                        pattern: pattern.to_string(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { method, rules })
    }

    pub fn method(&self) -> DeleteMethod {
        self.method
    }

    pub fn is_enabled(&self) -> bool {
        self.method != DeleteMethod::None
    }

    /// Whether the file at relative path `rel` should be retired.
    pub fn should_delete(&self, rel: &str) -> bool {
        let matched = self.rules.iter().any(|rule| rule.is_match(rel));
        match self.method {
            DeleteMethod::None => false,
            DeleteMethod::AllExceptSpecified => !matched,
            DeleteMethod::NoneButSpecified => matched,
        }
    }
}

/// Progress of one install attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    NotStarted,
    RetiringPrevious,
    InstallingNew,
    RollingBack,
    Installed,
    Failed,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallState::NotStarted => "not started",
            InstallState::RetiringPrevious => "retiring previous installation",
            InstallState::InstallingNew => "installing new files",
            InstallState::RollingBack => "rolling back",
            InstallState::Installed => "installed",
            InstallState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Two-phase installer with rollback.
pub struct FileInstaller {
    store: RollbackStore,
    staging: PathBuf,
    retirement: RetirementPolicy,
    preserved: PreservedFiles,
    retries: InstallRetries,
    events: EventSink,
    record_path: Option<PathBuf>,
    record: InstallationRecord,
    state: InstallState,
}

impl FileInstaller {
    /// Install files from `staging` into `app_root`, backing up into `rollback_root`.
    pub fn new(
        app_root: impl Into<PathBuf>,
        staging: impl Into<PathBuf>,
        rollback_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store: RollbackStore::new(app_root, rollback_root),
            staging: staging.into(),
            retirement: RetirementPolicy::default(),
            preserved: PreservedFiles::new(),
            retries: InstallRetries::default(),
            events: EventSink::disconnected(),
            record_path: None,
            record: InstallationRecord::new(),
            state: InstallState::NotStarted,
        }
    }

    pub fn with_retirement(mut self, retirement: RetirementPolicy) -> Self {
        self.retirement = retirement;
        self
    }

    pub fn with_preserved(mut self, preserved: PreservedFiles) -> Self {
        self.preserved = preserved;
        self
    }

    pub fn with_retries(mut self, retries: InstallRetries) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Persist the undo log here after each phase.
    pub fn with_record_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = Some(path.into());
        self
    }

    pub fn state(&self) -> InstallState {
        self.state
    }

    pub fn record(&self) -> &InstallationRecord {
        &self.record
    }

    pub fn store(&self) -> &RollbackStore {
        &self.store
    }

    /// Run a full install attempt.
    ///
    /// On failure the attempt is rolled back before the error is returned.
    /// If some backups could not be restored the error is
    /// [`UpdateError::RollbackIncomplete`] wrapping the original cause.
    pub fn install(&mut self) -> Result<(), UpdateError> {
        info!(
            app_root = %self.store.app_root().display(),
            staging = %self.staging.display(),
            "Starting install attempt"
        );

        self.state = InstallState::RetiringPrevious;
        if let Err(e) = self.retire_previous() {
            return Err(self.abort(e));
        }

        self.state = InstallState::InstallingNew;
        if let Err(e) = self.install_new() {
            return Err(self.abort(e));
        }

        self.state = InstallState::Installed;
        self.save_record();
        info!(
            installed = self.record.installed.len(),
            backed_up = self.record.backed_up.len(),
            "Install attempt complete"
        );
        Ok(())
    }

    /// Retire files of the previous installation.
    ///
    /// Returns the number of files retired. Running it again on an already
    /// retired root retires nothing.
    pub fn retire_previous(&mut self) -> Result<usize, UpdateError> {
        if !self.retirement.is_enabled() {
            debug!("No delete policy; skipping retirement");
            return Ok(0);
        }

        let candidates = self.enumerate_app_files()?;
        let total = candidates.len();
        let mut retired = 0;

        for (index, rel) in candidates.iter().enumerate() {
            if self.preserved.contains(rel) {
                debug!(path = %rel, "Preserved; not retiring");
                continue;
            }
            if !self.retirement.should_delete(rel) {
                continue;
            }

            self.events.emit(UpdateEvent::InstallProgress {
                phase: InstallPhase::Retiring,
                index: index + 1,
                total,
                path: rel.clone(),
            });

            let original = self.store.app_path(rel);
            self.store
                .backup(rel)
                .map_err(|e| step_error("back up", &original, e))?;
            self.retries
                .delete
                .run("delete", &original, || fs::remove_file(&original))
                .map_err(|e| step_error("delete", &original, e))?;

            self.record.record_backup(rel);
            retired += 1;
            debug!(path = %rel, "Retired file");
        }

        self.remove_empty_dirs();
        self.save_record();
        info!(retired, method = ?self.retirement.method(), "Retired previous installation");
        Ok(retired)
    }

    /// Place every staged file into the application root.
    pub fn install_new(&mut self) -> Result<usize, UpdateError> {
        let files = list_files(&self.staging, &[])?;
        let total = files.len();

        for (index, rel) in files.iter().enumerate() {
            self.events.emit(UpdateEvent::InstallProgress {
                phase: InstallPhase::Installing,
                index: index + 1,
                total,
                path: rel.clone(),
            });

            let destination = self.store.app_path(rel);
            let source = self.staging.join(rel);

            if destination.exists() {
                let store = &self.store;
                self.retries
                    .backup
                    .run("back up", &destination, || {
                        if destination.exists() {
                            store.backup(rel)?;
                            fs::remove_file(&destination)?;
                        }
                        Ok(())
                    })
                    .map_err(|e| step_error("back up", &destination, e))?;
                self.record.record_backup(rel);
            }

            self.retries
                .copy
                .run("copy", &destination, || {
                    if let Some(parent) = destination.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(&source, &destination).map(|_| ())
                })
                .map_err(|e| step_error("install", &destination, e))?;
            self.record.record_install(rel);

            // Best effort: the file is already installed
            if let Err(e) = self
                .retries
                .cleanup
                .run("remove staged copy of", &source, || fs::remove_file(&source))
            {
                warn!(path = %source.display(), error = %e, "Staged file left behind");
            }

            debug!(path = %rel, "Installed file");
        }

        self.save_record();
        info!(installed = total, "Installed new files");
        Ok(total)
    }

    fn abort(&mut self, cause: UpdateError) -> UpdateError {
        warn!(state = %self.state, error = %cause, "Install attempt failed; rolling back");
        self.state = InstallState::RollingBack;

        let events = &self.events;
        let failures = self
            .store
            .roll_back_with_progress(&self.record, |index, total, rel| {
                events.emit(UpdateEvent::InstallProgress {
                    phase: InstallPhase::RollingBack,
                    index,
                    total,
                    path: rel.to_string(),
                });
            });

        self.state = InstallState::Failed;
        self.save_record();
        if failures.is_empty() {
            cause
        } else {
            UpdateError::RollbackIncomplete {
                cause: Box::new(cause),
                failures,
            }
        }
    }

    fn enumerate_app_files(&self) -> Result<Vec<String>, UpdateError> {
        let excluded = [self.store.rollback_root(), self.staging.as_path()];
        list_files(self.store.app_root(), &excluded)
    }

    /// Remove directories left empty under the application root, bottom-up.
    fn remove_empty_dirs(&self) {
        let root = self.store.app_root();
        let dirs = WalkDir::new(root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir());

        for dir in dirs {
            let path = dir.path();
            let is_empty = match fs::read_dir(path) {
                Ok(mut entries) => entries.next().is_none(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to inspect directory");
                    continue;
                }
            };
            if is_empty {
                match fs::remove_dir(path) {
                    Ok(()) => debug!(path = %path.display(), "Removed empty directory"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove empty directory"),
                }
            }
        }
    }

    fn save_record(&self) {
        if let Some(path) = &self.record_path {
            if let Err(e) = self.record.save(path) {
                warn!(path = %path.display(), error = %e, "Failed to persist install record");
            }
        }
    }
}

fn step_error(action: &'static str, path: &Path, source: io::Error) -> UpdateError {
    UpdateError::InstallStep {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Relative paths of every file under `root`, sorted, skipping `excluded` subtrees.
fn list_files(root: &Path, excluded: &[&Path]) -> Result<Vec<String>, UpdateError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !excluded.iter().any(|ex| entry.path().starts_with(ex)));

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(rel) = relative_to(root, entry.path()) {
            files.push(rel);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        app: PathBuf,
        staging: PathBuf,
        rollback: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let app = temp.path().join("app");
            let staging = temp.path().join("new");
            let rollback = temp.path().join("rollback");
            fs::create_dir_all(&app).unwrap();
            fs::create_dir_all(&staging).unwrap();
            Self {
                _temp: temp,
                app,
                staging,
                rollback,
            }
        }

        fn app_file(&self, rel: &str, content: &[u8]) {
            write_file(&self.app.join(rel), content);
        }

        fn staged_file(&self, rel: &str, content: &[u8]) {
            write_file(&self.staging.join(rel), content);
        }

        fn installer(&self) -> FileInstaller {
            FileInstaller::new(&self.app, &self.staging, &self.rollback)
                .with_retries(InstallRetries::immediate())
        }

        fn read_app(&self, rel: &str) -> Option<Vec<u8>> {
            fs::read(self.app.join(rel)).ok()
        }
    }

    fn write_file(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_retry_policy_gives_up_after_attempts() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let mut calls = 0;
        let result: io::Result<()> = policy.run("touch", Path::new("x"), || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_policy_recovers() {
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let mut calls = 0;
        let result = policy.run("touch", Path::new("x"), || {
            calls += 1;
            if calls < 4 {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 4);
    }

    #[test]
    fn test_default_retries_match_config() {
        let retries = InstallRetries::default();
        assert_eq!(retries.delete.attempts, 10);
        assert_eq!(retries.backup.attempts, 20);
        assert_eq!(retries.copy.attempts, 10);
        assert_eq!(retries.cleanup.attempts, 10);
        assert_eq!(retries.copy.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_retirement_policy_rules() {
        let all_except =
            RetirementPolicy::new(DeleteMethod::AllExceptSpecified, ["^config/", r"\.LOG$"])
                .unwrap();
        assert!(all_except.should_delete("bin/app.dll"));
        assert!(!all_except.should_delete("Config/app.ini"));
        assert!(!all_except.should_delete("logs/today.log"));

        let none_but = RetirementPolicy::new(DeleteMethod::NoneButSpecified, [r"\.tmp$"]).unwrap();
        assert!(none_but.should_delete("cache/x.TMP"));
        assert!(!none_but.should_delete("app.dll"));

        let none = RetirementPolicy::new(DeleteMethod::None, [".*"]).unwrap();
        assert!(!none.is_enabled());
        assert!(!none.should_delete("anything"));
    }

    #[test]
    fn test_invalid_rule_is_rejected() {
        let result = RetirementPolicy::new(DeleteMethod::NoneButSpecified, ["(unclosed"]);
        assert!(matches!(result, Err(UpdateError::InvalidRule { .. })));
    }

    #[test]
    fn test_install_replaces_and_backs_up() {
        let fx = Fixture::new();
        fx.app_file("app.dll", b"v1");
        fx.app_file("data/user.db", b"user");
        fx.staged_file("app.dll", b"v2");
        fx.staged_file("plugins/new.dll", b"plugin");

        let mut installer = fx.installer();
        installer.install().unwrap();

        assert_eq!(installer.state(), InstallState::Installed);
        assert_eq!(fx.read_app("app.dll").unwrap(), b"v2");
        assert_eq!(fx.read_app("plugins/new.dll").unwrap(), b"plugin");
        assert_eq!(fx.read_app("data/user.db").unwrap(), b"user");
        assert_eq!(fs::read(fx.rollback.join("app.dll")).unwrap(), b"v1");
        assert_eq!(installer.record().backed_up, vec!["app.dll".to_string()]);
        assert_eq!(
            installer.record().installed,
            vec!["app.dll".to_string(), "plugins/new.dll".to_string()]
        );
        // Staged copies are consumed
        assert!(!fx.staging.join("app.dll").exists());
    }

    #[test]
    fn test_retirement_respects_preserve_set_and_rules() {
        let fx = Fixture::new();
        fx.app_file("old.dll", b"old");
        fx.app_file("readme.txt", b"keep me");
        fx.app_file("config/settings.ini", b"cfg");
        fx.app_file("legacy/sub/x.bin", b"x");

        let retirement =
            RetirementPolicy::new(DeleteMethod::AllExceptSpecified, ["^config/"]).unwrap();
        let preserved: PreservedFiles = ["README.TXT"].into_iter().collect();
        let mut installer = fx
            .installer()
            .with_retirement(retirement)
            .with_preserved(preserved);

        assert_eq!(installer.retire_previous().unwrap(), 2);
        assert!(fx.read_app("old.dll").is_none());
        assert!(fx.read_app("readme.txt").is_some());
        assert!(fx.read_app("config/settings.ini").is_some());
        // Emptied directories are removed, the root stays
        assert!(!fx.app.join("legacy").exists());
        assert!(fx.app.exists());
        assert_eq!(fs::read(fx.rollback.join("legacy/sub/x.bin")).unwrap(), b"x");

        // Idempotent on an already-retired root
        assert_eq!(installer.retire_previous().unwrap(), 0);
        assert_eq!(installer.record().backed_up.len(), 2);
    }

    #[test]
    fn test_failed_install_rolls_back_everything() {
        let fx = Fixture::new();
        fx.app_file("a.txt", b"a-old");
        fx.app_file("gone.txt", b"retired");
        // "b" exists as a file, so "b/inner.txt" cannot be installed
        fx.app_file("b", b"blocker");
        fx.staged_file("a.txt", b"a-new");
        fx.staged_file("b/inner.txt", b"inner");
        fx.staged_file("c.txt", b"c-new");

        let retirement = RetirementPolicy::new(DeleteMethod::NoneButSpecified, ["^gone"]).unwrap();
        let mut installer = fx.installer().with_retirement(retirement);
        let err = installer.install().unwrap_err();

        assert!(matches!(err, UpdateError::InstallStep { action: "install", .. }));
        assert_eq!(installer.state(), InstallState::Failed);
        assert_eq!(fx.read_app("a.txt").unwrap(), b"a-old");
        assert_eq!(fx.read_app("gone.txt").unwrap(), b"retired");
        assert_eq!(fx.read_app("b").unwrap(), b"blocker");
        assert!(fx.read_app("c.txt").is_none());
    }

    #[test]
    fn test_no_delete_policy_skips_retirement() {
        let fx = Fixture::new();
        fx.app_file("old.dll", b"old");
        let mut installer = fx.installer();
        assert_eq!(installer.retire_previous().unwrap(), 0);
        assert!(fx.read_app("old.dll").is_some());
    }

    #[test]
    fn test_record_is_persisted() {
        let fx = Fixture::new();
        fx.staged_file("x.txt", b"x");
        let record_path = fx.rollback.with_extension("json");
        let mut installer = fx.installer().with_record_path(&record_path);
        installer.install().unwrap();

        let record = InstallationRecord::load(&record_path).unwrap();
        assert_eq!(record.installed, vec!["x.txt".to_string()]);
    }

    #[test]
    fn test_progress_events_are_emitted() {
        let fx = Fixture::new();
        fx.staged_file("one.txt", b"1");
        fx.staged_file("two.txt", b"2");
        let (sink, mut rx) = EventSink::channel();
        let mut installer = fx.installer().with_events(sink);
        installer.install().unwrap();

        let mut seen = Vec::new();
        while let Ok(UpdateEvent::InstallProgress { index, total, .. }) = rx.try_recv() {
            seen.push((index, total));
        }
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_rollback_restores_file_replaced_by_directory() {
        let fx = Fixture::new();
        fx.app_file("d", b"precious original");
        fx.app_file("z", b"blocker");
        fx.staged_file("d/inner.txt", b"inner");
        fx.staged_file("z/inner", b"never installed");

        let retirement = RetirementPolicy::new(DeleteMethod::NoneButSpecified, ["^d$"]).unwrap();
        let (sink, mut rx) = EventSink::channel();
        let mut installer = fx.installer().with_retirement(retirement).with_events(sink);
        let err = installer.install().unwrap_err();

        assert!(matches!(err, UpdateError::InstallStep { .. }), "{err}");
        assert!(fx.app.join("d").is_file());
        assert_eq!(fx.read_app("d").unwrap(), b"precious original");
        assert_eq!(fx.read_app("z").unwrap(), b"blocker");

        let mut rolled_back = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let UpdateEvent::InstallProgress {
                phase: InstallPhase::RollingBack,
                index,
                total,
                path,
            } = event
            {
                rolled_back.push((index, total, path));
            }
        }
        assert_eq!(rolled_back, vec![(1, 1, "d".to_string())]);
    }
}
