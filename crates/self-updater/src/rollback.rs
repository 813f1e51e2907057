//! Rollback management.
//!
//! Files removed or overwritten during an install attempt are copied into a
//! rollback root that mirrors the application root's relative paths. The
//! [`InstallationRecord`] is the undo log: paths backed up and paths
//! installed, in commit order.
//!
//! Undoing an attempt deletes every installed path, along with any
//! directories that held nothing else, then moves every backup back into
//! place. Each entry is an independent move, so order does not matter and
//! one failed restore does not stop the others.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{RestoreFailure, UpdateError};
use crate::preserve::{normalize_relative, relative_to};

/// Undo log of one install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationRecord {
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// Relative paths copied into the rollback root, in commit order
    pub backed_up: Vec<String>,
    /// Relative paths placed into the application root, in commit order
    pub installed: Vec<String>,
}

impl Default for InstallationRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallationRecord {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            backed_up: Vec::new(),
            installed: Vec::new(),
        }
    }

    pub fn record_backup(&mut self, rel: &str) {
        self.backed_up.push(rel.to_string());
    }

    pub fn record_install(&mut self, rel: &str) {
        self.installed.push(rel.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.backed_up.is_empty() && self.installed.is_empty()
    }

    /// Persist the record as JSON.
    pub fn save(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, UpdateError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Backups for one application root.
#[derive(Debug, Clone)]
pub struct RollbackStore {
    app_root: PathBuf,
    rollback_root: PathBuf,
}

impl RollbackStore {
    pub fn new(app_root: impl Into<PathBuf>, rollback_root: impl Into<PathBuf>) -> Self {
        Self {
            app_root: app_root.into(),
            rollback_root: rollback_root.into(),
        }
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    pub fn rollback_root(&self) -> &Path {
        &self.rollback_root
    }

    /// Location of `rel` in the application root.
    pub fn app_path(&self, rel: &str) -> PathBuf {
        self.app_root.join(normalize_relative(rel))
    }

    /// Location of `rel`'s backup.
    pub fn backup_path(&self, rel: &str) -> PathBuf {
        self.rollback_root.join(normalize_relative(rel))
    }

    /// Copy `rel` from the application root into the rollback root.
    ///
    /// An existing backup of the same path is overwritten.
    pub fn backup(&self, rel: &str) -> io::Result<()> {
        let source = self.app_path(rel);
        let dest = self.backup_path(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &dest)?;
        debug!(from = %source.display(), to = %dest.display(), "Backed up file");
        Ok(())
    }

    /// Move the backup of `rel` back into the application root.
    pub fn restore(&self, rel: &str) -> io::Result<()> {
        let backup = self.backup_path(rel);
        let dest = self.app_path(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.is_dir() {
            // Only an empty directory may give way to a restored file
            fs::remove_dir(&dest)?;
        } else if dest.exists() {
            fs::remove_file(&dest)?;
        }
        move_file(&backup, &dest)?;
        debug!(path = %dest.display(), "Restored file from backup");
        Ok(())
    }

    /// Undo an install attempt: delete installed paths, then restore backups.
    ///
    /// Returns the paths that could not be put back. Deleting an installed
    /// file that is already gone is not a failure.
    pub fn roll_back(&self, record: &InstallationRecord) -> Vec<RestoreFailure> {
        self.roll_back_with_progress(record, |_, _, _| {})
    }

    /// [`roll_back`](Self::roll_back), calling `progress(index, total, rel)`
    /// once each backup has been handled.
    pub fn roll_back_with_progress<F>(
        &self,
        record: &InstallationRecord,
        mut progress: F,
    ) -> Vec<RestoreFailure>
    where
        F: FnMut(usize, usize, &str),
    {
        info!(
            installed = record.installed.len(),
            backed_up = record.backed_up.len(),
            "Rolling back install attempt"
        );
        let mut failures = Vec::new();

        for rel in &record.installed {
            let path = self.app_path(rel);
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed installed file");
                    self.prune_empty_parents(&path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove installed file");
                    failures.push(RestoreFailure {
                        path: rel.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let total = record.backed_up.len();
        for (index, rel) in record.backed_up.iter().enumerate() {
            if let Err(e) = self.restore(rel) {
                warn!(path = %rel, error = %e, "Failed to restore file");
                failures.push(RestoreFailure {
                    path: rel.clone(),
                    error: e.to_string(),
                });
            }
            progress(index + 1, total, rel);
        }

        if failures.is_empty() {
            info!("Rollback complete");
        }
        failures
    }

    /// Remove the now-empty directories above `path`, deepest first,
    /// stopping at the application root.
    fn prune_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.app_root || !current.starts_with(&self.app_root) {
                break;
            }
            if fs::remove_dir(current).is_err() {
                break;
            }
            debug!(path = %current.display(), "Removed directory left empty by rollback");
            dir = current.parent();
        }
    }

    /// Relative paths currently held in the rollback root.
    pub fn list_backups(&self) -> Vec<String> {
        if !self.rollback_root.exists() {
            return Vec::new();
        }
        let mut backups: Vec<String> = WalkDir::new(&self.rollback_root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| relative_to(&self.rollback_root, entry.path()))
            .collect();
        backups.sort();
        backups
    }

    /// Remove the rollback root.
    pub fn cleanup(&self) -> Result<(), UpdateError> {
        if self.rollback_root.exists() {
            fs::remove_dir_all(&self.rollback_root)?;
            info!(path = %self.rollback_root.display(), "Removed rollback directory");
        }
        Ok(())
    }
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (RollbackStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let app = temp.path().join("app");
        fs::create_dir_all(&app).unwrap();
        let store = RollbackStore::new(app, temp.path().join("rollback"));
        (store, temp)
    }

    fn write(store: &RollbackStore, rel: &str, content: &[u8]) {
        let path = store.app_path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_backup_mirrors_relative_path() {
        let (store, _temp) = create_test_store();
        write(&store, "bin/app.dll", b"v1");

        store.backup("bin/app.dll").unwrap();
        assert_eq!(fs::read(store.backup_path("bin/app.dll")).unwrap(), b"v1");
        // Original is untouched by a backup
        assert!(store.app_path("bin/app.dll").exists());
        assert_eq!(store.list_backups(), vec!["bin/app.dll".to_string()]);
    }

    #[test]
    fn test_restore_moves_backup_back() {
        let (store, _temp) = create_test_store();
        write(&store, "a.txt", b"original");
        store.backup("a.txt").unwrap();
        write(&store, "a.txt", b"replacement");

        store.restore("a.txt").unwrap();
        assert_eq!(fs::read(store.app_path("a.txt")).unwrap(), b"original");
        assert!(!store.backup_path("a.txt").exists());
    }

    #[test]
    fn test_roll_back_removes_installed_and_restores() {
        let (store, _temp) = create_test_store();
        write(&store, "keep.txt", b"old");
        store.backup("keep.txt").unwrap();
        fs::remove_file(store.app_path("keep.txt")).unwrap();

        let mut record = InstallationRecord::new();
        record.record_backup("keep.txt");
        write(&store, "keep.txt", b"new");
        record.record_install("keep.txt");
        write(&store, "added.txt", b"new");
        record.record_install("added.txt");

        let failures = store.roll_back(&record);
        assert!(failures.is_empty(), "{:?}", failures);
        assert_eq!(fs::read(store.app_path("keep.txt")).unwrap(), b"old");
        assert!(!store.app_path("added.txt").exists());
    }

    #[test]
    fn test_roll_back_continues_after_failure() {
        let (store, _temp) = create_test_store();
        write(&store, "b.txt", b"b");
        store.backup("b.txt").unwrap();
        fs::remove_file(store.app_path("b.txt")).unwrap();

        let mut record = InstallationRecord::new();
        record.record_backup("missing.txt");
        record.record_backup("b.txt");

        let failures = store.roll_back(&record);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "missing.txt");
        assert_eq!(fs::read(store.app_path("b.txt")).unwrap(), b"b");
    }

    #[test]
    fn test_record_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("record.json");
        let mut record = InstallationRecord::new();
        record.record_backup("a");
        record.record_install("b");
        record.save(&path).unwrap();

        let loaded = InstallationRecord::load(&path).unwrap();
        assert_eq!(loaded, record);
        assert!(!loaded.is_empty());
    }

    #[test]
    fn test_cleanup() {
        let (store, _temp) = create_test_store();
        assert!(store.list_backups().is_empty());
        write(&store, "x", b"x");
        store.backup("x").unwrap();
        store.cleanup().unwrap();
        assert!(!store.rollback_root().exists());
        store.cleanup().unwrap();
    }

    #[test]
    fn test_roll_back_replaces_directory_with_original_file() {
        let (store, _temp) = create_test_store();
        write(&store, "d", b"original");
        store.backup("d").unwrap();
        fs::remove_file(store.app_path("d")).unwrap();

        let mut record = InstallationRecord::new();
        record.record_backup("d");
        write(&store, "d/sub/inner.txt", b"new");
        record.record_install("d/sub/inner.txt");

        let failures = store.roll_back(&record);
        assert!(failures.is_empty(), "{:?}", failures);
        assert!(store.app_path("d").is_file());
        assert_eq!(fs::read(store.app_path("d")).unwrap(), b"original");
    }

    #[test]
    fn test_roll_back_prunes_only_emptied_directories() {
        let (store, _temp) = create_test_store();
        write(&store, "lib/existing.dll", b"old");

        let mut record = InstallationRecord::new();
        write(&store, "lib/added.dll", b"new");
        record.record_install("lib/added.dll");
        write(&store, "plugins/extra/a.dll", b"new");
        record.record_install("plugins/extra/a.dll");

        assert!(store.roll_back(&record).is_empty());
        assert!(store.app_path("lib/existing.dll").exists());
        assert!(!store.app_path("lib/added.dll").exists());
        assert!(!store.app_path("plugins").exists());
        assert!(store.app_root().exists());
    }

    #[test]
    fn test_restore_refuses_non_empty_directory() {
        let (store, _temp) = create_test_store();
        write(&store, "d", b"original");
        store.backup("d").unwrap();
        fs::remove_file(store.app_path("d")).unwrap();
        write(&store, "d/unrelated.txt", b"x");

        assert!(store.restore("d").is_err());
        assert!(store.app_path("d/unrelated.txt").exists());
        assert!(store.backup_path("d").exists());
    }

    #[test]
    fn test_progress_follows_each_restore() {
        let (store, _temp) = create_test_store();
        let mut record = InstallationRecord::new();
        for rel in ["a.txt", "b/c.txt"] {
            write(&store, rel, rel.as_bytes());
            store.backup(rel).unwrap();
            fs::remove_file(store.app_path(rel)).unwrap();
            record.record_backup(rel);
        }

        let mut seen = Vec::new();
        let failures = store.roll_back_with_progress(&record, |index, total, rel| {
            // The entry is already back in place when it is reported
            assert!(store.app_path(rel).exists());
            seen.push((index, total, rel.to_string()));
        });

        assert!(failures.is_empty());
        assert_eq!(
            seen,
            vec![(1, 2, "a.txt".to_string()), (2, 2, "b/c.txt".to_string())]
        );
    }

    #[test]
    fn test_paths_stay_under_their_roots() {
        let (store, _temp) = create_test_store();
        assert!(store.app_path("../../outside.dll").starts_with(store.app_root()));
        assert!(store.backup_path("../outside.dll").starts_with(store.rollback_root()));
    }
}
