//! Property-based tests for self-updater.
//!
//! # Properties Tested
//!
//! - Selection is deterministic for a fixed manifest and filesystem
//! - Package retries are bounded by the configured maximum
//! - A package is never transferred by two workers at once
//! - A failed install restores the application root exactly
//! - Retiring an already-retired root changes nothing

#![cfg(test)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use proptest::prelude::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::DownloadConfig;
use crate::download::{DownloadJob, DownloadScheduler, PackageFetcher, ProgressFn};
use crate::error::UpdateError;
use crate::flags::{UpdateMethod, VerificationLevel};
use crate::install::{FileInstaller, InstallRetries, RetirementPolicy};
use crate::manifest::{DeleteMethod, Manifest, Package};
use crate::preserve::relative_to;
use crate::selection::{NoVersionInfo, PackageSelector};
use crate::version::AppVersion;

// =============================================================================
// Generators
// =============================================================================

fn arb_method() -> impl Strategy<Value = UpdateMethod> {
    (0u8..32).prop_map(UpdateMethod::from_bits_truncate)
}

fn arb_level() -> impl Strategy<Value = VerificationLevel> {
    (0u8..8).prop_map(VerificationLevel::from_bits_truncate)
}

/// A package plus the local file content it would replace, if any.
fn arb_package(index: usize) -> impl Strategy<Value = (Package, Option<Vec<u8>>)> {
    (
        arb_method(),
        arb_level(),
        prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
        0u64..64,
        prop::option::of(any::<bool>()),
    )
        .prop_map(move |(method, level, local, file_size, component)| {
            let mut package = Package::new(format!("p{index}.zip"), format!("dir/p{index}.bin"));
            package.method = method;
            package.verification_level = level;
            package.file_size = file_size;
            package.version = "1.0.0.0".to_string();
            package.files = vec![format!("dir/p{index}.dat")];
            package.component_id = component.map(|on| if on { "on" } else { "off" }.to_string());
            (package, local)
        })
}

fn arb_packages() -> impl Strategy<Value = Vec<(Package, Option<Vec<u8>>)>> {
    (1usize..8).prop_flat_map(|n| (0..n).map(arb_package).collect::<Vec<_>>())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn write_file(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Every file under `root` with its content.
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| Some((relative_to(root, e.path())?, fs::read(e.path()).ok()?)))
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

/// Fails every transfer and counts attempts.
#[derive(Default)]
struct AlwaysFailing {
    calls: Mutex<u32>,
}

#[async_trait]
impl PackageFetcher for AlwaysFailing {
    async fn fetch_to_file(
        &self,
        _url: &str,
        _dest: &Path,
        _progress: &mut ProgressFn<'_>,
        _cancel: &CancellationToken,
    ) -> Result<u64, UpdateError> {
        *self.calls.lock().unwrap() += 1;
        Err(UpdateError::NetworkError("connection reset".to_string()))
    }

    async fn ping(&self, _url: &str) -> Result<(), UpdateError> {
        Ok(())
    }
}

/// Records overlapping transfers of the same URL.
#[derive(Default)]
struct OverlapDetector {
    in_flight: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
    overlaps: Mutex<u32>,
}

#[async_trait]
impl PackageFetcher for OverlapDetector {
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        _progress: &mut ProgressFn<'_>,
        _cancel: &CancellationToken,
    ) -> Result<u64, UpdateError> {
        if !self.in_flight.lock().unwrap().insert(url.to_string()) {
            *self.overlaps.lock().unwrap() += 1;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        fs::write(dest, url.as_bytes())?;
        self.in_flight.lock().unwrap().remove(url);
        self.fetched.lock().unwrap().push(url.to_string());
        Ok(url.len() as u64)
    }

    async fn ping(&self, _url: &str) -> Result<(), UpdateError> {
        Ok(())
    }
}

// =============================================================================
// Selection determinism
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Deciding the same manifest twice against the same filesystem gives
    /// the same decisions, selection and preserve list.
    #[test]
    fn prop_selection_is_deterministic(packages in arb_packages()) {
        let temp = TempDir::new().unwrap();
        let mut manifest = Manifest::new(AppVersion::new(2, 0, 0, 0));
        for (package, local) in &packages {
            if let Some(content) = local {
                write_file(&temp.path().join(&package.file_path), content);
            }
            manifest.packages.push(package.clone());
        }

        let components = |id: &str| id == "on";
        let selector = PackageSelector::new(temp.path(), &NoVersionInfo, &components);

        let first = selector.select(&manifest).unwrap();
        let second = selector.select(&manifest).unwrap();
        prop_assert_eq!(&first.packages, &second.packages);
        prop_assert_eq!(&first.preserved, &second.preserved);

        for (package, local) in &packages {
            let decision = selector.decide(package).unwrap();
            if package.method.contains(UpdateMethod::ALWAYS) {
                prop_assert!(decision.is_selected());
            }
            if local.is_some()
                && !package.method.contains(UpdateMethod::ALWAYS)
                && package.method.contains(UpdateMethod::SKIP_IF_EXISTS)
            {
                prop_assert!(!decision.is_selected());
            }
        }
    }
}

// =============================================================================
// Retry boundedness and claim exclusion
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A package that always fails is attempted exactly `max + 1` times and
    /// is reported once in the aggregate error.
    #[test]
    fn prop_retries_are_bounded(max_retry_count in 0u32..5, workers in 1usize..4) {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(AlwaysFailing::default());
        let config = DownloadConfig { multiple_download_count: workers, max_retry_count };
        let job = DownloadJob::new(
            Package::new("only.zip", "only.bin"),
            "mem://only.zip",
            temp.path().join("only.zip"),
        );

        let result = runtime().block_on(DownloadScheduler::new(fetcher.clone(), &config).run(vec![job]));

        match result {
            Err(UpdateError::PackagesFailed(failures)) => {
                prop_assert_eq!(failures.len(), 1);
                prop_assert_eq!(failures[0].retry_count, max_retry_count + 1);
            }
            other => prop_assert!(false, "unexpected result: {:?}", other.map(|_| ())),
        }
        prop_assert_eq!(*fetcher.calls.lock().unwrap(), max_retry_count + 1);
    }

    /// No package is transferred by two workers at once, and every package
    /// is transferred exactly once.
    #[test]
    fn prop_claims_are_exclusive(workers in 1usize..6, count in 1usize..12) {
        let temp = TempDir::new().unwrap();
        let fetcher = Arc::new(OverlapDetector::default());
        let config = DownloadConfig { multiple_download_count: workers, max_retry_count: 0 };
        let jobs: Vec<DownloadJob> = (0..count)
            .map(|i| {
                DownloadJob::new(
                    Package::new(format!("p{i}"), ""),
                    format!("mem://p{i}"),
                    temp.path().join(format!("p{i}")),
                )
            })
            .collect();

        let states = runtime()
            .block_on(DownloadScheduler::new(fetcher.clone(), &config).run(jobs))
            .unwrap();

        prop_assert!(states.iter().all(|s| s.is_downloaded && !s.is_downloading));
        prop_assert_eq!(*fetcher.overlaps.lock().unwrap(), 0);
        let mut fetched = fetcher.fetched.lock().unwrap().clone();
        fetched.sort();
        fetched.dedup();
        prop_assert_eq!(fetched.len(), count);
        prop_assert_eq!(fetcher.fetched.lock().unwrap().len(), count);
    }
}

// =============================================================================
// Rollback completeness and idempotent retirement
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Whatever step the install fails at, the application root afterwards
    /// holds exactly the files it held before.
    #[test]
    fn prop_failed_install_restores_root(
        existing in prop::collection::vec(any::<bool>(), 1..8),
        retired in 0usize..4,
        fail_at in any::<prop::sample::Index>(),
    ) {
        let temp = TempDir::new().unwrap();
        let app = temp.path().join("app");
        let staging = temp.path().join("new");
        fs::create_dir_all(&app).unwrap();
        fs::create_dir_all(&staging).unwrap();

        let k = fail_at.index(existing.len());
        for (i, exists) in existing.iter().enumerate() {
            let name = format!("f{i:02}");
            if i == k {
                // A regular file where the staged tree needs a directory
                write_file(&app.join(&name), b"blocker");
                write_file(&staging.join(&name).join("inner"), b"unreachable");
                continue;
            }
            if *exists {
                write_file(&app.join(&name), format!("old {i}").as_bytes());
            }
            write_file(&staging.join(&name), format!("new {i}").as_bytes());
        }
        for i in 0..retired {
            write_file(&app.join(format!("legacy/old{i}.txt")), b"legacy");
        }

        let before = snapshot(&app);
        let retirement = RetirementPolicy::new(DeleteMethod::NoneButSpecified, ["^legacy/"]).unwrap();
        let mut installer = FileInstaller::new(&app, &staging, temp.path().join("rollback"))
            .with_retirement(retirement)
            .with_retries(InstallRetries::immediate());

        let result = installer.install();
        prop_assert!(matches!(result, Err(UpdateError::InstallStep { .. })), "{:?}", result);
        prop_assert_eq!(snapshot(&app), before);
    }

    /// A second retirement pass retires nothing and leaves the root as the
    /// first pass left it.
    #[test]
    fn prop_retirement_is_idempotent(
        files in prop::collection::btree_set("[a-c]{1,3}(/[a-c]{1,2})?\\.(log|txt)", 1..10),
        method in prop_oneof![
            Just(DeleteMethod::AllExceptSpecified),
            Just(DeleteMethod::NoneButSpecified),
        ],
    ) {
        let temp = TempDir::new().unwrap();
        let app = temp.path().join("app");
        fs::create_dir_all(&app).unwrap();
        for file in &files {
            write_file(&app.join(file), file.as_bytes());
        }

        let retirement = RetirementPolicy::new(method, [r"\.LOG$"]).unwrap();
        let mut installer = FileInstaller::new(&app, temp.path().join("new"), temp.path().join("rollback"))
            .with_retirement(retirement)
            .with_retries(InstallRetries::immediate());

        let first = installer.retire_previous().unwrap();
        let after_first = snapshot(&app);
        let second = installer.retire_previous().unwrap();

        prop_assert!(first <= files.len());
        prop_assert_eq!(second, 0);
        prop_assert_eq!(snapshot(&app), after_first);
    }
}
