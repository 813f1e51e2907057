//! Package selection.
//!
//! Decides, for each package in a manifest, whether it must be downloaded
//! given the local file it would replace. Rules, in priority order:
//!
//! 1. `Always` selects.
//! 2. A component-gated package whose component is disabled is skipped.
//! 3. No local file: `SkipIfNotExist` skips, anything else selects.
//! 4. Local file present: `SkipIfExists` skips and preserves. Otherwise the
//!    package is selected when any enabled verification flag reports a
//!    difference, and skipped and preserved when none does.
//!
//! Skipped-and-preserved packages add their files to the preserve set so a
//! later retirement pass leaves them alone.

use std::path::Path;

use tracing::{debug, info};

use crate::error::UpdateError;
use crate::flags::{UpdateMethod, VerificationLevel};
use crate::manifest::{Manifest, Package};
use crate::preserve::{checked_relative, normalize_relative};
use crate::verifier::FileVerifier;
use crate::version::AppVersion;

/// Reads the embedded version of a local file.
pub trait FileVersionSource: Send + Sync {
    /// `None` when the file carries no readable version.
    fn file_version(&self, path: &Path) -> Option<AppVersion>;
}

/// A version source for platforms without embedded file versions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVersionInfo;

impl FileVersionSource for NoVersionInfo {
    fn file_version(&self, _path: &Path) -> Option<AppVersion> {
        None
    }
}

/// Why a package was or was not selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// `Always` method
    SelectAlways,
    /// No local file exists
    SelectMissing,
    /// A verification flag reported a difference
    SelectChanged,
    /// Component flag is off; not preserved
    SkipComponentDisabled,
    /// `SkipIfNotExist` with no local file; not preserved
    SkipNotExist,
    /// `SkipIfExists` with a local file; preserved
    SkipExists,
    /// Local file matches every enabled check; preserved
    SkipUnchanged,
}

impl Decision {
    pub fn is_selected(self) -> bool {
        matches!(
            self,
            Decision::SelectAlways | Decision::SelectMissing | Decision::SelectChanged
        )
    }

    pub fn preserves(self) -> bool {
        matches!(self, Decision::SkipExists | Decision::SkipUnchanged)
    }
}

/// Outcome of selecting over a whole manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub packages: Vec<Package>,
    /// Relative paths to add to the preserve set
    pub preserved: Vec<String>,
}

impl Selection {
    /// No concrete change to apply.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Computes the minimal set of packages to download.
pub struct PackageSelector<'a> {
    app_dir: &'a Path,
    versions: &'a dyn FileVersionSource,
    components: &'a dyn Fn(&str) -> bool,
    verifier: FileVerifier,
}

impl<'a> PackageSelector<'a> {
    pub fn new(
        app_dir: &'a Path,
        versions: &'a dyn FileVersionSource,
        components: &'a dyn Fn(&str) -> bool,
    ) -> Self {
        Self {
            app_dir,
            versions,
            components,
            verifier: FileVerifier::new(),
        }
    }

    /// Decide one package against the local filesystem.
    ///
    /// A declared install path that leaves the application root is an error.
    pub fn decide(&self, package: &Package) -> Result<Decision, UpdateError> {
        if !package.file_path.trim().is_empty() {
            checked_relative(&package.file_path)?;
        }

        if package.method.contains(UpdateMethod::ALWAYS) {
            return Ok(Decision::SelectAlways);
        }

        if let Some(component) = package.component_id.as_deref().filter(|c| !c.is_empty()) {
            if !(self.components)(component) {
                return Ok(Decision::SkipComponentDisabled);
            }
        }

        let local = self.app_dir.join(normalize_relative(&package.file_path));
        if !local.is_file() {
            if package.method.contains(UpdateMethod::SKIP_IF_NOT_EXIST) {
                return Ok(Decision::SkipNotExist);
            }
            return Ok(Decision::SelectMissing);
        }

        if package.method.contains(UpdateMethod::SKIP_IF_EXISTS) {
            return Ok(Decision::SkipExists);
        }

        if self.is_newer(package, &local)? {
            Ok(Decision::SelectChanged)
        } else {
            Ok(Decision::SkipUnchanged)
        }
    }

    fn is_newer(&self, package: &Package, local: &Path) -> Result<bool, UpdateError> {
        let level = package.verification_level;

        if level.contains(VerificationLevel::SIZE)
            && !self.verifier.size_matches(local, package.file_size)?
        {
            return Ok(true);
        }

        if level.contains(VerificationLevel::VERSION)
            && self
                .verifier
                .version_differs(self.versions.file_version(local), &package.version)
        {
            return Ok(true);
        }

        if level.contains(VerificationLevel::HASH)
            && !self.verifier.hash_matches(local, &package.file_hash)?
        {
            return Ok(true);
        }

        Ok(false)
    }

    /// Select over every package of `manifest`.
    ///
    /// A single-package manifest is synthesized into one `Always` package first.
    pub fn select(&self, manifest: &Manifest) -> Result<Selection, UpdateError> {
        let mut selection = Selection::default();

        if let Some(package) = manifest.synthesized_package() {
            info!(package = %package.name, "Adding monolithic package");
            selection.packages.push(package);
        }

        for package in &manifest.packages {
            let decision = self.decide(package)?;
            debug!(package = %package.name, ?decision, "Package decision");

            if decision.is_selected() {
                selection.packages.push(package.clone());
            } else if decision.preserves() {
                selection.preserved.extend(preserved_paths(package));
            }
        }

        if selection.is_empty() {
            info!("Version differs but no package needs updating; treating as no update");
        }
        Ok(selection)
    }
}

/// Paths kept when a package is skipped: its install path and its files.
fn preserved_paths(package: &Package) -> Vec<String> {
    std::iter::once(&package.file_path)
        .chain(&package.files)
        .map(|p| normalize_relative(p))
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct FixedVersion(Option<AppVersion>);

    impl FileVersionSource for FixedVersion {
        fn file_version(&self, _path: &Path) -> Option<AppVersion> {
            self.0
        }
    }

    fn all_enabled(_: &str) -> bool {
        true
    }

    fn none_enabled(_: &str) -> bool {
        false
    }

    fn app_with(files: &[(&str, &[u8])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        dir
    }

    fn package(method: UpdateMethod, level: VerificationLevel) -> Package {
        Package {
            method,
            verification_level: level,
            ..Package::new("app.zip", "app.dll")
        }
    }

    #[test]
    fn test_escaping_install_path_is_rejected() {
        let dir = app_with(&[]);
        let selector = PackageSelector::new(dir.path(), &NoVersionInfo, &all_enabled);
        let mut pkg = package(UpdateMethod::ALWAYS, VerificationLevel::NONE);
        pkg.file_path = "../outside.dll".to_string();

        assert!(matches!(
            selector.decide(&pkg),
            Err(UpdateError::UnsafePath { .. })
        ));
    }

    #[test]
    fn test_always_wins_over_everything() {
        let dir = app_with(&[("app.dll", b"x")]);
        let selector = PackageSelector::new(dir.path(), &NoVersionInfo, &none_enabled);
        let mut pkg = package(
            UpdateMethod::ALWAYS | UpdateMethod::SKIP_IF_EXISTS,
            VerificationLevel::NONE,
        );
        pkg.component_id = Some("off".to_string());
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SelectAlways);
    }

    #[test]
    fn test_disabled_component_skips_without_preserving() {
        let dir = app_with(&[("app.dll", b"x")]);
        let selector = PackageSelector::new(dir.path(), &NoVersionInfo, &none_enabled);
        let mut pkg = package(UpdateMethod::VERSION_COMPARE, VerificationLevel::HASH);
        pkg.component_id = Some("plugins".to_string());
        let decision = selector.decide(&pkg).unwrap();
        assert_eq!(decision, Decision::SkipComponentDisabled);
        assert!(!decision.preserves());
    }

    #[test]
    fn test_missing_local_file() {
        let dir = app_with(&[]);
        let selector = PackageSelector::new(dir.path(), &NoVersionInfo, &all_enabled);

        let pkg = package(UpdateMethod::VERSION_COMPARE, VerificationLevel::HASH);
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SelectMissing);

        let pkg = package(
            UpdateMethod::VERSION_COMPARE | UpdateMethod::SKIP_IF_NOT_EXIST,
            VerificationLevel::HASH,
        );
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SkipNotExist);
    }

    #[test]
    fn test_skip_if_exists_preserves() {
        let dir = app_with(&[("readme.txt", b"hello")]);
        let selector = PackageSelector::new(dir.path(), &NoVersionInfo, &all_enabled);
        let pkg = Package {
            method: UpdateMethod::SKIP_IF_EXISTS,
            ..Package::new("readme.zip", "readme.txt")
        };
        let mut manifest = Manifest::new(AppVersion::new(2, 0, 0, 0));
        manifest.packages.push(pkg);

        let selection = selector.select(&manifest).unwrap();
        assert!(selection.is_empty());
        assert_eq!(selection.preserved, vec!["readme.txt".to_string()]);
    }

    #[test]
    fn test_hash_difference_selects() {
        let dir = app_with(&[("app.dll", b"old content")]);
        let selector = PackageSelector::new(dir.path(), &NoVersionInfo, &all_enabled);
        let mut pkg = package(UpdateMethod::VERSION_COMPARE, VerificationLevel::HASH);
        pkg.file_hash = "1234".to_string();
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SelectChanged);

        pkg.file_hash = FileVerifier::new()
            .compute_hash(&dir.path().join("app.dll"))
            .unwrap()
            .to_lowercase();
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SkipUnchanged);
    }

    #[test]
    fn test_size_and_version_flags() {
        let dir = app_with(&[("app.dll", b"12345")]);
        let versions = FixedVersion(Some(AppVersion::new(1, 0, 0, 0)));
        let selector = PackageSelector::new(dir.path(), &versions, &all_enabled);

        let mut pkg = package(UpdateMethod::VERSION_COMPARE, VerificationLevel::SIZE);
        pkg.file_size = 5;
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SkipUnchanged);
        pkg.file_size = 6;
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SelectChanged);

        let mut pkg = package(UpdateMethod::VERSION_COMPARE, VerificationLevel::VERSION);
        pkg.version = "1.0.0.0".to_string();
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SkipUnchanged);
        pkg.version = String::new();
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SelectChanged);
    }

    #[test]
    fn test_no_flags_means_unchanged() {
        let dir = app_with(&[("app.dll", b"x")]);
        let selector = PackageSelector::new(dir.path(), &NoVersionInfo, &all_enabled);
        let pkg = package(UpdateMethod::VERSION_COMPARE, VerificationLevel::NONE);
        assert_eq!(selector.decide(&pkg).unwrap(), Decision::SkipUnchanged);
    }

    #[test]
    fn test_preserves_associated_files() {
        let dir = app_with(&[("plugin/core.dll", b"x")]);
        let selector = PackageSelector::new(dir.path(), &NoVersionInfo, &all_enabled);
        let mut pkg = package(UpdateMethod::SKIP_IF_EXISTS, VerificationLevel::NONE);
        pkg.file_path = "plugin\\core.dll".to_string();
        pkg.files = vec!["plugin/core.pdb".to_string(), "plugin/core.xml".to_string()];

        let mut manifest = Manifest::new(AppVersion::new(2, 0, 0, 0));
        manifest.packages.push(pkg);
        let selection = selector.select(&manifest).unwrap();
        assert_eq!(
            selection.preserved,
            vec!["plugin/core.dll", "plugin/core.pdb", "plugin/core.xml"]
        );
    }

    #[test]
    fn test_single_package_manifest_is_synthesized() {
        let dir = app_with(&[]);
        let selector = PackageSelector::new(dir.path(), &NoVersionInfo, &all_enabled);
        let mut manifest = Manifest::new(AppVersion::new(2, 0, 0, 0));
        manifest.package = Some("full.zip".to_string());
        manifest.package_hash = "AA".to_string();

        let selection = selector.select(&manifest).unwrap();
        assert_eq!(selection.packages.len(), 1);
        assert_eq!(selection.packages[0].method, UpdateMethod::ALWAYS);
    }
}
