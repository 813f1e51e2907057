//! Relative install paths and the preserve set.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::error::UpdateError;

/// Normalize a relative path for comparison and rule matching.
///
/// Separators become `/`. Leading separators, `.` and `..` components and
/// drive prefixes are dropped, so the result always stays below whatever
/// root it is joined to.
pub fn normalize_relative(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|part| is_plain_component(part))
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate a path taken from a manifest and return its normalized form.
///
/// Absolute paths, `..` components and drive or stream prefixes are
/// rejected, as is a path with no components.
pub fn checked_relative(path: &str) -> Result<String, UpdateError> {
    let unsafe_path = |reason: &str| UpdateError::UnsafePath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.starts_with(['/', '\\']) {
        return Err(unsafe_path("absolute path"));
    }
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => return Err(unsafe_path("parent directory component")),
            _ if part.contains(':') => return Err(unsafe_path("drive or stream prefix")),
            _ => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(unsafe_path("empty path"));
    }
    Ok(parts.join("/"))
}

fn is_plain_component(part: &str) -> bool {
    !part.is_empty() && part != "." && part != ".." && !part.contains(':')
}

/// Relative `/`-separated form of `path` below `root`, if it is below it.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Case-insensitive set of relative paths exempt from retirement.
///
/// Entries keep the spelling they were first added with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreservedFiles {
    entries: BTreeMap<String, String>,
}

impl PreservedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &str) -> String {
        normalize_relative(path).to_lowercase()
    }

    /// Add a path; returns false if it was already present.
    pub fn insert(&mut self, path: &str) -> bool {
        let key = Self::key(path);
        if key.is_empty() || self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, normalize_relative(path));
        true
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(&Self::key(path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in their original spelling.
    pub fn to_vec(&self) -> Vec<String> {
        self.entries.values().cloned().collect()
    }
}

impl<S: AsRef<str>> Extend<S> for PreservedFiles {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        for path in iter {
            self.insert(path.as_ref());
        }
    }
}

impl<S: AsRef<str>> FromIterator<S> for PreservedFiles {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("\\bin\\app.dll"), "bin/app.dll");
        assert_eq!(normalize_relative("./data//x.txt"), "data/x.txt");
        assert_eq!(normalize_relative(""), "");
        assert_eq!(normalize_relative("../../etc/passwd"), "etc/passwd");
        assert_eq!(normalize_relative("C:\\Windows\\x.dll"), "Windows/x.dll");
    }

    #[test]
    fn test_checked_relative_rejects_escapes() {
        assert_eq!(checked_relative("bin\\core.dll").unwrap(), "bin/core.dll");
        assert_eq!(checked_relative("./lang//en.json").unwrap(), "lang/en.json");

        for path in ["../../escaped.txt", "a/../../b", "/etc/passwd", "\\share\\x", "C:\\x.dll", "", "./"] {
            assert!(
                matches!(checked_relative(path), Err(UpdateError::UnsafePath { .. })),
                "{path:?} accepted"
            );
        }
    }

    #[test]
    fn test_relative_to() {
        let root = PathBuf::from("/opt/app");
        assert_eq!(
            relative_to(&root, &root.join("lib").join("a.so")).as_deref(),
            Some("lib/a.so")
        );
        assert_eq!(relative_to(&root, &root), None);
        assert_eq!(relative_to(&root, Path::new("/etc/passwd")), None);
    }

    #[test]
    fn test_case_insensitive_membership() {
        let mut set = PreservedFiles::new();
        assert!(set.insert("Config/Settings.ini"));
        assert!(!set.insert("config\\settings.INI"));
        assert!(set.contains("CONFIG/SETTINGS.INI"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.to_vec(), vec!["Config/Settings.ini".to_string()]);
    }

    #[test]
    fn test_empty_paths_are_ignored() {
        let set: PreservedFiles = ["", "/", "a.txt"].into_iter().collect();
        assert_eq!(set.len(), 1);
    }
}
