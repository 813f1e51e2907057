//! Four-component application versions.
//!
//! Versions are `major.minor.build.revision` and compare structurally,
//! component by component. Missing trailing components are zero, so
//! `2.0` and `2.0.0.0` are equal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::UpdateError;

/// An application or file version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AppVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl AppVersion {
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// The version used for packages synthesized from a single-package manifest.
    pub const ZERO: AppVersion = AppVersion::new(0, 0, 0, 0);
}

impl FromStr for AppVersion {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('.').collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(UpdateError::VersionParseError(format!(
                "expected 2 to 4 components in {:?}",
                s
            )));
        }

        let mut components = [0u32; 4];
        for (slot, part) in components.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| {
                UpdateError::VersionParseError(format!("invalid component {:?} in {:?}", part, s))
            })?;
        }

        Ok(Self::new(
            components[0],
            components[1],
            components[2],
            components[3],
        ))
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

impl Serialize for AppVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AppVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde helpers for optional versions where an empty string means "unset".
pub mod optional {
    use super::AppVersion;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<AppVersion>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<AppVersion>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_version() {
        let v: AppVersion = "1.2.3.4".parse().unwrap();
        assert_eq!(v, AppVersion::new(1, 2, 3, 4));
        assert_eq!(v.to_string(), "1.2.3.4");
    }

    #[test]
    fn test_parse_short_version_pads_with_zero() {
        let v: AppVersion = "2.1".parse().unwrap();
        assert_eq!(v, AppVersion::new(2, 1, 0, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<AppVersion>().is_err());
        assert!("1".parse::<AppVersion>().is_err());
        assert!("1.2.3.4.5".parse::<AppVersion>().is_err());
        assert!("1.x".parse::<AppVersion>().is_err());
    }

    #[test]
    fn test_structural_ordering() {
        let a: AppVersion = "1.10.0.0".parse().unwrap();
        let b: AppVersion = "1.9.0.0".parse().unwrap();
        // "1.10" < "1.9" as strings, but not as versions
        assert!(a > b);
        assert!(AppVersion::new(2, 0, 0, 0) > AppVersion::new(1, 99, 99, 99));
        assert!(AppVersion::new(1, 0, 0, 1) > AppVersion::new(1, 0, 0, 0));
    }

    #[test]
    fn test_optional_empty_string_is_none() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default, with = "optional")]
            min: Option<AppVersion>,
        }

        let h: Holder = serde_json::from_str(r#"{"min": ""}"#).unwrap();
        assert!(h.min.is_none());
        let h: Holder = serde_json::from_str(r#"{}"#).unwrap();
        assert!(h.min.is_none());
        let h: Holder = serde_json::from_str(r#"{"min": "1.5"}"#).unwrap();
        assert_eq!(h.min, Some(AppVersion::new(1, 5, 0, 0)));
    }
}
