//! Update manifest model and payload decoding.
//!
//! A manifest describes the target release: its version, the minimum version
//! that may upgrade to it, the packages that make it up, and the policy for
//! retiring the previous installation. It is loaded once per check cycle and
//! never mutated afterwards.
//!
//! Manifests travel as text, optionally gzip-compressed. The default text
//! format is JSON with camelCase keys; other formats plug in through
//! [`ManifestParser`].

use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::UpdateError;
use crate::flags::{UpdateMethod, VerificationLevel};
use crate::version::{self, AppVersion};

/// Payloads at or below this length are never treated as compressed.
const MIN_COMPRESSED_LEN: usize = 0x10;

/// `<?xm` read as a little-endian u32.
const XML_DECL_MAGIC: u32 = 0x6D78_3F3C;

/// UTF-8 BOM followed by `<`, read as a little-endian u32.
const BOM_XML_MAGIC: u32 = 0x3CBF_BBEF;

/// Placeholder in a manifest URL that is replaced by the package name.
const PACKAGE_NAME_PLACEHOLDER: &str = "{0}";

/// One upgrade source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Base address, e.g. `https://updates.example.com/app/`
    pub address: String,
    /// Manifest path resolved relative to `address`
    #[serde(default = "default_manifest_path")]
    pub manifest: String,
}

impl Server {
    pub fn new(address: impl Into<String>, manifest: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            manifest: manifest.into(),
        }
    }

    /// Resolve the manifest URL with URL-relative semantics.
    pub fn manifest_url(&self) -> Result<String, UpdateError> {
        let base = Url::parse(&self.address)?;
        Ok(base.join(&self.manifest)?.to_string())
    }
}

fn default_manifest_path() -> String {
    "update.json".to_string()
}

/// Policy for retiring files of the previous installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeleteMethod {
    /// Leave previous files in place.
    #[default]
    None,
    /// Delete every file that matches no rule.
    AllExceptSpecified,
    /// Delete only files that match a rule.
    NoneButSpecified,
}

/// One downloadable unit of the update payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    /// Payload name; also the file name under the session's package directory
    pub name: String,
    /// Declared version of the installed file (empty = always stale)
    #[serde(default)]
    pub version: String,
    /// Content hash of the downloadable payload
    #[serde(default)]
    pub hash: String,
    /// Size of the downloadable payload in bytes (0 = unknown)
    #[serde(default)]
    pub size: u64,
    /// Install path relative to the application root
    #[serde(default)]
    pub file_path: String,
    /// Declared size of the installed file
    #[serde(default)]
    pub file_size: u64,
    /// Declared content hash of the installed file
    #[serde(default)]
    pub file_hash: String,
    /// Optional feature gate resolved by the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    /// Files owned by this package, preserved when the package is skipped
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub method: UpdateMethod,
    #[serde(default)]
    pub verification_level: VerificationLevel,
}

impl Package {
    /// A package named `name` installed at `file_path`, with no policy set.
    pub fn new(name: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            hash: String::new(),
            size: 0,
            file_path: file_path.into(),
            file_size: 0,
            file_hash: String::new(),
            component_id: None,
            files: Vec::new(),
            method: UpdateMethod::NONE,
            verification_level: VerificationLevel::NONE,
        }
    }
}

/// Remote descriptor of the latest release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub app_name: String,
    pub app_version: AppVersion,
    #[serde(default, with = "version::optional")]
    pub required_min_version: Option<AppVersion>,
    #[serde(default)]
    pub must_update: bool,
    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub auto_kill_processes: bool,
    #[serde(default)]
    pub auto_end_processes_in_app_dir: bool,
    #[serde(default)]
    pub auto_exit_current_process: bool,
    /// Name of a single monolithic package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default)]
    pub package_hash: String,
    #[serde(default)]
    pub package_size: u64,
    /// Notified with an empty POST before downloads start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_ping_url: Option<String>,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub delete_method: DeleteMethod,
    /// Case-insensitive patterns matched against relative paths
    #[serde(default)]
    pub delete_file_rules: Vec<String>,
}

impl Manifest {
    /// A manifest for `app_version` with no packages and default policy.
    pub fn new(app_version: AppVersion) -> Self {
        Self {
            app_name: String::new(),
            app_version,
            required_min_version: None,
            must_update: false,
            force_update: false,
            auto_kill_processes: false,
            auto_end_processes_in_app_dir: false,
            auto_exit_current_process: false,
            package: None,
            package_hash: String::new(),
            package_size: 0,
            update_ping_url: None,
            packages: Vec::new(),
            delete_method: DeleteMethod::None,
            delete_file_rules: Vec::new(),
        }
    }

    /// The monolithic package, when the manifest names one and lists no others.
    ///
    /// It is always installed and verified by hash.
    pub fn synthesized_package(&self) -> Option<Package> {
        let name = self.package.as_deref().filter(|n| !n.is_empty())?;
        if !self.packages.is_empty() {
            return None;
        }
        Some(Package {
            version: AppVersion::ZERO.to_string(),
            hash: self.package_hash.clone(),
            size: self.package_size,
            method: UpdateMethod::ALWAYS,
            verification_level: VerificationLevel::HASH,
            ..Package::new(name, "")
        })
    }
}

/// Turns manifest text into a [`Manifest`].
pub trait ManifestParser: Send + Sync {
    /// Parse manifest text.
    fn parse(&self, text: &str) -> Result<Manifest, UpdateError>;

    /// Serialize a package list for the session's resume file.
    fn write_packages(&self, packages: &[Package]) -> Result<String, UpdateError>;

    /// Parse a package list written by [`ManifestParser::write_packages`].
    fn read_packages(&self, text: &str) -> Result<Vec<Package>, UpdateError>;

    /// Whether `payload` starts like plain text in this parser's format.
    ///
    /// Consulted in addition to the XML markers when deciding if a payload
    /// is compressed.
    fn is_plain_text(&self, _payload: &[u8]) -> bool {
        false
    }
}

/// JSON manifests with camelCase keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonManifestParser;

impl ManifestParser for JsonManifestParser {
    fn parse(&self, text: &str) -> Result<Manifest, UpdateError> {
        serde_json::from_str(text.trim_start_matches('\u{feff}'))
            .map_err(|e| UpdateError::ManifestParse(e.to_string()))
    }

    fn write_packages(&self, packages: &[Package]) -> Result<String, UpdateError> {
        Ok(serde_json::to_string_pretty(packages)?)
    }

    fn read_packages(&self, text: &str) -> Result<Vec<Package>, UpdateError> {
        Ok(serde_json::from_str(text)?)
    }

    fn is_plain_text(&self, payload: &[u8]) -> bool {
        let body = payload.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(payload);
        matches!(
            body.iter().find(|b| !b.is_ascii_whitespace()),
            Some(b'{') | Some(b'[')
        )
    }
}

/// Whether a raw payload must be decompressed before decoding.
///
/// Payloads longer than 16 bytes whose first four bytes (little-endian)
/// are neither `<?xm` nor BOM + `<` are compressed.
pub fn looks_compressed(data: &[u8]) -> bool {
    if data.len() <= MIN_COMPRESSED_LEN {
        return false;
    }
    let head = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    head != XML_DECL_MAGIC && head != BOM_XML_MAGIC
}

/// Decode a fetched manifest payload into text.
///
/// Payloads of 16 bytes or fewer carry no usable manifest and yield
/// [`UpdateError::ManifestEmpty`], as does an empty decoded text.
pub fn decode_manifest_payload(
    data: &[u8],
    parser: &dyn ManifestParser,
) -> Result<String, UpdateError> {
    if data.len() <= MIN_COMPRESSED_LEN {
        return Err(UpdateError::ManifestEmpty);
    }

    let text = if looks_compressed(data) && !parser.is_plain_text(data) {
        tracing::debug!(bytes = data.len(), "Decompressing manifest payload");
        let mut decoder = GzDecoder::new(data);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|e| UpdateError::Decompress(e.to_string()))?;
        text
    } else {
        String::from_utf8(data.to_vec())
            .map_err(|e| UpdateError::ManifestParse(format!("manifest is not UTF-8: {}", e)))?
    };

    if text.trim().is_empty() {
        return Err(UpdateError::ManifestEmpty);
    }
    Ok(text)
}

/// URL a package is downloaded from, derived from the manifest URL.
///
/// A `{0}` placeholder in the manifest URL is replaced by the package name;
/// otherwise the name replaces the last path segment.
pub fn package_source_url(manifest_url: &str, package_name: &str) -> String {
    if manifest_url.contains(PACKAGE_NAME_PLACEHOLDER) {
        return manifest_url.replace(PACKAGE_NAME_PLACEHOLDER, package_name);
    }
    match manifest_url.rfind('/') {
        Some(idx) => format!("{}{}", &manifest_url[..=idx], package_name),
        None => package_name.to_string(),
    }
}
