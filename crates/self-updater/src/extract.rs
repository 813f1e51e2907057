//! Unpacking downloaded payloads into the staging tree.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use tracing::debug;
use zip::ZipArchive;

use crate::error::UpdateError;
use crate::manifest::Package;
use crate::preserve::checked_relative;

/// Local file header signature.
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Turns a downloaded payload into files under the staging directory.
pub trait PayloadExtractor: Send + Sync {
    /// Unpack `payload` for `package` into `staging`, returning the number
    /// of files written.
    fn extract(&self, package: &Package, payload: &Path, staging: &Path)
        -> Result<usize, UpdateError>;
}

/// Zip archives whose entries are paths relative to the application root.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor;

impl PayloadExtractor for ZipExtractor {
    fn extract(
        &self,
        package: &Package,
        payload: &Path,
        staging: &Path,
    ) -> Result<usize, UpdateError> {
        let failed = |reason: String| UpdateError::ExtractionFailed {
            package: package.name.clone(),
            reason,
        };

        let file = File::open(payload)?;
        let mut archive = ZipArchive::new(file).map_err(|e| failed(e.to_string()))?;
        let mut written = 0;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| failed(e.to_string()))?;
            let Some(rel) = entry.enclosed_name() else {
                return Err(failed(format!("unsafe entry path {:?}", entry.name())));
            };
            let out_path = staging.join(rel);

            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
            written += 1;
        }

        debug!(package = %package.name, files = written, "Extracted archive");
        Ok(written)
    }
}

/// Payloads that are the installed file itself.
///
/// The payload lands at the package's `file_path`, or at its name when no
/// path is declared.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyExtractor;

impl PayloadExtractor for CopyExtractor {
    fn extract(
        &self,
        package: &Package,
        payload: &Path,
        staging: &Path,
    ) -> Result<usize, UpdateError> {
        let target = if package.file_path.trim().is_empty() {
            &package.name
        } else {
            &package.file_path
        };
        let rel = checked_relative(target).map_err(|e| UpdateError::ExtractionFailed {
            package: package.name.clone(),
            reason: e.to_string(),
        })?;

        let dest = staging.join(&rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(payload, &dest)?;
        debug!(package = %package.name, path = %rel, "Staged payload");
        Ok(1)
    }
}

/// Zip archives are unpacked, anything else is staged as a single file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl PayloadExtractor for DefaultExtractor {
    fn extract(
        &self,
        package: &Package,
        payload: &Path,
        staging: &Path,
    ) -> Result<usize, UpdateError> {
        if is_zip(payload)? {
            ZipExtractor.extract(package, payload, staging)
        } else {
            CopyExtractor.extract(package, payload, staging)
        }
    }
}

fn is_zip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == ZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
