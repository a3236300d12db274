//! Virtual path to backing/staging path mapping
//!
//! Pure path algebra: nothing here touches the filesystem.

use crate::error::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

const SEPARATOR: u8 = b'/';
const STAGING_PREFIX: &[u8] = b".";
const STAGING_SUFFIX: &[u8] = b".decrypt";

/// Maps virtual paths onto the backing directory
#[derive(Debug, Clone)]
pub struct PathResolver {
    base: PathBuf,
    max_len: usize,
}

impl PathResolver {
    /// Create a resolver rooted at `base`, rejecting results over `max_len` bytes
    pub fn new(base: impl Into<PathBuf>, max_len: usize) -> Self {
        let base = base.into();
        // A trailing separator would double up against the virtual path's leading one
        let mut bytes = base.into_os_string().into_vec();
        while bytes.len() > 1 && bytes.last() == Some(&SEPARATOR) {
            bytes.pop();
        }
        Self {
            base: PathBuf::from(OsString::from_vec(bytes)),
            max_len,
        }
    }

    /// The backing directory
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Absolute ciphertext path for a virtual path such as `/dir/file`
    pub fn resolve(&self, virtual_path: &Path) -> Result<PathBuf> {
        let rel = virtual_path.as_os_str().as_bytes();
        if rel.first() != Some(&SEPARATOR) {
            return Err(Error::InvalidPath(format!(
                "virtual path {:?} is not absolute",
                virtual_path
            )));
        }

        let base = match self.base.as_os_str().as_bytes() {
            [SEPARATOR] => &[][..],
            other => other,
        };
        let mut full = Vec::with_capacity(base.len() + rel.len());
        full.extend_from_slice(base);
        if rel.len() > 1 || base.is_empty() {
            full.extend_from_slice(rel);
        }

        self.bounded(full)
    }

    /// Ciphertext path for a name about to be created
    ///
    /// Staging file names are reserved and rejected with `InvalidPath`.
    pub fn resolve_new(&self, virtual_path: &Path) -> Result<PathBuf> {
        if has_staging_name(virtual_path) {
            return Err(Error::InvalidPath(format!(
                "{:?} is a reserved staging name",
                virtual_path
            )));
        }
        self.resolve(virtual_path)
    }

    /// Ciphertext path for an existing entry; staging files do not exist here
    pub fn resolve_visible(&self, virtual_path: &Path) -> Result<PathBuf> {
        if has_staging_name(virtual_path) {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOENT)));
        }
        self.resolve(virtual_path)
    }

    /// Staging path `<dir>/.<name>.decrypt` for a ciphertext path
    pub fn staging_path(&self, cipher_path: &Path) -> Result<PathBuf> {
        let bytes = cipher_path.as_os_str().as_bytes();
        let split = bytes
            .iter()
            .rposition(|&b| b == SEPARATOR)
            .ok_or_else(|| {
                Error::InvalidPath(format!("no separator in {:?}", cipher_path))
            })?;

        let (dir, name) = (&bytes[..split], &bytes[split + 1..]);
        if name.is_empty() {
            return Err(Error::InvalidPath(format!(
                "no file name in {:?}",
                cipher_path
            )));
        }

        let mut staging =
            Vec::with_capacity(bytes.len() + STAGING_PREFIX.len() + STAGING_SUFFIX.len());
        staging.extend_from_slice(dir);
        staging.push(SEPARATOR);
        staging.extend_from_slice(STAGING_PREFIX);
        staging.extend_from_slice(name);
        staging.extend_from_slice(STAGING_SUFFIX);

        self.bounded(staging)
    }

    fn bounded(&self, bytes: Vec<u8>) -> Result<PathBuf> {
        if bytes.len() >= self.max_len {
            return Err(Error::NameTooLong);
        }
        Ok(PathBuf::from(OsString::from_vec(bytes)))
    }
}

/// True if a directory entry name is a staging file
pub fn is_staging_name(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes.len() > STAGING_PREFIX.len() + STAGING_SUFFIX.len()
        && bytes.starts_with(STAGING_PREFIX)
        && bytes.ends_with(STAGING_SUFFIX)
}

fn has_staging_name(path: &Path) -> bool {
    path.file_name().map_or(false, is_staging_name)
}
