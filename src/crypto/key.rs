//! Passphrase providers
//!
//! The core asks a [`KeyProvider`] for the passphrase once per encrypt and
//! once per decrypt; it never caches what it gets back. Providers may cache
//! on their own side.

use crate::config::{KeyEncoding, KeySource};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Passphrase bytes, wiped when dropped
pub type Passphrase = Zeroizing<Vec<u8>>;

/// Capability that supplies passphrase material to the cipher
pub trait KeyProvider: Send + Sync {
    /// Fetch the current passphrase
    fn passphrase(&self) -> Result<Passphrase>;
}

/// Fixed passphrase held in memory
pub struct StaticKeyProvider {
    passphrase: Passphrase,
}

impl StaticKeyProvider {
    pub fn new(passphrase: impl Into<Vec<u8>>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    /// Ask for the passphrase on the terminal once and hold on to it
    pub fn prompt() -> Result<Self> {
        let entered = Zeroizing::new(
            rpassword::prompt_password("Enter encryption passphrase: ")
                .map_err(|e| Error::KeyUnavailable(e.to_string()))?,
        );
        Ok(Self::new(entered.as_bytes()))
    }
}

impl KeyProvider for StaticKeyProvider {
    fn passphrase(&self) -> Result<Passphrase> {
        if self.passphrase.is_empty() {
            return Err(Error::InvalidKey);
        }
        Ok(self.passphrase.clone())
    }
}

/// Reads the passphrase from an environment variable on every request
pub struct EnvKeyProvider {
    var: String,
}

impl EnvKeyProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl KeyProvider for EnvKeyProvider {
    fn passphrase(&self) -> Result<Passphrase> {
        let value = std::env::var(&self.var)
            .map_err(|e| Error::KeyUnavailable(format!("{}: {}", self.var, e)))?;
        let value = Zeroizing::new(value);
        if value.is_empty() {
            return Err(Error::InvalidKey);
        }
        Ok(Zeroizing::new(value.as_bytes().to_vec()))
    }
}

/// Reads the passphrase from a file on every request
///
/// A single trailing newline is stripped so `echo secret > keyfile` works.
pub struct FileKeyProvider {
    path: PathBuf,
    encoding: KeyEncoding,
}

impl FileKeyProvider {
    pub fn new(path: impl AsRef<Path>, encoding: KeyEncoding) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            encoding,
        }
    }
}

impl KeyProvider for FileKeyProvider {
    fn passphrase(&self) -> Result<Passphrase> {
        let mut raw = Zeroizing::new(std::fs::read(&self.path).map_err(|e| {
            Error::KeyUnavailable(format!("{}: {}", self.path.display(), e))
        })?);

        if raw.last() == Some(&b'\n') {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
        }

        let bytes = match self.encoding {
            KeyEncoding::Raw => raw,
            KeyEncoding::Hex => Zeroizing::new(hex::decode(raw.as_slice()).map_err(|e| {
                Error::KeyUnavailable(format!("{}: invalid hex: {}", self.path.display(), e))
            })?),
        };

        if bytes.is_empty() {
            return Err(Error::InvalidKey);
        }
        Ok(bytes)
    }
}

/// Build the provider selected by configuration
pub fn provider_from_source(source: &KeySource) -> Result<Arc<dyn KeyProvider>> {
    Ok(match source {
        KeySource::Prompt => Arc::new(StaticKeyProvider::prompt()?),
        KeySource::Env { var } => Arc::new(EnvKeyProvider::new(var.clone())),
        KeySource::File { path, encoding } => Arc::new(FileKeyProvider::new(path, *encoding)),
        KeySource::Static { passphrase } => Arc::new(StaticKeyProvider::new(passphrase.as_bytes())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_static_provider() {
        let provider = StaticKeyProvider::new("secret");
        assert_eq!(provider.passphrase().unwrap().as_slice(), b"secret");

        let empty = StaticKeyProvider::new(Vec::new());
        assert!(matches!(empty.passphrase(), Err(Error::InvalidKey)));
    }

    #[test]
    fn test_env_provider() {
        std::env::set_var("CIPHERFS_TEST_KEY_PROVIDER", "from-env");
        let provider = EnvKeyProvider::new("CIPHERFS_TEST_KEY_PROVIDER");
        assert_eq!(provider.passphrase().unwrap().as_slice(), b"from-env");

        let missing = EnvKeyProvider::new("CIPHERFS_TEST_KEY_PROVIDER_MISSING");
        assert!(matches!(missing.passphrase(), Err(Error::KeyUnavailable(_))));
    }

    #[test]
    fn test_file_provider_strips_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, b"secret\n").unwrap();

        let provider = FileKeyProvider::new(&path, KeyEncoding::Raw);
        assert_eq!(provider.passphrase().unwrap().as_slice(), b"secret");
    }

    #[test]
    fn test_file_provider_hex() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.hex");
        std::fs::write(&path, b"736563726574\n").unwrap();

        let provider = FileKeyProvider::new(&path, KeyEncoding::Hex);
        assert_eq!(provider.passphrase().unwrap().as_slice(), b"secret");

        std::fs::write(&path, b"not hex").unwrap();
        assert!(matches!(provider.passphrase(), Err(Error::KeyUnavailable(_))));
    }

    #[test]
    fn test_file_provider_missing_file() {
        let provider = FileKeyProvider::new("/nonexistent/cipherfs/key", KeyEncoding::Raw);
        assert!(matches!(provider.passphrase(), Err(Error::KeyUnavailable(_))));
    }
}
